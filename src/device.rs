//! The remote device: a shell channel plus package and power management.
//!
//! [`Device`] is what the runner talks to. [`AdbDevice`] implements it by spawning `adb`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use slog::{debug, o, trace, warn, Logger};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

/// Timeout for short, non-streaming adb invocations.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How long to wait for a device to come back online after a reboot or reconnect.
const ONLINE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Failure of a non-streaming device operation.
///
/// All of these mean that the device cannot be used right now.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to spawn adb: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("adb {command:?} failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("adb {command:?} timed out")]
    Timeout { command: String },
    #[error("Failed to write temporary file: {0}")]
    TempFile(#[source] std::io::Error),
    #[error("Device not available: {0}")]
    NotAvailable(String),
}

/// Failure of a streaming shell command.
///
/// The two variants need different recovery strategies.
#[derive(Clone, Debug, Error)]
pub enum ChannelError {
    /// The channel was never opened, the command did not run.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    /// The channel was opened but died before the command finished, including when the command
    /// stopped producing output for longer than the unresponsive timeout.
    #[error("Link killed: {0}")]
    LinkKilled(String),
}

/// Consumer of the line-oriented output of a streaming shell command.
///
/// The device only calls [`process_new_line`](Self::process_new_line). Flushing buffered state at
/// the end of the stream is up to the owner of the receiver.
pub trait LineReceiver {
    fn process_new_line(&mut self, line: &str);
}

/// A remote device that runs shell commands.
#[allow(async_fn_in_trait)]
pub trait Device {
    /// Run a shell command and return its complete output.
    async fn execute_shell_command(&mut self, command: &str) -> Result<String, DeviceError>;

    /// Run a shell command and feed every output line to `receiver` as it arrives.
    ///
    /// Fails with [`ChannelError::LinkKilled`] if no line arrives within `timeout`.
    async fn execute_shell_command_streaming(
        &mut self,
        command: &str,
        receiver: &mut dyn LineReceiver,
        timeout: Duration,
    ) -> Result<(), ChannelError>;

    /// Write `content` to `remote_path` on the device.
    async fn push_string(&mut self, content: &str, remote_path: &str) -> Result<bool, DeviceError>;

    /// Returns the installer error, or `None` on success.
    async fn install_package(
        &mut self,
        apk: &Path,
        replace_existing: bool,
        options: &[String],
    ) -> Result<Option<String>, DeviceError>;

    /// Returns the uninstaller error, or `None` on success.
    async fn uninstall_package(&mut self, package: &str) -> Result<Option<String>, DeviceError>;

    async fn get_property(&mut self, name: &str) -> Result<Option<String>, DeviceError>;

    /// Reboot and wait until the device is usable again.
    async fn reboot(&mut self) -> Result<(), DeviceError>;

    /// Try to bring an unresponsive device back online without rebooting it.
    async fn recover_device(&mut self) -> Result<(), DeviceError>;
}

/// A device reached through the `adb` command line tool.
#[derive(Clone, Debug)]
pub struct AdbDevice {
    logger: Logger,
    adb: PathBuf,
    serial: Option<String>,
}

/// adb reports its own failures (as opposed to failures of the remote command) on stderr with an
/// `error:` prefix.
fn adb_error(stderr: &str) -> Option<&str> {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("error:") || l.starts_with("adb: error:"))
}

impl AdbDevice {
    pub fn new(logger: Logger, serial: Option<String>) -> Self {
        let logger = match &serial {
            Some(s) => logger.new(o!("serial" => s.clone())),
            None => logger,
        };
        Self {
            logger,
            adb: PathBuf::from("adb"),
            serial,
        }
    }

    /// Use a different `adb` executable.
    pub fn with_adb(mut self, adb: PathBuf) -> Self {
        self.adb = adb;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run adb and return stdout.
    ///
    /// Only adb's own errors fail, a non-zero exit of a remote shell command does not.
    async fn run_adb(&self, args: &[&str], timeout: Duration) -> Result<String, DeviceError> {
        let command = args.join(" ");
        trace!(self.logger, "Run adb"; "args" => &command);
        let mut cmd = self.command();
        cmd.args(args);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(r) => r.map_err(DeviceError::SpawnFailed)?,
            Err(_) => return Err(DeviceError::Timeout { command }),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(e) = adb_error(&stderr) {
            return Err(DeviceError::CommandFailed {
                command,
                message: e.to_string(),
            });
        }
        if !output.status.success() && args.first() != Some(&"shell") {
            return Err(DeviceError::CommandFailed {
                command,
                message: format!("exited with {:?}: {}", output.status.code(), stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Wait until the device is connected and finished booting.
    async fn wait_for_device(&self) -> Result<(), DeviceError> {
        self.run_adb(&["wait-for-device"], ONLINE_TIMEOUT)
            .await
            .map_err(|e| DeviceError::NotAvailable(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + ONLINE_TIMEOUT;
        loop {
            match self
                .run_adb(&["shell", "getprop", "sys.boot_completed"], COMMAND_TIMEOUT)
                .await
            {
                Ok(out) if out.trim() == "1" => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!(self.logger, "Boot state query failed"; "error" => %e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeviceError::NotAvailable(
                    "device did not finish booting".into(),
                ));
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
    }
}

impl Device for AdbDevice {
    async fn execute_shell_command(&mut self, command: &str) -> Result<String, DeviceError> {
        self.run_adb(&["shell", command], COMMAND_TIMEOUT).await
    }

    async fn execute_shell_command_streaming(
        &mut self,
        command: &str,
        receiver: &mut dyn LineReceiver,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        debug!(self.logger, "Start shell command"; "command" => command);
        let mut cmd = self.command();
        cmd.arg("shell")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            ChannelError::ConnectionRefused(format!("failed to spawn adb: {}", e))
        })?;
        let (stdout, mut stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                return Err(ChannelError::ConnectionRefused(
                    "adb output was not captured".into(),
                ))
            }
        };

        // Test logs are not guaranteed to be valid utf-8
        let lines = SplitStream::new(BufReader::new(stdout).split(b'\n')).timeout(timeout);
        tokio::pin!(lines);
        let mut line_count = 0usize;
        while let Some(line) = lines.next().await {
            match line {
                Ok(Ok(l)) => {
                    line_count += 1;
                    let l = String::from_utf8_lossy(&l);
                    receiver.process_new_line(l.trim_end_matches('\r'));
                }
                Ok(Err(e)) => {
                    if let Err(e) = child.kill().await {
                        warn!(self.logger, "Failed to kill adb"; "error" => %e);
                    }
                    return Err(ChannelError::LinkKilled(format!("command link killed: {}", e)));
                }
                Err(_) => {
                    debug!(self.logger, "Detected unresponsive command"; "timeout" => ?timeout);
                    if let Err(e) = child.kill().await {
                        warn!(self.logger, "Failed to kill adb"; "error" => %e);
                    }
                    return Err(ChannelError::LinkKilled("command link hung".into()));
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ChannelError::LinkKilled(format!("failed to wait for adb: {}", e)))?;
        let mut err = String::new();
        if let Err(e) = stderr.read_to_string(&mut err).await {
            debug!(self.logger, "Failed to read stderr of adb"; "error" => %e);
        }

        if let Some(e) = adb_error(&err) {
            if line_count == 0 {
                return Err(ChannelError::ConnectionRefused(format!("command rejected: {}", e)));
            }
            return Err(ChannelError::LinkKilled(e.to_string()));
        }
        if status.code().is_none() {
            // Killed by a signal
            return Err(ChannelError::LinkKilled(format!("adb terminated: {}", status)));
        }
        trace!(self.logger, "Shell command finished"; "lines" => line_count, "status" => %status);
        Ok(())
    }

    async fn push_string(&mut self, content: &str, remote_path: &str) -> Result<bool, DeviceError> {
        let mut file = NamedTempFile::new().map_err(DeviceError::TempFile)?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.flush())
            .map_err(DeviceError::TempFile)?;
        let local = file.path().to_str().ok_or_else(|| {
            DeviceError::TempFile(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("temporary file path is not utf-8: {:?}", file.path()),
            ))
        })?;

        match self.run_adb(&["push", local, remote_path], COMMAND_TIMEOUT).await {
            Ok(_) => Ok(true),
            Err(DeviceError::CommandFailed { message, .. }) => {
                warn!(self.logger, "Failed to push file"; "path" => remote_path,
                    "error" => message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn install_package(
        &mut self,
        apk: &Path,
        replace_existing: bool,
        options: &[String],
    ) -> Result<Option<String>, DeviceError> {
        let apk = apk.to_string_lossy();
        let mut args = vec!["install"];
        if replace_existing {
            args.push("-r");
        }
        args.extend(options.iter().map(String::as_str));
        args.push(apk.as_ref());

        match self.run_adb(&args, COMMAND_TIMEOUT).await {
            Ok(out) if out.lines().any(|l| l.trim() == "Success") => Ok(None),
            Ok(out) => Ok(Some(
                out.lines()
                    .find(|l| l.starts_with("Failure"))
                    .unwrap_or_else(|| out.trim())
                    .to_string(),
            )),
            Err(DeviceError::CommandFailed { message, .. }) => Ok(Some(message)),
            Err(e) => Err(e),
        }
    }

    async fn uninstall_package(&mut self, package: &str) -> Result<Option<String>, DeviceError> {
        match self.run_adb(&["uninstall", package], COMMAND_TIMEOUT).await {
            Ok(out) if out.lines().any(|l| l.trim() == "Success") => Ok(None),
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(DeviceError::CommandFailed { message, .. }) => Ok(Some(message)),
            Err(e) => Err(e),
        }
    }

    async fn get_property(&mut self, name: &str) -> Result<Option<String>, DeviceError> {
        let out = self
            .run_adb(&["shell", "getprop", name], COMMAND_TIMEOUT)
            .await?;
        let value = out.trim();
        Ok(if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        })
    }

    async fn reboot(&mut self) -> Result<(), DeviceError> {
        debug!(self.logger, "Rebooting device");
        self.run_adb(&["reboot"], COMMAND_TIMEOUT).await?;
        self.wait_for_device().await
    }

    async fn recover_device(&mut self) -> Result<(), DeviceError> {
        debug!(self.logger, "Reconnecting device");
        if let Err(e) = self.run_adb(&["reconnect"], COMMAND_TIMEOUT).await {
            // Older adb versions cannot reconnect, waiting may still succeed
            debug!(self.logger, "adb reconnect failed"; "error" => %e);
        }
        self.wait_for_device().await
    }
}
