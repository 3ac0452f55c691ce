//! Escalating recovery from a broken connection to the device.
//!
//! Every failure without progress in between moves to a more drastic remedy: waiting, recovering
//! the device connection, rebooting and finally giving up.

use std::time::Duration;

use slog::{debug, error, warn, Logger};
use thiserror::Error;

use crate::device::{Device, DeviceError};

const RETRY_COOLDOWN: Duration = Duration::from_secs(6);
const PROCESS_KILL_WAIT: Duration = Duration::from_secs(1);
const DEQP_PROCESS_QUERY: &str = "ps | grep com.drawelements";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryState {
    /// Recover by waiting
    Wait,
    /// Recover by recovering the device connection
    Recover,
    /// Recover by rebooting
    Reboot,
    /// Cannot recover
    Fail,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Device not available: {0}")]
    DeviceUnavailable(&'static str),
}

#[derive(Debug, Error)]
enum KillError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Processes still alive: {0:?}")]
    StillAlive(Vec<u32>),
}

/// Recovery state of one run.
#[derive(Debug)]
pub struct Recovery {
    logger: Logger,
    state: RecoveryState,
}

/// Process ids from the output of `ps`, the pid is the second column.
fn parse_pids(ps_output: &str) -> Vec<u32> {
    ps_output
        .split(&['\r', '\n'][..])
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|pid| pid.parse().ok())
        .collect()
}

impl Recovery {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            state: RecoveryState::Wait,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Tests ran since the last failure, start over with the mildest remedy.
    pub fn on_execution_progressed(&mut self) {
        self.state = RecoveryState::Wait;
    }

    /// The shell channel could not be opened.
    pub async fn recover_connection_refused<D: Device>(
        &mut self,
        device: &mut D,
    ) -> Result<(), RecoveryError> {
        loop {
            let res = match self.state {
                // Waiting does not help against a refused connection
                RecoveryState::Wait | RecoveryState::Recover => {
                    warn!(self.logger, "ADB connection failed, trying to recover");
                    self.state = RecoveryState::Reboot;
                    device.recover_device().await
                }
                RecoveryState::Reboot => {
                    warn!(self.logger, "ADB connection failed after recovery, rebooting device");
                    self.state = RecoveryState::Fail;
                    device.reboot().await
                }
                RecoveryState::Fail => {
                    error!(self.logger, "Cannot recover ADB connection");
                    return Err(RecoveryError::DeviceUnavailable(
                        "failed to connect after reboot",
                    ));
                }
            };
            match res {
                Ok(()) => return Ok(()),
                Err(e) => warn!(self.logger, "Recovery attempt failed"; "error" => %e),
            }
        }
    }

    /// The shell channel died or hung while a command was running.
    pub async fn recover_com_link_killed<D: Device>(
        &mut self,
        device: &mut D,
    ) -> Result<(), RecoveryError> {
        loop {
            let res = match self.state {
                RecoveryState::Wait => {
                    warn!(self.logger, "ADB link failed, retrying after a cooldown period");
                    self.state = RecoveryState::Recover;
                    tokio::time::sleep(RETRY_COOLDOWN).await;
                    // The process on the device can outlive the link
                    self.kill_deqp_process(device).await
                }
                RecoveryState::Recover => {
                    warn!(self.logger, "ADB link failed, trying to recover");
                    self.state = RecoveryState::Reboot;
                    match device.recover_device().await {
                        Ok(()) => self.kill_deqp_process(device).await,
                        Err(e) => Err(e.into()),
                    }
                }
                RecoveryState::Reboot => {
                    warn!(self.logger, "ADB link failed after recovery, rebooting device");
                    self.state = RecoveryState::Fail;
                    device.reboot().await.map_err(KillError::from)
                }
                RecoveryState::Fail => {
                    error!(self.logger, "Cannot recover ADB connection");
                    return Err(RecoveryError::DeviceUnavailable("link killed after reboot"));
                }
            };
            match res {
                Ok(()) => return Ok(()),
                Err(e) => warn!(self.logger, "Recovery attempt failed"; "error" => %e),
            }
        }
    }

    async fn deqp_process_pids<D: Device>(&self, device: &mut D) -> Result<Vec<u32>, DeviceError> {
        let out = device.execute_shell_command(DEQP_PROCESS_QUERY).await?;
        Ok(parse_pids(&out))
    }

    async fn kill_deqp_process<D: Device>(&self, device: &mut D) -> Result<(), KillError> {
        for pid in self.deqp_process_pids(device).await? {
            debug!(self.logger, "Killing dEQP process"; "pid" => pid);
            device
                .execute_shell_command(&format!("kill -9 {}", pid))
                .await?;
        }

        tokio::time::sleep(PROCESS_KILL_WAIT).await;

        let alive = self.deqp_process_pids(device).await?;
        if alive.is_empty() {
            Ok(())
        } else {
            Err(KillError::StillAlive(alive))
        }
    }
}
