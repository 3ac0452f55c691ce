//! Schedules tests in batches per configuration and drives them through the instrumentation.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexSet;
use slog::{debug, error, info, o, warn, Logger};
use thiserror::Error;
use tokio::time::Instant;

use crate::capability::{abi_flag, CapabilityQuery, CapabilityQueryError};
use crate::caselist::generate_test_case_trie;
use crate::config::{resolve_test_instances, BatchRunConfiguration, InstanceArgs};
use crate::device::{ChannelError, Device, DeviceError};
use crate::parser::InstrumentationParser;
use crate::recovery::{Recovery, RecoveryError};
use crate::sink::ResultSink;
use crate::tracker::ResultTracker;
use crate::{RunOptions, TestId};

pub const CASE_LIST_FILE_NAME: &str = "/sdcard/dEQP-TestCaseList.txt";
pub const LOG_FILE_NAME: &str = "/sdcard/TestLog.qpa";
pub const DEQP_ONDEVICE_PKG: &str = "com.drawelements.deqp";
const INSTRUMENTATION_NAME: &str =
    "com.drawelements.deqp/com.drawelements.deqp.testercore.DeqpInstrumentation";
const GLES_VERSION_PROPERTY: &str = "ro.opengles.version";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("Failed to query device capabilities: {0}")]
    CapabilityQuery(#[from] CapabilityQueryError),
}

/// If a device with the encoded `ro.opengles.version` supports the required version.
///
/// The major version is stored in the upper 16 bits, the minor version in the lower 16 bits.
fn is_supported_gles_version(value: u32, (major, minor): (u32, u32)) -> bool {
    let device_major = (value & 0xffff_0000) >> 16;
    let device_minor = value & 0xffff;
    device_major > major || (device_major == major && device_minor >= minor)
}

/// Runs a list of dEQP tests on a device and reports the results to a [`ResultSink`].
pub struct DeqpTestRunner<D, S> {
    logger: Logger,
    device: D,
    options: RunOptions,
    tracker: ResultTracker<S>,
    recovery: Recovery,
    capabilities: CapabilityQuery,
}

impl<D: Device, S: ResultSink> DeqpTestRunner<D, S> {
    /// Tests without instance arguments run with the default configuration.
    pub fn new(
        logger: Logger,
        device: D,
        sink: S,
        tests: &[TestId],
        instance_args: &HashMap<TestId, Vec<InstanceArgs>>,
        options: RunOptions,
    ) -> Self {
        let logger = logger.new(o!("package" => options.package.name()));
        let instances = resolve_test_instances(tests, instance_args);
        Self {
            tracker: ResultTracker::new(logger.clone(), sink, instances, options.collect_logs),
            recovery: Recovery::new(logger.clone()),
            capabilities: CapabilityQuery::new(
                logger.clone(),
                options.abi.clone(),
                options.timeout,
            ),
            logger,
            device,
            options,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn sink(&self) -> &S {
        self.tracker.sink()
    }

    /// Name of the run reported to the sink.
    pub fn run_name(&self) -> String {
        match &self.options.abi {
            Some(abi) => format!("{} {}", abi, self.options.package),
            None => self.options.package.to_string(),
        }
    }

    /// Run all tests.
    ///
    /// Tests that were finalized before an error are reported nevertheless.
    pub async fn run(&mut self) -> Result<(), RunError> {
        let start = Instant::now();
        let name = self.run_name();
        let count = self.tracker.remaining_test_count();
        info!(self.logger, "Starting test run"; "tests" => count);
        self.tracker.sink_mut().run_started(&name, count);

        let res = self.run_supported().await;

        if let Err(e) = &res {
            error!(self.logger, "Test run aborted"; "error" => %e,
                "remaining" => self.tracker.remaining_test_count());
        }
        self.tracker.sink_mut().run_ended(start.elapsed());
        res
    }

    async fn run_supported(&mut self) -> Result<(), RunError> {
        if !self.is_supported_gles().await? {
            info!(self.logger, "OpenGL ES version not supported, skipping all tests");
            self.tracker.fake_pass_remaining();
            return Ok(());
        }

        let apk = self.options.apk.clone();
        if let Some(apk) = &apk {
            // Remove leftovers from an interrupted run
            self.uninstall_test_apk().await?;
            self.install_test_apk(apk).await?;
        }

        let res = self.run_tests().await;
        if apk.is_some() && matches!(res, Ok(()) | Err(RunError::CapabilityQuery(_))) {
            if let Err(e) = self.uninstall_test_apk().await {
                warn!(self.logger, "Failed to uninstall dEQP"; "error" => %e);
            }
        }
        res
    }

    async fn is_supported_gles(&mut self) -> Result<bool, RunError> {
        let required = match self.options.package.gles_version() {
            Some(v) => v,
            None => return Ok(true),
        };
        let value = match self.device.get_property(GLES_VERSION_PROPERTY).await? {
            Some(v) => v,
            None => return Ok(false),
        };
        match value.trim().parse() {
            Ok(v) => Ok(is_supported_gles_version(v, required)),
            Err(_) => {
                warn!(self.logger, "Cannot parse OpenGL ES version"; "version" => value);
                Ok(false)
            }
        }
    }

    async fn install_test_apk(&mut self, apk: &Path) -> Result<(), RunError> {
        let options = match &self.options.abi {
            Some(abi) => vec!["--abi".to_string(), abi.clone()],
            None => Vec::new(),
        };
        debug!(self.logger, "Installing dEQP"; "apk" => %apk.display());
        if let Some(e) = self.device.install_package(apk, true, &options).await? {
            error!(self.logger, "Failed to install dEQP"; "apk" => %apk.display(), "error" => e);
        }
        Ok(())
    }

    async fn uninstall_test_apk(&mut self) -> Result<(), RunError> {
        if let Some(e) = self.device.uninstall_package(DEQP_ONDEVICE_PKG).await? {
            debug!(self.logger, "Uninstalling dEQP failed"; "error" => e);
        }
        Ok(())
    }

    async fn run_tests(&mut self) -> Result<(), RunError> {
        let batch_size = self.options.batch_size.max(1);
        while self.tracker.has_remaining_tests() {
            let batch: Vec<TestId> = self
                .tracker
                .remaining_tests()
                .take(batch_size)
                .cloned()
                .collect();

            let mut configs = IndexSet::new();
            for test in &batch {
                if let Some(c) = self.tracker.instances_of(test) {
                    configs.extend(c.iter().cloned());
                }
            }
            for test in &batch {
                self.tracker.set_test_instances(test);
            }

            for config in configs {
                let tests: Vec<TestId> = batch
                    .iter()
                    .filter(|t| self.tracker.is_pending_test_instance(t, &config))
                    .cloned()
                    .collect();
                if !tests.is_empty() {
                    self.run_test_run_batch(&tests, config).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_test_run_batch(
        &mut self,
        tests: &[TestId],
        config: BatchRunConfiguration,
    ) -> Result<(), RunError> {
        let supported = self
            .capabilities
            .is_configuration_supported(&mut self.device, &config, self.options.package)
            .await?;
        self.tracker.set_current_config(config.clone());

        if supported {
            self.execute_test_run_batch(tests, &config).await
        } else {
            for test in tests {
                debug!(self.logger, "Skipping test invocation"; "test" => %test,
                    "config" => %config);
                self.tracker.skip_test(test);
            }
            Ok(())
        }
    }

    fn instrumentation_command(&self, config: &BatchRunConfiguration) -> String {
        let mut cmd_line = format!(
            "--deqp-caselist-file={} {}",
            CASE_LIST_FILE_NAME,
            config.display_command_line()
        );
        // Images are only useful in logs
        if !self.options.collect_logs {
            cmd_line.push_str(" --deqp-log-images=disable");
        }
        cmd_line.push_str(" --deqp-watchdog=enable");

        format!(
            "am instrument {}-w -e deqpLogFileName \"{}\" -e deqpCmdLine \"{}\" -e deqpLogData \
             \"{}\" {}",
            abi_flag(self.options.abi.as_deref()),
            LOG_FILE_NAME,
            cmd_line,
            self.options.collect_logs,
            INSTRUMENTATION_NAME
        )
    }

    async fn execute_test_run_batch(
        &mut self,
        tests: &[TestId],
        config: &BatchRunConfiguration,
    ) -> Result<(), RunError> {
        let case_list = generate_test_case_trie(tests);
        self.device
            .execute_shell_command(&format!("rm {}", CASE_LIST_FILE_NAME))
            .await?;
        self.device
            .execute_shell_command(&format!("rm {}", LOG_FILE_NAME))
            .await?;
        if !self
            .device
            .push_string(&format!("{}\n", case_list), CASE_LIST_FILE_NAME)
            .await?
        {
            warn!(self.logger, "Failed to push case list"; "path" => CASE_LIST_FILE_NAME);
        }

        let command = self.instrumentation_command(config);
        let instances_before = self.tracker.remaining_instance_count();
        let finalized_before = self.tracker.finalized_count();
        debug!(self.logger, "Running batch"; "config" => %config, "tests" => tests.len());

        let tracker = &mut self.tracker;
        let mut parser = InstrumentationParser::new(self.logger.clone(), |e| {
            tracker.handle_event(e)
        });
        let res = self
            .device
            .execute_shell_command_streaming(&command, &mut parser, self.options.timeout)
            .await;
        parser.done();

        let progressed = self.tracker.has_open_pending_test()
            || self.tracker.remaining_instance_count() < instances_before
            || self.tracker.finalized_count() > finalized_before;
        if progressed {
            self.recovery.on_execution_progressed();
        }

        let res = match res {
            Ok(()) => {
                if !progressed {
                    // Otherwise the same batch would be started again and again
                    warn!(self.logger, "Instrumentation did not report any test";
                        "config" => %config, "tests" => tests.len());
                    for test in tests {
                        self.tracker.mark_missing(test);
                    }
                }
                Ok(())
            }
            Err(ChannelError::ConnectionRefused(e)) => {
                warn!(self.logger, "Failed to start instrumentation"; "error" => e);
                self.recovery
                    .recover_connection_refused(&mut self.device)
                    .await
            }
            Err(ChannelError::LinkKilled(e)) => {
                warn!(self.logger, "Instrumentation link died"; "error" => e,
                    "test" => self.tracker.current_test().map(|t| t.to_string()));
                self.recovery.recover_com_link_killed(&mut self.device).await
            }
        };

        if res.is_err() {
            // Fail all instances of the running test so it cannot take down the device again
            self.tracker.on_device_lost();
        }
        self.tracker.end_batch();
        res.map_err(RunError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_helpers::*;
    use crate::tracker::{DEVICE_LOST_MESSAGE, INCOMPLETE_LOG_MESSAGE, MISSING_INSTANCE_MESSAGE};
    use crate::DeqpPackage;

    const PS_LINE: &str = "u0_a77  4711  312  1234567 56789 S com.drawelements.deqp:testercore";

    fn test_ids(paths: &[&str]) -> Vec<TestId> {
        paths.iter().map(|p| TestId::from_path(p)).collect()
    }

    fn rotations(rotations: &[&str]) -> Vec<InstanceArgs> {
        rotations
            .iter()
            .map(|r| {
                let mut args = InstanceArgs::new();
                args.insert("rotation".into(), r.to_string());
                args
            })
            .collect()
    }

    fn runner(
        device: MockDevice,
        tests: &[TestId],
        instances: HashMap<TestId, Vec<InstanceArgs>>,
        options: RunOptions,
    ) -> DeqpTestRunner<MockDevice, RecordingSink> {
        DeqpTestRunner::new(
            logger(),
            device,
            RecordingSink::default(),
            tests,
            &instances,
            options,
        )
    }

    fn gles3() -> RunOptions {
        RunOptions::new(DeqpPackage::Gles3)
    }

    #[test]
    fn gles_versions() {
        assert!(is_supported_gles_version(0x30001, (3, 1)));
        assert!(is_supported_gles_version(0x30001, (3, 0)));
        assert!(is_supported_gles_version(0x30001, (2, 0)));
        assert!(!is_supported_gles_version(0x30000, (3, 1)));
        assert!(!is_supported_gles_version(0x20000, (3, 0)));
        assert!(is_supported_gles_version(0x40000, (3, 1)));
    }

    #[test]
    fn command_line() {
        let config = BatchRunConfiguration::new("rgba8888d24s8", "90", "window");
        let r = runner(MockDevice::default(), &[], HashMap::new(), gles3());
        assert_eq!(
            r.instrumentation_command(&config),
            "am instrument -w -e deqpLogFileName \"/sdcard/TestLog.qpa\" -e deqpCmdLine \
             \"--deqp-caselist-file=/sdcard/dEQP-TestCaseList.txt \
             --deqp-gl-config-name=rgba8888d24s8 --deqp-screen-rotation=90 \
             --deqp-surface-type=window --deqp-log-images=disable --deqp-watchdog=enable\" \
             -e deqpLogData \"false\" \
             com.drawelements.deqp/com.drawelements.deqp.testercore.DeqpInstrumentation"
        );

        let mut options = gles3();
        options.abi = Some("arm64-v8a".into());
        options.collect_logs = true;
        let r = runner(MockDevice::default(), &[], HashMap::new(), options);
        assert_eq!(
            r.instrumentation_command(&config),
            "am instrument --abi arm64-v8a -w -e deqpLogFileName \"/sdcard/TestLog.qpa\" \
             -e deqpCmdLine \"--deqp-caselist-file=/sdcard/dEQP-TestCaseList.txt \
             --deqp-gl-config-name=rgba8888d24s8 --deqp-screen-rotation=90 \
             --deqp-surface-type=window --deqp-watchdog=enable\" -e deqpLogData \"true\" \
             com.drawelements.deqp/com.drawelements.deqp.testercore.DeqpInstrumentation"
        );
        assert_eq!(r.run_name(), "arm64-v8a dEQP-GLES3");
    }

    #[tokio::test]
    async fn run_all_tests() {
        let tests = test_ids(&[
            "dEQP-GLES3.info.vendor",
            "dEQP-GLES3.info.renderer",
            "dEQP-GLES3.info.version",
        ]);
        let mut r = runner(MockDevice::default(), &tests, HashMap::new(), gles3());
        r.run().await.unwrap();

        let mut expected = vec![SinkCall::RunStarted("dEQP-GLES3".into(), 3)];
        for t in &tests {
            expected.push(SinkCall::Started(t.clone()));
            expected.push(SinkCall::Ended(t.clone()));
        }
        expected.push(SinkCall::RunEnded);
        assert_eq!(r.sink().calls, expected);

        let device = r.device();
        assert_eq!(
            device.shell_commands,
            vec!["rm /sdcard/dEQP-TestCaseList.txt", "rm /sdcard/TestLog.qpa"]
        );
        assert_eq!(
            device.pushes,
            vec![(
                CASE_LIST_FILE_NAME.to_string(),
                "{dEQP-GLES3{info{vendor,renderer,version}}}\n".to_string()
            )]
        );
        assert_eq!(device.invocations.len(), 1);
        assert_eq!(device.queries.len(), 1);
        assert!(device.installed.is_empty());
        assert!(device.uninstalled.is_empty());
    }

    #[tokio::test]
    async fn configurations_report_once() {
        let tests = test_ids(&["pkg.ClassA.case1", "pkg.ClassA.case2"]);
        let mut instances = HashMap::new();
        instances.insert(tests[0].clone(), rotations(&["90", "0"]));
        let device = MockDevice::default().with_responder(|inv| match inv.rotation() {
            Some("90") => Response::finish_all(&inv.cases, "Fail"),
            _ => Response::pass_all(&inv.cases),
        });
        let mut r = runner(device, &tests, instances, gles3());
        r.run().await.unwrap();

        let case1 = &tests[0];
        assert_eq!(r.sink().finalized(), vec![case1, &tests[1]]);
        assert_eq!(
            r.sink().failures(),
            vec![(
                case1,
                "=== with config {glformat=rgba8888d24s8,rotation=90,surfacetype=window} ===\n\
                 Fail: Fail"
            )]
        );

        let invocations: Vec<_> = r
            .device()
            .invocations
            .iter()
            .map(|i| (i.rotation(), i.cases.clone()))
            .collect();
        assert_eq!(
            invocations,
            vec![
                (Some("90"), vec![case1.clone()]),
                (Some("0"), vec![case1.clone()]),
                (Some("unspecified"), vec![tests[1].clone()]),
            ]
        );
    }

    #[tokio::test]
    async fn unsupported_orientation_is_skipped() {
        let tests = test_ids(&["pkg.a", "pkg.b"]);
        let mut instances = HashMap::new();
        instances.insert(tests[0].clone(), rotations(&["90", "0"]));
        instances.insert(tests[1].clone(), rotations(&["270"]));
        let device = MockDevice {
            features: "feature:android.hardware.screen.portrait".into(),
            ..Default::default()
        };
        let mut r = runner(device, &tests, instances, gles3());
        r.run().await.unwrap();

        assert_eq!(r.sink().finalized(), vec![&tests[0], &tests[1]]);
        assert!(r.sink().failures().is_empty());

        let device = r.device();
        assert_eq!(device.invocations.len(), 1);
        assert_eq!(device.invocations[0].rotation(), Some("0"));
        assert_eq!(device.invocations[0].cases, vec![tests[0].clone()]);
        assert!(device
            .queries
            .iter()
            .all(|q| q.contains("--deqp-screen-rotation=0 ")));
    }

    #[tokio::test]
    async fn skipped_and_failed_configurations_combine() {
        let tests = test_ids(&["pkg.a"]);
        let mut instances = HashMap::new();
        instances.insert(tests[0].clone(), rotations(&["90", "0"]));
        let device = MockDevice {
            features: "feature:android.hardware.screen.portrait".into(),
            ..Default::default()
        }
        .with_responder(|inv| Response::finish_all(&inv.cases, "Fail"));
        let mut r = runner(device, &tests, instances, gles3());
        r.run().await.unwrap();

        assert_eq!(
            r.sink().failure(&tests[0]),
            Some(
                "=== with config {glformat=rgba8888d24s8,rotation=90,surfacetype=window} ===\n\
                 Configuration skipped\n\
                 === with config {glformat=rgba8888d24s8,rotation=0,surfacetype=window} ===\n\
                 Fail: Fail"
            )
        );
    }

    #[tokio::test]
    async fn unsupported_render_config() {
        let tests = test_ids(&["pkg.a", "pkg.b"]);
        let mut device = MockDevice::default();
        device.query_lines[0] = "INSTRUMENTATION_RESULT: Supported=No".into();
        let mut r = runner(device, &tests, HashMap::new(), gles3());
        r.run().await.unwrap();

        assert_eq!(r.sink().finalized().len(), 2);
        assert!(r.sink().failures().is_empty());
        assert!(r.device().invocations.is_empty());
    }

    #[tokio::test]
    async fn batches_are_limited() {
        let tests = test_ids(&["pkg.a", "pkg.b", "pkg.c", "pkg.d", "pkg.e"]);
        let mut options = RunOptions::new(DeqpPackage::Egl);
        options.batch_size = 2;
        let mut r = runner(MockDevice::default(), &tests, HashMap::new(), options);
        r.run().await.unwrap();

        let batches: Vec<_> = r
            .device()
            .invocations
            .iter()
            .map(|i| i.cases.clone())
            .collect();
        assert_eq!(
            batches,
            vec![tests[0..2].to_vec(), tests[2..4].to_vec(), tests[4..].to_vec()]
        );
        assert_eq!(r.sink().finalized().len(), 5);
        // EGL does not query render configs
        assert!(r.device().queries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn crash_continues_with_next_test() {
        let tests = test_ids(&["pkg.a", "pkg.crash", "pkg.c"]);
        let device = MockDevice::default().with_responder(|inv| {
            if inv.cases.len() == 3 {
                let mut lines = finished_case("pkg.a", "Pass");
                lines.extend(begin_case("pkg.crash"));
                Response::lines(lines)
                    .with_error(ChannelError::LinkKilled("command link hung".into()))
            } else {
                Response::pass_all(&inv.cases)
            }
        });
        let mut r = runner(device, &tests, HashMap::new(), gles3());
        r.run().await.unwrap();

        assert_eq!(r.sink().finalized(), vec![&tests[0], &tests[1], &tests[2]]);
        assert_eq!(
            r.sink().failures(),
            vec![(
                &tests[1],
                format!(
                    "=== with config {} ===\n{}",
                    BatchRunConfiguration::default().id(),
                    INCOMPLETE_LOG_MESSAGE
                )
                .as_str()
            )]
        );
        let device = r.device();
        assert_eq!(device.invocations.len(), 2);
        assert_eq!(device.invocations[1].cases, vec![tests[2].clone()]);
        assert_eq!(device.recover_count, 0);
        assert_eq!(device.reboot_count, 0);
    }

    #[tokio::test]
    async fn refused_connection_is_retried() {
        let tests = test_ids(&["pkg.a", "pkg.b"]);
        let mut calls = 0;
        let device = MockDevice::default().with_responder(move |inv| {
            calls += 1;
            if calls == 1 {
                Response::lines(Vec::new())
                    .with_error(ChannelError::ConnectionRefused("command rejected".into()))
            } else {
                Response::pass_all(&inv.cases)
            }
        });
        let mut r = runner(device, &tests, HashMap::new(), gles3());
        r.run().await.unwrap();

        assert_eq!(r.sink().finalized().len(), 2);
        assert!(r.sink().failures().is_empty());
        assert_eq!(r.device().invocations.len(), 2);
        assert_eq!(r.device().recover_count, 1);
    }

    #[tokio::test]
    async fn run_aborts_without_progress() {
        let tests = test_ids(&["pkg.a", "pkg.b"]);
        let device = MockDevice::default().with_responder(|_| {
            Response::lines(Vec::new())
                .with_error(ChannelError::ConnectionRefused("device offline".into()))
        });
        let mut r = runner(device, &tests, HashMap::new(), gles3());
        let res = r.run().await;

        assert!(
            matches!(res, Err(RunError::Recovery(RecoveryError::DeviceUnavailable(_)))),
            "{:?}",
            res
        );
        assert_eq!(
            r.sink().calls,
            vec![
                SinkCall::RunStarted("dEQP-GLES3".into(), 2),
                SinkCall::RunEnded
            ]
        );
        let device = r.device();
        assert_eq!(device.invocations.len(), 3);
        assert_eq!(device.recover_count, 1);
        assert_eq!(device.reboot_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn device_lost() {
        let tests = test_ids(&["pkg.killer", "pkg.b"]);
        let mut instances = HashMap::new();
        instances.insert(tests[0].clone(), rotations(&["0", "180"]));
        let mut device = MockDevice::default().with_responder(|_| {
            Response::lines(begin_case("pkg.killer"))
                .with_error(ChannelError::LinkKilled("command link killed".into()))
        });
        device.ps_default = PS_LINE.into();
        device
            .recover_results
            .push_back(Err(DeviceError::NotAvailable("offline".into())));
        device
            .reboot_results
            .push_back(Err(DeviceError::NotAvailable("offline".into())));
        let mut r = runner(device, &tests, instances, gles3());

        assert!(matches!(r.run().await, Err(RunError::Recovery(_))));
        assert_eq!(
            r.sink().calls,
            vec![
                SinkCall::RunStarted("dEQP-GLES3".into(), 2),
                SinkCall::Started(tests[0].clone()),
                SinkCall::Failed(
                    tests[0].clone(),
                    format!(
                        "=== with config {{glformat=rgba8888d24s8,rotation=0,surfacetype=window}} \
                         ===\n{}",
                        DEVICE_LOST_MESSAGE
                    )
                ),
                SinkCall::Ended(tests[0].clone()),
                SinkCall::RunEnded,
            ]
        );
        assert_eq!(r.device().invocations.len(), 1);
    }

    #[tokio::test]
    async fn unreported_tests_are_missing() {
        let tests = test_ids(&["pkg.a", "pkg.b"]);
        let device = MockDevice::default().with_responder(|_| {
            Response::lines(vec!["INSTRUMENTATION_CODE: -1".to_string()])
        });
        let mut r = runner(device, &tests, HashMap::new(), gles3());
        r.run().await.unwrap();

        assert_eq!(r.device().invocations.len(), 1);
        let failures = r.sink().failures();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|(_, m)| m.ends_with(MISSING_INSTANCE_MESSAGE)));
    }

    #[tokio::test]
    async fn tests_outside_the_batch_do_not_count() {
        let tests = test_ids(&["pkg.a", "pkg.b"]);
        // The device keeps running some other test and never finishes it
        let device = MockDevice::default().with_responder(|_| {
            let mut lines = begin_case("pkg.other");
            lines.push("INSTRUMENTATION_CODE: 0".into());
            Response::lines(lines)
        });
        let mut r = runner(device, &tests, HashMap::new(), gles3());
        r.run().await.unwrap();

        assert_eq!(r.device().invocations.len(), 1);
        let failures = r.sink().failures();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .all(|(_, m)| m.ends_with(MISSING_INSTANCE_MESSAGE)));
    }

    #[tokio::test]
    async fn unsupported_gles_version() {
        let tests = test_ids(&["dEQP-GLES31.info.vendor", "dEQP-GLES31.info.renderer"]);
        let device = MockDevice {
            // 3.0
            gles_version: Some("196608".into()),
            ..Default::default()
        };
        let mut options = RunOptions::new(DeqpPackage::Gles31);
        options.apk = Some(PathBuf::from("dEQP.apk"));
        let mut r = runner(device, &tests, HashMap::new(), options);
        r.run().await.unwrap();

        assert_eq!(
            r.sink().calls,
            vec![
                SinkCall::RunStarted("dEQP-GLES31".into(), 2),
                SinkCall::Started(tests[0].clone()),
                SinkCall::Ended(tests[0].clone()),
                SinkCall::Started(tests[1].clone()),
                SinkCall::Ended(tests[1].clone()),
                SinkCall::RunEnded,
            ]
        );
        let device = r.device();
        assert!(device.invocations.is_empty());
        assert!(device.installed.is_empty());
        assert!(device.shell_commands.is_empty());
    }

    #[tokio::test]
    async fn missing_gles_version() {
        let tests = test_ids(&["dEQP-GLES2.info.vendor"]);
        let device = MockDevice {
            gles_version: None,
            ..Default::default()
        };
        let mut r = runner(device, &tests, HashMap::new(), RunOptions::new(DeqpPackage::Gles2));
        r.run().await.unwrap();
        assert_eq!(r.sink().finalized().len(), 1);
        assert!(r.device().invocations.is_empty());
    }

    #[tokio::test]
    async fn package_is_installed() {
        let tests = test_ids(&["pkg.a"]);
        let mut options = gles3();
        options.apk = Some(PathBuf::from("dEQP.apk"));
        let mut r = runner(MockDevice::default(), &tests, HashMap::new(), options);
        r.run().await.unwrap();

        let device = r.device();
        assert_eq!(device.installed, vec![PathBuf::from("dEQP.apk")]);
        assert_eq!(device.uninstalled, vec![DEQP_ONDEVICE_PKG, DEQP_ONDEVICE_PKG]);
    }

    #[tokio::test]
    async fn capability_query_failure_aborts() {
        let tests = test_ids(&["pkg.a"]);
        let mut device = MockDevice::default();
        device.query_lines[0] = "INSTRUMENTATION_RESULT: Supported=Maybe".into();
        let mut options = gles3();
        options.apk = Some(PathBuf::from("dEQP.apk"));
        let mut r = runner(device, &tests, HashMap::new(), options);

        assert!(matches!(
            r.run().await,
            Err(RunError::CapabilityQuery(CapabilityQueryError::NoResult(_)))
        ));
        assert_eq!(
            r.sink().calls,
            vec![
                SinkCall::RunStarted("dEQP-GLES3".into(), 1),
                SinkCall::RunEnded
            ]
        );
        let device = r.device();
        assert!(device.invocations.is_empty());
        assert_eq!(device.uninstalled.len(), 2);
    }

    #[tokio::test]
    async fn logs_are_collected() {
        let tests = test_ids(&["pkg.a"]);
        let device = MockDevice::default().with_responder(|inv| {
            let mut lines = begin_case(&inv.cases[0].path());
            lines.push("INSTRUMENTATION_STATUS: dEQP-TestLogData-Log=<TestCaseResult>".into());
            lines.push("</TestCaseResult>".into());
            lines.push("INSTRUMENTATION_STATUS: dEQP-EventType=TestLogData".into());
            lines.push("INSTRUMENTATION_STATUS_CODE: 0".into());
            lines.extend(case_result("Pass", ""));
            lines.extend(end_case());
            Response::lines(lines)
        });
        let mut options = gles3();
        options.collect_logs = true;
        let mut r = runner(device, &tests, HashMap::new(), options);
        r.run().await.unwrap();

        assert!(r.sink().calls.contains(&SinkCall::Log(
            format!("pkg.a@{}", BatchRunConfiguration::default().id()),
            "<TestCaseResult>\n</TestCaseResult>".into()
        )));
        assert!(r.device().invocations[0]
            .command
            .contains("-e deqpLogData \"true\""));
    }
}
