//! A scripted device and a recording result sink for tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use slog::{o, Discard, Logger};

use crate::caselist::parse_test_case_trie;
use crate::device::{ChannelError, Device, DeviceError, LineReceiver};
use crate::runner::CASE_LIST_FILE_NAME;
use crate::sink::{LogDataType, ResultSink};
use crate::TestId;

pub fn logger() -> Logger {
    Logger::root(Discard, o!())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SinkCall {
    RunStarted(String, usize),
    Started(TestId),
    Log(String, String),
    Failed(TestId, String),
    Ended(TestId),
    RunEnded,
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
}

impl RecordingSink {
    /// Tests in the order they were reported.
    pub fn finalized(&self) -> Vec<&TestId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Ended(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(&TestId, &str)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Failed(t, m) => Some((t, m.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn failure(&self, test: &TestId) -> Option<&str> {
        self.failures()
            .into_iter()
            .find(|(t, _)| *t == test)
            .map(|(_, m)| m)
    }
}

impl ResultSink for RecordingSink {
    fn run_started(&mut self, name: &str, test_count: usize) {
        self.calls
            .push(SinkCall::RunStarted(name.to_string(), test_count));
    }

    fn test_started(&mut self, test: &TestId) {
        self.calls.push(SinkCall::Started(test.clone()));
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, content: &str) {
        assert_eq!(data_type, LogDataType::Xml);
        self.calls
            .push(SinkCall::Log(name.to_string(), content.to_string()));
    }

    fn test_failed(&mut self, test: &TestId, message: &str) {
        self.calls
            .push(SinkCall::Failed(test.clone(), message.to_string()));
    }

    fn test_ended(&mut self, test: &TestId, metrics: &HashMap<String, String>) {
        assert!(metrics.is_empty());
        self.calls.push(SinkCall::Ended(test.clone()));
    }

    fn run_ended(&mut self, _: Duration) {
        self.calls.push(SinkCall::RunEnded);
    }
}

pub fn begin_case(path: &str) -> Vec<String> {
    vec![
        format!("INSTRUMENTATION_STATUS: dEQP-BeginTestCase-TestCasePath={}", path),
        "INSTRUMENTATION_STATUS: dEQP-EventType=BeginTestCase".into(),
        "INSTRUMENTATION_STATUS_CODE: 0".into(),
    ]
}

pub fn case_result(code: &str, details: &str) -> Vec<String> {
    vec![
        format!("INSTRUMENTATION_STATUS: dEQP-TestCaseResult-Code={}", code),
        format!("INSTRUMENTATION_STATUS: dEQP-TestCaseResult-Details={}", details),
        "INSTRUMENTATION_STATUS: dEQP-EventType=TestCaseResult".into(),
        "INSTRUMENTATION_STATUS_CODE: 0".into(),
    ]
}

pub fn end_case() -> Vec<String> {
    vec![
        "INSTRUMENTATION_STATUS: dEQP-EventType=EndTestCase".into(),
        "INSTRUMENTATION_STATUS_CODE: 0".into(),
    ]
}

pub fn finished_case(path: &str, code: &str) -> Vec<String> {
    let mut lines = begin_case(path);
    lines.extend(case_result(code, code));
    lines.extend(end_case());
    lines
}

/// One run of the test instrumentation.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub command: String,
    /// Decoded from the case list that was pushed last.
    pub cases: Vec<TestId>,
}

impl Invocation {
    pub fn rotation(&self) -> Option<&str> {
        let start = self.command.find("--deqp-screen-rotation=")? + "--deqp-screen-rotation=".len();
        self.command[start..]
            .split(|c: char| c.is_whitespace() || c == '"')
            .next()
    }
}

pub struct Response {
    pub lines: Vec<String>,
    pub error: Option<ChannelError>,
}

impl Response {
    pub fn lines(lines: Vec<String>) -> Self {
        Self { lines, error: None }
    }

    /// Every case passes.
    pub fn pass_all(cases: &[TestId]) -> Self {
        Self::finish_all(cases, "Pass")
    }

    pub fn finish_all(cases: &[TestId], code: &str) -> Self {
        let mut lines = vec![
            "INSTRUMENTATION_STATUS: dEQP-EventType=BeginSession".to_string(),
            "INSTRUMENTATION_STATUS_CODE: 0".to_string(),
        ];
        for case in cases {
            lines.extend(finished_case(&case.path(), code));
        }
        lines.push("INSTRUMENTATION_STATUS: dEQP-EventType=EndSession".into());
        lines.push("INSTRUMENTATION_STATUS_CODE: 0".into());
        lines.push("INSTRUMENTATION_CODE: 0".into());
        Self::lines(lines)
    }

    pub fn with_error(mut self, error: ChannelError) -> Self {
        self.error = Some(error);
        self
    }
}

type Responder = Box<dyn FnMut(&Invocation) -> Response>;

/// A device that answers with scripted output and records what it was asked to do.
pub struct MockDevice {
    /// Output of `pm list features`
    pub features: String,
    /// Value of `ro.opengles.version`
    pub gles_version: Option<String>,
    /// Output of every capability query
    pub query_lines: Vec<String>,
    pub query_error: Option<ChannelError>,
    pub queries: Vec<String>,
    /// Outputs of `ps`, `ps_default` is used when empty
    pub ps_outputs: VecDeque<String>,
    pub ps_default: String,
    pub shell_commands: Vec<String>,
    /// Remote path and content
    pub pushes: Vec<(String, String)>,
    pub invocations: Vec<Invocation>,
    pub responder: Responder,
    /// Results of recovering and rebooting, success when empty
    pub recover_results: VecDeque<Result<(), DeviceError>>,
    pub reboot_results: VecDeque<Result<(), DeviceError>>,
    pub recover_count: usize,
    pub reboot_count: usize,
    pub installed: Vec<PathBuf>,
    pub uninstalled: Vec<String>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            features: "feature:android.hardware.screen.landscape\n\
                feature:android.hardware.screen.portrait\n\
                feature:android.software.live_wallpaper\n"
                .into(),
            // 3.1
            gles_version: Some("196609".into()),
            query_lines: vec![
                "INSTRUMENTATION_RESULT: Supported=Yes".into(),
                "INSTRUMENTATION_CODE: 0".into(),
            ],
            query_error: None,
            queries: Vec::new(),
            ps_outputs: VecDeque::new(),
            ps_default: String::new(),
            shell_commands: Vec::new(),
            pushes: Vec::new(),
            invocations: Vec::new(),
            responder: Box::new(|inv| Response::pass_all(&inv.cases)),
            recover_results: VecDeque::new(),
            reboot_results: VecDeque::new(),
            recover_count: 0,
            reboot_count: 0,
            installed: Vec::new(),
            uninstalled: Vec::new(),
        }
    }
}

impl MockDevice {
    pub fn with_responder(mut self, f: impl FnMut(&Invocation) -> Response + 'static) -> Self {
        self.responder = Box::new(f);
        self
    }

    fn current_case_list(&self) -> Vec<TestId> {
        self.pushes
            .iter()
            .rev()
            .find(|(path, _)| path == CASE_LIST_FILE_NAME)
            .map(|(_, content)| {
                parse_test_case_trie(content)
                    .expect("Invalid case list")
                    .iter()
                    .map(|p| TestId::from_path(p))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Device for MockDevice {
    async fn execute_shell_command(&mut self, command: &str) -> Result<String, DeviceError> {
        self.shell_commands.push(command.to_string());
        Ok(if command == "pm list features" {
            self.features.clone()
        } else if command.starts_with("ps") {
            self.ps_outputs
                .pop_front()
                .unwrap_or_else(|| self.ps_default.clone())
        } else {
            String::new()
        })
    }

    async fn execute_shell_command_streaming(
        &mut self,
        command: &str,
        receiver: &mut dyn LineReceiver,
        _: Duration,
    ) -> Result<(), ChannelError> {
        let response = if command.contains("DeqpPlatformCapabilityQueryInstrumentation") {
            self.queries.push(command.to_string());
            Response {
                lines: self.query_lines.clone(),
                error: self.query_error.clone(),
            }
        } else {
            let invocation = Invocation {
                command: command.to_string(),
                cases: self.current_case_list(),
            };
            let response = (self.responder)(&invocation);
            self.invocations.push(invocation);
            response
        };

        for line in &response.lines {
            receiver.process_new_line(line);
        }
        match response.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn push_string(&mut self, content: &str, remote_path: &str) -> Result<bool, DeviceError> {
        self.pushes
            .push((remote_path.to_string(), content.to_string()));
        Ok(true)
    }

    async fn install_package(
        &mut self,
        apk: &Path,
        _: bool,
        _: &[String],
    ) -> Result<Option<String>, DeviceError> {
        self.installed.push(apk.to_path_buf());
        Ok(None)
    }

    async fn uninstall_package(&mut self, package: &str) -> Result<Option<String>, DeviceError> {
        self.uninstalled.push(package.to_string());
        Ok(None)
    }

    async fn get_property(&mut self, name: &str) -> Result<Option<String>, DeviceError> {
        Ok(match name {
            "ro.opengles.version" => self.gles_version.clone(),
            _ => None,
        })
    }

    async fn reboot(&mut self) -> Result<(), DeviceError> {
        self.reboot_count += 1;
        self.reboot_results.pop_front().unwrap_or(Ok(()))
    }

    async fn recover_device(&mut self) -> Result<(), DeviceError> {
        self.recover_count += 1;
        self.recover_results.pop_front().unwrap_or(Ok(()))
    }
}
