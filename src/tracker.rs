//! Collects per-configuration results of tests and reports every test once all its configurations
//! finished.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use slog::{debug, error, warn, Logger};

use crate::config::BatchRunConfiguration;
use crate::parser::DeqpEvent;
use crate::sink::{LogDataType, ResultSink};
use crate::{StatusCode, TestId};

pub const INCOMPLETE_LOG_MESSAGE: &str = "Crash: Incomplete test log";
pub const DEVICE_LOST_MESSAGE: &str = "Crash: Device lost";
pub const SKIPPED_INSTANCE_LOG_MESSAGE: &str = "Configuration skipped";
pub const MISSING_INSTANCE_MESSAGE: &str =
    "Missing: test case was not reported by the instrumentation";

/// Results of a test that still has configurations left to run.
#[derive(Debug)]
struct PendingResult {
    all_instances_passed: bool,
    test_logs: IndexMap<BatchRunConfiguration, String>,
    error_messages: IndexMap<BatchRunConfiguration, String>,
    remaining_configs: HashSet<BatchRunConfiguration>,
}

impl PendingResult {
    fn new(configs: &IndexSet<BatchRunConfiguration>) -> Self {
        Self {
            all_instances_passed: true,
            test_logs: IndexMap::new(),
            error_messages: IndexMap::new(),
            remaining_configs: configs.iter().cloned().collect(),
        }
    }

    fn record_failure(&mut self, config: &BatchRunConfiguration, message: impl Into<String>) {
        self.all_instances_passed = false;
        self.error_messages.insert(config.clone(), message.into());
    }

    fn failure_message(&self) -> String {
        let mut message = String::new();
        for (config, msg) in &self.error_messages {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(&format!("=== with config {} ===\n{}", config.id(), msg));
        }
        message
    }
}

/// Tracks which test instances still have to run and forwards finished tests to a
/// [`ResultSink`].
///
/// Tests are finalized at most once. A finalized test leaves the remaining queue and is never
/// reported again, even when the device sends further events for it.
pub struct ResultTracker<S> {
    logger: Logger,
    sink: S,
    collect_logs: bool,
    test_instances: IndexMap<TestId, IndexSet<BatchRunConfiguration>>,
    /// Queue order of the remaining tests, can contain already finalized tests.
    queue: VecDeque<TestId>,
    remaining: HashSet<TestId>,
    pending_results: HashMap<TestId, PendingResult>,
    run_config: BatchRunConfiguration,
    current_test: Option<TestId>,
    got_test_result: bool,
    current_test_log: String,
    finalized: usize,
}

impl<S: ResultSink> ResultTracker<S> {
    pub fn new(
        logger: Logger,
        sink: S,
        test_instances: IndexMap<TestId, IndexSet<BatchRunConfiguration>>,
        collect_logs: bool,
    ) -> Self {
        let queue: VecDeque<_> = test_instances.keys().cloned().collect();
        let remaining = queue.iter().cloned().collect();
        Self {
            logger,
            sink,
            collect_logs,
            test_instances,
            queue,
            remaining,
            pending_results: HashMap::new(),
            run_config: BatchRunConfiguration::default(),
            current_test: None,
            got_test_result: false,
            current_test_log: String::new(),
            finalized: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Tests that are not finalized yet, in queue order.
    pub fn remaining_tests(&self) -> impl Iterator<Item = &TestId> + '_ {
        self.queue.iter().filter(|t| self.remaining.contains(*t))
    }

    pub fn has_remaining_tests(&self) -> bool {
        !self.remaining.is_empty()
    }

    pub fn remaining_test_count(&self) -> usize {
        self.remaining.len()
    }

    /// Number of tests that were reported to the sink.
    pub fn finalized_count(&self) -> usize {
        self.finalized
    }

    /// The declared configurations of a test.
    pub fn instances_of(&self, test: &TestId) -> Option<&IndexSet<BatchRunConfiguration>> {
        self.test_instances.get(test)
    }

    pub fn set_current_config(&mut self, config: BatchRunConfiguration) {
        self.run_config = config;
    }

    /// The test case that started but did not end yet.
    pub fn current_test(&self) -> Option<&TestId> {
        self.current_test.as_ref()
    }

    /// If the open test case is one that still has pending instances.
    pub fn has_open_pending_test(&self) -> bool {
        self.current_test
            .as_ref()
            .map(|t| self.pending_results.contains_key(t))
            .unwrap_or(false)
    }

    /// Start tracking the instances of a test.
    ///
    /// Does nothing if the test is tracked already or was finalized.
    pub fn set_test_instances(&mut self, test: &TestId) {
        if self.pending_results.contains_key(test) || !self.remaining.contains(test) {
            return;
        }
        if let Some(configs) = self.test_instances.get(test) {
            self.pending_results
                .insert(test.clone(), PendingResult::new(configs));
        }
    }

    /// If the test still has to be run with the given configuration.
    pub fn is_pending_test_instance(&self, test: &TestId, config: &BatchRunConfiguration) -> bool {
        match self.pending_results.get(test) {
            Some(result) => result.remaining_configs.contains(config),
            None => {
                self.remaining.contains(test)
                    && self
                        .test_instances
                        .get(test)
                        .map(|c| c.contains(config))
                        .unwrap_or(false)
            }
        }
    }

    /// Number of test instances that did not run yet.
    pub fn remaining_instance_count(&self) -> usize {
        self.remaining_tests()
            .map(|t| match self.pending_results.get(t) {
                Some(result) => result.remaining_configs.len(),
                None => self.test_instances.get(t).map(IndexSet::len).unwrap_or(0),
            })
            .sum()
    }

    /// Mark the current configuration of a test as skipped without running it.
    pub fn skip_test(&mut self, test: &TestId) {
        let config = self.run_config.clone();
        match self.pending_results.get_mut(test) {
            Some(result) => {
                result
                    .error_messages
                    .insert(config.clone(), SKIPPED_INSTANCE_LOG_MESSAGE.to_string());
                result.remaining_configs.remove(&config);
                if result.remaining_configs.is_empty() {
                    self.forward_finalized_result(test);
                }
            }
            None => warn!(self.logger, "Cannot skip untracked test"; "test" => %test),
        }
    }

    /// Fail the current configuration of a test that the instrumentation never reported.
    pub fn mark_missing(&mut self, test: &TestId) {
        let config = self.run_config.clone();
        match self.pending_results.get_mut(test) {
            Some(result) => {
                if !result.remaining_configs.remove(&config) {
                    return;
                }
                result.record_failure(&config, MISSING_INSTANCE_MESSAGE);
                if result.remaining_configs.is_empty() {
                    self.forward_finalized_result(test);
                }
            }
            None => warn!(self.logger, "Cannot mark untracked test as missing"; "test" => %test),
        }
    }

    pub fn handle_event(&mut self, event: DeqpEvent) {
        match event {
            DeqpEvent::BeginSession | DeqpEvent::EndSession => {}
            DeqpEvent::BeginTestCase { path } => self.begin_test_case(&path),
            DeqpEvent::EndTestCase => self.end_test_case(),
            DeqpEvent::TestCaseResult { code, details } => self.test_case_result(code, &details),
            DeqpEvent::TerminateTestCase { reason } => self.terminate_test_case(&reason),
            DeqpEvent::TestLogData { log } => self.current_test_log.push_str(&log),
        }
    }

    fn begin_test_case(&mut self, path: &str) {
        if let Some(open) = &self.current_test {
            debug!(self.logger, "Test started before the previous one ended";
                "previous" => %open, "test" => path);
            self.end_test_case();
        }

        let test = TestId::from_path(path);
        self.current_test_log.clear();
        self.got_test_result = false;

        match self.pending_results.get_mut(&test) {
            Some(result) => {
                result.remaining_configs.remove(&self.run_config);
            }
            None => warn!(self.logger, "Got unexpected start of test"; "test" => %test),
        }
        self.current_test = Some(test);
    }

    fn end_test_case(&mut self) {
        let test = match self.current_test.take() {
            Some(t) => t,
            None => {
                warn!(self.logger, "Got end of test without a start");
                return;
            }
        };

        match self.pending_results.get_mut(&test) {
            Some(result) => {
                if !self.got_test_result {
                    result.record_failure(&self.run_config, INCOMPLETE_LOG_MESSAGE);
                }
                if self.collect_logs && !self.current_test_log.is_empty() {
                    result.test_logs.insert(
                        self.run_config.clone(),
                        std::mem::take(&mut self.current_test_log),
                    );
                }
                if result.remaining_configs.is_empty() {
                    self.forward_finalized_result(&test);
                }
            }
            None => warn!(self.logger, "Got unexpected end of test"; "test" => %test),
        }
    }

    fn test_case_result(&mut self, code: StatusCode, details: &str) {
        self.got_test_result = true;
        let result = match self
            .current_test
            .as_ref()
            .and_then(|t| self.pending_results.get_mut(t))
        {
            Some(r) => r,
            None => {
                warn!(self.logger, "Got unexpected test result"; "test" => ?self.current_test,
                    "code" => %code);
                return;
            }
        };

        if !code.is_failure() {
            return;
        }
        let message = match &code {
            StatusCode::Unknown(c) => format!("Unknown result code: {}: {}", c, details),
            _ => format!("{}: {}", code, details),
        };
        result.record_failure(&self.run_config, message);
    }

    fn terminate_test_case(&mut self, reason: &str) {
        self.got_test_result = true;
        match self.current_test.take() {
            Some(test) => match self.pending_results.get_mut(&test) {
                Some(result) => {
                    result.record_failure(&self.run_config, format!("Terminated: {}", reason));
                    if result.remaining_configs.is_empty() {
                        self.forward_finalized_result(&test);
                    }
                }
                None => warn!(self.logger, "Got unexpected termination of test"; "test" => %test),
            },
            None => warn!(self.logger, "Got termination without a running test";
                "reason" => reason),
        }
    }

    /// The output of a batch ended, finish a test that is still open.
    pub fn end_batch(&mut self) {
        if self.current_test.is_some() {
            self.end_test_case();
        }
    }

    /// The device is gone, fail all configurations of the test that is running.
    pub fn on_device_lost(&mut self) {
        let test = match self.current_test.take() {
            Some(t) => t,
            None => return,
        };
        match self.pending_results.get_mut(&test) {
            Some(result) => {
                result.record_failure(&self.run_config, DEVICE_LOST_MESSAGE);
                if self.collect_logs && !self.current_test_log.is_empty() {
                    result.test_logs.insert(
                        self.run_config.clone(),
                        std::mem::take(&mut self.current_test_log),
                    );
                }
                result.remaining_configs.clear();
                self.forward_finalized_result(&test);
            }
            None => error!(self.logger, "Device lost in invalid state"; "test" => %test),
        }
    }

    /// Report all remaining tests as passed without running them.
    pub fn fake_pass_remaining(&mut self) {
        let metrics = HashMap::new();
        let tests: Vec<_> = self.remaining_tests().cloned().collect();
        for test in &tests {
            debug!(self.logger, "Skipping test"; "test" => %test);
            self.sink.test_started(test);
            self.sink.test_ended(test, &metrics);
        }
        self.finalized += tests.len();
        self.remaining.clear();
        self.queue.clear();
        self.pending_results.clear();
    }

    fn forward_finalized_result(&mut self, test: &TestId) {
        if !self.remaining.remove(test) {
            return;
        }
        let result = match self.pending_results.remove(test) {
            Some(r) => r,
            None => {
                error!(self.logger, "Finalized test has no results"; "test" => %test);
                return;
            }
        };
        while self
            .queue
            .front()
            .map(|t| !self.remaining.contains(t))
            .unwrap_or(false)
        {
            self.queue.pop_front();
        }
        self.finalized += 1;

        self.sink.test_started(test);
        if self.collect_logs {
            for (config, log) in &result.test_logs {
                let name = format!("{}@{}", test.path(), config.id());
                self.sink.test_log(&name, LogDataType::Xml, log);
            }
        }
        if !result.all_instances_passed {
            self.sink.test_failed(test, &result.failure_message());
        }
        self.sink.test_ended(test, &HashMap::new());
    }
}
