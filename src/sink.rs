use std::collections::HashMap;
use std::time::Duration;

use crate::TestId;

/// Format of a test log forwarded to a [`ResultSink`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogDataType {
    /// dEQP writes its test logs as xml fragments.
    Xml,
}

impl LogDataType {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Xml => "xml",
        }
    }
}

/// Receives finalized test results.
///
/// Every finalized test produces `test_started`, optionally `test_log` and `test_failed`, and then
/// `test_ended`, in that order.
pub trait ResultSink {
    fn run_started(&mut self, name: &str, test_count: usize);
    fn test_started(&mut self, test: &TestId);
    fn test_log(&mut self, name: &str, data_type: LogDataType, content: &str);
    fn test_failed(&mut self, test: &TestId, message: &str);
    fn test_ended(&mut self, test: &TestId, metrics: &HashMap<String, String>);
    fn run_ended(&mut self, elapsed: Duration);
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn run_started(&mut self, name: &str, test_count: usize) {
        (**self).run_started(name, test_count)
    }

    fn test_started(&mut self, test: &TestId) {
        (**self).test_started(test)
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, content: &str) {
        (**self).test_log(name, data_type, content)
    }

    fn test_failed(&mut self, test: &TestId, message: &str) {
        (**self).test_failed(test, message)
    }

    fn test_ended(&mut self, test: &TestId, metrics: &HashMap<String, String>) {
        (**self).test_ended(test, metrics)
    }

    fn run_ended(&mut self, elapsed: Duration) {
        (**self).run_ended(elapsed)
    }
}
