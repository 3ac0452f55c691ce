//! Parser for the status output of the dEQP instrumentation.
//!
//! The instrumentation reports every event as a block of `INSTRUMENTATION_STATUS: dEQP-<key>=`
//! fields terminated by an `INSTRUMENTATION_STATUS_CODE: ` line. Values can span multiple lines.

use std::collections::HashMap;

use slog::{debug, trace, warn, Logger};
use thiserror::Error;

use crate::device::LineReceiver;
use crate::StatusCode;

const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE: ";
const STATUS_PREFIX: &str = "INSTRUMENTATION_STATUS: ";
const DEQP_KEY_PREFIX: &str = "dEQP-";

const KEY_EVENT_TYPE: &str = "dEQP-EventType";
const KEY_TEST_CASE_PATH: &str = "dEQP-BeginTestCase-TestCasePath";
const KEY_RESULT_CODE: &str = "dEQP-TestCaseResult-Code";
const KEY_RESULT_DETAILS: &str = "dEQP-TestCaseResult-Details";
const KEY_TERMINATE_REASON: &str = "dEQP-TerminateTestCase-Reason";
const KEY_LOG: &str = "dEQP-TestLogData-Log";

/// An event reported by the dEQP instrumentation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeqpEvent {
    BeginSession,
    EndSession,
    BeginTestCase { path: String },
    EndTestCase,
    TestCaseResult { code: StatusCode, details: String },
    TerminateTestCase { reason: String },
    /// A fragment of the test log, fragments have to be concatenated.
    TestLogData { log: String },
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum EventError {
    #[error("Status record has no event type")]
    MissingEventType,
    #[error("Unknown event type {0:?}")]
    UnknownEventType(String),
    #[error("{event} event is missing {key}")]
    MissingField {
        event: &'static str,
        key: &'static str,
    },
}

impl DeqpEvent {
    /// Decode the fields of one status record.
    pub fn from_values(mut values: HashMap<String, String>) -> Result<Self, EventError> {
        let event_type = values
            .remove(KEY_EVENT_TYPE)
            .ok_or(EventError::MissingEventType)?;
        let mut take = |key| values.remove(key);

        Ok(match event_type.as_str() {
            "BeginSession" => Self::BeginSession,
            "EndSession" => Self::EndSession,
            "BeginTestCase" => Self::BeginTestCase {
                path: take(KEY_TEST_CASE_PATH).ok_or(EventError::MissingField {
                    event: "BeginTestCase",
                    key: KEY_TEST_CASE_PATH,
                })?,
            },
            "EndTestCase" => Self::EndTestCase,
            "TestCaseResult" => Self::TestCaseResult {
                code: take(KEY_RESULT_CODE)
                    .map(|c| StatusCode::from_code(&c))
                    .ok_or(EventError::MissingField {
                        event: "TestCaseResult",
                        key: KEY_RESULT_CODE,
                    })?,
                details: take(KEY_RESULT_DETAILS).unwrap_or_default(),
            },
            "TerminateTestCase" => Self::TerminateTestCase {
                reason: take(KEY_TERMINATE_REASON).unwrap_or_default(),
            },
            "TestLogData" => Self::TestLogData {
                log: take(KEY_LOG).unwrap_or_default(),
            },
            _ => return Err(EventError::UnknownEventType(event_type)),
        })
    }
}

/// Turns instrumentation output lines into [`DeqpEvent`]s.
///
/// Create a new parser for every instrumentation run, call [`done`](Self::done) when the output
/// ended.
pub struct InstrumentationParser<F> {
    logger: Logger,
    handler: F,
    values: Option<HashMap<String, String>>,
    /// Name and value of the field that is currently read.
    current: Option<(String, String)>,
}

impl<F: FnMut(DeqpEvent)> InstrumentationParser<F> {
    pub fn new(logger: Logger, handler: F) -> Self {
        Self {
            logger,
            handler,
            values: None,
            current: None,
        }
    }

    fn finish_field(&mut self) {
        if let Some((name, value)) = self.current.take() {
            self.values
                .get_or_insert_with(HashMap::new)
                .insert(name, value);
        }
    }

    fn dispatch(&mut self) {
        self.finish_field();
        let values = match self.values.take() {
            Some(v) => v,
            None => return,
        };
        match DeqpEvent::from_values(values) {
            Ok(event) => {
                trace!(self.logger, "Instrumentation event"; "event" => ?event);
                (self.handler)(event);
            }
            Err(EventError::MissingEventType) => {}
            Err(e @ EventError::UnknownEventType(_)) => {
                debug!(self.logger, "Ignoring instrumentation status"; "error" => %e);
            }
            Err(e) => warn!(self.logger, "Malformed instrumentation status"; "error" => %e),
        }
    }

    /// Flush a partially read record at the end of the output.
    pub fn done(&mut self) {
        self.dispatch();
    }
}

impl<F: FnMut(DeqpEvent)> LineReceiver for InstrumentationParser<F> {
    fn process_new_line(&mut self, line: &str) {
        if line.starts_with(STATUS_CODE_PREFIX) {
            self.dispatch();
        } else if let Some(field) = line
            .strip_prefix(STATUS_PREFIX)
            .filter(|f| f.starts_with(DEQP_KEY_PREFIX))
        {
            self.finish_field();
            let (name, value) = field.split_once('=').unwrap_or((field, ""));
            self.current = Some((name.to_string(), value.to_string()));
        } else if let Some((_, value)) = &mut self.current {
            value.push('\n');
            value.push_str(line);
        }
    }
}
