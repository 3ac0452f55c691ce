//! Collects finalized results into a summary and writes it to disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use slog::{debug, error, warn, Logger};
use thiserror::Error;
use time::OffsetDateTime;

use crate::sink::{LogDataType, ResultSink};
use crate::TestId;

/// Failure when writing the summary file
#[derive(Debug, Error)]
pub enum WriteSummaryError {
    #[error("Failed to write csv summary file: {0}")]
    WriteCsvFile(#[source] csv::Error),
    #[error("Failed to open csv summary file: {0}")]
    OpenCsvFile(#[source] csv::Error),
    #[error("Failed to write xml summary file: {0}")]
    WriteXmlFile(String),
    #[error("Failed to open xml summary file: {0}")]
    OpenFile(#[source] std::io::Error),
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Outcome {
    Pass,
    Fail,
    /// The run ended before the test was reported.
    NotRun,
}

/// Lines of the `summary.csv` file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SummaryEntry {
    /// Dotted dEQP test path.
    pub name: String,
    pub result: Outcome,
    pub message: Option<String>,
}

/// Lines of the run log, one json object per finalized test.
#[derive(Debug, Serialize)]
struct RunLogEntry<'a> {
    name: &'a str,
    result: Outcome,
    message: Option<&'a str>,
    #[serde(with = "time::serde::timestamp")]
    end: OffsetDateTime,
}

/// A [`ResultSink`] that keeps the outcome of every test.
///
/// Tests that never get reported stay [`Outcome::NotRun`].
pub struct Summary {
    logger: Logger,
    records: IndexMap<TestId, SummaryEntry>,
    run_log: Option<File>,
    log_dir: Option<PathBuf>,
    progress_bar: Option<ProgressBar>,
    run_name: String,
    elapsed: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub total: usize,
    pub pass: usize,
    pub fail: usize,
    pub not_run: usize,
}

fn write_run_log(logger: &Logger, f: &mut File, record: &SummaryEntry) {
    let entry = RunLogEntry {
        name: &record.name,
        result: record.result,
        message: record.message.as_deref(),
        end: OffsetDateTime::now_utc(),
    };
    if let Err(e) = serde_json::to_writer(&mut *f, &entry) {
        error!(logger, "Failed to write entry into log file"; "error" => %e, "entry" => ?entry);
    }
    if let Err(e) = f.write_all(b"\n") {
        error!(logger, "Failed to write into log file"; "error" => %e);
    }
}

/// Keep file names portable, config ids contain braces and commas.
fn log_file_name(name: &str, data_type: LogDataType) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", name, data_type.extension())
}

impl Summary {
    pub fn new(logger: Logger, tests: &[TestId]) -> Self {
        let records = tests
            .iter()
            .map(|t| {
                let entry = SummaryEntry {
                    name: t.path(),
                    result: Outcome::NotRun,
                    message: None,
                };
                (t.clone(), entry)
            })
            .collect();
        Self {
            logger,
            records,
            run_log: None,
            log_dir: None,
            progress_bar: None,
            run_name: String::new(),
            elapsed: None,
        }
    }

    /// Append every finalized test to a json lines file.
    pub fn with_run_log(mut self, path: &Path) -> Self {
        self.run_log = match File::create(path) {
            Ok(f) => Some(f),
            Err(e) => {
                error!(self.logger, "Failed to create log file"; "path" => ?path, "error" => %e);
                None
            }
        };
        self
    }

    /// Save raw test logs into this directory.
    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.progress_bar = Some(bar);
        self
    }

    /// The name the run was started with.
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Duration of the run, `None` until it ended.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn get(&self, test: &TestId) -> Option<&SummaryEntry> {
        self.records.get(test)
    }

    /// Entries in the order the tests were passed to [`Summary::new`].
    pub fn entries(&self) -> impl Iterator<Item = &SummaryEntry> + '_ {
        self.records.values()
    }

    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for e in self.entries() {
            stats.total += 1;
            match e.result {
                Outcome::Pass => stats.pass += 1,
                Outcome::Fail => stats.fail += 1,
                Outcome::NotRun => stats.not_run += 1,
            }
        }
        stats
    }
}

impl ResultSink for Summary {
    fn run_started(&mut self, name: &str, test_count: usize) {
        self.run_name = name.to_string();
        if let Some(bar) = &self.progress_bar {
            bar.set_length(test_count as u64);
        }
        if let Some(dir) = &self.log_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                error!(self.logger, "Failed to create log directory"; "error" => %e);
                self.log_dir = None;
            }
        }
    }

    fn test_started(&mut self, test: &TestId) {
        if !self.records.contains_key(test) {
            warn!(self.logger, "Start of unknown test"; "test" => %test);
        }
    }

    fn test_log(&mut self, name: &str, data_type: LogDataType, content: &str) {
        let dir = match &self.log_dir {
            Some(d) => d,
            None => return,
        };
        let path = dir.join(log_file_name(name, data_type));
        if let Err(e) = std::fs::write(&path, content) {
            warn!(self.logger, "Failed to write test log"; "path" => ?path, "error" => %e);
        }
    }

    fn test_failed(&mut self, test: &TestId, message: &str) {
        match self.records.get_mut(test) {
            Some(e) => {
                e.result = Outcome::Fail;
                e.message = Some(message.to_string());
            }
            None => warn!(self.logger, "Failure for unknown test"; "test" => %test),
        }
    }

    fn test_ended(&mut self, test: &TestId, _: &HashMap<String, String>) {
        let entry = match self.records.get_mut(test) {
            Some(e) => e,
            None => {
                warn!(self.logger, "Result for unknown test"; "test" => %test);
                return;
            }
        };
        if entry.result == Outcome::NotRun {
            entry.result = Outcome::Pass;
        }
        debug!(self.logger, "Test finished"; "test" => %test, "result" => ?entry.result);
        if let Some(f) = &mut self.run_log {
            write_run_log(&self.logger, f, entry);
        }

        if let Some(bar) = &self.progress_bar {
            bar.inc(1);
        }
    }

    fn run_ended(&mut self, elapsed: Duration) {
        self.elapsed = Some(elapsed);
        if let Some(f) = &mut self.run_log {
            if let Err(e) = f.flush() {
                error!(self.logger, "Failed to write into log file"; "error" => %e);
            }
        }
        if let Some(bar) = &self.progress_bar {
            bar.finish();
        }
    }
}

/// Write summary csv and xml file.
///
/// The xml file only contains failed tests and tests that did not run.
pub fn write_summary(
    summary: &Summary,
    csv_file: Option<&Path>,
    xml_file: Option<&Path>,
) -> Result<(), WriteSummaryError> {
    // Write csv
    if let Some(file) = csv_file {
        let mut writer = csv::Writer::from_path(file).map_err(WriteSummaryError::OpenCsvFile)?;
        for entry in summary.entries() {
            writer
                .serialize(entry)
                .map_err(WriteSummaryError::WriteCsvFile)?;
        }
        writer
            .flush()
            .map_err(|e| WriteSummaryError::WriteCsvFile(e.into()))?;
    }

    // Write xml
    if let Some(file) = xml_file {
        use junit_report::TestCase;

        let cases = summary.entries().filter_map(|e| {
            match e.result {
                Outcome::Pass => None,
                Outcome::Fail => {
                    let message = e.message.as_deref().unwrap_or_default();
                    let mut case = TestCase::failure(
                        &e.name,
                        junit_report::Duration::seconds(0),
                        "Fail",
                        message,
                    );
                    case.set_system_out(message);
                    Some(case)
                }
                Outcome::NotRun => Some(TestCase::error(
                    &e.name,
                    junit_report::Duration::seconds(0),
                    "NotRun",
                    "",
                )),
            }
        });
        let name = if summary.run_name.is_empty() {
            "dEQP"
        } else {
            summary.run_name.as_str()
        };
        let mut ts = junit_report::TestSuite::new(name);
        ts.add_testcases(cases);

        let mut r = junit_report::Report::new();
        r.add_testsuite(ts);
        let mut file = File::create(file).map_err(WriteSummaryError::OpenFile)?;
        r.write_xml(&mut file)
            .map_err(|e| WriteSummaryError::WriteXmlFile(e.to_string()))?;
    }
    Ok(())
}
