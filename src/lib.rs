//! Run dEQP test cases in batches on a remote Android device.
//!
//! Tests are sent to the on-device dEQP instrumentation in batches, one batch per run
//! configuration. The instrumentation output is parsed into per-test results. A test is reported
//! once all its configurations ran. When the connection to the device breaks, the runner escalates
//! through waiting, recovering and rebooting before it gives up.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use thiserror::Error;

pub mod capability;
pub mod caselist;
pub mod config;
pub mod device;
pub mod parser;
pub mod recovery;
pub mod runner;
pub mod sink;
#[cfg(feature = "bin")]
pub mod slog_pg;
pub mod summary;
pub mod tracker;

#[cfg(test)]
mod test_helpers;

pub use config::BatchRunConfiguration;
pub use device::{AdbDevice, ChannelError, Device, DeviceError, LineReceiver};
pub use runner::{DeqpTestRunner, RunError};
pub use sink::{LogDataType, ResultSink};
pub use summary::Summary;
pub use tracker::ResultTracker;

/// This many tests will be executed with a single instrumentation run.
pub const BATCH_SIZE: usize = 1000;
/// A shell command that prints nothing for this long is considered hung.
pub const UNRESPONSIVE_CMD_TIMEOUT: Duration = Duration::from_secs(60);

pub const LOG_FILE: &str = "run_log.json";
pub const CSV_SUMMARY: &str = "summary.csv";
pub const XML_SUMMARY: &str = "summary.xml";
/// Directory for raw test logs when log collection is enabled.
pub const TEST_LOG_DIR: &str = "logs";

pub static PROGRESS_BAR: Lazy<ProgressBar> = Lazy::new(|| {
    let bar = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{wide_bar} {pos}/{len} [{elapsed_precise}] ETA {eta}")
    {
        bar.set_style(style);
    }
    bar
});

static RESULT_VARIANTS: Lazy<HashMap<&str, StatusCode>> = Lazy::new(|| {
    let mut result_variants = HashMap::new();
    result_variants.insert("Pass", StatusCode::Pass);
    result_variants.insert("NotSupported", StatusCode::NotSupported);
    result_variants.insert("QualityWarning", StatusCode::QualityWarning);
    result_variants.insert("CompatibilityWarning", StatusCode::CompatibilityWarning);
    result_variants.insert("Fail", StatusCode::Fail);
    result_variants.insert("ResourceError", StatusCode::ResourceError);
    result_variants.insert("InternalError", StatusCode::InternalError);
    result_variants.insert("Crash", StatusCode::Crash);
    result_variants.insert("Timeout", StatusCode::Timeout);
    result_variants
});

#[derive(Clone, Debug)]
#[cfg_attr(feature = "bin", derive(clap::Parser))]
#[cfg_attr(feature = "bin", command(version, author, about))]
pub struct Options {
    /// A file with tests to run.
    ///
    /// One dEQP test path per line, empty lines and lines starting with `#` are skipped.
    #[cfg_attr(feature = "bin", arg(short, long))]
    pub tests: PathBuf,
    /// A json file with instance arguments for tests.
    ///
    /// Maps test paths to a list of objects with `glconfig`, `rotation` and `surfaceType` keys.
    /// Tests without instances run with the default configuration.
    #[cfg_attr(feature = "bin", arg(short, long))]
    pub instances: Option<PathBuf>,
    /// The dEQP package the tests belong to: dEQP-GLES2, dEQP-GLES3, dEQP-GLES31 or dEQP-EGL.
    #[cfg_attr(feature = "bin", arg(short, long))]
    pub package: DeqpPackage,
    /// Serial of the device to use.
    #[cfg_attr(feature = "bin", arg(short, long))]
    pub serial: Option<String>,
    #[cfg_attr(feature = "bin", arg(long))]
    pub abi: Option<String>,
    /// The dEQP apk that gets installed before running tests.
    ///
    /// If not set, the package is expected to be installed already.
    #[cfg_attr(feature = "bin", arg(long))]
    pub apk: Option<PathBuf>,
    /// Path to the adb executable.
    #[cfg_attr(feature = "bin", arg(long, default_value = "adb"))]
    pub adb: PathBuf,
    /// Directory for the summary files and logs.
    #[cfg_attr(feature = "bin", arg(short, long, default_value = "."))]
    pub output: PathBuf,
    /// Save raw dEQP test logs.
    #[cfg_attr(feature = "bin", arg(long))]
    pub collect_logs: bool,
    #[cfg_attr(feature = "bin", arg(long, default_value_t = BATCH_SIZE))]
    pub batch_size: usize,
    /// Timeout in seconds after which a command without output is considered hung.
    #[cfg_attr(feature = "bin", arg(long, default_value = "60"))]
    pub timeout: u32,
    /// Shuffle tests before running.
    ///
    /// This can uncover bugs that are not detected normally.
    #[cfg_attr(feature = "bin", arg(long))]
    pub shuffle: bool,
    /// Skip tests before this index.
    #[cfg_attr(feature = "bin", arg(long))]
    pub start: Option<usize>,
    /// Skip tests from this index on.
    #[cfg_attr(feature = "bin", arg(long))]
    pub end: Option<usize>,
    #[cfg_attr(feature = "bin", arg(long))]
    pub no_progress: bool,
}

/// Options for a single run of the runner.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub package: DeqpPackage,
    /// Passed as `--abi` to the instrumentation and the installer.
    pub abi: Option<String>,
    pub apk: Option<PathBuf>,
    /// Forward raw dEQP test logs to the result sink.
    pub collect_logs: bool,
    pub batch_size: usize,
    pub timeout: Duration,
}

/// Identifies a dEQP test case.
///
/// The class name is the test path without the last component.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TestId {
    class_name: String,
    test_name: String,
}

/// dEQP status codes reported for a test case.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum StatusCode {
    Pass,
    /// Counts as success
    NotSupported,
    /// Counts as success
    QualityWarning,
    /// Counts as success
    CompatibilityWarning,
    Fail,
    ResourceError,
    InternalError,
    Crash,
    Timeout,
    /// A code we do not know, counts as failure.
    Unknown(String),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DeqpPackage {
    Gles2,
    Gles3,
    Gles31,
    Egl,
}

#[derive(Debug, Error, Eq, PartialEq)]
#[error("Unknown dEQP package {0:?}")]
pub struct PackageParseError(String);

impl TestId {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }

    /// Split a dotted dEQP test path at the last `.`.
    pub fn from_path(path: &str) -> Self {
        match path.rsplit_once('.') {
            Some((class_name, test_name)) => Self::new(class_name, test_name),
            None => Self::new("", path),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// The dotted dEQP test path.
    pub fn path(&self) -> String {
        if self.class_name.is_empty() {
            self.test_name.clone()
        } else {
            format!("{}.{}", self.class_name, self.test_name)
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

impl StatusCode {
    pub fn from_code(code: &str) -> Self {
        RESULT_VARIANTS
            .get(code)
            .cloned()
            .unwrap_or_else(|| Self::Unknown(code.to_string()))
    }

    /// If the status makes the test instance fail.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            Self::Pass | Self::NotSupported | Self::QualityWarning | Self::CompatibilityWarning
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "{}", code),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl DeqpPackage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gles2 => "dEQP-GLES2",
            Self::Gles3 => "dEQP-GLES3",
            Self::Gles31 => "dEQP-GLES31",
            Self::Egl => "dEQP-EGL",
        }
    }

    /// Required OpenGL ES version as `(major, minor)`, `None` for packages that do not render
    /// through GLES.
    pub fn gles_version(&self) -> Option<(u32, u32)> {
        match self {
            Self::Gles2 => Some((2, 0)),
            Self::Gles3 => Some((3, 0)),
            Self::Gles31 => Some((3, 1)),
            Self::Egl => None,
        }
    }
}

impl FromStr for DeqpPackage {
    type Err = PackageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dEQP-GLES2" => Ok(Self::Gles2),
            "dEQP-GLES3" => Ok(Self::Gles3),
            "dEQP-GLES31" => Ok(Self::Gles31),
            "dEQP-EGL" => Ok(Self::Egl),
            _ => Err(PackageParseError(s.to_string())),
        }
    }
}

impl fmt::Display for DeqpPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl RunOptions {
    pub fn new(package: DeqpPackage) -> Self {
        Self {
            package,
            abi: None,
            apk: None,
            collect_logs: false,
            batch_size: BATCH_SIZE,
            timeout: UNRESPONSIVE_CMD_TIMEOUT,
        }
    }
}

/// Parses every line of the file as a test name.
///
/// Empty lines and lines starting with `#` will be skipped.
pub fn parse_test_file(content: &str) -> Vec<&str> {
    content
        .lines()
        .filter_map(|s| {
            let s = s.trim();
            if s.is_empty() || s.starts_with('#') {
                None
            } else {
                Some(s)
            }
        })
        .collect()
}

pub fn shuffle_tests(tests: &mut [TestId]) {
    tests.shuffle(&mut rand::thread_rng());
}
