//! Run configurations and their resolution from per-test instance arguments.

use std::collections::HashMap;
use std::fmt;

use indexmap::{IndexMap, IndexSet};

use crate::TestId;

pub const ROTATION_UNSPECIFIED: &str = "unspecified";
pub const ROTATION_PORTRAIT: &str = "0";
pub const ROTATION_LANDSCAPE: &str = "90";
pub const ROTATION_REVERSE_PORTRAIT: &str = "180";
pub const ROTATION_REVERSE_LANDSCAPE: &str = "270";

const DEFAULT_GL_CONFIG: &str = "rgba8888d24s8";
const DEFAULT_SURFACE_TYPE: &str = "window";

/// Instance arguments of one test, as key/value pairs (`glconfig`, `rotation`, `surfaceType`).
pub type InstanceArgs = HashMap<String, String>;

/// One configuration under which a test has to be run independently.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BatchRunConfiguration {
    gl_config: String,
    rotation: String,
    surface_type: String,
}

impl Default for BatchRunConfiguration {
    fn default() -> Self {
        Self::new(DEFAULT_GL_CONFIG, ROTATION_UNSPECIFIED, DEFAULT_SURFACE_TYPE)
    }
}

impl fmt::Display for BatchRunConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{glformat={},rotation={},surfacetype={}}}",
            self.gl_config, self.rotation, self.surface_type
        )
    }
}

impl BatchRunConfiguration {
    pub fn new(
        gl_config: impl Into<String>,
        rotation: impl Into<String>,
        surface_type: impl Into<String>,
    ) -> Self {
        Self {
            gl_config: gl_config.into(),
            rotation: rotation.into(),
            surface_type: surface_type.into(),
        }
    }

    /// Build a configuration from instance arguments, missing keys fall back to the default.
    pub fn from_instance_args(args: &InstanceArgs) -> Self {
        let default = Self::default();
        Self {
            gl_config: args.get("glconfig").cloned().unwrap_or(default.gl_config),
            rotation: args.get("rotation").cloned().unwrap_or(default.rotation),
            surface_type: args
                .get("surfaceType")
                .cloned()
                .unwrap_or(default.surface_type),
        }
    }

    /// String that uniquely identifies this configuration.
    pub fn id(&self) -> String {
        self.to_string()
    }

    pub fn gl_config(&self) -> &str {
        &self.gl_config
    }

    pub fn rotation(&self) -> &str {
        &self.rotation
    }

    pub fn surface_type(&self) -> &str {
        &self.surface_type
    }

    pub fn is_portrait_class_rotation(&self) -> bool {
        self.rotation == ROTATION_PORTRAIT || self.rotation == ROTATION_REVERSE_PORTRAIT
    }

    pub fn is_landscape_class_rotation(&self) -> bool {
        self.rotation == ROTATION_LANDSCAPE || self.rotation == ROTATION_REVERSE_LANDSCAPE
    }

    /// dEQP command line arguments that select this configuration.
    ///
    /// Empty fields are left out.
    pub fn display_command_line(&self) -> String {
        let mut args = Vec::with_capacity(3);
        if !self.gl_config.is_empty() {
            args.push(format!("--deqp-gl-config-name={}", self.gl_config));
        }
        if !self.rotation.is_empty() {
            args.push(format!("--deqp-screen-rotation={}", self.rotation));
        }
        if !self.surface_type.is_empty() {
            args.push(format!("--deqp-surface-type={}", self.surface_type));
        }
        args.join(" ")
    }
}

/// Resolve the configurations every test has to be run with.
///
/// Tests without instance arguments get the default configuration. The result keeps the order of
/// `tests` and the order in which configurations were first declared.
pub fn resolve_test_instances(
    tests: &[TestId],
    instance_args: &HashMap<TestId, Vec<InstanceArgs>>,
) -> IndexMap<TestId, IndexSet<BatchRunConfiguration>> {
    tests
        .iter()
        .map(|test| {
            let configs: IndexSet<_> = match instance_args.get(test) {
                Some(args) if !args.is_empty() => args
                    .iter()
                    .map(BatchRunConfiguration::from_instance_args)
                    .collect(),
                _ => std::iter::once(BatchRunConfiguration::default()).collect(),
            };
            (test.clone(), configs)
        })
        .collect()
}
