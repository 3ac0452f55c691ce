//! Queries if the device can run a configuration at all.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use slog::{debug, error, warn, Logger};
use thiserror::Error;

use crate::config::{BatchRunConfiguration, ROTATION_UNSPECIFIED};
use crate::device::{ChannelError, Device, DeviceError, LineReceiver};
use crate::DeqpPackage;

pub const FEATURE_LANDSCAPE: &str = "android.hardware.screen.landscape";
pub const FEATURE_PORTRAIT: &str = "android.hardware.screen.portrait";

const QUERY_INSTRUMENTATION_NAME: &str = "com.drawelements.deqp/com.drawelements.deqp.platformutil.DeqpPlatformCapabilityQueryInstrumentation";

/// The device does not behave well enough to decide if a configuration is supported.
#[derive(Debug, Error)]
pub enum CapabilityQueryError {
    #[error("Failed to query device: {0}")]
    Device(#[from] DeviceError),
    #[error("Capability query failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("Unexpected format of device feature {0:?}")]
    MalformedFeature(String),
    #[error("Capability query did not return a result: Supported={0}")]
    NoResult(String),
    #[error("Failed to run capability query, code: {code:?}, result: {result:?}")]
    QueryFailed {
        code: Option<i32>,
        result: HashMap<String, String>,
    },
}

/// Reads `INSTRUMENTATION_RESULT: key=value` and `INSTRUMENTATION_CODE: code` lines.
struct PlatformQueryParser {
    logger: Logger,
    results: HashMap<String, String>,
    code: Option<i32>,
}

impl LineReceiver for PlatformQueryParser {
    fn process_new_line(&mut self, line: &str) {
        if let Some(result) = line.strip_prefix("INSTRUMENTATION_RESULT: ") {
            match result.split_once('=') {
                Some((k, v)) => {
                    self.results.insert(k.to_string(), v.to_string());
                }
                None => warn!(self.logger, "Instrumentation result format unexpected";
                    "line" => line),
            }
        } else if let Some(code) = line.strip_prefix("INSTRUMENTATION_CODE: ") {
            match code.trim().parse() {
                Ok(c) => self.code = Some(c),
                Err(_) => warn!(self.logger, "Instrumentation code format unexpected";
                    "line" => line),
            }
        }
    }
}

/// `--abi <abi> ` for `am instrument`, or nothing if no abi is set.
pub(crate) fn abi_flag(abi: Option<&str>) -> String {
    match abi {
        Some(abi) => format!("--abi {} ", abi),
        None => String::new(),
    }
}

/// Every token of `pm list features` has the form `feature:<name>`.
fn parse_device_features(output: &str) -> Result<HashSet<String>, CapabilityQueryError> {
    output
        .split_whitespace()
        .map(|token| match token.split_once(':') {
            Some(("feature", name)) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(CapabilityQueryError::MalformedFeature(token.to_string())),
        })
        .collect()
}

/// Answers capability questions about one device, results are cached.
pub struct CapabilityQuery {
    logger: Logger,
    abi: Option<String>,
    timeout: Duration,
    device_features: Option<HashSet<String>>,
    /// Maps a query command line to the result.
    render_config_cache: HashMap<String, bool>,
}

impl CapabilityQuery {
    pub fn new(logger: Logger, abi: Option<String>, timeout: Duration) -> Self {
        Self {
            logger,
            abi,
            timeout,
            device_features: None,
            render_config_cache: HashMap::new(),
        }
    }

    /// Features of the device, queried once.
    pub async fn device_features<D: Device>(
        &mut self,
        device: &mut D,
    ) -> Result<&HashSet<String>, CapabilityQueryError> {
        let features = match self.device_features.take() {
            Some(f) => f,
            None => {
                let out = device.execute_shell_command("pm list features").await?;
                let features = parse_device_features(&out).map_err(|e| {
                    error!(self.logger, "Failed to parse device features"; "error" => %e);
                    e
                })?;
                debug!(self.logger, "Queried device features"; "count" => features.len());
                features
            }
        };
        Ok(&*self.device_features.insert(features))
    }

    /// If the device supports the screen rotation of a configuration.
    pub async fn is_orientation_supported<D: Device>(
        &mut self,
        device: &mut D,
        config: &BatchRunConfiguration,
    ) -> Result<bool, CapabilityQueryError> {
        if config.rotation() == ROTATION_UNSPECIFIED {
            return Ok(true);
        }
        let features = self.device_features(device).await?;
        if config.is_portrait_class_rotation() && !features.contains(FEATURE_PORTRAIT) {
            return Ok(false);
        }
        if config.is_landscape_class_rotation() && !features.contains(FEATURE_LANDSCAPE) {
            return Ok(false);
        }
        Ok(true)
    }

    /// If the device can create a render target for the configuration and GLES version.
    pub async fn is_render_config_supported<D: Device>(
        &mut self,
        device: &mut D,
        config: &BatchRunConfiguration,
        (major, minor): (u32, u32),
    ) -> Result<bool, CapabilityQueryError> {
        let mut cmd_line = config.display_command_line();
        if !cmd_line.is_empty() {
            cmd_line.push(' ');
        }
        cmd_line.push_str(&format!(
            "--deqp-gl-major-version={} --deqp-gl-minor-version={}",
            major, minor
        ));

        if let Some(&supported) = self.render_config_cache.get(&cmd_line) {
            return Ok(supported);
        }
        let supported = self.query_render_config(device, &cmd_line).await?;
        self.render_config_cache.insert(cmd_line, supported);
        Ok(supported)
    }

    async fn query_render_config<D: Device>(
        &self,
        device: &mut D,
        cmd_line: &str,
    ) -> Result<bool, CapabilityQueryError> {
        let command = format!(
            "am instrument {}-w -e deqpQueryType renderConfigSupported -e deqpCmdLine \"{}\" {}",
            abi_flag(self.abi.as_deref()),
            cmd_line,
            QUERY_INSTRUMENTATION_NAME
        );
        let mut parser = PlatformQueryParser {
            logger: self.logger.clone(),
            results: HashMap::new(),
            code: None,
        };
        device
            .execute_shell_command_streaming(&command, &mut parser, self.timeout)
            .await?;

        let res = match (parser.code, parser.results.get("Supported")) {
            (Some(0), Some(s)) if s == "Yes" => Ok(true),
            (Some(0), Some(s)) if s == "No" => Ok(false),
            (Some(0), Some(s)) => Err(CapabilityQueryError::NoResult(s.clone())),
            (code, _) => Err(CapabilityQueryError::QueryFailed {
                code,
                result: parser.results.clone(),
            }),
        };
        match &res {
            Ok(supported) => debug!(self.logger, "Queried render config";
                "cmd_line" => cmd_line, "supported" => supported),
            Err(e) => error!(self.logger, "Capability query failed"; "error" => %e),
        }
        res
    }

    /// Combines the orientation and, for GLES packages, the render config check.
    pub async fn is_configuration_supported<D: Device>(
        &mut self,
        device: &mut D,
        config: &BatchRunConfiguration,
        package: DeqpPackage,
    ) -> Result<bool, CapabilityQueryError> {
        if !self.is_orientation_supported(device, config).await? {
            return Ok(false);
        }
        match package.gles_version() {
            Some(version) => self.is_render_config_supported(device, config, version).await,
            None => Ok(true),
        }
    }
}
