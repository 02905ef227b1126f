//! Configuration passed into the lifecycle components at construction.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Deployment target the service is being prepared for.
///
/// Only affects which extra env/volume bindings the caller adds to the
/// service options; the lifecycle components never look at it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    Local,
    Aws,
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "local" => Ok(Target::Local),
            "aws" => Ok(Target::Aws),
            other => Err(Error::Config(format!("unknown target: {other}"))),
        }
    }
}

/// Shape of the rendered Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpecConfig {
    /// Base image for the runtime.
    pub base_image: String,
    /// Working directory inside the image.
    pub workdir: String,
    /// Interpreter that executes the artifact.
    pub interpreter: String,
}

impl Default for BuildSpecConfig {
    fn default() -> Self {
        Self {
            base_image: "node:24".to_string(),
            workdir: "/app".to_string(),
            interpreter: "node".to_string(),
        }
    }
}

/// Readiness probe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub max_attempts: u32,
    /// Status code the health endpoint returns once ready.
    pub ready_status: u16,
    /// Delay after failed attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ready_status: 204,
            backoff_step: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration for localsvc services.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image tool binary (docker or a compatible CLI).
    pub tool: PathBuf,
    /// Log every tool invocation at info level.
    pub log_invocations: bool,
    pub target: Target,
    /// Region exported to the container for the AWS target.
    pub aws_region: Option<String>,
    pub build_spec: BuildSpecConfig,
    pub probe: ProbeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("docker"),
            log_invocations: false,
            target: Target::Local,
            aws_region: None,
            build_spec: BuildSpecConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

/// Parse a boolean-ish flag value ("1", "true", "yes", "on").
pub fn parse_flag(value: &str) -> bool {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return n != 0;
    }
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        assert_eq!("aws".parse::<Target>().unwrap(), Target::Aws);
        assert_eq!("AWS".parse::<Target>().unwrap(), Target::Aws);
        assert_eq!("local".parse::<Target>().unwrap(), Target::Local);
        assert_eq!("".parse::<Target>().unwrap(), Target::Local);
        assert!("gcp".parse::<Target>().is_err());
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag("2"));
        assert!(parse_flag("true"));
        assert!(parse_flag(" on "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
        assert!(!parse_flag("false"));
    }

    #[test]
    fn defaults_match_node_runtime() {
        let config = Config::default();
        assert_eq!(config.tool, PathBuf::from("docker"));
        assert_eq!(config.build_spec.base_image, "node:24");
        assert_eq!(config.build_spec.workdir, "/app");
        assert_eq!(config.probe.max_attempts, 3);
        assert_eq!(config.probe.ready_status, 204);
        assert_eq!(config.probe.backoff_step, Duration::from_millis(500));
    }
}
