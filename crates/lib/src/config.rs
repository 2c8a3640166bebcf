//! Runtime configuration.
//!
//! [`ExecuteConfig`] is the in-process configuration handed to the engine.
//! [`Settings`] reads the environment (`KILN_STORE`, `KILN_MAX_JOBS`,
//! `KILN_BUILD_TIMEOUT`, `KILN_SUBSTITUTERS`, `KILN_SANDBOX`); callers may
//! override any field afterwards, e.g. from command line flags.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::platform::paths::store_dir;

pub const ENV_MAX_JOBS: &str = "KILN_MAX_JOBS";
pub const ENV_BUILD_TIMEOUT: &str = "KILN_BUILD_TIMEOUT";
pub const ENV_SUBSTITUTERS: &str = "KILN_SUBSTITUTERS";
pub const ENV_SANDBOX: &str = "KILN_SANDBOX";

/// Default cap on captured stdout and stderr, per stream.
pub const DEFAULT_MAX_LOG_BYTES: usize = 1024 * 1024;

/// Default time between SIGTERM and SIGKILL when stopping a build.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value '{value}' for {var}: {message}")]
  InvalidValue {
    var: &'static str,
    value: String,
    message: String,
  },
}

/// How far builders are cut off from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
  /// Private user and mount namespaces where the kernel allows them: the
  /// builder sees its sandbox and read-only system directories, nothing
  /// else. Elsewhere builds run unisolated with a warning.
  #[default]
  Auto,
  /// Only the scrubbed environment and private working directory.
  Off,
}

impl FromStr for Isolation {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_ascii_lowercase().as_str() {
      "auto" | "on" => Ok(Isolation::Auto),
      "off" | "none" => Ok(Isolation::Off),
      _ => Err("expected 'auto' or 'off'".to_string()),
    }
  }
}

impl fmt::Display for Isolation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Isolation::Auto => f.write_str("auto"),
      Isolation::Off => f.write_str("off"),
    }
  }
}

/// Configuration for executing builds.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of recipes realized concurrently.
  pub max_jobs: usize,
  /// Wall-clock limit for a single build. `None` means no limit.
  pub build_timeout: Option<Duration>,
  /// Grace period between SIGTERM and SIGKILL.
  pub kill_grace: Duration,
  /// Bytes of stdout and of stderr kept per build.
  pub max_log_bytes: usize,
  pub isolation: Isolation,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      max_jobs: default_jobs(),
      build_timeout: None,
      kill_grace: DEFAULT_KILL_GRACE,
      max_log_bytes: DEFAULT_MAX_LOG_BYTES,
      isolation: Isolation::default(),
    }
  }
}

fn default_jobs() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
  pub store: PathBuf,
  pub execute: ExecuteConfig,
  /// Substituter URLs in priority order (`file://…`, `http(s)://…` or a plain path).
  pub substituters: Vec<String>,
}

impl Settings {
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut execute = ExecuteConfig::default();

    if let Some(value) = non_empty_var(ENV_MAX_JOBS) {
      execute.max_jobs = parse_jobs(ENV_MAX_JOBS, &value)?;
    }

    if let Some(value) = non_empty_var(ENV_BUILD_TIMEOUT) {
      execute.build_timeout = parse_timeout(ENV_BUILD_TIMEOUT, &value)?;
    }

    if let Some(value) = non_empty_var(ENV_SANDBOX) {
      execute.isolation = value.parse().map_err(|message| ConfigError::InvalidValue {
        var: ENV_SANDBOX,
        value,
        message,
      })?;
    }

    let substituters = non_empty_var(ENV_SUBSTITUTERS)
      .map(|v| v.split_whitespace().map(str::to_string).collect())
      .unwrap_or_default();

    Ok(Self {
      store: store_dir(),
      execute,
      substituters,
    })
  }
}

fn non_empty_var(var: &str) -> Option<String> {
  std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a job count. Zero is rejected.
pub fn parse_jobs(var: &'static str, value: &str) -> Result<usize, ConfigError> {
  match value.trim().parse::<usize>() {
    Ok(0) => Err(ConfigError::InvalidValue {
      var,
      value: value.to_string(),
      message: "must be at least 1".to_string(),
    }),
    Ok(n) => Ok(n),
    Err(e) => Err(ConfigError::InvalidValue {
      var,
      value: value.to_string(),
      message: e.to_string(),
    }),
  }
}

/// Parse a humantime duration such as `90s` or `1h 30m`. `none` and `0`
/// disable the timeout.
pub fn parse_timeout(var: &'static str, value: &str) -> Result<Option<Duration>, ConfigError> {
  let value = value.trim();
  if value.eq_ignore_ascii_case("none") || value == "0" {
    return Ok(None);
  }
  humantime::parse_duration(value)
    .map(Some)
    .map_err(|e| ConfigError::InvalidValue {
      var,
      value: value.to_string(),
      message: e.to_string(),
    })
}
