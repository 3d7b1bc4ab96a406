// ABOUTME: Environment-driven configuration for the botyard binary
// ABOUTME: Reads BOTYARD_* variables, validates ranges and builds engine settings

use botyard_config as vars;
use botyard_sandbox::EngineSettings;
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number in {var}: {source}")]
    InvalidNumber {
        var: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{var}={value} is out of valid range ({min}-{max})")]
    OutOfRange {
        var: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("Invalid boolean in {var}: {value}")]
    InvalidBool { var: &'static str, value: String },
    #[error("Log replay lines ({replay}) cannot exceed log capacity ({capacity})")]
    ReplayExceedsCapacity { replay: usize, capacity: usize },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineSettings,
    pub image_pull_timeout: Duration,
    pub reconcile_on_startup: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineSettings::default();

        let bundles_root = env::var(vars::BOTYARD_BUNDLES_ROOT)
            .map(PathBuf::from)
            .unwrap_or(defaults.bundles_root);
        let image = non_empty_var(vars::BOTYARD_SANDBOX_IMAGE).unwrap_or(defaults.image);
        let interpreter =
            non_empty_var(vars::BOTYARD_SANDBOX_INTERPRETER).unwrap_or(defaults.interpreter);

        let memory_limit_mb = ranged(
            vars::BOTYARD_SANDBOX_MEMORY_MB,
            vars::DEFAULT_SANDBOX_MEMORY_MB,
            16,
            65_536,
        )?;
        let max_processes = ranged(
            vars::BOTYARD_SANDBOX_MAX_PROCESSES,
            vars::DEFAULT_SANDBOX_MAX_PROCESSES as u64,
            1,
            32_768,
        )? as i64;
        let stop_grace_secs = ranged(
            vars::BOTYARD_STOP_GRACE_SECS,
            vars::DEFAULT_STOP_GRACE_SECS,
            1,
            300,
        )?;
        let image_pull_secs = ranged(
            vars::BOTYARD_IMAGE_PULL_TIMEOUT_SECS,
            vars::DEFAULT_IMAGE_PULL_TIMEOUT_SECS,
            1,
            3_600,
        )?;
        let log_capacity = ranged(
            vars::BOTYARD_LOG_CAPACITY,
            vars::DEFAULT_LOG_CAPACITY as u64,
            1,
            1_000_000,
        )? as usize;
        let log_replay_lines = ranged(
            vars::BOTYARD_LOG_REPLAY_LINES,
            vars::DEFAULT_LOG_REPLAY_LINES as u64,
            0,
            1_000_000,
        )? as usize;

        if log_replay_lines > log_capacity {
            return Err(ConfigError::ReplayExceedsCapacity {
                replay: log_replay_lines,
                capacity: log_capacity,
            });
        }

        let reconcile_on_startup = match env::var(vars::BOTYARD_RECONCILE_ON_STARTUP) {
            Ok(value) => parse_bool(vars::BOTYARD_RECONCILE_ON_STARTUP, &value)?,
            Err(_) => true,
        };

        Ok(Config {
            engine: EngineSettings {
                bundles_root,
                image,
                interpreter,
                memory_limit_mb,
                max_processes,
                stop_grace: Duration::from_secs(stop_grace_secs),
                log_capacity,
                log_replay_lines,
                ..defaults
            },
            image_pull_timeout: Duration::from_secs(image_pull_secs),
            reconcile_on_startup,
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = ParseIntError>,
{
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|source| ConfigError::InvalidNumber { var, source }),
        Err(_) => Ok(default),
    }
}

fn ranged(var: &'static str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value = parse_var(var, default)?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            var,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}
