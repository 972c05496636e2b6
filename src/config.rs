//! Process configuration.
//!
//! Everything is read from environment variables once at start-up, the same
//! way the Docker deployment is configured. `VehicleLimits` is the constant
//! capability document served by `GET /api/config`; it is not persisted.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_DB_PATH: &str = "submarine.db";
pub const DEFAULT_TOKEN_HEADER: &str = "X-Operator-Token";
pub const DEFAULT_STATIC_DIR: &str = "static";
/// Target images live in this fixed sub-directory of the static root
pub const UPLOAD_SUBDIR: &str = "uploads";
pub const DEFAULT_SIMULATOR_INTERVAL_MS: u64 = 1500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    /// Shared operator secret. `None` disables the access guard entirely.
    pub operator_token: Option<String>,
    pub token_header: String,
    pub static_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub simulator_enabled: bool,
    pub simulator_interval: Duration,
    pub seed_demo_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            operator_token: None,
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            host: "0.0.0.0".to_string(),
            port: 5000,
            simulator_enabled: true,
            simulator_interval: Duration::from_millis(DEFAULT_SIMULATOR_INTERVAL_MS),
            seed_demo_data: true,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("PORT") {
            Some(raw) => parse_number::<u16>("PORT", &raw)?,
            None => defaults.port,
        };
        let simulator_interval = match lookup("SIMULATOR_INTERVAL_MS") {
            Some(raw) => {
                let ms = parse_number::<u64>("SIMULATOR_INTERVAL_MS", &raw)?;
                if ms == 0 {
                    return Err(ConfigError::InvalidValue {
                        name: "SIMULATOR_INTERVAL_MS",
                        value: raw,
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Duration::from_millis(ms)
            }
            None => defaults.simulator_interval,
        };

        Ok(Self {
            db_path: lookup("SUBMARINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            operator_token: lookup("OPERATOR_TOKEN").filter(|t| !t.is_empty()),
            token_header: lookup("OPERATOR_TOKEN_HEADER")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.token_header),
            static_dir: lookup("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            host: lookup("HOST").unwrap_or(defaults.host),
            port,
            simulator_enabled: lookup("SIMULATOR_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.simulator_enabled),
            simulator_interval,
            seed_demo_data: lookup("SEED_DEMO_DATA")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.seed_demo_data),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.static_dir.join(UPLOAD_SUBDIR)
    }
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// ============================================================================
// VEHICLE LIMITS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SoftLimits {
    pub max_pitch: f64,
    pub max_throttle: f64,
}

/// Static thresholds the console uses for warnings and input clamping
#[derive(Debug, Clone, Serialize)]
pub struct VehicleLimits {
    pub battery_low_v: f64,
    pub turbidity_max: f64,
    pub soft_limits: SoftLimits,
    pub roles: Vec<&'static str>,
}

impl Default for VehicleLimits {
    fn default() -> Self {
        Self {
            battery_low_v: 14.6,
            turbidity_max: 1.0,
            soft_limits: SoftLimits {
                max_pitch: 20.0,
                max_throttle: 0.7,
            },
            roles: vec!["viewer", "operator", "admin"],
        }
    }
}
