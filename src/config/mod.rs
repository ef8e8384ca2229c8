//! # Configuration
//!
//! Operator configuration loaded from environment variables.
//!
//! All configuration has defaults and can be overridden via environment variables,
//! which the deployment populates from a ConfigMap using `envFrom`.

mod controller;
mod server;

pub use controller::ControllerConfig;
pub use server::ServerConfig;

use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

/// Load configuration from environment variables with defaults
pub fn load_config() -> (ControllerConfig, ServerConfig) {
    (ControllerConfig::from_env(), ServerConfig::from_env())
}

/// Read environment variable or return default value
///
/// A value that does not parse is logged and replaced by the default.
pub(crate) fn env_var_or_default<T: FromStr>(key: &str, default: T) -> T
where
    <T as FromStr>::Err: Display,
{
    parse_or_default(key, std::env::var(key).ok(), default)
}

fn parse_or_default<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T
where
    <T as FromStr>::Err: Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring invalid configuration value, using default");
            default
        }
    }
}
