//! Environment-driven configuration shared by the receiver crates.
//!
//! Every config struct implements [`FromEnv`] on top of the small `env_*`
//! helpers below, so malformed variables surface as a
//! [`ConfigError`] naming the offending key.

pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

impl ConfigError {
    pub fn parse(key: &str, details: impl Display) -> Self {
        ConfigError::ParseError {
            key: key.to_string(),
            details: details.to_string(),
        }
    }
}

/// Deployment environment, selected through `APP_ENV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env_or_default("APP_ENV", "development");

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Read a variable, falling back to `default` when unset
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a variable that may be absent. Empty values count as absent.
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse a variable with `FromStr`, using `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env_optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::parse(key, e)),
        None => Ok(default),
    }
}

/// Parse a boolean flag. Accepts `true/false`, `1/0`, `yes/no` and `on/off`.
pub fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = env_optional(key) else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::parse(
            key,
            format!("'{}' is not a boolean", other),
        )),
    }
}

/// Parse a whole number of seconds into a [`Duration`]
pub fn env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_optional_treats_blank_as_missing() {
        temp_env::with_var("RECEIVER_TEST_OPTIONAL", Some("  "), || {
            assert_eq!(env_optional("RECEIVER_TEST_OPTIONAL"), None);
        });
        temp_env::with_var("RECEIVER_TEST_OPTIONAL", Some("value"), || {
            assert_eq!(env_optional("RECEIVER_TEST_OPTIONAL").as_deref(), Some("value"));
        });
    }

    #[test]
    fn test_env_parse_default_and_value() {
        temp_env::with_var_unset("RECEIVER_TEST_NUM", || {
            assert_eq!(env_parse("RECEIVER_TEST_NUM", 7u32).unwrap(), 7);
        });
        temp_env::with_var("RECEIVER_TEST_NUM", Some(" 12 "), || {
            assert_eq!(env_parse("RECEIVER_TEST_NUM", 7u32).unwrap(), 12);
        });
    }

    #[test]
    fn test_env_parse_invalid() {
        temp_env::with_var("RECEIVER_TEST_NUM", Some("twelve"), || {
            let err = env_parse("RECEIVER_TEST_NUM", 7u32).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "RECEIVER_TEST_NUM"));
        });
    }

    #[test]
    fn test_env_bool_variants() {
        for (raw, expected) in [("true", true), ("ON", true), ("0", false), ("no", false)] {
            temp_env::with_var("RECEIVER_TEST_FLAG", Some(raw), || {
                assert_eq!(env_bool("RECEIVER_TEST_FLAG", !expected).unwrap(), expected);
            });
        }
        temp_env::with_var("RECEIVER_TEST_FLAG", Some("maybe"), || {
            assert!(env_bool("RECEIVER_TEST_FLAG", false).is_err());
        });
    }

    #[test]
    fn test_env_duration_secs() {
        temp_env::with_var("RECEIVER_TEST_SECS", Some("30"), || {
            let value = env_duration_secs("RECEIVER_TEST_SECS", Duration::from_secs(1)).unwrap();
            assert_eq!(value, Duration::from_secs(30));
        });
    }
}
