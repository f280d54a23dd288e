//! Env-var parsing helpers shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating empty strings as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a boolean env var. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{}'", other),
            }),
        },
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(key: &str, default: &str) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable name so parallel tests don't collide.

    #[test]
    fn test_parse_optional_env_default() {
        let v: u64 = parse_optional_env("JOBFLEET_TEST_UNSET_NUMBER", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_parse_optional_env_invalid() {
        unsafe { std::env::set_var("JOBFLEET_TEST_BAD_NUMBER", "ten") };
        let err = parse_optional_env::<u64>("JOBFLEET_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("JOBFLEET_TEST_BAD_NUMBER"));
        unsafe { std::env::remove_var("JOBFLEET_TEST_BAD_NUMBER") };
    }

    #[test]
    fn test_parse_bool_env_variants() {
        unsafe { std::env::set_var("JOBFLEET_TEST_BOOL", "Yes") };
        assert!(parse_bool_env("JOBFLEET_TEST_BOOL", false).unwrap());
        unsafe { std::env::set_var("JOBFLEET_TEST_BOOL", "off") };
        assert!(!parse_bool_env("JOBFLEET_TEST_BOOL", true).unwrap());
        unsafe { std::env::set_var("JOBFLEET_TEST_BOOL", "maybe") };
        assert!(parse_bool_env("JOBFLEET_TEST_BOOL", true).is_err());
        unsafe { std::env::remove_var("JOBFLEET_TEST_BOOL") };
    }

    #[test]
    fn test_empty_env_is_unset() {
        unsafe { std::env::set_var("JOBFLEET_TEST_EMPTY", "  ") };
        assert_eq!(optional_env("JOBFLEET_TEST_EMPTY").unwrap(), None);
        unsafe { std::env::remove_var("JOBFLEET_TEST_EMPTY") };
    }
}
