use std::env;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Read a variable, treating unset and blank as absent.
pub(crate) fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` when absent.
pub(crate) fn parse_env<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

/// Parse an optional variable.
pub(crate) fn parse_env_opt<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    env_var(name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_blank_is_absent() {
        unsafe {
            env::set_var("RELAY_TEST_BLANK", "   ");
        }
        assert_eq!(env_var("RELAY_TEST_BLANK"), None);
        assert_eq!(parse_env("RELAY_TEST_BLANK", 7u32).unwrap(), 7);
        unsafe {
            env::remove_var("RELAY_TEST_BLANK");
        }
    }

    #[test]
    #[serial]
    fn test_invalid_number_reports_name() {
        unsafe {
            env::set_var("RELAY_TEST_NUM", "abc");
        }
        let err = parse_env::<u16>("RELAY_TEST_NUM", 1).unwrap_err();
        assert!(err.to_string().contains("RELAY_TEST_NUM"));
        assert!(parse_env_opt::<u16>("RELAY_TEST_NUM").is_err());
        unsafe {
            env::remove_var("RELAY_TEST_NUM");
        }
    }
}
