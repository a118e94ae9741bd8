//! Typed environment variable lookups
//!
//! Every lookup treats an unset or blank variable as "use the default" and
//! rejects values that do not parse, naming the variable in the error.

use std::str::FromStr;

use crate::error::{CommonError, Result};

/// Read a variable, mapping "unset" and "blank" to `None`
pub fn var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(CommonError::NotUnicode(name.to_string())),
    }
}

/// Read a string variable with a default
pub fn string_or(name: &str, default: &str) -> Result<String> {
    Ok(var(name)?.unwrap_or_else(|| default.to_string()))
}

/// Parse an optional variable
pub fn parse_opt<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name)? {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| CommonError::InvalidEnv {
                var: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Parse a variable with a default
pub fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(name)?.unwrap_or(default))
}

/// Read a boolean flag
///
/// Accepts `true/false`, `1/0`, `yes/no` and `on/off` in any case.
pub fn bool_or(name: &str, default: bool) -> Result<bool> {
    let Some(raw) = var(name)? else {
        return Ok(default);
    };

    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CommonError::InvalidEnv {
            var: name.to_string(),
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// Read a comma-separated list, dropping empty entries
pub fn list_or(name: &str, default: &[&str]) -> Result<Vec<String>> {
    match var(name)? {
        Some(raw) => Ok(split_list(&raw)),
        None => Ok(default.iter().map(|s| s.to_string()).collect()),
    }
}

/// Split a comma-separated value into trimmed, non-empty entries
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_unset_and_blank_use_default() {
        std::env::remove_var("FLAREPIPE_TEST_UNSET");
        assert_eq!(parse_or("FLAREPIPE_TEST_UNSET", 7u32).unwrap(), 7);

        std::env::set_var("FLAREPIPE_TEST_BLANK", "   ");
        assert_eq!(string_or("FLAREPIPE_TEST_BLANK", "fallback").unwrap(), "fallback");
        std::env::remove_var("FLAREPIPE_TEST_BLANK");
    }

    #[test]
    #[serial]
    fn test_parse_or_rejects_garbage() {
        std::env::set_var("FLAREPIPE_TEST_NUMBER", "ten");
        let err = parse_or("FLAREPIPE_TEST_NUMBER", 10u64).unwrap_err();
        assert!(err.to_string().contains("FLAREPIPE_TEST_NUMBER"));
        std::env::remove_var("FLAREPIPE_TEST_NUMBER");
    }

    #[test]
    #[serial]
    fn test_bool_or_accepts_common_spellings() {
        for (raw, expected) in [("TRUE", true), ("0", false), ("yes", true), ("Off", false)] {
            std::env::set_var("FLAREPIPE_TEST_FLAG", raw);
            assert_eq!(bool_or("FLAREPIPE_TEST_FLAG", !expected).unwrap(), expected);
        }
        std::env::set_var("FLAREPIPE_TEST_FLAG", "maybe");
        assert!(bool_or("FLAREPIPE_TEST_FLAG", true).is_err());
        std::env::remove_var("FLAREPIPE_TEST_FLAG");
    }

    #[test]
    #[serial]
    fn test_list_or() {
        std::env::set_var("FLAREPIPE_TEST_LIST", " a.com, ,b.org ,");
        assert_eq!(list_or("FLAREPIPE_TEST_LIST", &[]).unwrap(), vec!["a.com", "b.org"]);
        std::env::remove_var("FLAREPIPE_TEST_LIST");

        assert_eq!(list_or("FLAREPIPE_TEST_LIST", &["x"]).unwrap(), vec!["x"]);
    }
}
