//! Environment variable helpers.

use std::str::FromStr;

/// Read a boolean flag. `1`, `true`, `yes` and `on` are true, any other
/// value is false, and an unset variable yields `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Read and parse a variable. `Ok(None)` when it is unset.
pub fn env_parse<T>(name: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::config(format!("{name}={value:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_bool(v), "{v}");
        }
    }

    #[test]
    fn test_parse_bool_falsy() {
        for v in ["0", "false", "", "nope", "2"] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn test_env_unset_uses_default() {
        assert!(env_bool("BUDP_TEST_HELPERS_UNSET_FLAG", true));
        assert!(!env_bool("BUDP_TEST_HELPERS_UNSET_FLAG", false));
        assert_eq!(
            env_parse::<u64>("BUDP_TEST_HELPERS_UNSET_NUMBER").unwrap(),
            None
        );
    }

    #[test]
    fn test_env_parse_reports_bad_value() {
        std::env::set_var("BUDP_TEST_HELPERS_BAD_NUMBER", "ten");
        let err = env_parse::<u64>("BUDP_TEST_HELPERS_BAD_NUMBER").unwrap_err();
        assert!(err.to_string().contains("BUDP_TEST_HELPERS_BAD_NUMBER"));
        std::env::remove_var("BUDP_TEST_HELPERS_BAD_NUMBER");
    }
}
