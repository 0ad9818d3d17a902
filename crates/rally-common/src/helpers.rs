//! Common helper functions for Rally.

use std::str::FromStr;

/// Reads a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Reads and parses an environment variable, falling back to `default` when
/// it is unset or unparsable.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_variants() {
        std::env::set_var("RALLY_TEST_BOOL_ON", "Yes");
        std::env::set_var("RALLY_TEST_BOOL_OFF", "0");
        assert!(env_bool("RALLY_TEST_BOOL_ON", false));
        assert!(!env_bool("RALLY_TEST_BOOL_OFF", true));
        assert!(env_bool("RALLY_TEST_BOOL_MISSING", true));
    }

    #[test]
    fn test_env_parse_falls_back() {
        std::env::set_var("RALLY_TEST_PARSE_OK", " 42 ");
        std::env::set_var("RALLY_TEST_PARSE_BAD", "forty-two");
        assert_eq!(env_parse("RALLY_TEST_PARSE_OK", 7u64), 42);
        assert_eq!(env_parse("RALLY_TEST_PARSE_BAD", 7u64), 7);
        assert_eq!(env_parse("RALLY_TEST_PARSE_MISSING", 7u64), 7);
    }
}
