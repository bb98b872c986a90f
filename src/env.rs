use std::str::FromStr;

use tracing::warn;

/// Non-empty process environment lookup.
pub(crate) fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parses `key` into `T`, falling back to `default` (with a warning) on a
/// malformed value. Absent keys fall back silently.
pub(crate) fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = var(key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = %default, "ignoring malformed env value");
            default
        }
    }
}

/// Boolean env flag: only the literal `false` (any case) turns it off.
pub(crate) fn flag_enabled(key: &str, default: bool) -> bool {
    match var(key) {
        Some(raw) => !raw.eq_ignore_ascii_case("false"),
        None => default,
    }
}
