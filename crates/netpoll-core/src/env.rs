//! Environment variable helpers
//!
//! Every tunable in netpoll reads a `NETPOLL_*` variable with a library
//! default. Unparsable values fall back to the default rather than failing.
//!
//! ```ignore
//! use netpoll_core::env::{env_get, env_get_millis};
//!
//! let pollers: usize = env_get("NETPOLL_NUM_POLLERS", 4);
//! let timeout = env_get_millis("NETPOLL_POLL_TIMEOUT_MS", 100);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable parsed as `T`, `None` if unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean variable. "1", "true", "yes", "on" are true; "0", "false", "no",
/// "off" are false; anything else keeps the default.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Duration variable expressed in milliseconds.
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Duration variable expressed in microseconds.
#[inline]
pub fn env_get_micros(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_get(key, default_us))
}
