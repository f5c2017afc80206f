//! Env-tunable timeout defaults.

/// Default correlation timeout (milliseconds) when neither config nor env
/// provide one.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

fn read_positive_u64_env(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Maximum allowed correlation timeout (milliseconds).
///
/// Env vars:
/// - `BRIDGE_REQUEST_TIMEOUT_MAX_MS` (preferred)
/// - `BRIDGE_REQUEST_TIMEOUT_MS` (fallback; sets both default+max)
#[must_use]
pub fn request_timeout_max_ms() -> u64 {
    read_positive_u64_env("BRIDGE_REQUEST_TIMEOUT_MAX_MS")
        .or_else(|| read_positive_u64_env("BRIDGE_REQUEST_TIMEOUT_MS"))
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)
}

/// Default correlation timeout (milliseconds) when the config file does not
/// set `requestTimeoutMs`. Always clamped to [`request_timeout_max_ms`].
#[must_use]
pub fn request_timeout_default_ms() -> u64 {
    let max = request_timeout_max_ms();
    let default = read_positive_u64_env("BRIDGE_REQUEST_TIMEOUT_MS")
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
    default.min(max).max(1)
}
