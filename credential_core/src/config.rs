//! Lifecycle configuration.
//!
//! Consolidates the environment variables that control token lifetimes,
//! rotation cadence and store timeouts.

use crate::db::timeouts::DEFAULT_QUERY_TIMEOUT;
use chrono::Duration;
use std::time::Duration as StdDuration;

/// Configuration shared by all credential managers
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Default access code rotation interval in hours
    pub access_code_rotation_hours: i32,
    /// How often a rotation sweep loop polls for due codes
    pub rotation_check_interval: StdDuration,
    /// Lifetime of a refresh token
    pub refresh_token_ttl: Duration,
    /// Lifetime of a JWT access token
    pub access_token_ttl: Duration,
    /// Lifetime of an email verification token
    pub email_verification_ttl: Duration,
    /// Lifetime of a password reset token
    pub password_reset_ttl: Duration,
    /// Lifetime of a WebAuthn ceremony session
    pub webauthn_session_ttl: Duration,
    /// Upper bound on a single store call
    pub store_timeout: StdDuration,
    /// Accept assertions where both stored and presented sign counts are zero
    pub allow_zero_sign_count: bool,
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to defaults
    ///
    /// - `ACCESS_CODE_ROTATION_HOURS` (default: 24)
    /// - `ACCESS_CODE_ROTATION_CHECK_MINUTES` (default: 15)
    /// - `REFRESH_TOKEN_TTL_DAYS` (default: 30)
    /// - `ACCESS_TOKEN_TTL_HOURS` (default: 24)
    /// - `EMAIL_VERIFICATION_TTL_HOURS` (default: 24)
    /// - `PASSWORD_RESET_TTL_MINUTES` (default: 60)
    /// - `WEBAUTHN_SESSION_TTL_SECS` (default: 300)
    /// - `STORE_TIMEOUT_MS` (default: 5000)
    /// - `WEBAUTHN_ALLOW_ZERO_SIGN_COUNT` (default: false)
    pub fn from_env() -> Self {
        Self {
            access_code_rotation_hours: positive_env_or("ACCESS_CODE_ROTATION_HOURS", 24),
            rotation_check_interval: StdDuration::from_secs(
                60 * positive_env_or::<u64>("ACCESS_CODE_ROTATION_CHECK_MINUTES", 15),
            ),
            refresh_token_ttl: Duration::days(positive_env_or("REFRESH_TOKEN_TTL_DAYS", 30)),
            access_token_ttl: Duration::hours(positive_env_or("ACCESS_TOKEN_TTL_HOURS", 24)),
            email_verification_ttl: Duration::hours(positive_env_or(
                "EMAIL_VERIFICATION_TTL_HOURS",
                24,
            )),
            password_reset_ttl: Duration::minutes(positive_env_or(
                "PASSWORD_RESET_TTL_MINUTES",
                60,
            )),
            webauthn_session_ttl: Duration::seconds(positive_env_or(
                "WEBAUTHN_SESSION_TTL_SECS",
                300,
            )),
            store_timeout: StdDuration::from_millis(positive_env_or("STORE_TIMEOUT_MS", 5000)),
            allow_zero_sign_count: parse_env_or("WEBAUTHN_ALLOW_ZERO_SIGN_COUNT", false),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            access_code_rotation_hours: 24,
            rotation_check_interval: StdDuration::from_secs(15 * 60),
            refresh_token_ttl: Duration::days(30),
            access_token_ttl: Duration::hours(24),
            email_verification_ttl: Duration::hours(24),
            password_reset_ttl: Duration::hours(1),
            webauthn_session_ttl: Duration::minutes(5),
            store_timeout: DEFAULT_QUERY_TIMEOUT,
            allow_zero_sign_count: false,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}\nHint: {hint}")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Parse environment variable with default fallback
pub(crate) fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Like [`parse_env_or`], but values that are not strictly positive fall back too
fn positive_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
{
    let value = parse_env_or(key, default);
    if value > T::default() { value } else { default }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.access_code_rotation_hours, 24);
        assert_eq!(config.refresh_token_ttl, Duration::days(30));
        assert_eq!(config.password_reset_ttl, Duration::minutes(60));
        assert_eq!(config.webauthn_session_ttl, Duration::seconds(300));
        assert!(!config.allow_zero_sign_count);
        assert_eq!(config.store_timeout.as_millis(), 5000);
    }

    #[test]
    fn test_parse_env_or_falls_back_when_unset() {
        let value: u32 = parse_env_or("CREDENTIAL_CORE_TEST_UNSET_VARIABLE", 7);
        assert_eq!(value, 7);
    }
}
