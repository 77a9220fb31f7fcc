//! Structured logging setup.
//!
//! Logs go to stderr so that stdout stays reserved for machine-readable
//! command output.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured logging
///
/// Levels are configurable via the `RUST_LOG` env var; the default keeps
/// sqlx quiet unless something goes wrong.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Log security event with structured data
///
/// # Arguments
///
/// * `event_type` - Type of security event
/// * `user_id` - Optional user the event concerns
/// * `message` - Event message
pub fn log_security_event(event_type: &str, user_id: Option<Uuid>, message: &str) {
    tracing::warn!(
        event_type = event_type,
        user_id = ?user_id,
        "SECURITY: {}",
        message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_security_event() {
        // Just ensure it doesn't panic without a subscriber
        log_security_event("jwt_revoked", Some(Uuid::new_v4()), "Operator revoked token");
        log_security_event("codes_revoked", None, "Bulk revocation");
    }
}
