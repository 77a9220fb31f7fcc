//! CLI configuration management.
//!
//! Consolidates all environment variable reads and provides validated configuration.

use credential_core::{ConfigError, CoreConfig, db::DatabaseConfig};

/// Complete CLI configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct CtlConfig {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Credential lifetimes, rotation cadence and store timeout
    pub core: CoreConfig,
}

impl CtlConfig {
    /// Load configuration from environment variables
    ///
    /// # Arguments
    ///
    /// * `database_url_override` - Optional database URL override (from CLI args)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingRequired` if no database URL is given and
    /// `DATABASE_URL` is not set
    pub fn from_env(database_url_override: Option<String>) -> Result<Self, ConfigError> {
        let database = match database_url_override {
            Some(url) => DatabaseConfig::with_url(url),
            None => DatabaseConfig::from_env()?,
        };

        Ok(Self {
            database,
            core: CoreConfig::from_env(),
        })
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "DB_MAX_CONNECTIONS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid {
                var: "DB_MIN_CONNECTIONS".to_string(),
                reason: format!(
                    "Cannot exceed max connections ({})",
                    self.database.max_connections
                ),
            });
        }

        if self.core.refresh_token_ttl <= self.core.access_token_ttl {
            return Err(ConfigError::Invalid {
                var: "REFRESH_TOKEN_TTL_DAYS".to_string(),
                reason: format!(
                    "Refresh tokens must outlive access tokens ({} hours)",
                    self.core.access_token_ttl.num_hours()
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> CtlConfig {
        CtlConfig {
            database: DatabaseConfig {
                database_url: "postgres://localhost/test".to_string(),
                max_connections: 10,
                min_connections: 1,
                connection_timeout_secs: 5,
                idle_timeout_secs: 300,
                max_lifetime_secs: 1800,
            },
            core: CoreConfig::default(),
        }
    }

    #[test]
    fn test_override_url_wins() {
        let config = CtlConfig::from_env(Some("postgres://override/db".to_string())).unwrap();
        assert_eq!(config.database.database_url, "postgres://override/db");
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_pool_bounds() {
        let mut config = config();
        config.database.min_connections = 20;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("DB_MIN_CONNECTIONS"));
    }

    #[test]
    fn test_config_validation_refresh_outlives_access() {
        let mut config = config();
        config.core.refresh_token_ttl = Duration::hours(1);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("REFRESH_TOKEN_TTL_DAYS"));
    }
}
