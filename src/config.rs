//! Configuration management for the election portal
//!
//! Loads settings from environment variables (and `.env`) with validation.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Salt for session token hashing (base64 encoded, minimum 32 bytes)
    pub session_salt: String,

    /// Session lifetime in seconds (default: 30 minutes)
    pub ttl_seconds: u64,
}

impl SessionConfig {
    /// Load session configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let session_salt = std::env::var("PORTAL_SESSION_SALT")
            .map_err(|_| Error::internal("PORTAL_SESSION_SALT environment variable required"))?;

        Self::validate_salt(&session_salt, "PORTAL_SESSION_SALT")?;

        let ttl_seconds = env_or("PORTAL_SESSION_TTL_SECONDS", "1800")?;

        Ok(Self {
            session_salt,
            ttl_seconds,
        })
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        use base64::Engine;
        let session_salt =
            base64::engine::general_purpose::STANDARD.encode(rand::random::<[u8; 32]>());

        Self {
            session_salt,
            ttl_seconds: 300,
        }
    }

    /// Validate a base64-encoded salt
    fn validate_salt(salt: &str, name: &str) -> Result<()> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(salt)
            .map_err(|_| Error::internal(format!("{name} must be valid base64")))?;

        if decoded.len() < 32 {
            return Err(Error::internal(format!(
                "{name} must be at least 32 bytes when decoded"
            )));
        }

        Ok(())
    }

    /// Get the session salt as a 32-byte hashing key
    pub fn salt_key(&self) -> Result<[u8; 32]> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&self.session_salt)
            .map_err(|_| Error::internal("Invalid session salt"))?;

        // Longer salts are folded down to a key rather than truncated
        Ok(*blake3::hash(&decoded).as_bytes())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Ballot submission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Attempts per tally increment before reporting contention
    pub tally_retry_limit: u32,

    /// Upper bound on a single store call in milliseconds
    pub store_timeout_ms: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            tally_retry_limit: 5,
            store_timeout_ms: 5000,
        }
    }
}

impl SubmissionConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Realtime feed settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Events buffered per subscriber before it is told to resync
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    pub session: SessionConfig,
    pub submission: SubmissionConfig,
    pub feed: FeedConfig,
    pub reference_path: Option<PathBuf>,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl PortalConfig {
    /// Load configuration from environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let session = SessionConfig::from_env()?;

        let submission = SubmissionConfig {
            tally_retry_limit: env_or("PORTAL_TALLY_RETRY_LIMIT", "5")?,
            store_timeout_ms: env_or("PORTAL_STORE_TIMEOUT_MS", "5000")?,
        };
        if submission.tally_retry_limit == 0 {
            return Err(Error::validation("PORTAL_TALLY_RETRY_LIMIT must be positive"));
        }

        let feed = FeedConfig {
            capacity: env_or("PORTAL_FEED_CAPACITY", "256")?,
        };
        if feed.capacity == 0 {
            return Err(Error::validation("PORTAL_FEED_CAPACITY must be positive"));
        }

        let reference_path = std::env::var("PORTAL_REFERENCE_PATH").ok().map(PathBuf::from);

        let logging = LoggingConfig {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
        };

        Ok(Self {
            session,
            submission,
            feed,
            reference_path,
            logging,
        })
    }

    /// Create configuration for testing
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig::for_testing(),
            submission: SubmissionConfig {
                tally_retry_limit: 3,
                store_timeout_ms: 1000,
            },
            feed: FeedConfig { capacity: 64 },
            reference_path: None,
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: &str) -> Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| Error::internal(format!("Invalid {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_validation() {
        let config = SessionConfig::for_testing();
        assert!(config.salt_key().is_ok());
        assert!(config.ttl_seconds > 0);
    }

    #[test]
    fn test_salt_validation() {
        use base64::Engine;
        let valid_salt = base64::engine::general_purpose::STANDARD.encode([0u8; 32]);
        assert!(SessionConfig::validate_salt(&valid_salt, "TEST").is_ok());

        let short_salt = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(SessionConfig::validate_salt(&short_salt, "TEST").is_err());

        assert!(SessionConfig::validate_salt("invalid_base64!", "TEST").is_err());
    }

    #[test]
    fn test_testing_defaults() {
        let config = PortalConfig::for_testing();
        assert!(config.submission.tally_retry_limit > 0);
        assert_eq!(config.submission.store_timeout(), Duration::from_millis(1000));
        assert!(config.feed.capacity > 0);
    }
}
