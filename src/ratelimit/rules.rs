//! Rate limit rules and the frozen limiter configuration.
//!
//! Budgets are resolved on demand from a configuration value frozen at
//! construction: addresses share one default limit, credentials use a
//! per-credential entry when one exists and fall back to the credential
//! default otherwise. Window and block duration are global.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::key::LimiterKind;
use crate::error::{GatekeeperError, Result};

/// Default request budget per address within one window.
const DEFAULT_ADDRESS_LIMIT: u64 = 10;
/// Default request budget per credential within one window.
const DEFAULT_CREDENTIAL_LIMIT: u64 = 100;
/// Default window length in seconds.
const DEFAULT_WINDOW_SECS: u64 = 60;
/// Default quarantine length in seconds.
const DEFAULT_BLOCK_SECS: u64 = 180;

/// Budget override for one specific credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Maximum requests allowed in the time window
    pub limit: u64,
    /// Human description of this credential's tier
    #[serde(default)]
    pub description: String,
}

/// Credential table file format: a mapping from credential string to its
/// budget override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: HashMap<String, CredentialConfig>,
}

/// The frozen rate limiting configuration consumed by the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Request budget per address within one window
    pub default_address_limit: u64,
    /// Request budget per credential within one window
    pub default_credential_limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Quarantine length in seconds after an overflow
    pub block_secs: u64,
    /// Per-credential budget overrides
    #[serde(default)]
    pub credentials: HashMap<String, CredentialConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_address_limit: DEFAULT_ADDRESS_LIMIT,
            default_credential_limit: DEFAULT_CREDENTIAL_LIMIT,
            window_secs: DEFAULT_WINDOW_SECS,
            block_secs: DEFAULT_BLOCK_SECS,
            credentials: HashMap::new(),
        }
    }
}

/// The budget applied to one bucket, derived on demand and never stored.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Which identity kind this rule applies to
    pub kind: LimiterKind,
    /// Maximum admitted hits within one window
    pub limit: u64,
    /// Window length
    pub window: Duration,
    /// Quarantine length installed on overflow
    pub block_duration: Duration,
    /// Human description of where the limit came from
    pub description: String,
}

impl RateLimitConfig {
    /// Create a configuration with default budgets and an empty credential
    /// table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configured budgets.
    ///
    /// Limits and window must be positive; the block duration may be zero
    /// (a zero-length quarantine expires immediately).
    pub fn validate(&self) -> Result<()> {
        if self.default_address_limit == 0 {
            return Err(GatekeeperError::Config(
                "default address limit must be greater than 0".into(),
            ));
        }
        if self.default_credential_limit == 0 {
            return Err(GatekeeperError::Config(
                "default credential limit must be greater than 0".into(),
            ));
        }
        if self.window_secs == 0 {
            return Err(GatekeeperError::Config(
                "window must be greater than 0 seconds".into(),
            ));
        }
        for (credential, config) in &self.credentials {
            if config.limit == 0 {
                return Err(GatekeeperError::Config(format!(
                    "credential {} has a zero limit",
                    super::limiter::mask_credential(credential)
                )));
            }
        }
        Ok(())
    }

    /// Load the credential table from a YAML file and merge it in.
    pub fn load_credentials<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let file: CredentialsFile = serde_yaml::from_str(&contents).map_err(|e| {
            GatekeeperError::Config(format!("failed to parse credential table: {}", e))
        })?;

        info!(
            path = %path.display(),
            credential_count = file.credentials.len(),
            "Credential table loaded"
        );

        self.credentials.extend(file.credentials);
        self.validate()
    }

    /// Derive the rule for one identity. Pure; never consults the store.
    pub fn rule_for(&self, identity: &str, kind: LimiterKind) -> Rule {
        let (limit, description) = match kind {
            LimiterKind::Address => (
                self.default_address_limit,
                format!("default address limit for {}", identity),
            ),
            LimiterKind::Credential => match self.credentials.get(identity) {
                Some(config) => (config.limit, config.description.clone()),
                None => (
                    self.default_credential_limit,
                    format!(
                        "default credential limit for {}",
                        super::limiter::mask_credential(identity)
                    ),
                ),
            },
        };

        Rule {
            kind,
            limit,
            window: Duration::from_secs(self.window_secs),
            block_duration: Duration::from_secs(self.block_secs),
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_premium() -> RateLimitConfig {
        let mut config = RateLimitConfig::new();
        config.credentials.insert(
            "premium".to_string(),
            CredentialConfig {
                limit: 1000,
                description: "premium tier".to_string(),
            },
        );
        config
    }

    #[test]
    fn test_defaults() {
        let config = RateLimitConfig::new();
        assert_eq!(config.default_address_limit, 10);
        assert_eq!(config.default_credential_limit, 100);
        assert_eq!(config.window_secs, 60);
        assert_eq!(config.block_secs, 180);
    }

    #[test]
    fn test_address_rule_uses_default() {
        let config = config_with_premium();
        let rule = config.rule_for("192.168.1.1", LimiterKind::Address);
        assert_eq!(rule.kind, LimiterKind::Address);
        assert_eq!(rule.limit, 10);
        assert_eq!(rule.window, Duration::from_secs(60));
        assert_eq!(rule.block_duration, Duration::from_secs(180));
    }

    #[test]
    fn test_known_credential_uses_override() {
        let config = config_with_premium();
        let rule = config.rule_for("premium", LimiterKind::Credential);
        assert_eq!(rule.limit, 1000);
        assert_eq!(rule.description, "premium tier");
    }

    #[test]
    fn test_unknown_credential_falls_through() {
        let config = config_with_premium();
        let rule = config.rule_for("anonymous", LimiterKind::Credential);
        assert_eq!(rule.limit, 100);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = RateLimitConfig::new();
        config.default_address_limit = 0;
        assert!(config.validate().is_err());

        let mut config = RateLimitConfig::new();
        config.window_secs = 0;
        assert!(config.validate().is_err());

        // Zero block duration is a valid, immediately-expiring quarantine.
        let mut config = RateLimitConfig::new();
        config.block_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_credentials_from_yaml() {
        use std::io::Write;

        let yaml = r#"
credentials:
  premium:
    limit: 1000
    description: Premium tier
  trial:
    limit: 25
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let mut config = RateLimitConfig::new();
        config.load_credentials(file.path()).unwrap();

        assert_eq!(config.credentials["premium"].limit, 1000);
        assert_eq!(config.credentials["premium"].description, "Premium tier");
        assert_eq!(config.credentials["trial"].limit, 25);
        assert!(config.credentials["trial"].description.is_empty());
    }

    #[test]
    fn test_load_credentials_rejects_zero_limit() {
        use std::io::Write;

        let yaml = "credentials:\n  broken:\n    limit: 0\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let mut config = RateLimitConfig::new();
        assert!(config.load_credentials(file.path()).is_err());
    }
}
