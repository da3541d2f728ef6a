//! Limiter kinds and canonical bucket key composition.

use serde::{Deserialize, Serialize};

use crate::error::GatekeeperError;

/// Prefix shared by every bucket key in the store.
const KEY_PREFIX: &str = "rate_limit";

/// The two identity kinds a request can be limited by.
///
/// A present, non-empty credential always selects `Credential`; otherwise
/// the caller's network address selects `Address`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterKind {
    #[default]
    Address,
    Credential,
}

impl LimiterKind {
    /// The wire spelling used in headers, bodies, and bucket keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::Address => "address",
            LimiterKind::Credential => "credential",
        }
    }
}

impl std::fmt::Display for LimiterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LimiterKind {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "address" => Ok(LimiterKind::Address),
            "credential" => Ok(LimiterKind::Credential),
            other => Err(GatekeeperError::Classification(format!(
                "unknown limiter kind: {}",
                other
            ))),
        }
    }
}

/// Compose the canonical storage key `rate_limit:<kind>:<identity>`.
pub fn storage_key(kind: LimiterKind, identity: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, kind, identity)
}

/// Recover the limiter kind embedded in a storage key.
///
/// Returns `None` when the key does not follow the canonical format.
pub fn kind_from_key(key: &str) -> Option<LimiterKind> {
    let rest = key.strip_prefix(KEY_PREFIX)?.strip_prefix(':')?;
    let kind = rest.split(':').next()?;
    kind.parse().ok()
}
