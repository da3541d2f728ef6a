//! Core rate limiting decision engine.

use std::sync::Arc;
use tracing::{debug, error, info, trace};

use super::key::{storage_key, LimiterKind};
use super::rules::{RateLimitConfig, Rule};
use crate::error::{GatekeeperError, Result};
use crate::storage::{now_unix_ms, BucketState, CounterStore};

/// The engine's per-request verdict plus its annotations.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The limit that applied
    pub limit: u64,
    /// Budget left in the current window
    pub remaining: u64,
    /// Unix milliseconds when the current window ends
    pub reset_at_ms: i64,
    /// Unix milliseconds until which the identity is quarantined
    pub blocked_until_ms: Option<i64>,
    /// Which identity kind was limited
    pub kind: LimiterKind,
}

/// The decision engine.
///
/// Stateless beyond its injected collaborators: a frozen configuration and
/// a counter store handle. Correctness under contention comes entirely
/// from the store's per-key atomicity; the engine holds no lock across
/// store calls and performs no retries of its own.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create an engine over the given store and frozen configuration.
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// The hot path: classify the caller, consult the store, and decide.
    ///
    /// A present, non-empty credential always selects the credential
    /// limit, even when the caller's address is currently blocked.
    pub async fn check(&self, address: &str, credential: &str) -> Result<Decision> {
        let (kind, identity) = classify(address, credential)?;
        let rule = self.config.rule_for(identity, kind);
        let key = storage_key(kind, identity);

        trace!(
            key = %key,
            kind = %kind,
            limit = rule.limit,
            "Rate limit check initiated"
        );

        let (blocked, blocked_until_ms) = self.store.is_blocked(&key).await?;
        if blocked {
            info!(key = %key, blocked_until_ms = ?blocked_until_ms, "Request denied by active block");
            return Ok(Decision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_at_ms: now_unix_ms() + rule.window.as_millis() as i64,
                blocked_until_ms,
                kind,
            });
        }

        let (count, window_start_ms) = self
            .store
            .increment(&key, rule.limit, rule.window)
            .await?;
        let remaining = rule.limit.saturating_sub(count);
        let reset_at_ms = window_start_ms + rule.window.as_millis() as i64;

        // Admission is inclusive: the (limit+1)-th hit is the first denial.
        if count > rule.limit {
            let blocked_until_ms = now_unix_ms() + rule.block_duration.as_millis() as i64;
            if let Err(e) = self.store.block(&key, rule.block_duration).await {
                // The overflow is still denied; only the marker write failed.
                error!(key = %key, error = %e, "Failed to install block after overflow");
            }

            info!(
                key = %key,
                count = count,
                limit = rule.limit,
                blocked_until_ms = blocked_until_ms,
                "Rate limit exceeded, identity blocked"
            );

            return Ok(Decision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_at_ms,
                blocked_until_ms: Some(blocked_until_ms),
                kind,
            });
        }

        debug!(
            key = %key,
            count = count,
            limit = rule.limit,
            remaining = remaining,
            "Request allowed"
        );

        Ok(Decision {
            allowed: true,
            limit: rule.limit,
            remaining,
            reset_at_ms,
            blocked_until_ms: None,
            kind,
        })
    }

    /// Whether the identity is currently admitted (not blocked).
    pub async fn is_allowed(&self, identity: &str, kind: LimiterKind) -> Result<bool> {
        let key = storage_key(kind, identity);
        let (blocked, _) = self.store.is_blocked(&key).await?;
        Ok(!blocked)
    }

    /// The rule that would apply to an identity. Never consults the store.
    pub fn rule_for(&self, identity: &str, kind: LimiterKind) -> Rule {
        self.config.rule_for(identity, kind)
    }

    /// Snapshot of the identity's bucket, annotated with the queried kind.
    pub async fn status(&self, identity: &str, kind: LimiterKind) -> Result<Option<BucketState>> {
        let key = storage_key(kind, identity);
        let mut state = self.store.get(&key).await?;
        if let Some(state) = state.as_mut() {
            state.kind = kind;
        }
        Ok(state)
    }

    /// Drop all counter and block state for an identity.
    pub async fn reset(&self, identity: &str, kind: LimiterKind) -> Result<()> {
        let key = storage_key(kind, identity);
        self.store.reset(&key).await?;
        info!(key = %key, "Rate limit state reset");
        Ok(())
    }
}

/// Select the limiter kind and identity for a request.
///
/// The credential is trimmed; when non-empty it wins over the address.
fn classify<'a>(address: &'a str, credential: &'a str) -> Result<(LimiterKind, &'a str)> {
    let credential = credential.trim();
    if !credential.is_empty() {
        return Ok((LimiterKind::Credential, credential));
    }

    let address = address.trim();
    if address.is_empty() {
        return Err(GatekeeperError::Classification(
            "neither address nor credential identifies the caller".into(),
        ));
    }
    Ok((LimiterKind::Address, address))
}

/// Mask a credential for log fields: first 8 characters then `***`.
pub fn mask_credential(credential: &str) -> String {
    if credential.is_empty() {
        return String::new();
    }
    let prefix: String = credential.chars().take(8).collect();
    format!("{}***", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::CredentialConfig;
    use crate::storage::MemoryStore;

    fn test_config() -> RateLimitConfig {
        let mut config = RateLimitConfig {
            default_address_limit: 10,
            default_credential_limit: 100,
            window_secs: 60,
            block_secs: 180,
            credentials: Default::default(),
        };
        config.credentials.insert(
            "premium".to_string(),
            CredentialConfig {
                limit: 1000,
                description: "premium tier".to_string(),
            },
        );
        config
    }

    fn test_limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), test_config())
    }

    #[tokio::test]
    async fn test_address_within_budget() {
        let limiter = test_limiter();

        for expected_remaining in (5..10).rev() {
            let decision = limiter.check("192.168.1.100", "").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.kind, LimiterKind::Address);
            assert_eq!(decision.limit, 10);
            assert_eq!(decision.remaining, expected_remaining);
            assert!(decision.blocked_until_ms.is_none());
        }
    }

    #[tokio::test]
    async fn test_overflow_is_first_denial() {
        let limiter = test_limiter();

        for _ in 0..10 {
            let decision = limiter.check("192.168.1.101", "").await.unwrap();
            assert!(decision.allowed);
        }

        let decision = limiter.check("192.168.1.101", "").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        let blocked_until = decision.blocked_until_ms.expect("overflow installs a block");
        assert!(blocked_until > now_unix_ms());

        // Subsequent calls short-circuit on the block.
        let decision = limiter.check("192.168.1.101", "").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_credential_overrides_blocked_address() {
        let limiter = test_limiter();

        for _ in 0..11 {
            limiter.check("192.168.1.101", "").await.unwrap();
        }
        assert!(!limiter.check("192.168.1.101", "").await.unwrap().allowed);

        let decision = limiter.check("192.168.1.101", "premium").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.kind, LimiterKind::Credential);
        assert_eq!(decision.limit, 1000);
    }

    #[tokio::test]
    async fn test_credential_precedence_trims_whitespace() {
        let limiter = test_limiter();

        let decision = limiter.check("10.0.0.1", "  premium  ").await.unwrap();
        assert_eq!(decision.kind, LimiterKind::Credential);
        assert_eq!(decision.limit, 1000);

        let decision = limiter.check("10.0.0.1", "   ").await.unwrap();
        assert_eq!(decision.kind, LimiterKind::Address);
    }

    #[tokio::test]
    async fn test_unknown_credential_gets_default_limit() {
        let limiter = test_limiter();

        let decision = limiter.check("10.0.0.1", "anonymous-key").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 100);
        assert_eq!(decision.remaining, 99);
    }

    #[tokio::test]
    async fn test_reset_recovers_admission() {
        let limiter = test_limiter();

        for _ in 0..11 {
            limiter.check("192.168.1.101", "").await.unwrap();
        }
        assert!(!limiter.check("192.168.1.101", "").await.unwrap().allowed);

        limiter
            .reset("192.168.1.101", LimiterKind::Address)
            .await
            .unwrap();

        let decision = limiter.check("192.168.1.101", "").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_status_annotates_kind() {
        let limiter = test_limiter();

        limiter.check("10.0.0.1", "premium").await.unwrap();
        let state = limiter
            .status("premium", LimiterKind::Credential)
            .await
            .unwrap()
            .expect("bucket exists after a hit");
        assert_eq!(state.kind, LimiterKind::Credential);
        assert_eq!(state.count, 1);

        assert!(limiter
            .status("10.9.9.9", LimiterKind::Address)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rule_for_is_pure_config_lookup() {
        let limiter = test_limiter();

        let rule = limiter.rule_for("premium", LimiterKind::Credential);
        assert_eq!(rule.limit, 1000);
        let rule = limiter.rule_for("10.0.0.1", LimiterKind::Address);
        assert_eq!(rule.limit, 10);
        assert_eq!(rule.window.as_secs(), 60);
        assert_eq!(rule.block_duration.as_secs(), 180);
    }

    #[tokio::test]
    async fn test_is_allowed_tracks_block_state() {
        let limiter = test_limiter();

        assert!(limiter
            .is_allowed("192.168.1.101", LimiterKind::Address)
            .await
            .unwrap());

        for _ in 0..11 {
            limiter.check("192.168.1.101", "").await.unwrap();
        }

        assert!(!limiter
            .is_allowed("192.168.1.101", LimiterKind::Address)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_identity_is_a_classification_error() {
        let limiter = test_limiter();

        let result = limiter.check("", "").await;
        assert!(matches!(result, Err(GatekeeperError::Classification(_))));
    }

    #[tokio::test]
    async fn test_concurrent_distinct_addresses_all_allowed() {
        let limiter = Arc::new(test_limiter());
        let mut handles = Vec::new();

        for caller in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let address = format!("10.1.0.{}", caller);
                let mut allowed = 0;
                for _ in 0..3 {
                    if limiter.check(&address, "").await.unwrap().allowed {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 60);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_admits_exactly_limit() {
        let limiter = Arc::new(test_limiter());
        let mut handles = Vec::new();

        for _ in 0..30 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("10.2.0.1", "").await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_mask_credential() {
        assert_eq!(mask_credential(""), "");
        assert_eq!(mask_credential("short"), "short***");
        assert_eq!(mask_credential("abcdefghij"), "abcdefgh***");
    }
}
