//! Rate limiting rules and the decision engine.

mod key;
mod limiter;
mod rules;

pub use key::{kind_from_key, storage_key, LimiterKind};
pub use limiter::{mask_credential, Decision, RateLimiter};
pub use rules::{CredentialConfig, RateLimitConfig, Rule};
