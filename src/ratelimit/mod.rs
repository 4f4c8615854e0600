//! Admission control: identity resolution, limit policy and decisions.

mod cleanup;
mod engine;
mod identity;
mod policy;

pub use cleanup::CleanupScheduler;
pub use engine::{Decision, DecisionEngine};
pub use identity::{Identity, IdentityKind};
pub use policy::{
    LimitPolicy, PolicyConfig, PolicyTable, Resolution, TokenLimit, BY_IP,
    DEFAULT_FALLBACK_TOKEN_LIMIT, DEFAULT_IP_LIMIT, DEFAULT_NORMAL_TOKEN_LIMIT,
    DEFAULT_RETRY_AFTER_SECS, DEFAULT_ULTRA_TOKEN_LIMIT, DEFAULT_WINDOW_SECS, NORMAL_TOKEN,
    ULTRA_TOKEN,
};
