//! Limit policies and their resolution for a request.
//!
//! The policy table is built once at startup and is read-only afterwards. It
//! holds an ordered list of named-token limits, one fallback limit for tokens
//! that are not listed, and one limit for requests keyed by source address.

use std::time::Duration;

use tracing::{info, warn};

use super::identity::Identity;

/// Match key of the policy applied to requests without a token.
pub const BY_IP: &str = "by-ip";

/// Requests per window for an address without a token.
pub const DEFAULT_IP_LIMIT: u64 = 10;
/// Requests per window for a token missing from the named table.
pub const DEFAULT_FALLBACK_TOKEN_LIMIT: u64 = 20;
/// Requests per window for `NORMAL_TOKEN`.
pub const DEFAULT_NORMAL_TOKEN_LIMIT: u64 = 50;
/// Requests per window for `ULTRA_TOKEN`.
pub const DEFAULT_ULTRA_TOKEN_LIMIT: u64 = 100;
/// Length of the counting window in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 1;
/// How long an identity stays blocked once it exceeds its limit, in seconds.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// The tokens known out of the box.
pub const NORMAL_TOKEN: &str = "NORMAL_TOKEN";
pub const ULTRA_TOKEN: &str = "ULTRA_TOKEN";

/// A named-token limit as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLimit {
    /// The token literal
    pub token: String,
    /// Requests allowed per window
    pub limit: u64,
}

impl TokenLimit {
    pub fn new(token: &str, limit: u64) -> Self {
        Self {
            token: token.to_string(),
            limit,
        }
    }
}

/// Policy configuration handed to [`PolicyTable::new`].
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Requests per window for requests keyed by address
    pub ip_limit: u64,

    /// Requests per window for unrecognised tokens
    pub fallback_token_limit: u64,

    /// Named-token limits, matched in order
    pub tokens: Vec<TokenLimit>,

    /// Counting window in seconds
    pub window_secs: u64,

    /// Block duration in seconds
    pub retry_after_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ip_limit: default_ip_limit(),
            fallback_token_limit: default_fallback_token_limit(),
            tokens: default_token_limits(),
            window_secs: default_window_secs(),
            retry_after_secs: default_retry_after_secs(),
        }
    }
}

fn default_ip_limit() -> u64 {
    DEFAULT_IP_LIMIT
}

fn default_fallback_token_limit() -> u64 {
    DEFAULT_FALLBACK_TOKEN_LIMIT
}

fn default_token_limits() -> Vec<TokenLimit> {
    vec![
        TokenLimit::new(NORMAL_TOKEN, DEFAULT_NORMAL_TOKEN_LIMIT),
        TokenLimit::new(ULTRA_TOKEN, DEFAULT_ULTRA_TOKEN_LIMIT),
    ]
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_retry_after_secs() -> u64 {
    DEFAULT_RETRY_AFTER_SECS
}

/// A single limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitPolicy {
    /// A token literal, or [`BY_IP`]
    pub match_key: String,
    /// Requests allowed per window, always positive
    pub limit: u64,
}

/// The identity and limit that apply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub identity: Identity,
    pub limit: u64,
}

/// The immutable limit policy table.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    named: Vec<LimitPolicy>,
    fallback_token_limit: u64,
    ip: LimitPolicy,
    window: Duration,
    retry_after: Duration,
}

impl PolicyTable {
    /// Build the table, replacing any zero value with its default.
    pub fn new(config: &PolicyConfig) -> Self {
        let named = config
            .tokens
            .iter()
            .map(|t| LimitPolicy {
                match_key: t.token.clone(),
                limit: positive_or_default(
                    &format!("token limit for {}", t.token),
                    t.limit,
                    DEFAULT_FALLBACK_TOKEN_LIMIT,
                ),
            })
            .collect();

        let window_secs =
            positive_or_default("window_secs", config.window_secs, DEFAULT_WINDOW_SECS);
        let retry_after_secs = positive_or_default(
            "retry_after_secs",
            config.retry_after_secs,
            DEFAULT_RETRY_AFTER_SECS,
        );

        let table = Self {
            named,
            fallback_token_limit: positive_or_default(
                "fallback_token_limit",
                config.fallback_token_limit,
                DEFAULT_FALLBACK_TOKEN_LIMIT,
            ),
            ip: LimitPolicy {
                match_key: BY_IP.to_string(),
                limit: positive_or_default("ip_limit", config.ip_limit, DEFAULT_IP_LIMIT),
            },
            window: Duration::from_secs(window_secs),
            retry_after: Duration::from_secs(retry_after_secs),
        };

        info!(
            named_tokens = table.named.len(),
            ip_limit = table.ip.limit,
            fallback_token_limit = table.fallback_token_limit,
            window_secs = window_secs,
            retry_after_secs = retry_after_secs,
            "Limit policy table built"
        );

        table
    }

    /// Resolve the identity and limit for a request.
    ///
    /// A non-empty token always keys the request, even when it is not listed:
    /// unknown tokens get the fallback limit, never the address limit. An empty
    /// token counts as no token.
    pub fn resolve(&self, token: Option<&str>, remote_addr: &str) -> Resolution {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => Resolution {
                identity: Identity::token(token),
                limit: self.token_limit(token),
            },
            None => Resolution {
                identity: Identity::from_remote_addr(remote_addr),
                limit: self.ip.limit,
            },
        }
    }

    /// Limit for a token, falling back for unknown tokens.
    pub fn token_limit(&self, token: &str) -> u64 {
        self.named
            .iter()
            .find(|p| p.match_key == token)
            .map(|p| p.limit)
            .unwrap_or(self.fallback_token_limit)
    }

    /// The named-token policies, in match order.
    pub fn named(&self) -> &[LimitPolicy] {
        &self.named
    }

    /// The policy for requests keyed by address.
    pub fn ip_policy(&self) -> &LimitPolicy {
        &self.ip
    }

    pub fn fallback_token_limit(&self) -> u64 {
        self.fallback_token_limit
    }

    /// The counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The block duration applied once an identity exceeds its limit.
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new(&PolicyConfig::default())
    }
}

fn positive_or_default(name: &str, value: u64, default: u64) -> u64 {
    if value == 0 {
        warn!(setting = %name, default = default, "Limit must be positive, using default");
        default
    } else {
        value
    }
}
