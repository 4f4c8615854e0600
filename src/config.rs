//! Configuration management for Tollgate.
//!
//! Settings come from an optional file layered under environment variables.
//! Keys are flat (`ip_limit_per_second`, `redis_host`, ...); the matching
//! environment variables are their upper-case forms. Every value is parsed on
//! its own: a value that fails to parse, or a limit that is not positive, is
//! replaced by its default with a warning and never stops the service.

use std::net::SocketAddr;
use std::str::FromStr;

use tracing::{info, warn};

use crate::error::{GateError, Result};
use crate::ratelimit::{
    PolicyConfig, TokenLimit, DEFAULT_FALLBACK_TOKEN_LIMIT, DEFAULT_IP_LIMIT,
    DEFAULT_NORMAL_TOKEN_LIMIT, DEFAULT_RETRY_AFTER_SECS, DEFAULT_ULTRA_TOKEN_LIMIT,
    DEFAULT_WINDOW_SECS, NORMAL_TOKEN, ULTRA_TOKEN,
};
use crate::store::RedisSettings;

const LISTEN_ADDR: &str = "listen_addr";
const FAILURE_POLICY: &str = "failure_policy";
const CLEANUP_ENABLED: &str = "cleanup_enabled";
const REDIS_HOST: &str = "redis_host";
const REDIS_PORT: &str = "redis_port";
const REDIS_PASSWORD: &str = "redis_password";
const REDIS_DB: &str = "redis_db";
const IP_LIMIT: &str = "ip_limit_per_second";
const WINDOW: &str = "rate_window_seconds";
const RETRY_AFTER: &str = "retry_after_seconds";
const FALLBACK_TOKEN_LIMIT: &str = "default_token_rate_per_second";
const NORMAL_TOKEN_LIMIT: &str = "basic_token_rate_per_second";
const ULTRA_TOKEN_LIMIT: &str = "ultra_token_rate_per_second";
const TOKEN_LIMITS: &str = "token_limits";

/// Section names a nested file might use. Keys are flat, so these are reported
/// and otherwise ignored.
const NESTED_SECTIONS: [&str; 3] = ["server", "store", "policy"];

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default)]
pub struct GateConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Counter store connection settings
    pub store: RedisSettings,

    /// Limit policy configuration
    pub policy: PolicyConfig,
}

/// What the service does when the counter store cannot produce a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit the request
    Open,
    /// Reject the request
    #[default]
    Closed,
}

impl FromStr for FailurePolicy {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            other => Err(GateError::Config(format!(
                "unknown failure policy {:?}, expected \"open\" or \"closed\"",
                other
            ))),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen_addr: SocketAddr,

    /// Behaviour when the counter store fails
    pub failure_policy: FailurePolicy,

    /// Delete blocked counters once their block elapses
    pub cleanup_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            failure_policy: FailurePolicy::default(),
            cleanup_enabled: default_cleanup_enabled(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_cleanup_enabled() -> bool {
    true
}

impl GateConfig {
    /// Load configuration from an optional file and the environment.
    ///
    /// Fails only if the file itself cannot be read or parsed.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }
        let source = builder
            .add_source(config::Environment::default())
            .build()?;

        Ok(Self::from_source(&source))
    }

    /// Build the configuration from an already assembled source.
    pub fn from_source(source: &config::Config) -> Self {
        for section in NESTED_SECTIONS {
            if source.get_table(section).is_ok() {
                warn!(section = %section, "Nested configuration sections are not read; use flat keys");
            }
        }

        let defaults = RedisSettings::default();
        let store = RedisSettings {
            host: lookup(source, REDIS_HOST).unwrap_or(defaults.host),
            port: parse_or(source, REDIS_PORT, defaults.port),
            password: lookup(source, REDIS_PASSWORD),
            db: parse_or(source, REDIS_DB, defaults.db),
        };

        let server = ServerConfig {
            listen_addr: parse_or(source, LISTEN_ADDR, default_listen_addr()),
            failure_policy: parse_or(source, FAILURE_POLICY, FailurePolicy::default()),
            cleanup_enabled: parse_or(source, CLEANUP_ENABLED, default_cleanup_enabled()),
        };

        let mut tokens = vec![
            TokenLimit::new(
                NORMAL_TOKEN,
                limit_or(source, NORMAL_TOKEN_LIMIT, DEFAULT_NORMAL_TOKEN_LIMIT),
            ),
            TokenLimit::new(
                ULTRA_TOKEN,
                limit_or(source, ULTRA_TOKEN_LIMIT, DEFAULT_ULTRA_TOKEN_LIMIT),
            ),
        ];
        if let Some(raw) = lookup(source, TOKEN_LIMITS) {
            merge_token_limits(&mut tokens, parse_token_limits(&raw));
        }

        let policy = PolicyConfig {
            ip_limit: limit_or(source, IP_LIMIT, DEFAULT_IP_LIMIT),
            fallback_token_limit: limit_or(
                source,
                FALLBACK_TOKEN_LIMIT,
                DEFAULT_FALLBACK_TOKEN_LIMIT,
            ),
            tokens,
            window_secs: limit_or(source, WINDOW, DEFAULT_WINDOW_SECS),
            retry_after_secs: limit_or(source, RETRY_AFTER, DEFAULT_RETRY_AFTER_SECS),
        };

        Self {
            server,
            store,
            policy,
        }
    }
}

/// A non-empty string value for `key`.
fn lookup(source: &config::Config, key: &str) -> Option<String> {
    source
        .get_string(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(source: &config::Config, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(source, key) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => value,
        Err(e) => {
            warn!(key = %key, value = %raw, error = %e, default = ?default, "Invalid setting, using default");
            default
        }
    }
}

/// Parse a strictly positive limit.
fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|e| GateError::Config(format!("{} = {:?}: {}", key, raw, e)))?;
    if value <= 0 {
        return Err(GateError::Config(format!(
            "{} = {} must be a positive integer",
            key, value
        )));
    }
    Ok(value as u64)
}

fn limit_or(source: &config::Config, key: &str, default: u64) -> u64 {
    let Some(raw) = lookup(source, key) else {
        return default;
    };
    parse_positive(key, &raw).unwrap_or_else(|e| {
        warn!(error = %e, default = default, "Invalid limit, using default");
        default
    })
}

/// Parse `TOKEN=LIMIT[,TOKEN=LIMIT...]`. Entries without a token are skipped;
/// entries with an invalid limit get the fallback token limit.
fn parse_token_limits(raw: &str) -> Vec<TokenLimit> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let Some((token, limit)) = entry.split_once('=') else {
                warn!(entry = %entry, "Token limit entry is not TOKEN=LIMIT, skipping");
                return None;
            };
            let token = token.trim();
            if token.is_empty() {
                warn!(entry = %entry, "Token limit entry has no token, skipping");
                return None;
            }
            let limit = parse_positive(token, limit).unwrap_or_else(|e| {
                warn!(error = %e, default = DEFAULT_FALLBACK_TOKEN_LIMIT, "Invalid token limit, using default");
                DEFAULT_FALLBACK_TOKEN_LIMIT
            });
            Some(TokenLimit::new(token, limit))
        })
        .collect()
}

fn merge_token_limits(tokens: &mut Vec<TokenLimit>, extra: Vec<TokenLimit>) {
    for entry in extra {
        match tokens.iter_mut().find(|t| t.token == entry.token) {
            Some(existing) => existing.limit = entry.limit,
            None => tokens.push(entry),
        }
    }
}
