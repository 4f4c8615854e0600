//! Admission middleware.
//!
//! Every request passes through [`admission`] before it reaches a handler.
//! A blocked identity gets `429 Too Many Requests` with a `Retry-After`
//! header and a JSON body; an admitted request continues down the stack.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::config::FailurePolicy;
use crate::ratelimit::DecisionEngine;
use crate::store::CounterStore;

/// Header carrying the caller's access token.
pub const API_KEY_HEADER: &str = "api_key";

/// Message returned to a blocked caller.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Message returned when no decision could be made and the service fails closed.
pub const UNAVAILABLE_MESSAGE: &str = "rate limiter unavailable";

/// Remote address used when the connection carries none.
const UNKNOWN_REMOTE: &str = "unknown";

/// JSON body of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitedBody {
    pub message: String,
}

/// Shared state of the admission middleware.
pub struct AdmissionState<S: CounterStore + 'static> {
    engine: Arc<DecisionEngine<S>>,
    failure_policy: FailurePolicy,
}

impl<S: CounterStore + 'static> AdmissionState<S> {
    pub fn new(engine: Arc<DecisionEngine<S>>, failure_policy: FailurePolicy) -> Self {
        Self {
            engine,
            failure_policy,
        }
    }

    pub fn engine(&self) -> &Arc<DecisionEngine<S>> {
        &self.engine
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

impl<S: CounterStore + 'static> Clone for AdmissionState<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            failure_policy: self.failure_policy,
        }
    }
}

/// Decide on a request and either reject it or pass it on.
#[instrument(
    skip_all,
    fields(method = %req.method(), path = %req.uri().path())
)]
pub async fn admission<S: CounterStore + 'static>(
    State(state): State<AdmissionState<S>>,
    req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(API_KEY_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| {
            warn!("Request carries no remote address");
            UNKNOWN_REMOTE.to_string()
        });

    match state.engine.decide(token.as_deref(), &remote_addr).await {
        Ok(decision) if decision.blocked => {
            debug!(
                remote = %remote_addr,
                retry_after_secs = decision.retry_after_secs,
                "Request rejected"
            );
            rate_limited(decision.retry_after_secs)
        }
        Ok(_) => next.run(req).await,
        Err(e) => match state.failure_policy {
            FailurePolicy::Open => {
                warn!(error = %e, remote = %remote_addr, "No admission decision, failing open");
                next.run(req).await
            }
            FailurePolicy::Closed => {
                error!(error = %e, remote = %remote_addr, "No admission decision, failing closed");
                unavailable()
            }
        },
    }
}

fn rate_limited(retry_after_secs: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_secs.to_string())],
        Json(RateLimitedBody {
            message: RATE_LIMITED_MESSAGE.to_string(),
        }),
    )
        .into_response()
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(RateLimitedBody {
            message: UNAVAILABLE_MESSAGE.to_string(),
        }),
    )
        .into_response()
}
