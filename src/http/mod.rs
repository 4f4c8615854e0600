//! HTTP surface: the admission middleware and the server that hosts it.

mod middleware;
mod server;

pub use middleware::{
    admission, AdmissionState, RateLimitedBody, API_KEY_HEADER, RATE_LIMITED_MESSAGE,
    UNAVAILABLE_MESSAGE,
};
pub use server::{router, HttpServer, GREETING};
