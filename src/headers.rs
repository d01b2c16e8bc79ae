//! Rendering a [`Decision`] as HTTP.
//!
//! Rejections become `429 Too Many Requests` with `Retry-After`; every response carries the
//! `X-RateLimit-*` trio.

use crate::engine::Decision;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Epoch milliseconds.
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Whole seconds until retrying makes sense, rounded up, at least 1.
pub fn retry_after_secs(decision: &Decision, now_millis: u64) -> u64 {
    let millis = u64::try_from(decision.retry_after(now_millis).as_millis()).unwrap_or(u64::MAX);
    (millis / 1000 + u64::from(millis % 1000 != 0)).max(1)
}

/// Header pairs for `decision`, in emission order.
pub fn rate_limit_headers(decision: &Decision, now_millis: u64) -> Vec<(&'static str, String)> {
    let remaining = if decision.allowed { decision.remaining } else { 0 };
    let mut headers = vec![
        (X_RATELIMIT_LIMIT, decision.limit.to_string()),
        (X_RATELIMIT_REMAINING, remaining.to_string()),
        (X_RATELIMIT_RESET, decision.reset_at.to_string()),
    ];
    if !decision.allowed {
        headers.push((RETRY_AFTER.as_str(), retry_after_secs(decision, now_millis).to_string()));
    }
    headers
}

/// Write the headers for `decision` into `map`, replacing previous values.
pub fn apply(decision: &Decision, map: &mut HeaderMap, now_millis: u64) {
    for (name, value) in rate_limit_headers(decision, now_millis) {
        // Names are static lowercase tokens and values are decimal digits.
        if let Ok(value) = HeaderValue::from_str(&value) {
            map.insert(HeaderName::from_static(name), value);
        }
    }
}

/// `Some(429)` for rejections, `None` to pass the handler's status through.
pub fn status(decision: &Decision) -> Option<StatusCode> {
    (!decision.allowed).then_some(StatusCode::TOO_MANY_REQUESTS)
}

/// Complete rejection response with an empty body.
pub fn too_many_requests<B: Default>(decision: &Decision, now_millis: u64) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    apply(decision, response.headers_mut(), now_millis);
    response
}
