//! Rate limit decision service.
//!
//! Every request except the health path is counted against the client's
//! identifier. Allowed requests get a 200 carrying the rate limit headers;
//! denied ones get a 429 with the same headers and `Remaining` pinned to 0.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use serde_json::json;
use tracing::{debug, instrument, trace};

use super::identifier::client_identifier;
use crate::ratelimit::{RateLimitPolicy, RateLimitResult};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// HTTP front for a [`RateLimitPolicy`].
pub struct RateLimitService {
    /// The policy every counted request goes through
    policy: Arc<RateLimitPolicy>,
    /// Path that is answered without touching the policy
    health_path: String,
}

impl RateLimitService {
    /// Create a new service around a policy.
    pub fn new(policy: Arc<RateLimitPolicy>, health_path: impl Into<String>) -> Self {
        Self {
            policy,
            health_path: health_path.into(),
        }
    }

    /// The policy behind this service.
    pub fn policy(&self) -> &Arc<RateLimitPolicy> {
        &self.policy
    }

    /// Answer one request.
    #[instrument(
        skip(self, req),
        fields(method = %req.method(), path = %req.uri().path())
    )]
    pub async fn handle<B>(&self, req: Request<B>, peer: Option<SocketAddr>) -> Response<Full<Bytes>> {
        if req.uri().path() == self.health_path {
            trace!("Health check");
            return json_response(StatusCode::OK, json!({ "status": "ok" }));
        }

        let identifier = client_identifier(req.headers(), peer);
        let result = self.policy.check(&identifier).await;

        if result.allowed {
            let mut response = json_response(
                StatusCode::OK,
                json!({
                    "allowed": true,
                    "limit": result.limit,
                    "remaining": result.remaining,
                    "reset_at": result.reset_at,
                }),
            );
            attach_rate_limit_headers(&mut response, &result);
            response
        } else {
            debug!(
                identifier = %identifier,
                limit = result.limit,
                reset_at = result.reset_at,
                "Rate limit exceeded"
            );
            let mut response = json_response(
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "Too Many Requests",
                    "message": "Rate limit exceeded. Please try again later.",
                }),
            );
            attach_rate_limit_headers(&mut response, &RateLimitResult { remaining: 0, ..result });
            response
        }
    }
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
pub fn attach_rate_limit_headers<B>(response: &mut Response<B>, result: &RateLimitResult) {
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_at));
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
