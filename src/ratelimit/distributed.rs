//! Distributed rate limiter backed by a Redis-compatible REST store.
//!
//! Counting happens inside the store: a Lua script evaluates a sliding
//! window over the current and previous fixed buckets atomically, so every
//! node sharing the store sees the same counts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use super::backend::{LimitSettings, RateLimitResult, RateLimiterBackend};
use super::clock::Clock;
use crate::error::{RateKeeperError, Result};

/// Sliding window evaluated by the store.
///
/// KEYS: current bucket, previous bucket. ARGV: limit, now (ms), window (ms),
/// increment. Returns -1 when over the limit, otherwise the remaining quota.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local current_key  = KEYS[1]
local previous_key = KEYS[2]
local limit        = tonumber(ARGV[1])
local now          = tonumber(ARGV[2])
local window       = tonumber(ARGV[3])
local increment_by = tonumber(ARGV[4])

local current  = tonumber(redis.call("GET", current_key) or "0")
local previous = tonumber(redis.call("GET", previous_key) or "0")

local elapsed = (now % window) / window
previous = math.floor((1 - elapsed) * previous)

if previous + current >= limit then
  return -1
end

local updated = redis.call("INCRBY", current_key, increment_by)
if updated == increment_by then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end
return limit - (updated + previous)
"#;

/// Connection settings for the distributed store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// REST endpoint of the store
    pub url: String,
    /// Bearer token for the endpoint
    pub token: String,
    /// Namespace prepended to every counter key
    pub key_prefix: String,
    /// Upper bound on a single round trip
    pub timeout: Duration,
}

/// Body returned by the store's REST API.
#[derive(Debug, Deserialize)]
struct StoreReply {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// A rate limiter whose counters live in a shared remote store.
pub struct DistributedRateLimiter {
    client: Client,
    endpoint: Url,
    token: String,
    key_prefix: String,
    settings: LimitSettings,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("endpoint", &self.endpoint.as_str())
            .field("key_prefix", &self.key_prefix)
            .field("settings", &self.settings)
            .finish()
    }
}

impl DistributedRateLimiter {
    /// Create a new distributed rate limiter.
    ///
    /// Fails when the endpoint or token is unusable, or when the settings
    /// cannot describe a window (zero limit or zero-length window).
    pub fn new(options: &StoreOptions, settings: LimitSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        let endpoint = Url::parse(options.url.trim())
            .map_err(|e| RateKeeperError::Backend(format!("invalid store URL: {}", e)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(RateKeeperError::Backend(format!(
                "unsupported store URL scheme: {}",
                endpoint.scheme()
            )));
        }

        let token = options.token.trim();
        if token.is_empty() {
            return Err(RateKeeperError::Backend("store token is empty".to_string()));
        }
        if settings.max_requests == 0 || settings.window_ms == 0 {
            return Err(RateKeeperError::Backend(format!(
                "limit and window must be positive (limit={}, window_ms={})",
                settings.max_requests, settings.window_ms
            )));
        }

        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| RateKeeperError::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
            key_prefix: options.key_prefix.clone(),
            settings,
            clock,
        })
    }

    /// Check the rate limit for an identifier against the shared store.
    pub async fn check(&self, identifier: &str) -> Result<RateLimitResult> {
        let now = self.clock.now_millis();
        let window_ms = self.settings.window_ms;
        let bucket = now / window_ms;

        let current_key = self.counter_key(identifier, bucket);
        let previous_key = self.counter_key(identifier, bucket.saturating_sub(1));

        trace!(
            identifier = %identifier,
            key = %current_key,
            "Checking distributed rate limit"
        );

        let command = json!([
            "EVAL",
            SLIDING_WINDOW_SCRIPT,
            "2",
            current_key,
            previous_key,
            self.settings.max_requests.to_string(),
            now.to_string(),
            window_ms.to_string(),
            "1",
        ]);

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        let reply = parse_reply(status, &body)?;

        let remaining = reply
            .result
            .as_ref()
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| RateKeeperError::Store {
                status: status.as_u16(),
                message: format!("reply has no integer result: {}", body),
            })?;

        let allowed = remaining >= 0;
        if !allowed {
            debug!(
                identifier = %identifier,
                limit = self.settings.max_requests,
                "Distributed rate limit exceeded"
            );
        }

        Ok(RateLimitResult {
            allowed,
            limit: self.settings.max_requests,
            remaining: remaining.clamp(0, u32::MAX as i64) as u32,
            reset_at: (bucket + 1).saturating_mul(window_ms),
        })
    }

    /// Key of the counter for one identifier and bucket.
    fn counter_key(&self, identifier: &str, bucket: u64) -> String {
        format!("{}:{}:{}", self.key_prefix, identifier, bucket)
    }
}

/// Turn an HTTP reply from the store into a [`StoreReply`] or an error.
fn parse_reply(status: StatusCode, body: &str) -> Result<StoreReply> {
    let parsed = serde_json::from_str::<StoreReply>(body);

    if let Ok(StoreReply { error: Some(message), .. }) = &parsed {
        return Err(RateKeeperError::Store {
            status: status.as_u16(),
            message: message.clone(),
        });
    }
    if !status.is_success() {
        return Err(RateKeeperError::Store {
            status: status.as_u16(),
            message: body.to_string(),
        });
    }

    parsed.map_err(|e| RateKeeperError::Store {
        status: status.as_u16(),
        message: format!("unreadable reply: {}", e),
    })
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check(&self, identifier: &str) -> Result<RateLimitResult> {
        DistributedRateLimiter::check(self, identifier).await
    }

    fn name(&self) -> &'static str {
        "distributed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NOW: u64 = 1_700_000_030_000;

    fn options(url: &str) -> StoreOptions {
        StoreOptions {
            url: url.to_string(),
            token: "secret-token".to_string(),
            key_prefix: "ratelimit".to_string(),
            timeout: Duration::from_millis(500),
        }
    }

    fn limiter(url: &str) -> DistributedRateLimiter {
        DistributedRateLimiter::new(
            &options(url),
            LimitSettings::new(5, 60_000),
            Arc::new(ManualClock::new(NOW)),
        )
        .unwrap()
    }

    async fn store_replying(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret-token"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_rejects_invalid_url() {
        let err = DistributedRateLimiter::new(
            &options("not a url"),
            LimitSettings::new(5, 60_000),
            Arc::new(ManualClock::new(NOW)),
        )
        .unwrap_err();
        assert!(matches!(err, RateKeeperError::Backend(_)));
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let result = DistributedRateLimiter::new(
            &options("redis://localhost:6379"),
            LimitSettings::new(5, 60_000),
            Arc::new(ManualClock::new(NOW)),
        );
        assert!(matches!(result, Err(RateKeeperError::Backend(_))));
    }

    #[test]
    fn test_rejects_empty_token() {
        let mut opts = options("https://store.example.com");
        opts.token = "  ".to_string();
        let result =
            DistributedRateLimiter::new(&opts, LimitSettings::new(5, 60_000), Arc::new(ManualClock::new(NOW)));
        assert!(matches!(result, Err(RateKeeperError::Backend(_))));
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = DistributedRateLimiter::new(
            &options("https://store.example.com"),
            LimitSettings::new(5, 0),
            Arc::new(ManualClock::new(NOW)),
        );
        assert!(matches!(result, Err(RateKeeperError::Backend(_))));
    }

    #[tokio::test]
    async fn test_allowed_reply() {
        let server = store_replying(ResponseTemplate::new(200).set_body_json(json!({ "result": 4 }))).await;
        let limiter = limiter(&server.uri());

        let result = limiter.check("203.0.113.7").await.unwrap();

        assert!(result.allowed);
        assert_eq!(result.limit, 5);
        assert_eq!(result.remaining, 4);
        assert_eq!(result.reset_at, 1_700_000_040_000);
    }

    #[tokio::test]
    async fn test_sends_eval_with_bucket_keys() {
        let server = store_replying(ResponseTemplate::new(200).set_body_json(json!({ "result": 4 }))).await;
        let limiter = limiter(&server.uri());

        limiter.check("203.0.113.7").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let command: Vec<serde_json::Value> = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(command[0], "EVAL");
        assert_eq!(command[2], "2");
        assert_eq!(command[3], "ratelimit:203.0.113.7:28333333");
        assert_eq!(command[4], "ratelimit:203.0.113.7:28333332");
        assert_eq!(command[5], "5");
        assert_eq!(command[6], NOW.to_string());
        assert_eq!(command[7], "60000");
    }

    #[tokio::test]
    async fn test_denied_reply() {
        let server = store_replying(ResponseTemplate::new(200).set_body_json(json!({ "result": -1 }))).await;
        let limiter = limiter(&server.uri());

        let result = limiter.check("203.0.113.7").await.unwrap();

        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_store_error_field_is_an_error() {
        let server = store_replying(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "ERR wrong number of arguments" })),
        )
        .await;
        let limiter = limiter(&server.uri());

        match limiter.check("ip").await {
            Err(RateKeeperError::Store { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("wrong number"));
            }
            other => panic!("expected store error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_an_error() {
        let server = store_replying(ResponseTemplate::new(503).set_body_string("unavailable")).await;
        let limiter = limiter(&server.uri());

        assert!(matches!(
            limiter.check("ip").await,
            Err(RateKeeperError::Store { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_non_integer_result_is_an_error() {
        let server = store_replying(ResponseTemplate::new(200).set_body_json(json!({ "result": "OK" }))).await;
        let limiter = limiter(&server.uri());

        assert!(limiter.check("ip").await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_token_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Unauthorized" })))
            .mount(&server)
            .await;
        let limiter = limiter(&server.uri());

        assert!(matches!(
            limiter.check("ip").await,
            Err(RateKeeperError::Store { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let server = store_replying(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "result": 4 }))
                .set_delay(Duration::from_secs(2)),
        )
        .await;
        let mut opts = options(&server.uri());
        opts.timeout = Duration::from_millis(100);
        let limiter =
            DistributedRateLimiter::new(&opts, LimitSettings::new(5, 60_000), Arc::new(ManualClock::new(NOW)))
                .unwrap();

        match limiter.check("ip").await {
            Err(RateKeeperError::Transport(e)) => assert!(e.is_timeout()),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_is_an_error() {
        // Port 9 (discard) is closed on test hosts.
        let limiter = limiter("http://127.0.0.1:9");
        assert!(matches!(
            limiter.check("ip").await,
            Err(RateKeeperError::Transport(_))
        ));
    }
}
