//! Fixed-window rate limiting at `RequestValidated`.
//!
//! Callers may pick the counting scope per request:
//!
//! ```json
//! "extension": { "rate_limit": { "scope": "function" } }
//! ```
//!
//! `caller` (the default) counts per caller id, `function` counts per target
//! URN across all callers.
//!
//! Anonymous callers have no id and all count against one shared
//! `caller:anonymous` window. A busy anonymous client can therefore exhaust
//! the limit for every other anonymous client; per-client limits for
//! unauthenticated traffic belong in front of the server, where the peer
//! address is known.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use forrst_core::{ErrorCode, ErrorInfo, ResponseObject};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::{Extension, HookOutcome, RequestValidated};
use crate::service::error::DispatchError;

/// Purge expired windows once every this many hits.
const PURGE_EVERY: u64 = 1024;

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Verdict for one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Shared counter store. Windows must expire on their own so that a crashed
/// node cannot leave a key blocked.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one hit against `key` in a window of `window` length.
    ///
    /// # Errors
    ///
    /// Backend failures; the pipeline reports them as internal errors.
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, DispatchError>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    length: Duration,
    count: u32,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.length
    }
}

/// Process-local [`RateLimiter`] on a [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    windows: DashMap<String, Window>,
    hits: AtomicU64,
}

impl InMemoryRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops windows whose time is up.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.windows.retain(|_, window| !window.is_expired(now));
    }

    /// Number of live counters.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, DispatchError> {
        let now = Instant::now();
        let decision = {
            let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
                started: now,
                length: window,
                count: 0,
            });
            if entry.is_expired(now) {
                *entry = Window {
                    started: now,
                    length: window,
                    count: 0,
                };
            }
            if entry.count < limit {
                entry.count += 1;
                RateDecision::Allowed {
                    remaining: limit - entry.count,
                }
            } else {
                RateDecision::Limited {
                    retry_after: entry
                        .length
                        .saturating_sub(now.duration_since(entry.started)),
                }
            }
        };
        if self.hits.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired();
        }
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// RateLimitExtension
// ---------------------------------------------------------------------------

/// Rejects calls over `limit` per `window` with `RATE_LIMITED`.
pub struct RateLimitExtension {
    limiter: Arc<dyn RateLimiter>,
    limit: u32,
    window: Duration,
}

impl RateLimitExtension {
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter>, limit: u32, window: Duration) -> Self {
        Self {
            limiter,
            limit,
            window,
        }
    }

    fn key(event: &RequestValidated<'_>) -> Result<String, ErrorInfo> {
        let scope = event
            .request
            .extension_options("rate_limit")
            .and_then(|options| options.get("scope"))
            .and_then(Value::as_str);
        match scope {
            None | Some("caller") => Ok(format!(
                "caller:{}",
                event.context.caller_id().unwrap_or("anonymous")
            )),
            Some("function") => Ok(format!("function:{}", event.request.function())),
            Some(other) => Err(ErrorInfo::new(
                ErrorCode::InvalidRequest,
                format!("unknown rate_limit scope `{other}`"),
            )
            .with_detail("field", "extension.rate_limit.scope")),
        }
    }
}

#[async_trait]
impl Extension for RateLimitExtension {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn on_request_validated(
        &self,
        event: &RequestValidated<'_>,
    ) -> Result<HookOutcome, DispatchError> {
        let id = Some(event.request.id().to_string());
        let key = match Self::key(event) {
            Ok(key) => key,
            Err(info) => return Ok(HookOutcome::StopPropagation(ResponseObject::failure(id, info))),
        };
        match self.limiter.hit(&key, self.limit, self.window).await? {
            RateDecision::Allowed { .. } => Ok(HookOutcome::Continue),
            RateDecision::Limited { retry_after } => {
                let retry_after_ms = u64::try_from(retry_after.as_millis())
                    .unwrap_or(u64::MAX)
                    .max(1);
                debug!(key = %key, retry_after_ms, "call rate limited");
                Ok(HookOutcome::StopPropagation(
                    DispatchError::RateLimited { retry_after_ms }.into_response(id),
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use forrst_core::{
        validate, CallContext, Caller, Principal, RequestObject, ValidatedRequest, ValidationRules,
    };
    use serde_json::json;

    use super::*;

    fn make_request(function: &str, scope: Option<&str>) -> ValidatedRequest {
        let mut req = RequestObject::new("r1", function, json!({}));
        if let Some(scope) = scope {
            req = req.with_extension("rate_limit", json!({ "scope": scope }));
        }
        validate(req, &ValidationRules::default().with_extensions(["rate_limit"])).unwrap()
    }

    fn ctx_for(caller: &str) -> CallContext {
        CallContext::new("n1", Caller::Principal(Principal::new(caller)), "t")
    }

    async fn run(ext: &RateLimitExtension, request: &ValidatedRequest, ctx: &CallContext) -> HookOutcome {
        ext.on_request_validated(&RequestValidated {
            request,
            context: ctx,
        })
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let limiter = InMemoryRateLimiter::new();
        let window = Duration::from_secs(1);
        for remaining in [1, 0] {
            assert_eq!(
                limiter.hit("k", 2, window).await.unwrap(),
                RateDecision::Allowed { remaining }
            );
        }
        assert!(matches!(
            limiter.hit("k", 2, window).await.unwrap(),
            RateDecision::Limited { .. }
        ));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(matches!(
            limiter.hit("k", 2, window).await.unwrap(),
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_expired_windows() {
        let limiter = InMemoryRateLimiter::new();
        limiter.hit("a", 5, Duration::from_millis(10)).await.unwrap();
        limiter.hit("b", 5, Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        limiter.purge_expired();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn over_limit_stops_with_retry_hint() {
        let ext = RateLimitExtension::new(
            Arc::new(InMemoryRateLimiter::new()),
            1,
            Duration::from_secs(10),
        );
        let request = make_request("app.echo", None);
        let ctx = ctx_for("alice");

        assert_eq!(run(&ext, &request, &ctx).await, HookOutcome::Continue);
        let HookOutcome::StopPropagation(response) = run(&ext, &request, &ctx).await else {
            panic!("expected the second call to be limited");
        };
        let error = response.primary_error().unwrap();
        assert_eq!(error.code, ErrorCode::RateLimited);
        assert_eq!(error.details.as_ref().unwrap()["retry_after_ms"], 10_000);
        assert_eq!(response.id(), Some("r1"));

        // Another caller has its own window.
        assert_eq!(run(&ext, &request, &ctx_for("bob")).await, HookOutcome::Continue);
    }

    #[tokio::test]
    async fn function_scope_is_shared_across_callers() {
        let ext = RateLimitExtension::new(
            Arc::new(InMemoryRateLimiter::new()),
            1,
            Duration::from_secs(60),
        );
        let request = make_request("app.export", Some("function"));
        assert_eq!(run(&ext, &request, &ctx_for("alice")).await, HookOutcome::Continue);
        assert!(matches!(
            run(&ext, &request, &ctx_for("bob")).await,
            HookOutcome::StopPropagation(_)
        ));
    }

    #[tokio::test]
    async fn unknown_scope_is_invalid_request() {
        let ext = RateLimitExtension::new(
            Arc::new(InMemoryRateLimiter::new()),
            10,
            Duration::from_secs(60),
        );
        let request = make_request("app.export", Some("planet"));
        let HookOutcome::StopPropagation(response) = run(&ext, &request, &ctx_for("a")).await else {
            panic!("expected stop");
        };
        assert_eq!(response.primary_error().unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn anonymous_callers_share_one_window() {
        let ext = RateLimitExtension::new(
            Arc::new(InMemoryRateLimiter::new()),
            1,
            Duration::from_secs(60),
        );
        let request = make_request("app.echo", None);
        let first = CallContext::new("n1", Caller::Anonymous, "trace-a");
        let second = CallContext::new("n1", Caller::Anonymous, "trace-b");

        assert_eq!(run(&ext, &request, &first).await, HookOutcome::Continue);
        assert!(matches!(
            run(&ext, &request, &second).await,
            HookOutcome::StopPropagation(_)
        ));
        // Named callers are unaffected by the anonymous window.
        assert_eq!(run(&ext, &request, &ctx_for("carol")).await, HookOutcome::Continue);
    }
}
