use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue};
use tracing::warn;

use crate::models::{Project, Tier};

pub mod local;
pub mod shared;

/// One sliding-window check window.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
	#[error("rate limit backend unavailable: {0}")]
	Unavailable(String),
}

/// Outcome of a single counted hit against a key.
#[derive(Debug, Clone)]
pub struct RateDecision {
	pub allowed: bool,
	pub limit: u32,
	pub remaining: u32,
	pub reset_at: DateTime<Utc>,
}

impl RateDecision {
	pub fn open(limit: u32) -> Self {
		Self {
			allowed: true,
			limit,
			remaining: limit,
			reset_at: Utc::now() + WINDOW,
		}
	}

	/// `X-RateLimit-*` on every response; `Retry-After` only on denial.
	pub fn headers(&self) -> HeaderMap {
		let mut headers = HeaderMap::new();
		if let Ok(v) = HeaderValue::from_str(&self.limit.to_string()) {
			headers.insert("x-ratelimit-limit", v);
		}
		if let Ok(v) = HeaderValue::from_str(&self.remaining.to_string()) {
			headers.insert("x-ratelimit-remaining", v);
		}
		if let Ok(v) = HeaderValue::from_str(&self.reset_at.timestamp().to_string()) {
			headers.insert("x-ratelimit-reset", v);
		}
		if !self.allowed {
			let retry_after = (self.reset_at - Utc::now()).num_seconds().max(1);
			if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
				headers.insert(http::header::RETRY_AFTER, v);
			}
		}
		headers
	}
}

/// Contract shared by the in-process and Redis-backed window counters.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
	async fn hit(&self, key: &str, limit: u32, window: Duration)
	-> Result<RateDecision, BackendError>;
}

/// Policy selection plus the pluggable backend. Keyed per principal, falling
/// back to client ip for unauthenticated traffic (which only ever reaches
/// the error path, but still counts).
pub struct RateLimiter {
	backend: Arc<dyn RateLimitBackend>,
}

impl RateLimiter {
	pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
		Self { backend }
	}

	pub fn key(user_id: Option<&str>, client_ip: &str) -> String {
		match user_id {
			Some(id) => format!("ratelimit:user:{id}"),
			None => format!("ratelimit:ip:{client_ip}"),
		}
	}

	/// Project rate-limit override, else the tier default.
	pub fn limit_for(project: Option<&Project>) -> u32 {
		match project {
			Some(p) => p.settings.rate_limit.unwrap_or_else(|| p.tier().rate_limit()),
			None => Tier::Free.rate_limit(),
		}
	}

	/// Counts a hit and decides. A backend transport failure fails open:
	/// the request is allowed and the failure logged.
	pub async fn check(&self, key: &str, limit: u32) -> RateDecision {
		match self.backend.hit(key, limit, WINDOW).await {
			Ok(decision) => decision,
			Err(e) => {
				warn!(key, error = %e, "rate limit backend error, failing open");
				RateDecision::open(limit)
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct BrokenBackend;

	#[async_trait]
	impl RateLimitBackend for BrokenBackend {
		async fn hit(
			&self,
			_key: &str,
			_limit: u32,
			_window: Duration,
		) -> Result<RateDecision, BackendError> {
			Err(BackendError::Unavailable("connection refused".to_string()))
		}
	}

	#[tokio::test]
	async fn backend_failure_fails_open() {
		let limiter = RateLimiter::new(Arc::new(BrokenBackend));
		let decision = limiter.check("ratelimit:user:u1", 10).await;
		assert!(decision.allowed);
		assert_eq!(decision.limit, 10);
	}

	#[test]
	fn key_prefers_principal() {
		assert_eq!(
			RateLimiter::key(Some("u1"), "10.0.0.1"),
			"ratelimit:user:u1"
		);
		assert_eq!(RateLimiter::key(None, "10.0.0.1"), "ratelimit:ip:10.0.0.1");
	}

	#[test]
	fn denial_headers_explain_themselves() {
		let decision = RateDecision {
			allowed: false,
			limit: 10,
			remaining: 0,
			reset_at: Utc::now() + Duration::from_secs(30),
		};
		let headers = decision.headers();
		assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
		assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
		assert!(headers.contains_key("x-ratelimit-reset"));
		assert!(headers.contains_key(http::header::RETRY_AFTER));
	}

	#[test]
	fn tier_defaults_apply_without_override() {
		let mut p = Project::new("demo", "u1");
		assert_eq!(RateLimiter::limit_for(Some(&p)), 10);
		p.settings.rate_limit = Some(42);
		assert_eq!(RateLimiter::limit_for(Some(&p)), 42);
		assert_eq!(RateLimiter::limit_for(None), 10);
	}
}
