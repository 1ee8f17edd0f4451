use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{BackendError, RateDecision, RateLimitBackend};

/// When the map grows past this, expired windows are swept on the next hit.
const SWEEP_THRESHOLD: usize = 10_000;

struct Window {
	count: u32,
	reset_at: DateTime<Utc>,
}

/// In-process window counter used when no shared key-value store is
/// configured. Single-node semantics only; a cluster wants [`super::shared`].
#[derive(Default)]
pub struct LocalBackend {
	windows: Mutex<HashMap<String, Window>>,
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
	async fn hit(
		&self,
		key: &str,
		limit: u32,
		window: Duration,
	) -> Result<RateDecision, BackendError> {
		let now = Utc::now();
		let mut windows = self.windows.lock();

		if windows.len() > SWEEP_THRESHOLD {
			windows.retain(|_, w| w.reset_at > now);
		}

		let entry = windows.entry(key.to_string()).or_insert_with(|| Window {
			count: 0,
			reset_at: now + window,
		});
		if entry.reset_at <= now {
			entry.count = 0;
			entry.reset_at = now + window;
		}
		entry.count += 1;

		Ok(RateDecision {
			allowed: entry.count <= limit,
			limit,
			remaining: limit.saturating_sub(entry.count),
			reset_at: entry.reset_at,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn denies_past_limit_within_window() {
		let backend = LocalBackend::default();
		let window = Duration::from_secs(60);
		for i in 1..=10 {
			let d = backend.hit("k", 10, window).await.unwrap();
			assert!(d.allowed, "hit {i} should be allowed");
			assert_eq!(d.remaining, 10 - i);
		}
		let d = backend.hit("k", 10, window).await.unwrap();
		assert!(!d.allowed);
		assert_eq!(d.remaining, 0);
	}

	#[tokio::test]
	async fn window_expiry_resets_count() {
		let backend = LocalBackend::default();
		let window = Duration::from_millis(20);
		for _ in 0..3 {
			backend.hit("k", 2, window).await.unwrap();
		}
		assert!(!backend.hit("k", 2, window).await.unwrap().allowed);
		tokio::time::sleep(Duration::from_millis(40)).await;
		assert!(backend.hit("k", 2, window).await.unwrap().allowed);
	}

	#[tokio::test]
	async fn keys_are_independent() {
		let backend = LocalBackend::default();
		let window = Duration::from_secs(60);
		for _ in 0..5 {
			backend.hit("a", 3, window).await.unwrap();
		}
		assert!(backend.hit("b", 3, window).await.unwrap().allowed);
	}
}
