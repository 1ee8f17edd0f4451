use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::{BackendError, RateDecision, RateLimitBackend};

/// Sliding-window counter over a shared Redis sorted set: trim entries older
/// than the window, append now, count what remains. The four commands run as
/// one MULTI/EXEC transaction so concurrent gateways agree on the count.
pub struct SharedBackend {
	conn: MultiplexedConnection,
}

impl SharedBackend {
	pub async fn connect(url: &str) -> Result<Self, BackendError> {
		let client =
			redis::Client::open(url).map_err(|e| BackendError::Unavailable(e.to_string()))?;
		let conn = client
			.get_multiplexed_async_connection()
			.await
			.map_err(|e| BackendError::Unavailable(e.to_string()))?;
		info!("connected shared rate-limit backend");
		Ok(Self { conn })
	}
}

#[async_trait]
impl RateLimitBackend for SharedBackend {
	async fn hit(
		&self,
		key: &str,
		limit: u32,
		window: Duration,
	) -> Result<RateDecision, BackendError> {
		let now_ms = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map_err(|e| BackendError::Unavailable(e.to_string()))?
			.as_millis() as u64;
		let window_ms = window.as_millis() as u64;
		// Member must be unique per hit or concurrent ZADDs collapse.
		let mut nonce = [0u8; 4];
		rand::rng().fill_bytes(&mut nonce);
		let member = format!("{now_ms}-{}", hex::encode(nonce));

		let mut conn = self.conn.clone();
		let (_trimmed, _added, count, _expired): (i64, i64, i64, i64) = redis::pipe()
			.atomic()
			.cmd("ZREMRANGEBYSCORE")
			.arg(key)
			.arg(0)
			.arg(now_ms.saturating_sub(window_ms))
			.cmd("ZADD")
			.arg(key)
			.arg(now_ms)
			.arg(&member)
			.cmd("ZCARD")
			.arg(key)
			.cmd("PEXPIRE")
			.arg(key)
			.arg(window_ms)
			.query_async(&mut conn)
			.await
			.map_err(|e| BackendError::Unavailable(e.to_string()))?;

		let count = count.max(0) as u32;
		Ok(RateDecision {
			allowed: count <= limit,
			limit,
			remaining: limit.saturating_sub(count),
			reset_at: Utc::now() + window,
		})
	}
}
