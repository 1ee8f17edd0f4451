use http::{HeaderMap, HeaderValue};
use serde_json::json;

use crate::errors::{ApiError, ErrorKind};
use crate::models::Project;

const WARN_RATIO: f64 = 0.9;

/// Admission verdict over a project's day/month counters. Pure over the
/// project snapshot: counters only advance after a successful forward, so an
/// upstream failure never burns budget. The small over-admission race under
/// concurrency is accepted.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
	pub admitted: bool,
	/// Which budget denied the request, when denied.
	pub exceeded: Option<&'static str>,
	pub day_used: u64,
	pub day_limit: u64,
	pub month_used: u64,
	pub month_limit: u64,
}

impl QuotaDecision {
	pub fn evaluate(project: &Project) -> Self {
		let day_used = project.usage.current_day.requests;
		let day_limit = project.daily_limit();
		let month_used = project.usage.current_month.requests;
		let month_limit = project.monthly_limit();

		let exceeded = if day_used >= day_limit {
			Some("daily")
		} else if month_used >= month_limit {
			Some("monthly")
		} else {
			None
		};

		Self {
			admitted: exceeded.is_none(),
			exceeded,
			day_used,
			day_limit,
			month_used,
			month_limit,
		}
	}

	fn near_limit(&self) -> bool {
		let day = self.day_used as f64 >= self.day_limit as f64 * WARN_RATIO;
		let month = self.month_used as f64 >= self.month_limit as f64 * WARN_RATIO;
		day || month
	}

	/// `X-Quota-*` headers carried on every admitted and denied response.
	pub fn headers(&self) -> HeaderMap {
		let mut headers = HeaderMap::new();
		let pairs = [
			("x-quota-daily-limit", self.day_limit),
			(
				"x-quota-daily-remaining",
				self.day_limit.saturating_sub(self.day_used),
			),
			("x-quota-monthly-limit", self.month_limit),
			(
				"x-quota-monthly-remaining",
				self.month_limit.saturating_sub(self.month_used),
			),
		];
		for (name, value) in pairs {
			if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
				headers.insert(name, v);
			}
		}
		if self.near_limit() {
			headers.insert(
				"x-quota-warning",
				HeaderValue::from_static("quota nearly exhausted"),
			);
		}
		headers
	}

	pub fn denial(&self) -> ApiError {
		let quota_type = self.exceeded.unwrap_or("daily");
		ApiError::new(
			ErrorKind::QuotaExceeded,
			format!("{quota_type} request quota exhausted"),
		)
		.with_details(json!({
			"quotaType": quota_type,
			"dayUsed": self.day_used,
			"dayLimit": self.day_limit,
			"monthUsed": self.month_used,
			"monthLimit": self.month_limit,
		}))
		.with_headers(self.headers())
	}
}
