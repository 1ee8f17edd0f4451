use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use crate::errors::{ApiError, ErrorKind};

/// Hard cap on the serialized JSON body, independent of transport limits.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

// Conservative screens; false positives are acceptable here.
static SQL_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r#"(?i)\b(union|select|insert|update|delete|drop|create|alter)\b\s*(['";]|--|/\*)"#)
		.unwrap_or_else(|e| panic!("invalid sql screen pattern: {e}"))
});

static SCRIPT_INJECTION: LazyLock<[Regex; 3]> = LazyLock::new(|| {
	[
		r"(?i)<\s*script\b",
		r"(?i)javascript\s*:",
		r#"(?i)\bon[a-z]+\s*=\s*["']"#,
	]
	.map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid script screen pattern: {e}")))
});

/// Reject oversized or suspicious payloads before the schema pass runs.
pub fn screen(serialized: &str) -> Result<(), ApiError> {
	if serialized.len() > MAX_BODY_BYTES {
		return Err(
			ApiError::new(ErrorKind::InvalidRequest, "request body exceeds 1 MiB")
				.with_status(http::StatusCode::PAYLOAD_TOO_LARGE)
				.with_details(json!({ "maxBytes": MAX_BODY_BYTES, "actualBytes": serialized.len() })),
		);
	}
	if SQL_INJECTION.is_match(serialized) {
		return Err(ApiError::new(
			ErrorKind::InvalidRequest,
			"request body matches a disallowed SQL pattern",
		));
	}
	for re in SCRIPT_INJECTION.iter() {
		if re.is_match(serialized) {
			return Err(ApiError::new(
				ErrorKind::InvalidRequest,
				"request body matches a disallowed script pattern",
			));
		}
	}
	Ok(())
}
