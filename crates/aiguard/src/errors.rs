use axum::response::{IntoResponse, Response};
use chrono::Utc;
use http::{HeaderMap, StatusCode};
use serde_json::{Value, json};

/// Closed set of error kinds carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
	#[serde(rename = "INVALID_PROVIDER")]
	InvalidProvider,
	#[serde(rename = "UPSTREAM_ERROR")]
	UpstreamError,
	#[serde(rename = "NETWORK_ERROR")]
	NetworkError,
	#[serde(rename = "TIMEOUT")]
	Timeout,
	#[serde(rename = "INVALID_REQUEST")]
	InvalidRequest,
	#[serde(rename = "CONFIGURATION_ERROR")]
	ConfigurationError,
	#[serde(rename = "AUTHENTICATION_ERROR")]
	AuthenticationError,
	#[serde(rename = "RATE_LIMIT_EXCEEDED")]
	RateLimitExceeded,
	#[serde(rename = "QUOTA_EXCEEDED")]
	QuotaExceeded,
	#[serde(rename = "FORBIDDEN")]
	Forbidden,
	#[serde(rename = "NOT_FOUND")]
	NotFound,
	#[serde(rename = "CONFLICT")]
	Conflict,
	#[serde(rename = "DATABASE_ERROR")]
	DatabaseError,
	#[serde(rename = "VALIDATION_ERROR")]
	ValidationError,
	#[serde(rename = "UNKNOWN_ERROR")]
	UnknownError,
}

impl ErrorKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorKind::InvalidProvider => "INVALID_PROVIDER",
			ErrorKind::UpstreamError => "UPSTREAM_ERROR",
			ErrorKind::NetworkError => "NETWORK_ERROR",
			ErrorKind::Timeout => "TIMEOUT",
			ErrorKind::InvalidRequest => "INVALID_REQUEST",
			ErrorKind::ConfigurationError => "CONFIGURATION_ERROR",
			ErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
			ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
			ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
			ErrorKind::Forbidden => "FORBIDDEN",
			ErrorKind::NotFound => "NOT_FOUND",
			ErrorKind::Conflict => "CONFLICT",
			ErrorKind::DatabaseError => "DATABASE_ERROR",
			ErrorKind::ValidationError => "VALIDATION_ERROR",
			ErrorKind::UnknownError => "UNKNOWN_ERROR",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ErrorKind::InvalidProvider | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
			ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
			ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
			ErrorKind::Forbidden => StatusCode::FORBIDDEN,
			ErrorKind::NotFound => StatusCode::NOT_FOUND,
			ErrorKind::Conflict => StatusCode::CONFLICT,
			ErrorKind::RateLimitExceeded | ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
			ErrorKind::NetworkError => StatusCode::BAD_GATEWAY,
			ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
			ErrorKind::ConfigurationError
			| ErrorKind::DatabaseError
			| ErrorKind::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

/// A pipeline-stage failure rendered as the JSON error envelope.
///
/// Headers attached here (e.g. `Retry-After`, `X-RateLimit-*`) are carried
/// onto the final response so every denial explains itself.
#[derive(Debug, Clone)]
pub struct ApiError {
	pub kind: ErrorKind,
	pub message: String,
	pub details: Option<Value>,
	pub suggestions: Vec<String>,
	pub headers: HeaderMap,
	status_override: Option<StatusCode>,
}

impl ApiError {
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			details: None,
			suggestions: Vec::new(),
			headers: HeaderMap::new(),
			status_override: None,
		}
	}

	pub fn with_details(mut self, details: Value) -> Self {
		self.details = Some(details);
		self
	}

	pub fn with_suggestion(mut self, s: impl Into<String>) -> Self {
		self.suggestions.push(s.into());
		self
	}

	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		self.headers.extend(headers);
		self
	}

	/// Override the kind's default status (e.g. 413 for an oversized body).
	pub fn with_status(mut self, status: StatusCode) -> Self {
		self.status_override = Some(status);
		self
	}

	pub fn status(&self) -> StatusCode {
		self.status_override.unwrap_or_else(|| self.kind.status())
	}

	/// Render the envelope of the external interface contract.
	pub fn envelope(&self, path: &str, method: &str, request_id: Option<&str>) -> Value {
		let mut error = serde_json::Map::new();
		error.insert("type".into(), json!(self.kind.as_str()));
		error.insert("message".into(), json!(self.message));
		if let Some(details) = &self.details {
			error.insert("details".into(), details.clone());
		}
		error.insert("statusCode".into(), json!(self.status().as_u16()));
		error.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
		error.insert("path".into(), json!(path));
		error.insert("method".into(), json!(method));
		if let Some(id) = request_id {
			error.insert("requestId".into(), json!(id));
		}
		if !self.suggestions.is_empty() {
			error.insert("suggestions".into(), json!(self.suggestions));
		}
		json!({ "error": Value::Object(error) })
	}
}

impl std::fmt::Display for ApiError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.kind.as_str(), self.message)
	}
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		// The context middleware rewrites the body with the real path, method
		// and request id; the placeholder body keeps raw handler output valid.
		let body = self.envelope("", "", None);
		let mut resp = (
			self.status(),
			self.headers.clone(),
			axum::Json(body),
		)
			.into_response();
		resp.extensions_mut().insert(self);
		resp
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_shape() {
		let err = ApiError::new(ErrorKind::RateLimitExceeded, "too many requests")
			.with_details(json!({"limit": 10}))
			.with_suggestion("slow down");
		let env = err.envelope("/v1/messages", "POST", Some("abc123"));
		let e = &env["error"];
		assert_eq!(e["type"], "RATE_LIMIT_EXCEEDED");
		assert_eq!(e["statusCode"], 429);
		assert_eq!(e["path"], "/v1/messages");
		assert_eq!(e["method"], "POST");
		assert_eq!(e["requestId"], "abc123");
		assert_eq!(e["details"]["limit"], 10);
		assert_eq!(e["suggestions"][0], "slow down");
	}

	#[test]
	fn status_mapping() {
		assert_eq!(ErrorKind::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
		assert_eq!(ErrorKind::NetworkError.status(), StatusCode::BAD_GATEWAY);
		assert_eq!(
			ErrorKind::AuthenticationError.status(),
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			ErrorKind::ConfigurationError.status(),
			StatusCode::INTERNAL_SERVER_ERROR
		);
	}
}
