use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{ApiError, ErrorKind};
use crate::providers::{Provider, registry};
use crate::usage::{StreamScanner, UsageCounts};

/// Request headers never relayed upstream.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
	"host",
	"x-ai-guard-provider",
	"x-ai-guard-project",
	"authorization",
	"connection",
	"content-length",
	"user-agent",
	"accept-encoding",
	"postman-token",
	"cache-control",
	"pragma",
];

/// Hop-by-hop response headers never relayed downstream.
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
	"content-encoding",
	"transfer-encoding",
	"connection",
	"content-length",
];

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
	#[error("upstream timed out")]
	Timeout,
	#[error("upstream request failed: {0}")]
	Network(String),
	#[error("failed to build upstream request: {0}")]
	Build(String),
}

impl From<ForwardError> for ApiError {
	fn from(err: ForwardError) -> Self {
		match err {
			ForwardError::Timeout => ApiError::new(ErrorKind::Timeout, err.to_string()),
			ForwardError::Network(_) => ApiError::new(ErrorKind::NetworkError, err.to_string()),
			ForwardError::Build(_) => ApiError::new(ErrorKind::UnknownError, err.to_string()),
		}
	}
}

pub struct ForwardRequest<'a> {
	pub provider: Provider,
	pub method: Method,
	pub path: &'a str,
	pub raw_query: Option<&'a str>,
	pub headers: &'a HeaderMap,
	pub body: Bytes,
	pub credential: &'a SecretString,
	pub streaming: bool,
}

pub struct ForwardReply {
	pub response: Response,
	pub status: StatusCode,
	/// Full upstream body, present only on the buffered path.
	pub buffered: Option<Bytes>,
}

/// A request is streamed when the caller asks for an event stream or the
/// body opts in with `stream: true`.
pub fn is_streaming(headers: &HeaderMap, body: Option<&Value>) -> bool {
	let accept_stream = headers
		.get(http::header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.contains("text/event-stream") || v.contains("application/x-ndjson"));
	let body_stream = body
		.and_then(|b| b.get("stream"))
		.and_then(Value::as_bool)
		.unwrap_or(false);
	accept_stream || body_stream
}

fn is_idempotent(method: &Method) -> bool {
	matches!(
		*method,
		Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
	)
}

/// Compose the upstream URL: registry origin + inbound path, with the
/// inbound query merged against the registry's constant parameters
/// (constants win ties). The host is implied by the origin.
fn compose_url(
	provider: Provider,
	path: &str,
	raw_query: Option<&str>,
	origin_override: Option<&str>,
) -> String {
	let entry = registry(provider);
	let origin = origin_override.unwrap_or(entry.origin);
	let mut pairs: Vec<(String, String)> = raw_query
		.unwrap_or_default()
		.split('&')
		.filter(|s| !s.is_empty())
		.map(|pair| match pair.split_once('=') {
			Some((k, v)) => (k.to_string(), v.to_string()),
			None => (pair.to_string(), String::new()),
		})
		.collect();
	for (k, v) in entry.constant_query {
		pairs.retain(|(key, _)| key != k);
		pairs.push((k.to_string(), v.to_string()));
	}
	if pairs.is_empty() {
		format!("{origin}{path}")
	} else {
		let query = pairs
			.iter()
			.map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
			.collect::<Vec<_>>()
			.join("&");
		format!("{origin}{path}?{query}")
	}
}

/// Filter the inbound headers, add registry constants where absent, then
/// attach the resolved credential on the provider's auth header.
fn compose_headers(
	provider: Provider,
	inbound: &HeaderMap,
	credential: &SecretString,
) -> Result<HeaderMap, ForwardError> {
	let entry = registry(provider);
	let mut headers = HeaderMap::new();
	for (name, value) in inbound {
		if DROPPED_REQUEST_HEADERS.contains(&name.as_str()) {
			continue;
		}
		headers.append(name.clone(), value.clone());
	}
	for (name, value) in entry.constant_headers {
		let name = http::HeaderName::from_bytes(name.as_bytes())
			.map_err(|e| ForwardError::Build(e.to_string()))?;
		if !headers.contains_key(&name) {
			headers.insert(name, HeaderValue::from_static(value));
		}
	}

	let auth_value = match entry.auth_prefix {
		Some(prefix) => format!("{prefix} {}", credential.expose_secret()),
		None => credential.expose_secret().to_string(),
	};
	let mut auth_value =
		HeaderValue::from_str(&auth_value).map_err(|e| ForwardError::Build(e.to_string()))?;
	auth_value.set_sensitive(true);
	let auth_name = http::HeaderName::from_bytes(entry.auth_header.as_bytes())
		.map_err(|e| ForwardError::Build(e.to_string()))?;
	headers.insert(auth_name, auth_value);
	Ok(headers)
}

/// Owns the pooled upstream client and the retry/timeout policy. Buffered
/// responses are fully read before relaying; streaming responses are piped
/// byte-for-byte with headers flushed first.
#[derive(Clone)]
pub struct Forwarder {
	client: reqwest::Client,
	timeout: Duration,
	max_retries: u32,
	retry_delay: Duration,
	origin_override: Option<String>,
}

impl Forwarder {
	pub fn new(client: reqwest::Client, config: &Config) -> Self {
		Self {
			client,
			timeout: config.request_timeout,
			max_retries: config.max_retries,
			retry_delay: config.retry_delay,
			origin_override: None,
		}
	}

	/// Route every provider at the given origin instead of the registry
	/// entry. Auth and header composition are unchanged.
	pub fn with_origin_override(mut self, origin: impl Into<String>) -> Self {
		self.origin_override = Some(origin.into());
		self
	}

	/// `on_stream_end` fires exactly once for streaming forwards: at the
	/// upstream's terminal frame, on transport error, or when the caller
	/// disconnects and the pipe is dropped.
	pub async fn forward(
		&self,
		req: ForwardRequest<'_>,
		on_stream_end: Option<Box<dyn FnOnce(UsageCounts) + Send + 'static>>,
	) -> Result<ForwardReply, ForwardError> {
		let url = compose_url(
			req.provider,
			req.path,
			req.raw_query,
			self.origin_override.as_deref(),
		);
		let headers = compose_headers(req.provider, req.headers, req.credential)?;
		let retryable = is_idempotent(&req.method);

		let mut attempt = 0u32;
		let upstream = loop {
			attempt += 1;
			let call = self
				.client
				.request(req.method.clone(), url.as_str())
				.headers(headers.clone())
				.body(req.body.clone());

			let result = tokio::time::timeout(self.timeout, call.send()).await;
			match result {
				Ok(Ok(resp)) => {
					// 5xx retries only for idempotent methods, and never on
					// the streaming path once a response exists.
					if resp.status().is_server_error()
						&& retryable && !req.streaming
						&& attempt <= self.max_retries
					{
						debug!(url = %url, status = %resp.status(), attempt, "retrying after upstream 5xx");
						tokio::time::sleep(self.retry_delay * attempt).await;
						continue;
					}
					break resp;
				},
				Ok(Err(e)) => {
					if retryable && attempt <= self.max_retries {
						debug!(url = %url, error = %e, attempt, "retrying after transport error");
						tokio::time::sleep(self.retry_delay * attempt).await;
						continue;
					}
					return Err(ForwardError::Network(e.to_string()));
				},
				Err(_) => {
					warn!(url = %url, attempt, "upstream attempt timed out");
					return Err(ForwardError::Timeout);
				},
			}
		};

		let status = upstream.status();
		let mut response_headers = HeaderMap::new();
		for (name, value) in upstream.headers() {
			if DROPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
				continue;
			}
			response_headers.append(name.clone(), value.clone());
		}

		if req.streaming {
			let scan = ScanState {
				scanner: Some(StreamScanner::new(req.provider)),
				on_end: on_stream_end,
			};
			let body = Body::from_stream(relay_stream(Box::pin(upstream.bytes_stream()), scan));
			Ok(ForwardReply {
				response: build_response(status, response_headers, body)?,
				status,
				buffered: None,
			})
		} else {
			let bytes = upstream
				.bytes()
				.await
				.map_err(|e| ForwardError::Network(e.to_string()))?;
			let body = Body::from(bytes.clone());
			Ok(ForwardReply {
				response: build_response(status, response_headers, body)?,
				status,
				buffered: Some(bytes),
			})
		}
	}
}

fn build_response(
	status: StatusCode,
	headers: HeaderMap,
	body: Body,
) -> Result<Response, ForwardError> {
	let mut builder = http::Response::builder().status(status);
	if let Some(h) = builder.headers_mut() {
		*h = headers;
	}
	builder
		.body(body)
		.map_err(|e| ForwardError::Build(e.to_string()))
}

struct ScanState {
	scanner: Option<StreamScanner>,
	on_end: Option<Box<dyn FnOnce(UsageCounts) + Send + 'static>>,
}

impl ScanState {
	fn finish(&mut self) {
		if let Some(scanner) = self.scanner.take()
			&& let Some(on_end) = self.on_end.take()
		{
			on_end(scanner.finish());
		}
	}
}

// A dropped downstream peer drops the whole pipe; account for whatever was
// seen up to that point.
impl Drop for ScanState {
	fn drop(&mut self) {
		self.finish();
	}
}

/// Pipe upstream frames to the caller unbuffered, feeding the usage scanner
/// as bytes pass through. Upstream errors propagate to the peer and close
/// the pipe.
fn relay_stream<S>(
	upstream: S,
	scan: ScanState,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send
where
	S: futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
	struct State<S> {
		upstream: S,
		scan: ScanState,
		done: bool,
	}

	futures::stream::unfold(
		State {
			upstream,
			scan,
			done: false,
		},
		|mut st| async move {
			if st.done {
				return None;
			}
			match st.upstream.next().await {
				Some(Ok(chunk)) => {
					if let Some(scanner) = st.scan.scanner.as_mut() {
						scanner.push(&chunk);
					}
					Some((Ok(chunk), st))
				},
				Some(Err(e)) => {
					st.done = true;
					st.scan.finish();
					Some((Err(std::io::Error::other(e.to_string())), st))
				},
				None => {
					st.scan.finish();
					None
				},
			}
		},
	)
}
