use std::sync::Arc;

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::HeaderValue;
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::audit::AuditWriter;
use crate::auth::identity::IdentityVerifier;
use crate::auth::validator::TokenValidator;
use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::crypto::CryptoVault;
use crate::errors::ApiError;
use crate::management;
use crate::providers::Provider;
use crate::proxy::forward::Forwarder;
use crate::proxy::pipeline;
use crate::ratelimit::{RateLimitBackend, RateLimiter};
use crate::store::Stores;
use crate::usage::UsageTracker;

/// Request id assigned at ingress and carried through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub fn new_request_id() -> String {
	let mut rng = rand::rng();
	(0..16).map(|_| rng.sample(Alphanumeric) as char).collect()
}

/// Everything the pipeline needs, constructed once in `main` and injected.
/// No process-wide singletons.
pub struct AppState {
	pub config: Arc<Config>,
	pub stores: Stores,
	pub vault: Arc<CryptoVault>,
	pub validator: TokenValidator,
	pub resolver: CredentialResolver,
	pub limiter: RateLimiter,
	pub forwarder: Forwarder,
	pub tracker: UsageTracker,
	pub audit: AuditWriter,
}

impl AppState {
	pub fn new(
		config: Arc<Config>,
		stores: Stores,
		verifier: Option<Arc<dyn IdentityVerifier>>,
		rate_backend: Arc<dyn RateLimitBackend>,
		client: reqwest::Client,
	) -> Self {
		let vault = Arc::new(CryptoVault::new(&config.encryption_key));
		Self {
			validator: TokenValidator::new(stores.clone(), verifier),
			resolver: CredentialResolver::new(vault.clone(), config.default_provider_keys.clone()),
			limiter: RateLimiter::new(rate_backend),
			forwarder: Forwarder::new(client, &config),
			tracker: UsageTracker::new(stores.clone()),
			audit: AuditWriter::new(stores.clone()),
			vault,
			stores,
			config,
		}
	}
}

/// The full ingress surface: health endpoints, the management API under
/// `/_api`, and the proxy pipeline as the fallback for everything else.
pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/ready", get(ready))
		.nest("/_api", management::router())
		.fallback(pipeline::handle)
		.layer(middleware::from_fn(request_context))
		.with_state(state)
}

async fn health() -> impl IntoResponse {
	axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn ready() -> impl IntoResponse {
	let providers: Vec<_> = Provider::ALL.iter().map(Provider::as_str).collect();
	axum::Json(serde_json::json!({ "status": "ready", "providers": providers }))
}

/// Assigns the request id and, on the way out, rewrites any error envelope
/// with the request context (path, method, id) that handlers don't carry.
async fn request_context(mut req: Request, next: Next) -> Response {
	let request_id = new_request_id();
	let path = req.uri().path().to_string();
	let method = req.method().as_str().to_string();
	req.extensions_mut().insert(RequestId(request_id.clone()));

	let mut resp = next.run(req).await;

	if let Some(err) = resp.extensions().get::<ApiError>().cloned() {
		let body = err.envelope(&path, &method, Some(&request_id));
		resp = (err.status(), err.headers.clone(), axum::Json(body)).into_response();
	}
	if let Ok(v) = HeaderValue::from_str(&request_id) {
		resp.headers_mut().insert("x-request-id", v);
	}
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_ids_are_alphanumeric() {
		let id = new_request_id();
		assert_eq!(id.len(), 16);
		assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
		assert_ne!(id, new_request_id());
	}
}
