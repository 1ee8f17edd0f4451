use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aiguard::app::{self, AppState};
use aiguard::auth::{codec, hasher};
use aiguard::config::Config;
use aiguard::models::{
	PersonalAccessToken, Project, ProviderCredential, QuotaOverride, Scope, User,
};
use aiguard::providers::Provider;
use aiguard::ratelimit::local::LocalBackend;
use aiguard::store::Stores;
use aiguard::store::memory::MemoryStore;
use axum::Router;
use axum::body::{Body, to_bytes};
use chrono::Utc;
use http::{Request, StatusCode};
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> Config {
	Config {
		port: 0,
		request_timeout: Duration::from_secs(5),
		max_retries: 1,
		retry_delay: Duration::from_millis(10),
		max_request_size: 4 * 1024 * 1024,
		mongodb_uri: None,
		mongodb_db_name: "aiguard-test".to_string(),
		redis_url: None,
		encryption_key: SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
		firebase_project_id: None,
		firebase_client_email: None,
		firebase_private_key: None,
		admin_secret_key: Some(SecretString::from("admin-override".to_string())),
		default_provider_keys: HashMap::new(),
	}
}

struct Harness {
	router: Router,
	mem: Arc<MemoryStore>,
	stores: Stores,
	token: String,
	project_id: String,
	server: MockServer,
}

/// In-memory stores, a local rate-limit window, and a wiremock upstream in
/// place of the real provider origins. Seeds one user with a default
/// project carrying an active anthropic credential, plus a PAT.
async fn harness(scopes: Vec<Scope>) -> Harness {
	let server = MockServer::start().await;
	let mem = Arc::new(MemoryStore::default());
	let stores = Stores {
		users: mem.clone(),
		tokens: mem.clone(),
		projects: mem.clone(),
		usage: mem.clone(),
		audit: mem.clone(),
	};

	let mut state = AppState::new(
		Arc::new(test_config()),
		stores.clone(),
		None,
		Arc::new(LocalBackend::default()),
		reqwest::Client::new(),
	);
	state.forwarder = state.forwarder.clone().with_origin_override(server.uri());

	let mut user = User::new("owner@example.com");
	stores.users.insert(&user).await.unwrap();

	let mut project = Project::new("demo", &user.id);
	let sealed = state.vault.encrypt("sk-anthropic-test", None).unwrap();
	project.credentials.push(ProviderCredential {
		provider: Provider::Anthropic,
		ciphertext: sealed.envelope,
		key_id: sealed.key_id,
		active: true,
		added_by: user.id.clone(),
		added_at: Utc::now(),
	});
	stores.projects.insert(&project).await.unwrap();

	user.default_project = Some(project.id.clone());
	stores.users.update(&user).await.unwrap();

	let minted = codec::mint();
	let now = Utc::now();
	stores
		.tokens
		.insert(&PersonalAccessToken {
			id: minted.id.clone(),
			token_hash: hasher::hash_token(minted.expose()).unwrap(),
			user_id: user.id.clone(),
			project_id: None,
			name: "integration".to_string(),
			scopes,
			expires_at: None,
			revoked: false,
			last_used_at: None,
			created_at: now,
			updated_at: now,
		})
		.await
		.unwrap();

	Harness {
		router: app::router(Arc::new(state)),
		mem,
		stores,
		token: minted.expose().to_string(),
		project_id: project.id,
		server,
	}
}

fn anthropic_request(token: &str, body: Value) -> Request<Body> {
	Request::builder()
		.method("POST")
		.uri("/v1/messages")
		.header("x-ai-guard-provider", "anthropic")
		.header("authorization", format!("Bearer {token}"))
		.header("content-type", "application/json")
		.body(Body::from(body.to_string()))
		.unwrap()
}

fn chat_body() -> Value {
	json!({
		"model": "claude-3-sonnet-20240229",
		"messages": [{"role": "user", "content": "hi"}],
		"max_tokens": 16,
	})
}

async fn json_body(resp: axum::response::Response) -> Value {
	let bytes = to_bytes(resp.into_body(), 4 * 1024 * 1024).await.unwrap();
	serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn anthropic_happy_path_relays_and_accounts() {
	let h = harness(vec![Scope::ApiWrite]).await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "msg_1",
			"model": "claude-3-sonnet-20240229",
			"content": [{"type": "text", "text": "hello"}],
			"usage": {"input_tokens": 9, "output_tokens": 7},
		})))
		.mount(&h.server)
		.await;

	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(&h.token, chat_body()))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert!(resp.headers().contains_key("x-ratelimit-limit"));
	assert!(resp.headers().contains_key("x-ratelimit-remaining"));
	assert!(resp.headers().contains_key("x-quota-daily-limit"));
	assert!(resp.headers().contains_key("x-request-id"));

	let body = json_body(resp).await;
	assert_eq!(body["usage"]["input_tokens"], 9);

	// The outbound request carried the decrypted key and the provider's
	// constant header, and never the caller's auth or selection headers.
	let upstream = &h.server.received_requests().await.unwrap()[0];
	assert_eq!(upstream.headers.get("x-api-key").unwrap(), "sk-anthropic-test");
	assert_eq!(
		upstream.headers.get("anthropic-version").unwrap(),
		"2023-06-01"
	);
	assert!(upstream.headers.get("authorization").is_none());
	assert!(upstream.headers.get("x-ai-guard-provider").is_none());

	// Accounting runs off the request task.
	tokio::time::sleep(Duration::from_millis(100)).await;
	let records = h.mem.usage_records();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].provider, Provider::Anthropic);
	assert_eq!(records[0].prompt_tokens, Some(9));
	assert_eq!(records[0].completion_tokens, Some(7));
	assert_eq!(records[0].total_tokens, Some(16));
	assert!(records[0].cost.is_some());

	let project = h.stores.projects.find(&h.project_id).await.unwrap().unwrap();
	assert_eq!(project.usage.current_day.requests, 1);
	assert_eq!(project.usage.current_month.requests, 1);
	assert_eq!(project.usage.current_day.tokens, 16);
}

#[tokio::test]
async fn missing_provider_header_is_rejected_before_upstream() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let req = Request::builder()
		.method("POST")
		.uri("/v1/messages")
		.header("authorization", format!("Bearer {}", h.token))
		.header("content-type", "application/json")
		.body(Body::from(chat_body().to_string()))
		.unwrap();
	let resp = h.router.clone().oneshot(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "INVALID_REQUEST");
	assert_eq!(body["error"]["path"], "/v1/messages");
	assert_eq!(body["error"]["method"], "POST");
	assert!(body["error"]["requestId"].is_string());

	assert!(h.server.received_requests().await.unwrap().is_empty());
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(h.mem.usage_records().is_empty());
}

#[tokio::test]
async fn unknown_provider_tag_is_invalid_provider() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let mut req = anthropic_request(&h.token, chat_body());
	req.headers_mut().insert(
		"x-ai-guard-provider",
		http::HeaderValue::from_static("mistral"),
	);
	let resp = h.router.clone().oneshot(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "INVALID_PROVIDER");
}

#[tokio::test]
async fn wrong_scope_is_forbidden() {
	let h = harness(vec![Scope::ProjectsRead]).await;
	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(&h.token, chat_body()))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::FORBIDDEN);
	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "FORBIDDEN");
	assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_token_is_unauthorized() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(
			"pat_0011223344556677_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
			chat_body(),
		))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "AUTHENTICATION_ERROR");
}

#[tokio::test]
async fn schema_violation_reports_field_details() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let body = json!({
		"model": "claude-3-sonnet-20240229",
		"messages": [{"role": "user", "content": "hi"}],
		// max_tokens missing
	});
	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(&h.token, body))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "INVALID_REQUEST");
	let fields = body["error"]["details"]["fields"].as_array().unwrap();
	assert!(fields.iter().any(|f| f["field"] == "max_tokens"));
	assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn rate_limit_override_denies_with_retry_after() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let mut project = h.stores.projects.find(&h.project_id).await.unwrap().unwrap();
	project.settings.rate_limit = Some(2);
	h.stores
		.projects
		.update_settings(&h.project_id, &project.settings)
		.await
		.unwrap();
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({"usage": {}})))
		.mount(&h.server)
		.await;

	for _ in 0..2 {
		let resp = h
			.router
			.clone()
			.oneshot(anthropic_request(&h.token, chat_body()))
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}
	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(&h.token, chat_body()))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	assert!(resp.headers().contains_key("retry-after"));
	assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "RATE_LIMIT_EXCEEDED");
	// Only the two admitted requests reached the upstream.
	assert_eq!(h.server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn exhausted_daily_quota_denies_with_quota_type() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let mut project = h.stores.projects.find(&h.project_id).await.unwrap().unwrap();
	project.settings.quota = Some(QuotaOverride {
		daily: 1,
		monthly: 100,
	});
	h.stores
		.projects
		.update_settings(&h.project_id, &project.settings)
		.await
		.unwrap();
	// One successful forward already happened today.
	h.stores
		.projects
		.increment_usage(&h.project_id, 1, 10, 0.0)
		.await
		.unwrap();

	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(&h.token, chat_body()))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	assert_eq!(resp.headers().get("x-quota-daily-remaining").unwrap(), "0");
	let body = json_body(resp).await;
	assert_eq!(body["error"]["type"], "QUOTA_EXCEEDED");
	assert_eq!(body["error"]["details"]["quotaType"], "daily");
	assert!(h.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn streaming_forward_pipes_sse_and_accounts_at_stream_end() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let sse = concat!(
		"event: message_start\n",
		"data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-sonnet-20240229\",\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
		"event: content_block_delta\n",
		"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
		"event: message_delta\n",
		"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n\n",
		"event: message_stop\n",
		"data: {\"type\":\"message_stop\"}\n\n",
	);
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(200).set_body_raw(sse.as_bytes().to_vec(), "text/event-stream"))
		.mount(&h.server)
		.await;

	let mut body = chat_body();
	body["stream"] = json!(true);
	let mut req = anthropic_request(&h.token, body);
	req
		.headers_mut()
		.insert(http::header::ACCEPT, http::HeaderValue::from_static("text/event-stream"));

	let resp = h.router.clone().oneshot(req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(
		resp.headers().get("content-type").unwrap(),
		"text/event-stream"
	);

	let relayed = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
	let relayed = String::from_utf8(relayed.to_vec()).unwrap();
	assert!(relayed.contains("message_start"));
	assert!(relayed.contains("message_stop"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	let records = h.mem.usage_records();
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].prompt_tokens, Some(9));
	assert_eq!(records[0].completion_tokens, Some(7));
	assert_eq!(records[0].total_tokens, Some(16));
	assert_eq!(
		records[0].model.as_deref(),
		Some("claude-3-sonnet-20240229")
	);
}

#[tokio::test]
async fn upstream_error_bodies_are_relayed_unmasked() {
	let h = harness(vec![Scope::ApiWrite]).await;
	Mock::given(method("POST"))
		.and(path("/v1/messages"))
		.respond_with(ResponseTemplate::new(429).set_body_json(json!({
			"type": "error",
			"error": {"type": "rate_limit_error", "message": "provider says slow down"},
		})))
		.mount(&h.server)
		.await;

	let resp = h
		.router
		.clone()
		.oneshot(anthropic_request(&h.token, chat_body()))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
	let body = json_body(resp).await;
	assert_eq!(body["error"]["message"], "provider says slow down");
}

#[tokio::test]
async fn health_and_ready_endpoints() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let resp = h
		.router
		.clone()
		.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = h
		.router
		.clone()
		.oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
		.await
		.unwrap();
	let body = json_body(resp).await;
	let providers: Vec<_> = body["providers"]
		.as_array()
		.unwrap()
		.iter()
		.map(|p| p.as_str().unwrap().to_string())
		.collect();
	assert_eq!(providers, vec!["openai", "anthropic", "gemini"]);
}

#[tokio::test]
async fn management_profile_and_token_lifecycle() {
	let h = harness(vec![Scope::ApiWrite]).await;

	let resp = h
		.router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/_api/users/profile")
				.header("authorization", format!("Bearer {}", h.token))
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let body = json_body(resp).await;
	assert_eq!(body["email"], "owner@example.com");

	// Mint a second token through the API; the raw secret round-trips.
	let resp = h
		.router
		.clone()
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/_api/users/tokens")
				.header("authorization", format!("Bearer {}", h.token))
				.header("content-type", "application/json")
				.body(Body::from(
					json!({"name": "ci", "scopes": ["api:read"]}).to_string(),
				))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::CREATED);
	let body = json_body(resp).await;
	let raw = body["token"].as_str().unwrap();
	assert!(codec::parse(raw).is_some());
	assert_eq!(body["info"]["name"], "ci");

	// Duplicate names conflict.
	let resp = h
		.router
		.clone()
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/_api/users/tokens")
				.header("authorization", format!("Bearer {}", h.token))
				.header("content-type", "application/json")
				.body(Body::from(
					json!({"name": "ci", "scopes": ["api:read"]}).to_string(),
				))
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn admin_endpoints_accept_the_admin_key_header() {
	let h = harness(vec![Scope::ApiWrite]).await;
	let resp = h
		.router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/_api/admin/users")
				.header("x-admin-key", "admin-override")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);

	let resp = h
		.router
		.clone()
		.oneshot(
			Request::builder()
				.uri("/_api/admin/users")
				.header("x-admin-key", "wrong")
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap();
	// Wrong override and no bearer token: the identity path fails first.
	assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
