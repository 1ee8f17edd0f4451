use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use http::{Method, StatusCode, header};
use serde_json::Value;
use tracing::info;

use crate::app::{AppState, RequestId};
use crate::auth::{AuthType, Principal};
use crate::credentials::CredentialSource;
use crate::errors::{ApiError, ErrorKind};
use crate::models::{Project, Scope};
use crate::providers::Provider;
use crate::proxy::forward::{ForwardRequest, is_streaming};
use crate::quota::QuotaDecision;
use crate::ratelimit::RateLimiter;
use crate::usage::{RequestOutcome, UsageCounts, extract_usage, model_for_request};
use crate::validation::validate_body;

/// Pipeline state exposed for downstream middleware, mirroring what each
/// stage resolved.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub request_id: String,
	pub user_id: String,
	pub auth_type: AuthType,
	pub token_id: Option<String>,
	pub project_id: Option<String>,
	pub provider: Provider,
	pub client_ip: String,
	pub key_source: CredentialSource,
	pub key_id: Option<String>,
}

struct Failure {
	error: ApiError,
	user_id: Option<String>,
}

fn fail(user_id: Option<&str>, error: impl Into<ApiError>) -> Failure {
	Failure {
		error: error.into(),
		user_id: user_id.map(str::to_string),
	}
}

fn client_ip(req: &Request) -> String {
	req
		.headers()
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(|v| v.trim().to_string())
		.or_else(|| {
			req
				.extensions()
				.get::<ConnectInfo<SocketAddr>>()
				.map(|ci| ci.0.ip().to_string())
		})
		.unwrap_or_else(|| "unknown".to_string())
}

/// Single entry point for every proxied request: authenticate, validate,
/// admit, resolve, forward, account. Stage failures convert to the error
/// envelope at this boundary.
pub async fn handle(State(state): State<Arc<AppState>>, req: Request) -> Response {
	let started = Instant::now();
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let ip = client_ip(&req);
	let user_agent = req
		.headers()
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let provider_tag = req
		.headers()
		.get("x-ai-guard-provider")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);

	match run(&state, req, started, &ip).await {
		Ok(response) => response,
		Err(failure) => {
			let status = failure.error.status().as_u16();
			info!(
				method = %method,
				path = %path,
				status,
				error = %failure.error,
				"pipeline rejected request"
			);
			state.audit.proxied_request(
				failure.user_id.as_deref(),
				method.as_str(),
				&path,
				provider_tag.as_deref().unwrap_or("unknown"),
				status,
				Some(&ip),
				user_agent.as_deref(),
				Some(&failure.error.message),
			);
			failure.error.into_response()
		},
	}
}

async fn run(
	state: &Arc<AppState>,
	req: Request,
	started: Instant,
	client_ip: &str,
) -> Result<Response, Failure> {
	let request_id = req
		.extensions()
		.get::<RequestId>()
		.map(|id| id.0.clone())
		.unwrap_or_else(crate::app::new_request_id);
	let user_agent = req
		.headers()
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let (parts, body) = req.into_parts();
	let method = parts.method;
	let headers = parts.headers;
	let path = parts.uri.path().to_string();
	let raw_query = parts.uri.query().map(str::to_string);

	// Management paths never reach the upstream; anything that fell through
	// the admin router is unknown.
	if path.starts_with("/_api") {
		return Err(fail(
			None,
			ApiError::new(ErrorKind::NotFound, "unknown management endpoint"),
		));
	}

	// Stage: provider selection.
	let provider_raw = headers
		.get("x-ai-guard-provider")
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| {
			fail(
				None,
				ApiError::new(
					ErrorKind::InvalidRequest,
					"missing X-AI-Guard-Provider header",
				)
				.with_suggestion("set X-AI-Guard-Provider to openai, anthropic or gemini"),
			)
		})?;
	let provider = Provider::from_str(provider_raw).map_err(|e| fail(None, e))?;

	// Stage: authentication.
	let authorization = headers
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok());
	let principal = state
		.validator
		.authenticate(authorization)
		.await
		.map_err(|e| fail(None, e))?;
	let user_id = principal.user.id.clone();

	// Stage: body intake and validation.
	let bytes = to_bytes(body, state.config.max_request_size)
		.await
		.map_err(|_| {
			fail(
				Some(&user_id),
				ApiError::new(ErrorKind::InvalidRequest, "request body too large")
					.with_status(StatusCode::PAYLOAD_TOO_LARGE),
			)
		})?;
	let body_json = parse_body(&headers, &bytes).map_err(|e| fail(Some(&user_id), e))?;
	if let Some(json) = &body_json {
		validate_body(provider, method.as_str(), &path, json)
			.map_err(|e| fail(Some(&user_id), e))?;
	}

	// Stage: scope enforcement.
	let needed = if method == Method::GET {
		Scope::ApiRead
	} else {
		Scope::ApiWrite
	};
	if !principal.has_scope(needed) {
		return Err(fail(
			Some(&user_id),
			ApiError::new(ErrorKind::Forbidden, "token does not grant this operation"),
		));
	}

	// Stage: project context (explicit hint, token scope, or user default).
	let (context_project, default_project) =
		resolve_projects(state, &principal, &headers, raw_query.as_deref())
			.await
			.map_err(|e| Failure {
				error: e.error,
				user_id: Some(user_id.clone()),
			})?;
	let effective_project = context_project.as_ref().or(default_project.as_ref());

	// Stage: rate limiting.
	let rate_key = RateLimiter::key(Some(&user_id), client_ip);
	let rate_limit = RateLimiter::limit_for(effective_project);
	let rate = state.limiter.check(&rate_key, rate_limit).await;
	if !rate.allowed {
		return Err(fail(
			Some(&user_id),
			ApiError::new(ErrorKind::RateLimitExceeded, "rate limit exceeded")
				.with_details(serde_json::json!({ "limit": rate.limit, "windowSeconds": 60 }))
				.with_headers(rate.headers()),
		));
	}

	// Stage: quota admission. Counters advance post-forward, not here.
	let quota = effective_project.map(QuotaDecision::evaluate);
	if let Some(q) = &quota
		&& !q.admitted
	{
		return Err(fail(Some(&user_id), q.denial()));
	}

	// Stage: credential resolution.
	let resolved = state
		.resolver
		.resolve(context_project.as_ref(), default_project.as_ref(), provider)
		.map_err(|e| fail(Some(&user_id), e))?;

	// Stage: forward.
	let streaming = is_streaming(&headers, body_json.as_ref());
	let model = model_for_request(provider, body_json.as_ref(), &path);
	let project_id = effective_project.map(|p| p.id.clone());

	let on_stream_end = if streaming {
		let tracker = state.tracker.clone();
		let outcome = RequestOutcome {
			user_id: user_id.clone(),
			project_id: project_id.clone(),
			provider,
			endpoint: path.clone(),
			method: method.as_str().to_string(),
			model: model.clone(),
			counts: UsageCounts::default(),
			status_code: 200,
			response_time_ms: 0,
		};
		Some(Box::new(move |counts: UsageCounts| {
			tracker.record(RequestOutcome {
				counts,
				response_time_ms: started.elapsed().as_millis() as u64,
				..outcome
			});
		}) as Box<dyn FnOnce(UsageCounts) + Send + 'static>)
	} else {
		None
	};

	let reply = state
		.forwarder
		.forward(
			ForwardRequest {
				provider,
				method: method.clone(),
				path: &path,
				raw_query: raw_query.as_deref(),
				headers: &headers,
				body: bytes,
				credential: &resolved.key,
				streaming,
			},
			on_stream_end,
		)
		.await
		.map_err(|e| fail(Some(&user_id), e))?;

	// Stage: accounting. Buffered bodies are parsed here; streaming bodies
	// report through the scanner at stream end.
	if !streaming {
		let counts = reply
			.buffered
			.as_ref()
			.and_then(|b| serde_json::from_slice::<Value>(b).ok())
			.map(|v| extract_usage(provider, &v))
			.unwrap_or_default();
		state.tracker.record(RequestOutcome {
			user_id: user_id.clone(),
			project_id: project_id.clone(),
			provider,
			endpoint: path.clone(),
			method: method.as_str().to_string(),
			model,
			counts,
			status_code: reply.status.as_u16(),
			response_time_ms: started.elapsed().as_millis() as u64,
		});
	}
	state.audit.proxied_request(
		Some(&user_id),
		method.as_str(),
		&path,
		provider.as_str(),
		reply.status.as_u16(),
		Some(client_ip),
		user_agent.as_deref(),
		None,
	);
	info!(
		method = %method,
		path = %path,
		provider = %provider,
		status = reply.status.as_u16(),
		streaming,
		duration_ms = started.elapsed().as_millis() as u64,
		request_id = %request_id,
		"proxied request"
	);

	let mut response = reply.response;
	response.headers_mut().extend(rate.headers());
	if let Some(q) = &quota {
		response.headers_mut().extend(q.headers());
	}
	response.extensions_mut().insert(RequestContext {
		request_id,
		user_id,
		auth_type: principal.auth_type,
		token_id: principal.token.map(|t| t.id),
		project_id,
		provider,
		client_ip: client_ip.to_string(),
		key_source: resolved.source,
		key_id: resolved.key_id,
	});
	Ok(response)
}

/// JSON is parsed when the body is non-empty; a declared-JSON body that
/// fails to parse is rejected, anything else forwards verbatim unparsed.
fn parse_body(headers: &http::HeaderMap, bytes: &[u8]) -> Result<Option<Value>, ApiError> {
	if bytes.is_empty() {
		return Ok(None);
	}
	match serde_json::from_slice(bytes) {
		Ok(v) => Ok(Some(v)),
		Err(_) => {
			let declared_json = headers
				.get(header::CONTENT_TYPE)
				.and_then(|v| v.to_str().ok())
				.is_some_and(|v| v.contains("application/json"));
			if declared_json {
				Err(ApiError::new(
					ErrorKind::InvalidRequest,
					"request body is not valid JSON",
				))
			} else {
				Ok(None)
			}
		},
	}
}

/// Loads the explicit project context (header, query parameter, or
/// token-scoped project) and, separately, the caller's default project.
/// A dangling default-project reference is tolerated.
async fn resolve_projects(
	state: &Arc<AppState>,
	principal: &Principal,
	headers: &http::HeaderMap,
	raw_query: Option<&str>,
) -> Result<(Option<Project>, Option<Project>), Failure> {
	let user_id = &principal.user.id;
	let hint = headers
		.get("x-ai-guard-project")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.or_else(|| query_param(raw_query, "project"))
		.or_else(|| principal.token.as_ref().and_then(|t| t.project_id.clone()));

	let context_project = match hint {
		Some(id) => {
			let project = state
				.stores
				.projects
				.find(&id)
				.await
				.map_err(|e| fail(Some(user_id), ApiError::from(e)))?
				.ok_or_else(|| {
					fail(
						Some(user_id),
						ApiError::new(ErrorKind::NotFound, format!("project {id} not found")),
					)
				})?;
			if project.role_of(user_id).is_none() {
				return Err(fail(
					Some(user_id),
					ApiError::new(ErrorKind::Forbidden, "not a member of the requested project"),
				));
			}
			Some(project)
		},
		None => None,
	};

	let default_project = if context_project.is_none() {
		match &principal.user.default_project {
			Some(id) => state
				.stores
				.projects
				.find(id)
				.await
				.map_err(|e| fail(Some(user_id), ApiError::from(e)))?,
			None => None,
		}
	} else {
		None
	};

	Ok((context_project, default_project))
}

fn query_param(raw_query: Option<&str>, name: &str) -> Option<String> {
	raw_query?
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == name)
		.map(|(_, v)| v.to_string())
}
