use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app::AppState;
use crate::auth::{Principal, codec, hasher};
use crate::errors::{ApiError, ErrorKind};
use crate::models::{
	MemberRole, PersonalAccessToken, Project, ProjectMember, ProviderCredential, QuotaOverride,
	Scope, UserStatus,
};
use crate::providers::Provider;

/// Administrative surface mounted under `/_api`.
pub fn router() -> Router<Arc<AppState>> {
	Router::new()
		.route("/users/profile", get(get_profile).patch(update_profile))
		.route("/users/account", delete(delete_account))
		.route("/users/tokens", post(create_token).get(list_tokens))
		.route("/users/tokens/{id}", delete(revoke_token))
		.route("/users/tokens/{id}/rotate", post(rotate_token))
		.route("/projects", post(create_project).get(list_projects))
		.route(
			"/projects/{id}",
			get(get_project).patch(update_project).delete(delete_project),
		)
		.route("/projects/{id}/keys", post(add_project_key).get(list_project_keys))
		.route("/projects/{id}/keys/{key_id}", delete(remove_project_key))
		.route("/projects/{id}/members", post(add_member))
		.route("/projects/{id}/members/{user_id}", delete(remove_member))
		.route("/projects/{id}/usage", get(project_usage))
		.route("/projects/{id}/quota", put(set_quota))
		.route("/admin/users", get(admin_list_users))
		.route("/admin/users/{id}/suspend", post(admin_suspend_user))
		.route("/admin/users/{id}/activate", post(admin_activate_user))
		.fallback(not_found)
}

async fn not_found() -> ApiError {
	ApiError::new(ErrorKind::NotFound, "unknown management endpoint")
}

async fn authed(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
	let authorization = headers
		.get(http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok());
	Ok(state.validator.authenticate(authorization).await?)
}

fn require_scope(principal: &Principal, scope: Scope) -> Result<(), ApiError> {
	if principal.has_scope(scope) {
		Ok(())
	} else {
		Err(ApiError::new(
			ErrorKind::Forbidden,
			"token does not grant this operation",
		))
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Admin access: the `admin` PAT scope, or the `X-Admin-Key` override.
async fn admin_authed(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
	if let Some(candidate) = headers.get("x-admin-key").and_then(|v| v.to_str().ok())
		&& let Some(secret) = &state.config.admin_secret_key
		&& constant_time_eq(candidate.as_bytes(), secret.expose_secret().as_bytes())
	{
		return Ok("admin-key".to_string());
	}
	let principal = authed(state, headers).await?;
	if principal.is_admin() {
		Ok(principal.user.id)
	} else {
		Err(ApiError::new(ErrorKind::Forbidden, "admin access required"))
	}
}

// ---- users ----

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
	id: String,
	email: String,
	display_name: Option<String>,
	status: UserStatus,
	default_project: Option<String>,
	created_at: DateTime<Utc>,
	last_login_at: Option<DateTime<Utc>>,
}

impl From<&crate::models::User> for ProfileResponse {
	fn from(u: &crate::models::User) -> Self {
		Self {
			id: u.id.clone(),
			email: u.email.clone(),
			display_name: u.display_name.clone(),
			status: u.status,
			default_project: u.default_project.clone(),
			created_at: u.created_at,
			last_login_at: u.last_login_at,
		}
	}
}

async fn get_profile(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	Ok(Json(ProfileResponse::from(&principal.user)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProfileRequest {
	display_name: Option<String>,
	default_project: Option<String>,
}

async fn update_profile(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(body): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::UsersWrite)?;
	let mut user = principal.user;

	if let Some(name) = body.display_name {
		user.display_name = Some(name);
	}
	if let Some(project_id) = body.default_project {
		let project = state
			.stores
			.projects
			.find(&project_id)
			.await?
			.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "project not found"))?;
		if project.role_of(&user.id).is_none() {
			return Err(ApiError::new(
				ErrorKind::Forbidden,
				"cannot default to a project you are not a member of",
			));
		}
		user.default_project = Some(project.id);
	}
	user.updated_at = Utc::now();
	state.stores.users.update(&user).await?;
	state
		.audit
		.admin_action(&user.id, "user.updated", "user", Some(&user.id), None);
	Ok(Json(ProfileResponse::from(&user)))
}

/// Logical delete: flips status and revokes every owned token.
async fn delete_account(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::UsersWrite)?;
	let user_id = principal.user.id;
	state
		.stores
		.users
		.set_status(&user_id, UserStatus::Deleted)
		.await?;
	state.stores.tokens.revoke_all_for_user(&user_id).await?;
	state
		.audit
		.admin_action(&user_id, "user.deleted", "user", Some(&user_id), None);
	Ok(Json(json!({ "deleted": true })))
}

// ---- tokens ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenRequest {
	name: String,
	scopes: Vec<Scope>,
	project_id: Option<String>,
	expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenInfo {
	id: String,
	name: String,
	scopes: Vec<Scope>,
	project_id: Option<String>,
	expires_at: Option<DateTime<Utc>>,
	revoked: bool,
	last_used_at: Option<DateTime<Utc>>,
	created_at: DateTime<Utc>,
}

impl From<&PersonalAccessToken> for TokenInfo {
	fn from(t: &PersonalAccessToken) -> Self {
		Self {
			id: t.id.clone(),
			name: t.name.clone(),
			scopes: t.scopes.clone(),
			project_id: t.project_id.clone(),
			expires_at: t.expires_at,
			revoked: t.revoked,
			last_used_at: t.last_used_at,
			created_at: t.created_at,
		}
	}
}

async fn create_token(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(body): Json<CreateTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	let user_id = principal.user.id.clone();

	if body.name.trim().is_empty() {
		return Err(ApiError::new(ErrorKind::ValidationError, "name is required"));
	}
	if body.scopes.is_empty() {
		return Err(ApiError::new(
			ErrorKind::ValidationError,
			"at least one scope is required",
		));
	}
	if state
		.stores
		.tokens
		.find_by_name(&user_id, body.name.trim())
		.await?
		.is_some()
	{
		return Err(ApiError::new(
			ErrorKind::Conflict,
			format!("a token named {:?} already exists", body.name.trim()),
		));
	}
	if let Some(project_id) = &body.project_id {
		let project = state
			.stores
			.projects
			.find(project_id)
			.await?
			.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "project not found"))?;
		if project.role_of(&user_id).is_none() {
			return Err(ApiError::new(
				ErrorKind::Forbidden,
				"cannot scope a token to a project you are not a member of",
			));
		}
	}

	let minted = codec::mint();
	let now = Utc::now();
	let token = PersonalAccessToken {
		id: minted.id.clone(),
		token_hash: hasher::hash_token(minted.expose())?,
		user_id: user_id.clone(),
		project_id: body.project_id,
		name: body.name.trim().to_string(),
		scopes: body.scopes,
		expires_at: body.expires_at,
		revoked: false,
		last_used_at: None,
		created_at: now,
		updated_at: now,
	};
	state.stores.tokens.insert(&token).await?;
	state.audit.admin_action(
		&user_id,
		"api_key.created",
		"token",
		Some(&token.id),
		Some(json!({ "name": token.name })),
	);

	// The raw token is returned exactly once, here.
	Ok((
		http::StatusCode::CREATED,
		Json(json!({
			"token": minted.expose(),
			"info": TokenInfo::from(&token),
		})),
	))
}

async fn list_tokens(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	let tokens = state
		.stores
		.tokens
		.list_for_user(&principal.user.id)
		.await?;
	let infos: Vec<TokenInfo> = tokens.iter().map(TokenInfo::from).collect();
	Ok(Json(infos))
}

async fn revoke_token(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	let revoked = state.stores.tokens.revoke(&principal.user.id, &id).await?;
	if !revoked {
		return Err(ApiError::new(ErrorKind::NotFound, "token not found"));
	}
	state.audit.admin_action(
		&principal.user.id,
		"api_key.revoked",
		"token",
		Some(&id),
		None,
	);
	Ok(Json(json!({ "revoked": true })))
}

/// Replaces the secret in place: same identifier, new hash, old wire string
/// immediately invalid.
async fn rotate_token(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	let token = state
		.stores
		.tokens
		.find(&id)
		.await?
		.filter(|t| t.user_id == principal.user.id && !t.revoked)
		.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "token not found"))?;

	let minted = codec::mint_with_id(&token.id);
	state
		.stores
		.tokens
		.update_secret(&token.id, &hasher::hash_token(minted.expose())?)
		.await?;
	state.audit.admin_action(
		&principal.user.id,
		"api_key.rotated",
		"token",
		Some(&token.id),
		None,
	);
	Ok(Json(json!({ "token": minted.expose() })))
}

// ---- projects ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
	name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
	id: String,
	name: String,
	owner_id: String,
	members: Vec<ProjectMember>,
	settings: crate::models::ProjectSettings,
	created_at: DateTime<Utc>,
}

impl From<&Project> for ProjectResponse {
	fn from(p: &Project) -> Self {
		Self {
			id: p.id.clone(),
			name: p.name.clone(),
			owner_id: p.owner_id.clone(),
			members: p.members.clone(),
			settings: p.settings.clone(),
			created_at: p.created_at,
		}
	}
}

async fn create_project(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Json(body): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	if body.name.trim().is_empty() {
		return Err(ApiError::new(ErrorKind::ValidationError, "name is required"));
	}
	let project = Project::new(body.name.trim(), &principal.user.id);
	state.stores.projects.insert(&project).await?;
	state.audit.admin_action(
		&principal.user.id,
		"project.created",
		"project",
		Some(&project.id),
		Some(json!({ "name": project.name })),
	);
	Ok((
		http::StatusCode::CREATED,
		Json(ProjectResponse::from(&project)),
	))
}

async fn list_projects(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsRead)?;
	let projects = state
		.stores
		.projects
		.list_for_user(&principal.user.id)
		.await?;
	let out: Vec<ProjectResponse> = projects.iter().map(ProjectResponse::from).collect();
	Ok(Json(out))
}

/// Loads a project the caller belongs to, with an optional minimum role.
async fn member_project(
	state: &AppState,
	principal: &Principal,
	project_id: &str,
	need_manage: bool,
) -> Result<Project, ApiError> {
	let project = state
		.stores
		.projects
		.find(project_id)
		.await?
		.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "project not found"))?;
	match project.role_of(&principal.user.id) {
		None => Err(ApiError::new(
			ErrorKind::Forbidden,
			"not a member of this project",
		)),
		Some(MemberRole::Member) if need_manage => Err(ApiError::new(
			ErrorKind::Forbidden,
			"project owner or admin role required",
		)),
		Some(_) => Ok(project),
	}
}

async fn get_project(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsRead)?;
	let project = member_project(&state, &principal, &id, false).await?;
	Ok(Json(ProjectResponse::from(&project)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProjectRequest {
	rate_limit: Option<u32>,
	allowed_providers: Option<Vec<Provider>>,
	webhook_url: Option<String>,
}

async fn update_project(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
	Json(body): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;

	let mut settings = project.settings.clone();
	if let Some(limit) = body.rate_limit {
		if limit == 0 {
			return Err(ApiError::new(
				ErrorKind::ValidationError,
				"rateLimit must be positive",
			));
		}
		settings.rate_limit = Some(limit);
	}
	if let Some(allowed) = body.allowed_providers {
		settings.allowed_providers = Some(allowed);
	}
	if let Some(url) = body.webhook_url {
		if !url.starts_with("https://") && !url.starts_with("http://") {
			return Err(ApiError::new(
				ErrorKind::ValidationError,
				"webhookUrl must be an http(s) URL",
			));
		}
		settings.webhook_url = Some(url);
	}
	state
		.stores
		.projects
		.update_settings(&project.id, &settings)
		.await?;
	state.audit.admin_action(
		&principal.user.id,
		"project.updated",
		"project",
		Some(&project.id),
		None,
	);
	Ok(Json(settings))
}

async fn delete_project(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;
	if project.owner_id != principal.user.id {
		return Err(ApiError::new(
			ErrorKind::Forbidden,
			"only the owner can delete a project",
		));
	}
	state.stores.projects.delete(&id).await?;
	state.audit.admin_action(
		&principal.user.id,
		"project.deleted",
		"project",
		Some(&id),
		None,
	);
	Ok(Json(json!({ "deleted": true })))
}

// ---- project credentials ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddKeyRequest {
	provider: Provider,
	api_key: String,
	metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyInfo {
	provider: Provider,
	key_id: String,
	active: bool,
	added_by: String,
	added_at: DateTime<Utc>,
}

impl From<&ProviderCredential> for KeyInfo {
	fn from(c: &ProviderCredential) -> Self {
		Self {
			provider: c.provider,
			key_id: c.key_id.clone(),
			active: c.active,
			added_by: c.added_by.clone(),
			added_at: c.added_at,
		}
	}
}

async fn add_project_key(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
	Json(body): Json<AddKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;
	if body.api_key.trim().is_empty() {
		return Err(ApiError::new(
			ErrorKind::ValidationError,
			"apiKey is required",
		));
	}

	let sealed = state
		.vault
		.encrypt(body.api_key.trim(), body.metadata)
		.map_err(|_| ApiError::new(ErrorKind::ConfigurationError, "failed to seal credential"))?;
	let credential = ProviderCredential {
		provider: body.provider,
		ciphertext: sealed.envelope,
		key_id: sealed.key_id.clone(),
		active: true,
		added_by: principal.user.id.clone(),
		added_at: Utc::now(),
	};
	state
		.stores
		.projects
		.add_credential(&project.id, &credential)
		.await?;
	state.audit.admin_action(
		&principal.user.id,
		"api_key.created",
		"project_credential",
		Some(&sealed.key_id),
		Some(json!({ "projectId": project.id, "provider": body.provider })),
	);
	Ok((http::StatusCode::CREATED, Json(KeyInfo::from(&credential))))
}

async fn list_project_keys(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsRead)?;
	let project = member_project(&state, &principal, &id, false).await?;
	let keys: Vec<KeyInfo> = project.credentials.iter().map(KeyInfo::from).collect();
	Ok(Json(keys))
}

async fn remove_project_key(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path((id, key_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;
	let removed = state
		.stores
		.projects
		.remove_credential(&project.id, &key_id)
		.await?;
	if !removed {
		return Err(ApiError::new(ErrorKind::NotFound, "credential not found"));
	}
	state.audit.admin_action(
		&principal.user.id,
		"api_key.revoked",
		"project_credential",
		Some(&key_id),
		Some(json!({ "projectId": project.id })),
	);
	Ok(Json(json!({ "removed": true })))
}

// ---- project members ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddMemberRequest {
	user_id: String,
	role: MemberRole,
}

async fn add_member(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
	Json(body): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;
	if body.role == MemberRole::Owner {
		return Err(ApiError::new(
			ErrorKind::ValidationError,
			"projects have exactly one owner",
		));
	}
	let target = state
		.stores
		.users
		.find(&body.user_id)
		.await?
		.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "user not found"))?;
	if project.role_of(&target.id).is_some() {
		return Err(ApiError::new(ErrorKind::Conflict, "already a member"));
	}
	let member = ProjectMember {
		user_id: target.id.clone(),
		role: body.role,
		added_at: Utc::now(),
	};
	state.stores.projects.add_member(&project.id, &member).await?;
	state.audit.admin_action(
		&principal.user.id,
		"project.member.added",
		"project",
		Some(&project.id),
		Some(json!({ "userId": target.id, "role": body.role })),
	);
	Ok((http::StatusCode::CREATED, Json(member)))
}

async fn remove_member(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path((id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;
	if user_id == project.owner_id {
		return Err(ApiError::new(
			ErrorKind::ValidationError,
			"the owner cannot be removed",
		));
	}
	if project.role_of(&user_id).is_none() {
		return Err(ApiError::new(ErrorKind::NotFound, "not a member"));
	}
	state
		.stores
		.projects
		.remove_member(&project.id, &user_id)
		.await?;
	state.audit.admin_action(
		&principal.user.id,
		"project.member.removed",
		"project",
		Some(&project.id),
		Some(json!({ "userId": user_id })),
	);
	Ok(Json(json!({ "removed": true })))
}

// ---- usage & quota ----

async fn project_usage(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsRead)?;
	let project = member_project(&state, &principal, &id, false).await?;
	Ok(Json(json!({
		"usage": project.usage,
		"limits": {
			"daily": project.daily_limit(),
			"monthly": project.monthly_limit(),
		},
		"tier": project.tier(),
	})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetQuotaRequest {
	daily: u64,
	monthly: u64,
}

async fn set_quota(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
	Json(body): Json<SetQuotaRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let principal = authed(&state, &headers).await?;
	require_scope(&principal, Scope::ProjectsWrite)?;
	let project = member_project(&state, &principal, &id, true).await?;
	if body.daily == 0 || body.monthly == 0 {
		return Err(ApiError::new(
			ErrorKind::ValidationError,
			"quota limits must be positive",
		));
	}
	let mut settings = project.settings.clone();
	settings.quota = Some(QuotaOverride {
		daily: body.daily,
		monthly: body.monthly,
	});
	state
		.stores
		.projects
		.update_settings(&project.id, &settings)
		.await?;
	state.audit.admin_action(
		&principal.user.id,
		"project.updated",
		"project",
		Some(&project.id),
		Some(json!({ "quota": { "daily": body.daily, "monthly": body.monthly } })),
	);
	Ok(Json(json!({ "quota": settings.quota })))
}

// ---- admin ----

async fn admin_list_users(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
	let actor = admin_authed(&state, &headers).await?;
	let users = state.stores.users.list(200).await?;
	let out: Vec<ProfileResponse> = users.iter().map(ProfileResponse::from).collect();
	state
		.audit
		.admin_action(&actor, "user.listed", "user", None, None);
	Ok(Json(out))
}

async fn admin_set_status(
	state: &AppState,
	headers: &HeaderMap,
	id: &str,
	status: UserStatus,
	action: &str,
) -> Result<serde_json::Value, ApiError> {
	let actor = admin_authed(state, headers).await?;
	let user = state
		.stores
		.users
		.find(id)
		.await?
		.ok_or_else(|| ApiError::new(ErrorKind::NotFound, "user not found"))?;
	state.stores.users.set_status(&user.id, status).await?;
	// Suspension is reversible and the validator already rejects tokens of
	// non-active owners; only deletion revokes outright.
	if status == UserStatus::Deleted {
		state.stores.tokens.revoke_all_for_user(&user.id).await?;
	}
	state
		.audit
		.admin_action(&actor, action, "user", Some(&user.id), None);
	Ok(json!({ "id": user.id, "status": status }))
}

async fn admin_suspend_user(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let body = admin_set_status(&state, &headers, &id, UserStatus::Suspended, "user.suspended").await?;
	Ok(Json(body))
}

async fn admin_activate_user(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let body = admin_set_status(&state, &headers, &id, UserStatus::Active, "user.activated").await?;
	Ok(Json(body))
}
