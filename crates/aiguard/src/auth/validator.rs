use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::codec;
use super::hasher;
use super::identity::{IdentityProfile, IdentityVerifier};
use super::{AuthError, AuthType, Principal};
use crate::models::User;
use crate::store::Stores;

/// Dispatches bearer credentials to the PAT or external-identity path and
/// produces the caller principal.
#[derive(Clone)]
pub struct TokenValidator {
	stores: Stores,
	verifier: Option<Arc<dyn IdentityVerifier>>,
}

impl TokenValidator {
	pub fn new(stores: Stores, verifier: Option<Arc<dyn IdentityVerifier>>) -> Self {
		Self { stores, verifier }
	}

	/// `authorization` is the raw header value; the `Bearer ` prefix is
	/// optional on the wire.
	pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, AuthError> {
		let raw = authorization.ok_or(AuthError::Missing)?.trim();
		let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
		if token.is_empty() {
			return Err(AuthError::Missing);
		}
		if token.starts_with(codec::TOKEN_PREFIX) {
			self.authenticate_pat(token).await
		} else {
			self.authenticate_identity(token).await
		}
	}

	async fn authenticate_pat(&self, token: &str) -> Result<Principal, AuthError> {
		let Some((id, _secret)) = codec::parse(token) else {
			info!(target: "audit", action = "auth.pat", outcome = "malformed");
			return Err(AuthError::Invalid);
		};
		let Some(stored) = self.stores.tokens.find(&id).await? else {
			info!(target: "audit", action = "auth.pat", token_id = %id, outcome = "not_found");
			return Err(AuthError::Invalid);
		};
		if !stored.usable_at(Utc::now()) {
			info!(target: "audit", action = "auth.pat", token_id = %id, outcome = "disabled");
			return Err(AuthError::Disabled);
		}
		if !hasher::verify_token(token, &stored.token_hash) {
			info!(target: "audit", action = "auth.pat", token_id = %id, outcome = "bad_secret");
			return Err(AuthError::Invalid);
		}
		let Some(user) = self.stores.users.find(&stored.user_id).await? else {
			warn!(target: "audit", action = "auth.pat", token_id = %id, outcome = "orphaned");
			return Err(AuthError::Invalid);
		};
		if !user.is_active() {
			info!(target: "audit", action = "auth.pat", token_id = %id, outcome = "user_inactive");
			return Err(AuthError::UserInactive);
		}

		let tokens = self.stores.tokens.clone();
		let token_id = stored.id.clone();
		tokio::spawn(async move {
			if let Err(e) = tokens.touch_last_used(&token_id, Utc::now()).await {
				debug!(token_id = %token_id, error = %e, "failed to update lastUsedAt");
			}
		});

		debug!(token_id = %stored.id, user_id = %user.id, "pat validated");
		Ok(Principal {
			user,
			token: Some(stored),
			auth_type: AuthType::Pat,
		})
	}

	async fn authenticate_identity(&self, token: &str) -> Result<Principal, AuthError> {
		let Some(verifier) = &self.verifier else {
			info!(target: "audit", action = "auth.identity", outcome = "verifier_unavailable");
			return Err(AuthError::VerifierUnavailable);
		};
		let profile = verifier.verify(token).await.map_err(|e| {
			info!(target: "audit", action = "auth.identity", outcome = "rejected");
			e
		})?;

		let user = self.upsert_identity_user(&profile).await?;
		if !user.is_active() {
			info!(target: "audit", action = "auth.identity", user_id = %user.id, outcome = "user_inactive");
			return Err(AuthError::UserInactive);
		}

		let users = self.stores.users.clone();
		let user_id = user.id.clone();
		tokio::spawn(async move {
			if let Err(e) = users.touch_last_login(&user_id, Utc::now()).await {
				debug!(user_id = %user_id, error = %e, "failed to update lastLoginAt");
			}
		});

		Ok(Principal {
			user,
			token: None,
			auth_type: AuthType::External,
		})
	}

	/// Upsert keyed by the external uid. An admin-provisioned user with a
	/// matching email is linked rather than duplicated.
	async fn upsert_identity_user(&self, profile: &IdentityProfile) -> Result<User, AuthError> {
		if let Some(user) = self.stores.users.find_by_external_id(&profile.uid).await? {
			return Ok(user);
		}
		if let Some(email) = &profile.email
			&& let Some(mut user) = self.stores.users.find_by_email(email).await?
		{
			user.external_id = Some(profile.uid.clone());
			user.updated_at = Utc::now();
			self.stores.users.update(&user).await?;
			info!(target: "audit", action = "auth.link", user_id = %user.id, "linked external identity");
			return Ok(user);
		}

		let email = profile
			.email
			.clone()
			.unwrap_or_else(|| format!("{}@users.external.invalid", profile.uid));
		let mut user = User::new(&email);
		user.external_id = Some(profile.uid.clone());
		user.display_name = profile.display_name.clone();
		self.stores.users.insert(&user).await?;
		info!(target: "audit", action = "auth.provision", user_id = %user.id, "provisioned user from identity token");
		Ok(user)
	}
}
