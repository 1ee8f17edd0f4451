use crate::errors::{ApiError, ErrorKind};
use crate::models::{PersonalAccessToken, Scope, User};
use crate::store::StoreError;

pub mod codec;
pub mod hasher;
pub mod identity;
pub mod validator;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("missing bearer token")]
	Missing,
	#[error("invalid token")]
	Invalid,
	#[error("token revoked or expired")]
	Disabled,
	#[error("user is not active")]
	UserInactive,
	#[error("identity verification unavailable")]
	VerifierUnavailable,
	#[error("identity token rejected: {0}")]
	Identity(String),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl From<AuthError> for ApiError {
	fn from(err: AuthError) -> Self {
		match err {
			AuthError::Store(e) => e.into(),
			other => ApiError::new(ErrorKind::AuthenticationError, other.to_string()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
	Pat,
	External,
}

/// The authenticated caller: the user plus, for PAT auth, the token that was
/// presented.
#[derive(Debug, Clone)]
pub struct Principal {
	pub user: User,
	pub token: Option<PersonalAccessToken>,
	pub auth_type: AuthType,
}

impl Principal {
	/// Externally-verified sessions carry every scope; PATs are limited to
	/// their grant, with `admin` implying everything and write implying read
	/// within a resource family.
	pub fn has_scope(&self, scope: Scope) -> bool {
		let Some(token) = &self.token else {
			return true;
		};
		if token.scopes.contains(&Scope::Admin) || token.scopes.contains(&scope) {
			return true;
		}
		match scope {
			Scope::ApiRead => token.scopes.contains(&Scope::ApiWrite),
			Scope::ProjectsRead => token.scopes.contains(&Scope::ProjectsWrite),
			Scope::UsersRead => token.scopes.contains(&Scope::UsersWrite),
			_ => false,
		}
	}

	pub fn is_admin(&self) -> bool {
		match &self.token {
			Some(token) => token.scopes.contains(&Scope::Admin),
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;
	use crate::models::UserStatus;

	fn principal(scopes: Vec<Scope>) -> Principal {
		let now = Utc::now();
		Principal {
			user: User::new("a@b.c"),
			token: Some(PersonalAccessToken {
				id: "pat_0011223344556677".into(),
				token_hash: "h".into(),
				user_id: "u".into(),
				project_id: None,
				name: "t".into(),
				scopes,
				expires_at: None,
				revoked: false,
				last_used_at: None,
				created_at: now,
				updated_at: now,
			}),
			auth_type: AuthType::Pat,
		}
	}

	#[test]
	fn write_implies_read() {
		let p = principal(vec![Scope::ApiWrite]);
		assert!(p.has_scope(Scope::ApiRead));
		assert!(p.has_scope(Scope::ApiWrite));
		assert!(!p.has_scope(Scope::ProjectsRead));
	}

	#[test]
	fn admin_implies_everything() {
		let p = principal(vec![Scope::Admin]);
		for s in [
			Scope::ApiRead,
			Scope::ApiWrite,
			Scope::ProjectsWrite,
			Scope::UsersWrite,
		] {
			assert!(p.has_scope(s));
		}
		assert!(p.is_admin());
	}

	#[test]
	fn external_principal_is_unrestricted() {
		let mut user = User::new("a@b.c");
		user.status = UserStatus::Active;
		let p = Principal {
			user,
			token: None,
			auth_type: AuthType::External,
		};
		assert!(p.has_scope(Scope::Admin));
		assert!(!p.is_admin());
	}
}
