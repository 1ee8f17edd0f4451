use std::collections::HashMap;

use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::AuthError;

/// Basic profile returned by the external identity provider.
#[derive(Debug, Clone)]
pub struct IdentityProfile {
	pub uid: String,
	pub email: Option<String>,
	pub display_name: Option<String>,
}

/// Opaque external verifier: bearer string in, profile or failure out.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
	async fn verify(&self, token: &str) -> Result<IdentityProfile, AuthError>;
}

const JWKS_URL: &str =
	"https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Verifies Firebase-style identity tokens against Google's securetoken
/// signing keys. Keys are cached and refreshed when an unknown `kid` shows
/// up (Google rotates them every few hours).
pub struct FirebaseVerifier {
	project_id: String,
	client: reqwest::Client,
	keys: RwLock<HashMap<String, DecodingKey>>,
}

#[derive(serde::Deserialize)]
struct IdentityClaims {
	sub: String,
	#[serde(default)]
	email: Option<String>,
	#[serde(default)]
	name: Option<String>,
}

impl FirebaseVerifier {
	/// Fetches the signing keys up front so the verifier is usable before
	/// the first request that needs it. On failure the caller continues to
	/// serve PAT-only traffic.
	pub async fn new(project_id: &str, client: reqwest::Client) -> Result<Self, AuthError> {
		let verifier = Self {
			project_id: project_id.to_string(),
			client,
			keys: RwLock::new(HashMap::new()),
		};
		verifier.refresh_keys().await?;
		Ok(verifier)
	}

	async fn refresh_keys(&self) -> Result<(), AuthError> {
		let set: JwkSet = self
			.client
			.get(JWKS_URL)
			.send()
			.await
			.map_err(|e| AuthError::Identity(format!("jwks fetch failed: {e}")))?
			.json()
			.await
			.map_err(|e| AuthError::Identity(format!("jwks parse failed: {e}")))?;

		let mut keys = HashMap::new();
		for jwk in &set.keys {
			let Some(kid) = jwk.common.key_id.clone() else {
				continue;
			};
			if let AlgorithmParameters::RSA(rsa) = &jwk.algorithm {
				match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
					Ok(key) => {
						keys.insert(kid, key);
					},
					Err(e) => {
						warn!(kid, error = %e, "skipping undecodable signing key");
					},
				}
			}
		}
		if keys.is_empty() {
			return Err(AuthError::Identity("no usable signing keys".to_string()));
		}
		debug!(count = keys.len(), "refreshed identity signing keys");
		*self.keys.write().await = keys;
		Ok(())
	}

	async fn key_for(&self, kid: &str) -> Result<DecodingKey, AuthError> {
		if let Some(key) = self.keys.read().await.get(kid) {
			return Ok(key.clone());
		}
		// Unknown kid: likely a rotation since the last fetch.
		self.refresh_keys().await?;
		self
			.keys
			.read()
			.await
			.get(kid)
			.cloned()
			.ok_or_else(|| AuthError::Identity(format!("unknown signing key {kid}")))
	}
}

#[async_trait]
impl IdentityVerifier for FirebaseVerifier {
	async fn verify(&self, token: &str) -> Result<IdentityProfile, AuthError> {
		let header = decode_header(token).map_err(|_| AuthError::Invalid)?;
		let kid = header
			.kid
			.ok_or_else(|| AuthError::Identity("token header missing kid".to_string()))?;
		let key = self.key_for(&kid).await?;

		let mut validation = Validation::new(Algorithm::RS256);
		validation.set_audience(&[&self.project_id]);
		validation.set_issuer(&[format!(
			"https://securetoken.google.com/{}",
			self.project_id
		)]);

		let data = decode::<IdentityClaims>(token, &key, &validation)
			.map_err(|e| AuthError::Identity(e.to_string()))?;
		Ok(IdentityProfile {
			uid: data.claims.sub,
			email: data.claims.email,
			display_name: data.claims.name,
		})
	}
}

/// Table-driven verifier for tests and local development.
#[derive(Default)]
pub struct StaticVerifier {
	profiles: HashMap<String, IdentityProfile>,
}

impl StaticVerifier {
	pub fn with_token(mut self, token: &str, profile: IdentityProfile) -> Self {
		self.profiles.insert(token.to_string(), profile);
		self
	}
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
	async fn verify(&self, token: &str) -> Result<IdentityProfile, AuthError> {
		self
			.profiles
			.get(token)
			.cloned()
			.ok_or_else(|| AuthError::Identity("unrecognized identity token".to_string()))
	}
}
