use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;
use tracing::{debug, warn};

use crate::crypto::CryptoVault;
use crate::errors::{ApiError, ErrorKind};
use crate::models::Project;
use crate::providers::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
	Project,
	User,
	System,
}

pub struct ResolvedCredential {
	pub key: SecretString,
	pub source: CredentialSource,
	/// Stable vault handle; `None` for environment-supplied defaults.
	pub key_id: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
	#[error("provider {0} is not allowed for this project")]
	ProviderNotAllowed(Provider),
	#[error("no credential available for provider {0}")]
	Unavailable(Provider),
	#[error("stored credential could not be decrypted")]
	Decryption,
}

impl From<CredentialError> for ApiError {
	fn from(err: CredentialError) -> Self {
		match &err {
			CredentialError::ProviderNotAllowed(_) => {
				ApiError::new(ErrorKind::Forbidden, err.to_string())
			},
			CredentialError::Unavailable(provider) => {
				ApiError::new(ErrorKind::ConfigurationError, err.to_string()).with_suggestion(format!(
					"add a {provider} key to the project or configure a process default"
				))
			},
			// Fail closed: an undecryptable credential is a deployment
			// problem, never a reason to fall through to another key.
			CredentialError::Decryption => {
				ApiError::new(ErrorKind::ConfigurationError, err.to_string())
			},
		}
	}
}

/// Chooses the provider credential for a request:
/// project context, then the caller's default project, then the
/// process-level default. Exactly one source wins.
pub struct CredentialResolver {
	vault: Arc<CryptoVault>,
	defaults: HashMap<Provider, SecretString>,
}

impl CredentialResolver {
	pub fn new(vault: Arc<CryptoVault>, defaults: HashMap<Provider, SecretString>) -> Self {
		Self { vault, defaults }
	}

	pub fn resolve(
		&self,
		context_project: Option<&Project>,
		default_project: Option<&Project>,
		provider: Provider,
	) -> Result<ResolvedCredential, CredentialError> {
		if let Some(project) = context_project {
			// The allowlist binds regardless of credential availability.
			if !project.allows_provider(provider) {
				return Err(CredentialError::ProviderNotAllowed(provider));
			}
			if let Some(resolved) = self.unseal(project, provider, CredentialSource::Project)? {
				return Ok(resolved);
			}
		} else if let Some(project) = default_project {
			if !project.allows_provider(provider) {
				return Err(CredentialError::ProviderNotAllowed(provider));
			}
			if let Some(resolved) = self.unseal(project, provider, CredentialSource::User)? {
				return Ok(resolved);
			}
		}

		if let Some(key) = self.defaults.get(&provider) {
			debug!(provider = %provider, source = "system", "resolved credential");
			return Ok(ResolvedCredential {
				key: key.clone(),
				source: CredentialSource::System,
				key_id: None,
			});
		}
		Err(CredentialError::Unavailable(provider))
	}

	fn unseal(
		&self,
		project: &Project,
		provider: Provider,
		source: CredentialSource,
	) -> Result<Option<ResolvedCredential>, CredentialError> {
		let Some(credential) = project.active_credential(provider) else {
			return Ok(None);
		};
		let unsealed = self.vault.decrypt(&credential.ciphertext).map_err(|e| {
			warn!(
				project_id = %project.id,
				key_id = %credential.key_id,
				error = %e,
				"credential decryption failed"
			);
			CredentialError::Decryption
		})?;
		debug!(provider = %provider, project_id = %project.id, source = ?source, "resolved credential");
		Ok(Some(ResolvedCredential {
			key: unsealed.api_key,
			source,
			key_id: Some(credential.key_id.clone()),
		}))
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use secrecy::ExposeSecret;

	use super::*;
	use crate::models::ProviderCredential;

	fn vault() -> Arc<CryptoVault> {
		Arc::new(CryptoVault::new(&SecretString::from(
			"0123456789abcdef0123456789abcdef".to_string(),
		)))
	}

	fn project_with_key(vault: &CryptoVault, provider: Provider, api_key: &str) -> Project {
		let mut p = Project::new("demo", "u1");
		let sealed = vault.encrypt(api_key, None).unwrap();
		p.credentials.push(ProviderCredential {
			provider,
			ciphertext: sealed.envelope,
			key_id: sealed.key_id,
			active: true,
			added_by: "u1".to_string(),
			added_at: Utc::now(),
		});
		p
	}

	#[test]
	fn project_context_wins() {
		let vault = vault();
		let ctx = project_with_key(&vault, Provider::Anthropic, "sk-ctx");
		let dflt = project_with_key(&vault, Provider::Anthropic, "sk-default");
		let mut defaults = HashMap::new();
		defaults.insert(
			Provider::Anthropic,
			SecretString::from("sk-system".to_string()),
		);
		let resolver = CredentialResolver::new(vault, defaults);

		let got = resolver
			.resolve(Some(&ctx), Some(&dflt), Provider::Anthropic)
			.unwrap();
		assert_eq!(got.source, CredentialSource::Project);
		assert_eq!(got.key.expose_secret(), "sk-ctx");
		assert!(got.key_id.is_some());
	}

	#[test]
	fn default_project_is_second() {
		let vault = vault();
		let dflt = project_with_key(&vault, Provider::OpenAi, "sk-default");
		let resolver = CredentialResolver::new(vault, HashMap::new());
		let got = resolver
			.resolve(None, Some(&dflt), Provider::OpenAi)
			.unwrap();
		assert_eq!(got.source, CredentialSource::User);
		assert_eq!(got.key.expose_secret(), "sk-default");
	}

	#[test]
	fn system_default_is_last() {
		let vault = vault();
		let mut defaults = HashMap::new();
		defaults.insert(Provider::Gemini, SecretString::from("sk-env".to_string()));
		let resolver = CredentialResolver::new(vault, defaults);
		let got = resolver.resolve(None, None, Provider::Gemini).unwrap();
		assert_eq!(got.source, CredentialSource::System);
		assert_eq!(got.key_id, None);
	}

	#[test]
	fn nothing_available() {
		let resolver = CredentialResolver::new(vault(), HashMap::new());
		assert!(matches!(
			resolver.resolve(None, None, Provider::OpenAi),
			Err(CredentialError::Unavailable(Provider::OpenAi))
		));
	}

	#[test]
	fn allowlist_blocks_even_with_credential() {
		let vault = vault();
		let mut ctx = project_with_key(&vault, Provider::OpenAi, "sk-ctx");
		ctx.settings.allowed_providers = Some(vec![Provider::Anthropic]);
		let mut defaults = HashMap::new();
		defaults.insert(Provider::OpenAi, SecretString::from("sk-env".to_string()));
		let resolver = CredentialResolver::new(vault, defaults);
		assert!(matches!(
			resolver.resolve(Some(&ctx), None, Provider::OpenAi),
			Err(CredentialError::ProviderNotAllowed(Provider::OpenAi))
		));
	}

	#[test]
	fn inactive_credentials_fall_through_to_system() {
		let vault = vault();
		let mut ctx = project_with_key(&vault, Provider::OpenAi, "sk-ctx");
		ctx.credentials[0].active = false;
		let mut defaults = HashMap::new();
		defaults.insert(Provider::OpenAi, SecretString::from("sk-env".to_string()));
		let resolver = CredentialResolver::new(vault, defaults);
		let got = resolver.resolve(Some(&ctx), None, Provider::OpenAi).unwrap();
		assert_eq!(got.source, CredentialSource::System);
	}

	#[test]
	fn corrupt_envelope_fails_closed() {
		let vault = vault();
		let mut ctx = project_with_key(&vault, Provider::OpenAi, "sk-ctx");
		ctx.credentials[0].ciphertext = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string();
		let mut defaults = HashMap::new();
		defaults.insert(Provider::OpenAi, SecretString::from("sk-env".to_string()));
		let resolver = CredentialResolver::new(vault, defaults);
		assert!(matches!(
			resolver.resolve(Some(&ctx), None, Provider::OpenAi),
			Err(CredentialError::Decryption)
		));
	}
}
