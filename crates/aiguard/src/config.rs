use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serializer;
use tracing::warn;

use crate::providers::Provider;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_DB_NAME: &str = "aiguard";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("missing required environment variable {0}")]
	Missing(&'static str),
}

/// Process configuration, read from the environment exactly once in `main`
/// and passed into the pipeline by handle. Never mutated after startup.
#[derive(Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub port: u16,
	#[serde(with = "serde_dur")]
	pub request_timeout: Duration,
	pub max_retries: u32,
	#[serde(with = "serde_dur")]
	pub retry_delay: Duration,
	pub max_request_size: usize,
	pub mongodb_uri: Option<String>,
	pub mongodb_db_name: String,
	pub redis_url: Option<String>,
	#[serde(serialize_with = "ser_redact")]
	pub encryption_key: SecretString,
	pub firebase_project_id: Option<String>,
	pub firebase_client_email: Option<String>,
	#[serde(serialize_with = "ser_redact_opt")]
	pub firebase_private_key: Option<SecretString>,
	#[serde(serialize_with = "ser_redact_opt")]
	pub admin_secret_key: Option<SecretString>,
	#[serde(serialize_with = "ser_redact_keys")]
	pub default_provider_keys: HashMap<Provider, SecretString>,
}

impl Config {
	pub fn from_env() -> Result<Self, ConfigError> {
		let encryption_key = std::env::var("ENCRYPTION_KEY")
			.map(SecretString::from)
			.map_err(|_| ConfigError::Missing("ENCRYPTION_KEY"))?;

		let mut default_provider_keys = HashMap::new();
		for (key, provider) in [
			("OPENAI_API_KEY", Provider::OpenAi),
			("ANTHROPIC_API_KEY", Provider::Anthropic),
			("GEMINI_API_KEY", Provider::Gemini),
		] {
			if let Ok(v) = std::env::var(key)
				&& !v.is_empty()
			{
				default_provider_keys.insert(provider, SecretString::from(v));
			}
		}

		Ok(Self {
			port: env_parse("PORT", DEFAULT_PORT),
			request_timeout: Duration::from_millis(env_parse(
				"REQUEST_TIMEOUT",
				DEFAULT_REQUEST_TIMEOUT_MS,
			)),
			max_retries: env_parse("MAX_RETRIES", DEFAULT_MAX_RETRIES),
			retry_delay: Duration::from_millis(env_parse("RETRY_DELAY", DEFAULT_RETRY_DELAY_MS)),
			max_request_size: env_parse("MAX_REQUEST_SIZE", DEFAULT_MAX_REQUEST_SIZE),
			mongodb_uri: env_opt("MONGODB_URI"),
			mongodb_db_name: env_opt("MONGODB_DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string()),
			redis_url: env_opt("REDIS_URL"),
			encryption_key,
			firebase_project_id: env_opt("FIREBASE_PROJECT_ID"),
			firebase_client_email: env_opt("FIREBASE_CLIENT_EMAIL"),
			firebase_private_key: env_opt("FIREBASE_PRIVATE_KEY").map(SecretString::from),
			admin_secret_key: env_opt("ADMIN_SECRET_KEY").map(SecretString::from),
			default_provider_keys,
		})
	}
}

impl std::fmt::Debug for Config {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Config")
			.field("port", &self.port)
			.field("request_timeout", &self.request_timeout)
			.field("max_retries", &self.max_retries)
			.field("retry_delay", &self.retry_delay)
			.field("max_request_size", &self.max_request_size)
			.field("mongodb_db_name", &self.mongodb_db_name)
			.field("redis_url", &self.redis_url.is_some())
			.field("firebase_project_id", &self.firebase_project_id)
			.finish_non_exhaustive()
	}
}

fn env_opt(key: &str) -> Option<String> {
	std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
	match std::env::var(key) {
		Ok(raw) => raw.parse().unwrap_or_else(|_| {
			warn!(key, value = %raw, "unparseable environment value, using default");
			default
		}),
		Err(_) => default,
	}
}

pub fn ser_redact<S: Serializer>(_: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

fn ser_redact_opt<S: Serializer>(
	v: &Option<SecretString>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	match v {
		Some(_) => serializer.serialize_str("<redacted>"),
		None => serializer.serialize_none(),
	}
}

fn ser_redact_keys<S: Serializer>(
	v: &HashMap<Provider, SecretString>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	serializer.collect_seq(v.keys())
}

mod serde_dur {
	use std::time::Duration;

	use serde::Serializer;

	pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(d.as_millis() as u64)
	}
}
