use std::str::FromStr;

use crate::errors::{ApiError, ErrorKind};

/// Closed set of upstream providers. New providers are added by extending
/// this enum and the registry table below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
	OpenAi,
	Anthropic,
	Gemini,
}

impl Provider {
	pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Gemini];

	pub fn as_str(&self) -> &'static str {
		match self {
			Provider::OpenAi => "openai",
			Provider::Anthropic => "anthropic",
			Provider::Gemini => "gemini",
		}
	}
}

impl std::fmt::Display for Provider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Provider {
	type Err = ApiError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"openai" => Ok(Provider::OpenAi),
			"anthropic" => Ok(Provider::Anthropic),
			"gemini" => Ok(Provider::Gemini),
			other => Err(
				ApiError::new(
					ErrorKind::InvalidProvider,
					format!("unknown provider: {other}"),
				)
				.with_suggestion("supported providers: openai, anthropic, gemini"),
			),
		}
	}
}

/// Static per-provider forwarding facts: upstream origin, how the credential
/// is attached, and any headers/query parameters the upstream always wants.
#[derive(Debug, Clone, Copy)]
pub struct ProviderEntry {
	pub origin: &'static str,
	pub auth_header: &'static str,
	pub auth_prefix: Option<&'static str>,
	pub constant_headers: &'static [(&'static str, &'static str)],
	pub constant_query: &'static [(&'static str, &'static str)],
}

impl ProviderEntry {
	/// Host component of the origin, for the outbound `host` header.
	pub fn host(&self) -> &'static str {
		self
			.origin
			.trim_start_matches("https://")
			.trim_start_matches("http://")
	}
}

const OPENAI: ProviderEntry = ProviderEntry {
	origin: "https://api.openai.com",
	auth_header: "authorization",
	auth_prefix: Some("Bearer"),
	constant_headers: &[],
	constant_query: &[],
};

const ANTHROPIC: ProviderEntry = ProviderEntry {
	origin: "https://api.anthropic.com",
	auth_header: "x-api-key",
	auth_prefix: None,
	constant_headers: &[("anthropic-version", "2023-06-01")],
	constant_query: &[],
};

const GEMINI: ProviderEntry = ProviderEntry {
	origin: "https://generativelanguage.googleapis.com",
	auth_header: "x-goog-api-key",
	auth_prefix: None,
	constant_headers: &[],
	constant_query: &[],
};

/// Read-only after startup; keyed by the closed enum rather than strings.
pub fn registry(provider: Provider) -> &'static ProviderEntry {
	match provider {
		Provider::OpenAi => &OPENAI,
		Provider::Anthropic => &ANTHROPIC,
		Provider::Gemini => &GEMINI,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tags_round_trip() {
		for p in Provider::ALL {
			assert_eq!(Provider::from_str(p.as_str()).ok(), Some(p));
		}
		assert_eq!(Provider::from_str("OpenAI").ok(), Some(Provider::OpenAi));
		assert!(Provider::from_str("mistral").is_err());
	}

	#[test]
	fn registry_entries() {
		let a = registry(Provider::Anthropic);
		assert_eq!(a.origin, "https://api.anthropic.com");
		assert_eq!(a.auth_header, "x-api-key");
		assert_eq!(a.auth_prefix, None);
		assert_eq!(a.constant_headers, &[("anthropic-version", "2023-06-01")]);
		assert_eq!(a.host(), "api.anthropic.com");

		let o = registry(Provider::OpenAi);
		assert_eq!(o.auth_header, "authorization");
		assert_eq!(o.auth_prefix, Some("Bearer"));

		let g = registry(Provider::Gemini);
		assert_eq!(g.origin, "https://generativelanguage.googleapis.com");
		assert_eq!(g.auth_header, "x-goog-api-key");
	}
}
