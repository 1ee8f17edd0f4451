use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::providers::Provider;

/// 16 lowercase hex characters (8 random bytes); the id shape shared by
/// users, projects, and the PAT identifier segment.
pub fn new_id() -> String {
	let mut bytes = [0u8; 8];
	rand::rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
	Active,
	Suspended,
	Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
	#[serde(rename = "_id")]
	pub id: String,
	/// Identifier at the external identity provider, when the user was
	/// provisioned through identity-token login.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub external_id: Option<String>,
	/// Always stored lowercased; unique among non-deleted users.
	pub email: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
	pub status: UserStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_project: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
	pub fn new(email: &str) -> Self {
		let now = Utc::now();
		Self {
			id: new_id(),
			external_id: None,
			email: email.to_lowercase(),
			display_name: None,
			status: UserStatus::Active,
			default_project: None,
			created_at: now,
			updated_at: now,
			last_login_at: None,
		}
	}

	pub fn is_active(&self) -> bool {
		self.status == UserStatus::Active
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
	#[serde(rename = "api:read")]
	ApiRead,
	#[serde(rename = "api:write")]
	ApiWrite,
	#[serde(rename = "projects:read")]
	ProjectsRead,
	#[serde(rename = "projects:write")]
	ProjectsWrite,
	#[serde(rename = "users:read")]
	UsersRead,
	#[serde(rename = "users:write")]
	UsersWrite,
	#[serde(rename = "admin")]
	Admin,
}

/// A stored personal access token. The raw secret never appears here: only
/// the indexed identifier (`pat_<16 hex>`) and the slow hash of the full
/// wire string survive creation.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalAccessToken {
	/// The lookup identifier, wire prefix included.
	#[serde(rename = "_id")]
	pub id: String,
	pub token_hash: String,
	pub user_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
	/// Human name, unique per user.
	pub name: String,
	pub scopes: Vec<Scope>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	pub revoked: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_used_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl PersonalAccessToken {
	/// Usability modulo the owner's status, which the caller checks against
	/// the user record.
	pub fn usable_at(&self, now: DateTime<Utc>) -> bool {
		!self.revoked && self.expires_at.is_none_or(|exp| now < exp)
	}
}

impl std::fmt::Debug for PersonalAccessToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PersonalAccessToken")
			.field("id", &self.id)
			.field("user_id", &self.user_id)
			.field("project_id", &self.project_id)
			.field("name", &self.name)
			.field("scopes", &self.scopes)
			.field("expires_at", &self.expires_at)
			.field("revoked", &self.revoked)
			// token_hash intentionally omitted
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
	Owner,
	Admin,
	Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMember {
	pub user_id: String,
	pub role: MemberRole,
	pub added_at: DateTime<Utc>,
}

/// A provider credential embedded in its owning project. The plaintext key
/// exists only inside the crypto vault's envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredential {
	pub provider: Provider,
	pub ciphertext: String,
	pub key_id: String,
	pub active: bool,
	pub added_by: String,
	pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaOverride {
	pub daily: u64,
	pub monthly: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
	/// Requests per minute, overriding the tier default.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rate_limit: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub quota: Option<QuotaOverride>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub allowed_providers: Option<Vec<Provider>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
	pub requests: u64,
	pub tokens: u64,
	pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUsage {
	#[serde(default)]
	pub total: UsageBucket,
	#[serde(default)]
	pub current_month: UsageBucket,
	#[serde(default)]
	pub current_day: UsageBucket,
	pub last_updated: DateTime<Utc>,
}

impl Default for ProjectUsage {
	fn default() -> Self {
		Self {
			total: UsageBucket::default(),
			current_month: UsageBucket::default(),
			current_day: UsageBucket::default(),
			last_updated: Utc::now(),
		}
	}
}

/// Policy tier inferred from project size when no override is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
	Free,
	Pro,
	Enterprise,
}

impl Tier {
	pub fn from_member_count(count: usize) -> Self {
		match count {
			0..=1 => Tier::Free,
			2..=5 => Tier::Pro,
			_ => Tier::Enterprise,
		}
	}

	/// Requests per minute.
	pub fn rate_limit(&self) -> u32 {
		match self {
			Tier::Free => 10,
			Tier::Pro => 100,
			Tier::Enterprise => 1_000,
		}
	}

	pub fn daily_quota(&self) -> u64 {
		match self {
			Tier::Free => 100,
			Tier::Pro => 5_000,
			Tier::Enterprise => 50_000,
		}
	}

	pub fn monthly_quota(&self) -> u64 {
		match self {
			Tier::Free => 1_000,
			Tier::Pro => 50_000,
			Tier::Enterprise => 1_000_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
	#[serde(rename = "_id")]
	pub id: String,
	pub name: String,
	pub owner_id: String,
	pub members: Vec<ProjectMember>,
	#[serde(default)]
	pub credentials: Vec<ProviderCredential>,
	#[serde(default)]
	pub settings: ProjectSettings,
	#[serde(default)]
	pub usage: ProjectUsage,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Project {
	pub fn new(name: &str, owner_id: &str) -> Self {
		let now = Utc::now();
		Self {
			id: new_id(),
			name: name.to_string(),
			owner_id: owner_id.to_string(),
			members: vec![ProjectMember {
				user_id: owner_id.to_string(),
				role: MemberRole::Owner,
				added_at: now,
			}],
			credentials: Vec::new(),
			settings: ProjectSettings::default(),
			usage: ProjectUsage::default(),
			created_at: now,
			updated_at: now,
		}
	}

	pub fn tier(&self) -> Tier {
		Tier::from_member_count(self.members.len())
	}

	/// First active credential for the provider, in insertion order. Ties
	/// between multiple active credentials resolve deterministically to the
	/// earliest added.
	pub fn active_credential(&self, provider: Provider) -> Option<&ProviderCredential> {
		self
			.credentials
			.iter()
			.find(|c| c.active && c.provider == provider)
	}

	pub fn role_of(&self, user_id: &str) -> Option<MemberRole> {
		self
			.members
			.iter()
			.find(|m| m.user_id == user_id)
			.map(|m| m.role)
	}

	pub fn allows_provider(&self, provider: Provider) -> bool {
		match &self.settings.allowed_providers {
			Some(allowed) => allowed.contains(&provider),
			None => true,
		}
	}

	pub fn daily_limit(&self) -> u64 {
		self
			.settings
			.quota
			.map(|q| q.daily)
			.unwrap_or_else(|| self.tier().daily_quota())
	}

	pub fn monthly_limit(&self) -> u64 {
		self
			.settings
			.quota
			.map(|q| q.monthly)
			.unwrap_or_else(|| self.tier().monthly_quota())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
	pub user_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub project_id: Option<String>,
	pub provider: Provider,
	pub endpoint: String,
	pub method: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub prompt_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completion_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub total_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cost: Option<f64>,
	pub response_time_ms: u64,
	pub status_code: u16,
	/// BSON date so the collection's 90-day TTL index applies.
	#[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
	Success,
	Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	/// Closed taxonomy: `auth.*`, `api_key.*`, `project.*`,
	/// `project.member.*`, `user.*`, `api.*`.
	pub action: String,
	pub resource_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_ip: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_agent: Option<String>,
	#[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
	pub timestamp: DateTime<Utc>,
	pub status: AuditStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn id_shape() {
		let id = new_id();
		assert_eq!(id.len(), 16);
		assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}

	#[test]
	fn tier_inference() {
		assert_eq!(Tier::from_member_count(0), Tier::Free);
		assert_eq!(Tier::from_member_count(1), Tier::Free);
		assert_eq!(Tier::from_member_count(2), Tier::Pro);
		assert_eq!(Tier::from_member_count(5), Tier::Pro);
		assert_eq!(Tier::from_member_count(6), Tier::Enterprise);
	}

	#[test]
	fn owner_is_member_with_owner_role() {
		let p = Project::new("demo", "user1");
		assert_eq!(p.role_of("user1"), Some(MemberRole::Owner));
		assert_eq!(p.tier(), Tier::Free);
	}

	#[test]
	fn first_active_credential_wins() {
		let mut p = Project::new("demo", "user1");
		let now = Utc::now();
		for (key_id, active) in [("k1", false), ("k2", true), ("k3", true)] {
			p.credentials.push(ProviderCredential {
				provider: Provider::OpenAi,
				ciphertext: String::new(),
				key_id: key_id.to_string(),
				active,
				added_by: "user1".to_string(),
				added_at: now,
			});
		}
		let picked = p.active_credential(Provider::OpenAi);
		assert_eq!(picked.map(|c| c.key_id.as_str()), Some("k2"));
		assert!(p.active_credential(Provider::Gemini).is_none());
	}

	#[test]
	fn token_usability() {
		let now = Utc::now();
		let mut tok = PersonalAccessToken {
			id: "pat_0011223344556677".to_string(),
			token_hash: "$2b$10$abcdefghijklmnopqrstuv".to_string(),
			user_id: "u".to_string(),
			project_id: None,
			name: "ci".to_string(),
			scopes: vec![Scope::ApiWrite],
			expires_at: None,
			revoked: false,
			last_used_at: None,
			created_at: now,
			updated_at: now,
		};
		assert!(tok.usable_at(now));
		tok.expires_at = Some(now - chrono::Duration::seconds(1));
		assert!(!tok.usable_at(now));
		tok.expires_at = None;
		tok.revoked = true;
		assert!(!tok.usable_at(now));
	}

	#[test]
	fn debug_redacts_token_hash() {
		let now = Utc::now();
		let tok = PersonalAccessToken {
			id: "pat_0011223344556677".to_string(),
			token_hash: "$2b$10$secrethashvalue".to_string(),
			user_id: "u".to_string(),
			project_id: None,
			name: "ci".to_string(),
			scopes: vec![],
			expires_at: None,
			revoked: false,
			last_used_at: None,
			created_at: now,
			updated_at: now,
		};
		let dbg = format!("{tok:?}");
		assert!(!dbg.contains("secrethashvalue"));
		assert!(!dbg.contains("token_hash"));
	}
}
