use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
	AuditStore, ProjectStore, StoreResult, TokenStore, UsageStore, UserStore,
};
use crate::models::{
	AuditLog, PersonalAccessToken, Project, ProjectMember, ProjectSettings, ProviderCredential,
	UsageBucket, UsageRecord, User, UserStatus,
};

/// In-process store used when no `MONGODB_URI` is configured, and by tests.
/// Mutations take the per-collection lock, which gives the same atomicity the
/// Mongo implementation gets from single-document updates.
#[derive(Default)]
pub struct MemoryStore {
	users: RwLock<HashMap<String, User>>,
	tokens: RwLock<HashMap<String, PersonalAccessToken>>,
	projects: RwLock<HashMap<String, Project>>,
	usage: RwLock<Vec<UsageRecord>>,
	audit: RwLock<Vec<AuditLog>>,
}

impl MemoryStore {
	pub fn audit_entries(&self) -> Vec<AuditLog> {
		self.audit.read().clone()
	}

	pub fn usage_records(&self) -> Vec<UsageRecord> {
		self.usage.read().clone()
	}
}

#[async_trait]
impl UserStore for MemoryStore {
	async fn find(&self, id: &str) -> StoreResult<Option<User>> {
		Ok(self.users.read().get(id).cloned())
	}

	async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
		Ok(
			self
				.users
				.read()
				.values()
				.find(|u| u.external_id.as_deref() == Some(external_id))
				.cloned(),
		)
	}

	async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
		let email = email.to_lowercase();
		Ok(
			self
				.users
				.read()
				.values()
				.find(|u| u.email == email && u.status != UserStatus::Deleted)
				.cloned(),
		)
	}

	async fn insert(&self, user: &User) -> StoreResult<()> {
		self.users.write().insert(user.id.clone(), user.clone());
		Ok(())
	}

	async fn update(&self, user: &User) -> StoreResult<()> {
		self.users.write().insert(user.id.clone(), user.clone());
		Ok(())
	}

	async fn touch_last_login(&self, id: &str, when: DateTime<Utc>) -> StoreResult<()> {
		if let Some(u) = self.users.write().get_mut(id) {
			u.last_login_at = Some(when);
		}
		Ok(())
	}

	async fn set_status(&self, id: &str, status: UserStatus) -> StoreResult<()> {
		if let Some(u) = self.users.write().get_mut(id) {
			u.status = status;
			u.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn list(&self, limit: usize) -> StoreResult<Vec<User>> {
		let mut out: Vec<_> = self.users.read().values().cloned().collect();
		out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		out.truncate(limit);
		Ok(out)
	}
}

#[async_trait]
impl TokenStore for MemoryStore {
	async fn find(&self, id: &str) -> StoreResult<Option<PersonalAccessToken>> {
		Ok(self.tokens.read().get(id).cloned())
	}

	async fn insert(&self, token: &PersonalAccessToken) -> StoreResult<()> {
		self.tokens.write().insert(token.id.clone(), token.clone());
		Ok(())
	}

	async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<PersonalAccessToken>> {
		let mut out: Vec<_> = self
			.tokens
			.read()
			.values()
			.filter(|t| t.user_id == user_id)
			.cloned()
			.collect();
		out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(out)
	}

	async fn find_by_name(
		&self,
		user_id: &str,
		name: &str,
	) -> StoreResult<Option<PersonalAccessToken>> {
		Ok(
			self
				.tokens
				.read()
				.values()
				.find(|t| t.user_id == user_id && t.name == name && !t.revoked)
				.cloned(),
		)
	}

	async fn revoke(&self, user_id: &str, id: &str) -> StoreResult<bool> {
		let mut tokens = self.tokens.write();
		match tokens.get_mut(id) {
			Some(t) if t.user_id == user_id && !t.revoked => {
				t.revoked = true;
				t.updated_at = Utc::now();
				Ok(true)
			},
			_ => Ok(false),
		}
	}

	async fn revoke_all_for_user(&self, user_id: &str) -> StoreResult<()> {
		for t in self.tokens.write().values_mut() {
			if t.user_id == user_id {
				t.revoked = true;
				t.updated_at = Utc::now();
			}
		}
		Ok(())
	}

	async fn touch_last_used(&self, id: &str, when: DateTime<Utc>) -> StoreResult<()> {
		if let Some(t) = self.tokens.write().get_mut(id) {
			t.last_used_at = Some(when);
		}
		Ok(())
	}

	async fn update_secret(&self, id: &str, token_hash: &str) -> StoreResult<()> {
		if let Some(t) = self.tokens.write().get_mut(id) {
			t.token_hash = token_hash.to_string();
			t.updated_at = Utc::now();
		}
		Ok(())
	}
}

#[async_trait]
impl ProjectStore for MemoryStore {
	async fn find(&self, id: &str) -> StoreResult<Option<Project>> {
		Ok(self.projects.read().get(id).cloned())
	}

	async fn insert(&self, project: &Project) -> StoreResult<()> {
		self
			.projects
			.write()
			.insert(project.id.clone(), project.clone());
		Ok(())
	}

	async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Project>> {
		let mut out: Vec<_> = self
			.projects
			.read()
			.values()
			.filter(|p| p.members.iter().any(|m| m.user_id == user_id))
			.cloned()
			.collect();
		out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(out)
	}

	async fn update_settings(&self, id: &str, settings: &ProjectSettings) -> StoreResult<()> {
		if let Some(p) = self.projects.write().get_mut(id) {
			p.settings = settings.clone();
			p.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn add_member(&self, id: &str, member: &ProjectMember) -> StoreResult<()> {
		if let Some(p) = self.projects.write().get_mut(id) {
			if !p.members.iter().any(|m| m.user_id == member.user_id) {
				p.members.push(member.clone());
				p.updated_at = Utc::now();
			}
		}
		Ok(())
	}

	async fn remove_member(&self, id: &str, user_id: &str) -> StoreResult<()> {
		if let Some(p) = self.projects.write().get_mut(id) {
			p.members.retain(|m| m.user_id != user_id);
			p.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn add_credential(&self, id: &str, credential: &ProviderCredential) -> StoreResult<()> {
		if let Some(p) = self.projects.write().get_mut(id) {
			p.credentials.push(credential.clone());
			p.updated_at = Utc::now();
		}
		Ok(())
	}

	async fn remove_credential(&self, id: &str, key_id: &str) -> StoreResult<bool> {
		let mut projects = self.projects.write();
		let Some(p) = projects.get_mut(id) else {
			return Ok(false);
		};
		let before = p.credentials.len();
		p.credentials.retain(|c| c.key_id != key_id);
		Ok(p.credentials.len() != before)
	}

	async fn delete(&self, id: &str) -> StoreResult<()> {
		self.projects.write().remove(id);
		Ok(())
	}

	async fn increment_usage(
		&self,
		id: &str,
		requests: u64,
		tokens: u64,
		cost: f64,
	) -> StoreResult<()> {
		if let Some(p) = self.projects.write().get_mut(id) {
			for bucket in [
				&mut p.usage.total,
				&mut p.usage.current_month,
				&mut p.usage.current_day,
			] {
				bucket.requests += requests;
				bucket.tokens += tokens;
				bucket.cost += cost;
			}
			p.usage.last_updated = Utc::now();
		}
		Ok(())
	}

	async fn reset_daily(&self) -> StoreResult<u64> {
		let mut projects = self.projects.write();
		for p in projects.values_mut() {
			p.usage.current_day = UsageBucket::default();
			p.usage.last_updated = Utc::now();
		}
		Ok(projects.len() as u64)
	}

	async fn reset_monthly(&self) -> StoreResult<u64> {
		let mut projects = self.projects.write();
		for p in projects.values_mut() {
			p.usage.current_month = UsageBucket::default();
			p.usage.last_updated = Utc::now();
		}
		Ok(projects.len() as u64)
	}
}

#[async_trait]
impl UsageStore for MemoryStore {
	async fn insert(&self, record: &UsageRecord) -> StoreResult<()> {
		self.usage.write().push(record.clone());
		Ok(())
	}

	async fn list_for_project(
		&self,
		project_id: &str,
		limit: usize,
	) -> StoreResult<Vec<UsageRecord>> {
		Ok(
			self
				.usage
				.read()
				.iter()
				.filter(|r| r.project_id.as_deref() == Some(project_id))
				.take(limit)
				.cloned()
				.collect(),
		)
	}
}

#[async_trait]
impl AuditStore for MemoryStore {
	async fn insert(&self, entry: &AuditLog) -> StoreResult<()> {
		self.audit.write().push(entry.clone());
		Ok(())
	}
}
