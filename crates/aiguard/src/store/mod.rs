use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{ApiError, ErrorKind};
use crate::models::{
	AuditLog, PersonalAccessToken, Project, ProjectMember, ProjectSettings, ProviderCredential,
	UsageRecord, User, UserStatus,
};

pub mod memory;
pub mod mongo;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(String),
	#[error("not found")]
	NotFound,
}

impl From<StoreError> for ApiError {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::NotFound => ApiError::new(ErrorKind::NotFound, "resource not found"),
			StoreError::Database(msg) => ApiError::new(ErrorKind::DatabaseError, msg),
		}
	}
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Data-access contract for users.
#[async_trait]
pub trait UserStore: Send + Sync {
	async fn find(&self, id: &str) -> StoreResult<Option<User>>;
	async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>>;
	/// Non-deleted users only; emails are stored lowercased.
	async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
	async fn insert(&self, user: &User) -> StoreResult<()>;
	async fn update(&self, user: &User) -> StoreResult<()>;
	async fn touch_last_login(&self, id: &str, when: DateTime<Utc>) -> StoreResult<()>;
	async fn set_status(&self, id: &str, status: UserStatus) -> StoreResult<()>;
	async fn list(&self, limit: usize) -> StoreResult<Vec<User>>;
}

/// Data-access contract for personal access tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
	async fn find(&self, id: &str) -> StoreResult<Option<PersonalAccessToken>>;
	async fn insert(&self, token: &PersonalAccessToken) -> StoreResult<()>;
	async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<PersonalAccessToken>>;
	async fn find_by_name(&self, user_id: &str, name: &str)
	-> StoreResult<Option<PersonalAccessToken>>;
	/// Returns false when no live token matched.
	async fn revoke(&self, user_id: &str, id: &str) -> StoreResult<bool>;
	async fn revoke_all_for_user(&self, user_id: &str) -> StoreResult<()>;
	async fn touch_last_used(&self, id: &str, when: DateTime<Utc>) -> StoreResult<()>;
	/// Swap the stored hash during rotation, keeping the identifier stable.
	async fn update_secret(&self, id: &str, token_hash: &str) -> StoreResult<()>;
}

/// Data-access contract for projects, including the embedded credential and
/// usage-counter arrays. Counter updates must be single-operation atomic
/// increments on the backing store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
	async fn find(&self, id: &str) -> StoreResult<Option<Project>>;
	async fn insert(&self, project: &Project) -> StoreResult<()>;
	async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Project>>;
	async fn update_settings(&self, id: &str, settings: &ProjectSettings) -> StoreResult<()>;
	async fn add_member(&self, id: &str, member: &ProjectMember) -> StoreResult<()>;
	async fn remove_member(&self, id: &str, user_id: &str) -> StoreResult<()>;
	async fn add_credential(&self, id: &str, credential: &ProviderCredential) -> StoreResult<()>;
	async fn remove_credential(&self, id: &str, key_id: &str) -> StoreResult<bool>;
	async fn delete(&self, id: &str) -> StoreResult<()>;
	/// Bump all three usage buckets at once: `+requests`, `+tokens`, `+cost`.
	async fn increment_usage(
		&self,
		id: &str,
		requests: u64,
		tokens: u64,
		cost: f64,
	) -> StoreResult<()>;
	async fn reset_daily(&self) -> StoreResult<u64>;
	async fn reset_monthly(&self) -> StoreResult<u64>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
	async fn insert(&self, record: &UsageRecord) -> StoreResult<()>;
	async fn list_for_project(&self, project_id: &str, limit: usize)
	-> StoreResult<Vec<UsageRecord>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
	async fn insert(&self, entry: &AuditLog) -> StoreResult<()>;
}

/// The full set of repositories, injected into the pipeline at startup.
#[derive(Clone)]
pub struct Stores {
	pub users: Arc<dyn UserStore>,
	pub tokens: Arc<dyn TokenStore>,
	pub projects: Arc<dyn ProjectStore>,
	pub usage: Arc<dyn UsageStore>,
	pub audit: Arc<dyn AuditStore>,
}

impl Stores {
	/// Volatile stores for local development and tests.
	pub fn in_memory() -> Self {
		let mem = Arc::new(memory::MemoryStore::default());
		Self {
			users: mem.clone(),
			tokens: mem.clone(),
			projects: mem.clone(),
			usage: mem.clone(),
			audit: mem,
		}
	}
}
