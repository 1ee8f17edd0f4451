use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{Bson, doc};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::info;

use super::{
	AuditStore, ProjectStore, StoreError, StoreResult, Stores, TokenStore, UsageStore, UserStore,
};
use crate::models::{
	AuditLog, PersonalAccessToken, Project, ProjectMember, ProjectSettings, ProviderCredential,
	UsageRecord, User, UserStatus,
};

const TTL_90_DAYS: Duration = Duration::from_secs(90 * 24 * 60 * 60);

fn db_err(e: impl std::fmt::Display) -> StoreError {
	StoreError::Database(e.to_string())
}

/// Chrono timestamps on the administrative models are stored as RFC 3339
/// strings, matching their serde form.
fn ts(when: DateTime<Utc>) -> Bson {
	Bson::String(when.to_rfc3339())
}

/// MongoDB-backed repositories over the collections of the persisted-state
/// layout: `users`, `personalaccesstokens`, `projects`, `usagerecords`,
/// `auditlogs`.
#[derive(Clone)]
pub struct MongoStore {
	users: Collection<User>,
	tokens: Collection<PersonalAccessToken>,
	projects: Collection<Project>,
	usage: Collection<UsageRecord>,
	audit: Collection<AuditLog>,
}

impl MongoStore {
	pub fn new(db: &Database) -> Self {
		Self {
			users: db.collection("users"),
			tokens: db.collection("personalaccesstokens"),
			projects: db.collection("projects"),
			usage: db.collection("usagerecords"),
			audit: db.collection("auditlogs"),
		}
	}

	pub async fn connect(uri: &str, db_name: &str) -> StoreResult<Stores> {
		let client = Client::with_uri_str(uri).await.map_err(db_err)?;
		let db = client.database(db_name);
		let store = Arc::new(MongoStore::new(&db));
		store.ensure_indexes().await?;
		info!(db = db_name, "connected to document store");
		Ok(Stores {
			users: store.clone(),
			tokens: store.clone(),
			projects: store.clone(),
			usage: store.clone(),
			audit: store,
		})
	}

	/// Unique/lookup indexes plus the 90-day TTL indexes on the append-only
	/// collections.
	pub async fn ensure_indexes(&self) -> StoreResult<()> {
		self
			.users
			.create_index(
				IndexModel::builder()
					.keys(doc! { "email": 1 })
					.options(
						IndexOptions::builder()
							.unique(true)
							.partial_filter_expression(doc! { "status": { "$ne": "deleted" } })
							.build(),
					)
					.build(),
			)
			.await
			.map_err(db_err)?;
		self
			.users
			.create_index(
				IndexModel::builder()
					.keys(doc! { "externalId": 1 })
					.options(IndexOptions::builder().unique(true).sparse(true).build())
					.build(),
			)
			.await
			.map_err(db_err)?;
		self
			.tokens
			.create_index(IndexModel::builder().keys(doc! { "userId": 1 }).build())
			.await
			.map_err(db_err)?;
		self
			.projects
			.create_index(
				IndexModel::builder()
					.keys(doc! { "members.userId": 1 })
					.build(),
			)
			.await
			.map_err(db_err)?;
		self
			.usage
			.create_index(
				IndexModel::builder()
					.keys(doc! { "timestamp": 1 })
					.options(IndexOptions::builder().expire_after(TTL_90_DAYS).build())
					.build(),
			)
			.await
			.map_err(db_err)?;
		self
			.usage
			.create_index(IndexModel::builder().keys(doc! { "projectId": 1 }).build())
			.await
			.map_err(db_err)?;
		self
			.audit
			.create_index(
				IndexModel::builder()
					.keys(doc! { "timestamp": 1 })
					.options(IndexOptions::builder().expire_after(TTL_90_DAYS).build())
					.build(),
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}
}

#[async_trait]
impl UserStore for MongoStore {
	async fn find(&self, id: &str) -> StoreResult<Option<User>> {
		self.users.find_one(doc! { "_id": id }).await.map_err(db_err)
	}

	async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<User>> {
		self
			.users
			.find_one(doc! { "externalId": external_id })
			.await
			.map_err(db_err)
	}

	async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
		self
			.users
			.find_one(doc! { "email": email.to_lowercase(), "status": { "$ne": "deleted" } })
			.await
			.map_err(db_err)
	}

	async fn insert(&self, user: &User) -> StoreResult<()> {
		self.users.insert_one(user).await.map_err(db_err)?;
		Ok(())
	}

	async fn update(&self, user: &User) -> StoreResult<()> {
		self
			.users
			.replace_one(doc! { "_id": user.id.as_str() }, user)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn touch_last_login(&self, id: &str, when: DateTime<Utc>) -> StoreResult<()> {
		self
			.users
			.update_one(
				doc! { "_id": id },
				doc! { "$set": { "lastLoginAt": ts(when) } },
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn set_status(&self, id: &str, status: UserStatus) -> StoreResult<()> {
		let status = mongodb::bson::to_bson(&status).map_err(db_err)?;
		self
			.users
			.update_one(
				doc! { "_id": id },
				doc! { "$set": { "status": status, "updatedAt": ts(Utc::now()) } },
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn list(&self, limit: usize) -> StoreResult<Vec<User>> {
		self
			.users
			.find(doc! {})
			.sort(doc! { "createdAt": 1 })
			.limit(limit as i64)
			.await
			.map_err(db_err)?
			.try_collect()
			.await
			.map_err(db_err)
	}
}

#[async_trait]
impl TokenStore for MongoStore {
	async fn find(&self, id: &str) -> StoreResult<Option<PersonalAccessToken>> {
		self
			.tokens
			.find_one(doc! { "_id": id })
			.await
			.map_err(db_err)
	}

	async fn insert(&self, token: &PersonalAccessToken) -> StoreResult<()> {
		self.tokens.insert_one(token).await.map_err(db_err)?;
		Ok(())
	}

	async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<PersonalAccessToken>> {
		self
			.tokens
			.find(doc! { "userId": user_id })
			.sort(doc! { "createdAt": 1 })
			.await
			.map_err(db_err)?
			.try_collect()
			.await
			.map_err(db_err)
	}

	async fn find_by_name(
		&self,
		user_id: &str,
		name: &str,
	) -> StoreResult<Option<PersonalAccessToken>> {
		self
			.tokens
			.find_one(doc! { "userId": user_id, "name": name, "revoked": false })
			.await
			.map_err(db_err)
	}

	async fn revoke(&self, user_id: &str, id: &str) -> StoreResult<bool> {
		let res = self
			.tokens
			.update_one(
				doc! { "_id": id, "userId": user_id, "revoked": false },
				doc! { "$set": { "revoked": true, "updatedAt": ts(Utc::now()) } },
			)
			.await
			.map_err(db_err)?;
		Ok(res.modified_count > 0)
	}

	async fn revoke_all_for_user(&self, user_id: &str) -> StoreResult<()> {
		self
			.tokens
			.update_many(
				doc! { "userId": user_id },
				doc! { "$set": { "revoked": true, "updatedAt": ts(Utc::now()) } },
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn touch_last_used(&self, id: &str, when: DateTime<Utc>) -> StoreResult<()> {
		self
			.tokens
			.update_one(
				doc! { "_id": id },
				doc! { "$set": { "lastUsedAt": ts(when) } },
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn update_secret(&self, id: &str, token_hash: &str) -> StoreResult<()> {
		self
			.tokens
			.update_one(
				doc! { "_id": id },
				doc! { "$set": { "tokenHash": token_hash, "updatedAt": ts(Utc::now()) } },
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}
}

#[async_trait]
impl ProjectStore for MongoStore {
	async fn find(&self, id: &str) -> StoreResult<Option<Project>> {
		self
			.projects
			.find_one(doc! { "_id": id })
			.await
			.map_err(db_err)
	}

	async fn insert(&self, project: &Project) -> StoreResult<()> {
		self.projects.insert_one(project).await.map_err(db_err)?;
		Ok(())
	}

	async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Project>> {
		self
			.projects
			.find(doc! { "members.userId": user_id })
			.sort(doc! { "createdAt": 1 })
			.await
			.map_err(db_err)?
			.try_collect()
			.await
			.map_err(db_err)
	}

	async fn update_settings(&self, id: &str, settings: &ProjectSettings) -> StoreResult<()> {
		let settings = mongodb::bson::to_bson(settings).map_err(db_err)?;
		self
			.projects
			.update_one(
				doc! { "_id": id },
				doc! { "$set": { "settings": settings, "updatedAt": ts(Utc::now()) } },
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn add_member(&self, id: &str, member: &ProjectMember) -> StoreResult<()> {
		let member_bson = mongodb::bson::to_bson(member).map_err(db_err)?;
		// Guard against duplicates at the query level so the push is atomic.
		self
			.projects
			.update_one(
				doc! { "_id": id, "members.userId": { "$ne": member.user_id.as_str() } },
				doc! {
					"$push": { "members": member_bson },
					"$set": { "updatedAt": ts(Utc::now()) },
				},
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn remove_member(&self, id: &str, user_id: &str) -> StoreResult<()> {
		self
			.projects
			.update_one(
				doc! { "_id": id },
				doc! {
					"$pull": { "members": { "userId": user_id } },
					"$set": { "updatedAt": ts(Utc::now()) },
				},
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn add_credential(&self, id: &str, credential: &ProviderCredential) -> StoreResult<()> {
		let cred = mongodb::bson::to_bson(credential).map_err(db_err)?;
		self
			.projects
			.update_one(
				doc! { "_id": id },
				doc! {
					"$push": { "credentials": cred },
					"$set": { "updatedAt": ts(Utc::now()) },
				},
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn remove_credential(&self, id: &str, key_id: &str) -> StoreResult<bool> {
		let res = self
			.projects
			.update_one(
				doc! { "_id": id },
				doc! {
					"$pull": { "credentials": { "keyId": key_id } },
					"$set": { "updatedAt": ts(Utc::now()) },
				},
			)
			.await
			.map_err(db_err)?;
		Ok(res.modified_count > 0)
	}

	async fn delete(&self, id: &str) -> StoreResult<()> {
		self
			.projects
			.delete_one(doc! { "_id": id })
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn increment_usage(
		&self,
		id: &str,
		requests: u64,
		tokens: u64,
		cost: f64,
	) -> StoreResult<()> {
		// One server-side $inc across all buckets; never read-modify-write.
		let requests = requests as i64;
		let tokens = tokens as i64;
		self
			.projects
			.update_one(
				doc! { "_id": id },
				doc! {
					"$inc": {
						"usage.total.requests": requests,
						"usage.total.tokens": tokens,
						"usage.total.cost": cost,
						"usage.currentMonth.requests": requests,
						"usage.currentMonth.tokens": tokens,
						"usage.currentMonth.cost": cost,
						"usage.currentDay.requests": requests,
						"usage.currentDay.tokens": tokens,
						"usage.currentDay.cost": cost,
					},
					"$set": { "usage.lastUpdated": ts(Utc::now()) },
				},
			)
			.await
			.map_err(db_err)?;
		Ok(())
	}

	async fn reset_daily(&self) -> StoreResult<u64> {
		let res = self
			.projects
			.update_many(
				doc! {},
				doc! { "$set": {
					"usage.currentDay": { "requests": 0_i64, "tokens": 0_i64, "cost": 0.0 },
					"usage.lastUpdated": ts(Utc::now()),
				} },
			)
			.await
			.map_err(db_err)?;
		Ok(res.modified_count)
	}

	async fn reset_monthly(&self) -> StoreResult<u64> {
		let res = self
			.projects
			.update_many(
				doc! {},
				doc! { "$set": {
					"usage.currentMonth": { "requests": 0_i64, "tokens": 0_i64, "cost": 0.0 },
					"usage.lastUpdated": ts(Utc::now()),
				} },
			)
			.await
			.map_err(db_err)?;
		Ok(res.modified_count)
	}
}

#[async_trait]
impl UsageStore for MongoStore {
	async fn insert(&self, record: &UsageRecord) -> StoreResult<()> {
		self.usage.insert_one(record).await.map_err(db_err)?;
		Ok(())
	}

	async fn list_for_project(
		&self,
		project_id: &str,
		limit: usize,
	) -> StoreResult<Vec<UsageRecord>> {
		self
			.usage
			.find(doc! { "projectId": project_id })
			.sort(doc! { "timestamp": -1 })
			.limit(limit as i64)
			.await
			.map_err(db_err)?
			.try_collect()
			.await
			.map_err(db_err)
	}
}

#[async_trait]
impl AuditStore for MongoStore {
	async fn insert(&self, entry: &AuditLog) -> StoreResult<()> {
		self.audit.insert_one(entry).await.map_err(db_err)?;
		Ok(())
	}
}
