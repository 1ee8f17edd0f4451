use chrono::Utc;
use tracing::warn;

use crate::models::{AuditLog, AuditStatus};
use crate::store::Stores;

/// Append-only, best-effort audit trail. Entries expire after 90 days via
/// the store's TTL index. Write failures are logged and never propagate.
#[derive(Clone)]
pub struct AuditWriter {
	stores: Stores,
}

impl AuditWriter {
	pub fn new(stores: Stores) -> Self {
		Self { stores }
	}

	pub fn emit(&self, entry: AuditLog) {
		let stores = self.stores.clone();
		tracing::debug!(
			target: "audit",
			action = %entry.action,
			status = ?entry.status,
			resource = %entry.resource_type,
			"audit event"
		);
		tokio::spawn(async move {
			if let Err(e) = stores.audit.insert(&entry).await {
				warn!(action = %entry.action, error = %e, "audit write failed");
			}
		});
	}

	/// One entry per proxied request: action `api.<method>`.
	#[allow(clippy::too_many_arguments)]
	pub fn proxied_request(
		&self,
		user_id: Option<&str>,
		method: &str,
		path: &str,
		provider: &str,
		status_code: u16,
		client_ip: Option<&str>,
		user_agent: Option<&str>,
		error: Option<&str>,
	) {
		self.emit(AuditLog {
			user_id: user_id.map(str::to_string),
			action: format!("api.{}", method.to_lowercase()),
			resource_type: "proxy".to_string(),
			resource_id: None,
			details: Some(serde_json::json!({
				"path": path,
				"provider": provider,
				"statusCode": status_code,
			})),
			client_ip: client_ip.map(str::to_string),
			user_agent: user_agent.map(str::to_string),
			timestamp: Utc::now(),
			status: if error.is_none() {
				AuditStatus::Success
			} else {
				AuditStatus::Failure
			},
			error: error.map(str::to_string),
		});
	}

	/// One entry per administrative action (`api_key.*`, `project.*`, ...).
	pub fn admin_action(
		&self,
		user_id: &str,
		action: &str,
		resource_type: &str,
		resource_id: Option<&str>,
		details: Option<serde_json::Value>,
	) {
		self.emit(AuditLog {
			user_id: Some(user_id.to_string()),
			action: action.to_string(),
			resource_type: resource_type.to_string(),
			resource_id: resource_id.map(str::to_string),
			details,
			client_ip: None,
			user_agent: None,
			timestamp: Utc::now(),
			status: AuditStatus::Success,
			error: None,
		});
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::store::memory::MemoryStore;

	#[tokio::test]
	async fn proxied_request_entries_use_api_action() {
		let mem = Arc::new(MemoryStore::default());
		let stores = Stores {
			users: mem.clone(),
			tokens: mem.clone(),
			projects: mem.clone(),
			usage: mem.clone(),
			audit: mem.clone(),
		};
		let writer = AuditWriter::new(stores);
		writer.proxied_request(
			Some("u1"),
			"POST",
			"/v1/messages",
			"anthropic",
			200,
			Some("10.1.2.3"),
			Some("curl/8"),
			None,
		);
		writer.proxied_request(None, "POST", "/v1/messages", "anthropic", 401, None, None, Some("auth failed"));

		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		let entries = mem.audit_entries();
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].action, "api.post");
		assert_eq!(entries[0].status, AuditStatus::Success);
		assert_eq!(entries[1].status, AuditStatus::Failure);
		assert_eq!(entries[1].error.as_deref(), Some("auth failed"));
	}
}
