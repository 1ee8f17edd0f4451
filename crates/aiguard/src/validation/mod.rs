use serde_json::Value;

use crate::errors::ApiError;
use crate::providers::Provider;

pub mod safety;
pub mod schema;

/// Two-pass request validation: the cheap safety screen first, then the
/// per-endpoint schema when a rule matches. Unmatched endpoints pass
/// through for forward compatibility.
pub fn validate_body(
	provider: Provider,
	method: &str,
	path: &str,
	body: &Value,
) -> Result<(), ApiError> {
	let serialized = body.to_string();
	safety::screen(&serialized)?;
	schema::validate(provider, method, path, body)
}
