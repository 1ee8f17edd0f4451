use serde_json::{Value, json};

use crate::errors::{ApiError, ErrorKind};
use crate::providers::Provider;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldError {
	pub field: String,
	pub message: String,
}

fn err(errs: &mut Vec<FieldError>, field: &str, message: impl Into<String>) {
	errs.push(FieldError {
		field: field.to_string(),
		message: message.into(),
	});
}

type Check = fn(&Value, &mut Vec<FieldError>);

struct Rule {
	provider: Provider,
	method: &'static str,
	/// Exact segments; `:name` segments match any single value.
	path: &'static str,
	check: Check,
}

static RULES: &[Rule] = &[
	Rule {
		provider: Provider::OpenAi,
		method: "POST",
		path: "/v1/chat/completions",
		check: check_openai_chat,
	},
	Rule {
		provider: Provider::Anthropic,
		method: "POST",
		path: "/v1/messages",
		check: check_anthropic_messages,
	},
	Rule {
		provider: Provider::Gemini,
		method: "POST",
		path: "/v1beta/models/:model/generateContent",
		check: check_gemini_generate,
	},
];

fn path_matches(pattern: &str, path: &str) -> bool {
	let pattern_segs: Vec<_> = pattern.split('/').filter(|s| !s.is_empty()).collect();
	let path_segs: Vec<_> = path.split('/').filter(|s| !s.is_empty()).collect();
	pattern_segs.len() == path_segs.len()
		&& pattern_segs
			.iter()
			.zip(&path_segs)
			.all(|(p, s)| p.starts_with(':') || p == s)
}

/// Validate against the matching rule, if any. Unmatched endpoints are
/// allowed through so new provider surfaces keep working.
pub fn validate(provider: Provider, method: &str, path: &str, body: &Value) -> Result<(), ApiError> {
	let Some(rule) = RULES
		.iter()
		.find(|r| r.provider == provider && r.method == method && path_matches(r.path, path))
	else {
		return Ok(());
	};

	let mut errs = Vec::new();
	if body.is_object() {
		(rule.check)(body, &mut errs);
	} else {
		err(&mut errs, "$", "request body must be a JSON object");
	}

	if errs.is_empty() {
		Ok(())
	} else {
		Err(
			ApiError::new(ErrorKind::InvalidRequest, "request body failed validation")
				.with_details(json!({ "fields": errs })),
		)
	}
}

fn require_str<'a>(body: &'a Value, field: &str, errs: &mut Vec<FieldError>) -> Option<&'a str> {
	match body.get(field) {
		Some(Value::String(s)) => Some(s),
		Some(_) => {
			err(errs, field, "must be a string");
			None
		},
		None => {
			err(errs, field, "is required");
			None
		},
	}
}

fn opt_str(body: &Value, field: &str, errs: &mut Vec<FieldError>) {
	if let Some(v) = body.get(field)
		&& !v.is_string()
	{
		err(errs, field, "must be a string");
	}
}

fn opt_bool(body: &Value, field: &str, errs: &mut Vec<FieldError>) {
	if let Some(v) = body.get(field)
		&& !v.is_boolean()
	{
		err(errs, field, "must be a boolean");
	}
}

fn opt_array(body: &Value, field: &str, errs: &mut Vec<FieldError>) {
	if let Some(v) = body.get(field)
		&& !v.is_array()
	{
		err(errs, field, "must be an array");
	}
}

fn opt_f64_range(body: &Value, field: &str, min: f64, max: f64, errs: &mut Vec<FieldError>) {
	if let Some(v) = body.get(field) {
		match v.as_f64() {
			Some(n) if (min..=max).contains(&n) => {},
			_ => err(errs, field, format!("must be a number in [{min}, {max}]")),
		}
	}
}

fn int_in_range(body: &Value, field: &str, min: u64, max: u64, errs: &mut Vec<FieldError>) {
	match body.get(field).and_then(Value::as_u64) {
		Some(n) if (min..=max).contains(&n) => {},
		_ => err(errs, field, format!("must be an integer in [{min}, {max}]")),
	}
}

fn opt_int_range(body: &Value, field: &str, min: u64, max: u64, errs: &mut Vec<FieldError>) {
	if body.get(field).is_some() {
		int_in_range(body, field, min, max, errs);
	}
}

fn string_or_array(v: &Value) -> bool {
	v.is_string() || v.is_array()
}

fn check_messages(body: &Value, roles: &[&str], errs: &mut Vec<FieldError>) {
	let Some(messages) = body.get("messages") else {
		err(errs, "messages", "is required");
		return;
	};
	let Some(items) = messages.as_array() else {
		err(errs, "messages", "must be an array");
		return;
	};
	if items.is_empty() {
		err(errs, "messages", "must not be empty");
	}
	for (i, item) in items.iter().enumerate() {
		let Some(obj) = item.as_object() else {
			err(errs, &format!("messages[{i}]"), "must be an object");
			continue;
		};
		match obj.get("role").and_then(Value::as_str) {
			Some(role) if roles.contains(&role) => {},
			Some(role) => err(
				errs,
				&format!("messages[{i}].role"),
				format!("unsupported role {role:?}"),
			),
			None => err(errs, &format!("messages[{i}].role"), "is required"),
		}
		match obj.get("content") {
			Some(content) if string_or_array(content) => {},
			Some(_) => err(
				errs,
				&format!("messages[{i}].content"),
				"must be a string or an array",
			),
			None => err(errs, &format!("messages[{i}].content"), "is required"),
		}
	}
}

fn check_openai_chat(body: &Value, errs: &mut Vec<FieldError>) {
	require_str(body, "model", errs);
	check_messages(
		body,
		&["system", "user", "assistant", "function", "tool"],
		errs,
	);
	opt_int_range(body, "max_tokens", 1, 4096, errs);
	opt_f64_range(body, "temperature", 0.0, 2.0, errs);
	opt_f64_range(body, "top_p", 0.0, 1.0, errs);
	opt_bool(body, "stream", errs);
	opt_array(body, "functions", errs);
	opt_array(body, "tools", errs);
}

fn check_anthropic_messages(body: &Value, errs: &mut Vec<FieldError>) {
	require_str(body, "model", errs);
	check_messages(body, &["user", "assistant"], errs);
	int_in_range(body, "max_tokens", 1, 4096, errs);
	opt_f64_range(body, "temperature", 0.0, 1.0, errs);
	opt_f64_range(body, "top_p", 0.0, 1.0, errs);
	if let Some(v) = body.get("top_k")
		&& v.as_u64().is_none()
	{
		err(errs, "top_k", "must be a non-negative integer");
	}
	opt_bool(body, "stream", errs);
	opt_str(body, "system", errs);
}

const GEMINI_PART_KEYS: [&str; 5] = [
	"text",
	"inlineData",
	"fileData",
	"functionCall",
	"functionResponse",
];

fn check_gemini_generate(body: &Value, errs: &mut Vec<FieldError>) {
	match body.get("contents").and_then(Value::as_array) {
		None => err(errs, "contents", "is required and must be an array"),
		Some(contents) => {
			for (i, content) in contents.iter().enumerate() {
				let Some(obj) = content.as_object() else {
					err(errs, &format!("contents[{i}]"), "must be an object");
					continue;
				};
				if let Some(role) = obj.get("role").and_then(Value::as_str)
					&& !["user", "model"].contains(&role)
				{
					err(
						errs,
						&format!("contents[{i}].role"),
						format!("unsupported role {role:?}"),
					);
				}
				match obj.get("parts").and_then(Value::as_array) {
					None => err(
						errs,
						&format!("contents[{i}].parts"),
						"is required and must be an array",
					),
					Some(parts) => {
						for (j, part) in parts.iter().enumerate() {
							let known = part
								.as_object()
								.map(|p| GEMINI_PART_KEYS.iter().any(|k| p.contains_key(*k)))
								.unwrap_or(false);
							if !known {
								err(
									errs,
									&format!("contents[{i}].parts[{j}]"),
									"must contain text, inlineData, fileData, functionCall or functionResponse",
								);
							}
						}
					},
				}
			}
		},
	}
	opt_array(body, "tools", errs);
	opt_array(body, "safetySettings", errs);
	if let Some(cfg) = body.get("generationConfig") {
		if cfg.is_object() {
			opt_f64_range(cfg, "temperature", 0.0, 1.0, errs);
			opt_f64_range(cfg, "topP", 0.0, 1.0, errs);
			if let Some(v) = cfg.get("topK")
				&& v.as_u64().is_none_or(|n| n < 1)
			{
				err(errs, "generationConfig.topK", "must be an integer >= 1");
			}
			opt_int_range(cfg, "candidateCount", 1, 8, errs);
			opt_int_range(cfg, "maxOutputTokens", 1, 8192, errs);
		} else {
			err(errs, "generationConfig", "must be an object");
		}
	}
}
