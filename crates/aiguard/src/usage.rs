use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::UsageRecord;
use crate::providers::Provider;
use crate::store::Stores;

/// Token counts and model name recovered from a provider response. Absence
/// of any field is tolerated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageCounts {
	pub prompt_tokens: Option<u64>,
	pub completion_tokens: Option<u64>,
	pub total_tokens: Option<u64>,
	pub model: Option<String>,
}

impl UsageCounts {
	fn merge(&mut self, other: UsageCounts) {
		self.prompt_tokens = other.prompt_tokens.or(self.prompt_tokens);
		self.completion_tokens = other.completion_tokens.or(self.completion_tokens);
		self.total_tokens = other.total_tokens.or(self.total_tokens);
		if other.model.is_some() {
			self.model = other.model;
		}
	}

	/// Derive a missing total when both parts are known.
	fn finalize(mut self) -> Self {
		if self.total_tokens.is_none()
			&& let (Some(p), Some(c)) = (self.prompt_tokens, self.completion_tokens)
		{
			self.total_tokens = Some(p + c);
		}
		self
	}
}

/// Pull token counts out of a parsed (non-streaming) response body.
pub fn extract_usage(provider: Provider, body: &Value) -> UsageCounts {
	let counts = match provider {
		Provider::OpenAi => UsageCounts {
			prompt_tokens: body["usage"]["prompt_tokens"].as_u64(),
			completion_tokens: body["usage"]["completion_tokens"].as_u64(),
			total_tokens: body["usage"]["total_tokens"].as_u64(),
			model: body["model"].as_str().map(str::to_string),
		},
		Provider::Anthropic => UsageCounts {
			prompt_tokens: body["usage"]["input_tokens"].as_u64(),
			completion_tokens: body["usage"]["output_tokens"].as_u64(),
			total_tokens: None,
			model: body["model"].as_str().map(str::to_string),
		},
		Provider::Gemini => UsageCounts {
			prompt_tokens: body["usageMetadata"]["promptTokenCount"].as_u64(),
			completion_tokens: body["usageMetadata"]["candidatesTokenCount"].as_u64(),
			total_tokens: body["usageMetadata"]["totalTokenCount"].as_u64(),
			model: None,
		},
	};
	counts.finalize()
}

/// Model name for accounting: openai/anthropic read the request body,
/// gemini reads the path segment after `models/`.
pub fn model_for_request(provider: Provider, request_body: Option<&Value>, path: &str) -> Option<String> {
	match provider {
		Provider::OpenAi | Provider::Anthropic => request_body
			.and_then(|b| b.get("model"))
			.and_then(Value::as_str)
			.map(str::to_string),
		Provider::Gemini => {
			let rest = path.split("models/").nth(1)?;
			let model = rest.split(['/', ':']).next()?;
			(!model.is_empty()).then(|| model.to_string())
		},
	}
}

// Cost per 1K tokens (input, output), matched by substring, most specific
// first. Unknown models yield no cost.
const COST_TABLE: &[(&str, f64, f64)] = &[
	("gpt-4o-mini", 0.000_15, 0.000_6),
	("gpt-4o", 0.002_5, 0.01),
	("gpt-4-turbo", 0.01, 0.03),
	("gpt-4", 0.03, 0.06),
	("gpt-3.5", 0.000_5, 0.001_5),
	("claude-3-5-sonnet", 0.003, 0.015),
	("claude-3-opus", 0.015, 0.075),
	("claude-3-sonnet", 0.003, 0.015),
	("claude-3-haiku", 0.000_25, 0.001_25),
	("gemini-1.5-pro", 0.001_25, 0.005),
	("gemini-1.5-flash", 0.000_075, 0.000_3),
	("gemini-pro", 0.000_5, 0.001_5),
];

pub fn cost_for(model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<f64> {
	let (_, input_rate, output_rate) = COST_TABLE
		.iter()
		.find(|(family, _, _)| model.contains(family))?;
	Some(
		prompt_tokens as f64 / 1000.0 * input_rate
			+ completion_tokens as f64 / 1000.0 * output_rate,
	)
}

/// Maximum bytes of a partial SSE line kept between chunks.
const SCAN_LINE_CAP: usize = 64 * 1024;

/// Incrementally watches a relayed SSE body for the usage-bearing events,
/// without buffering frames. Fed by the forwarder as bytes flow through.
pub struct StreamScanner {
	provider: Provider,
	partial: String,
	counts: UsageCounts,
}

impl StreamScanner {
	pub fn new(provider: Provider) -> Self {
		Self {
			provider,
			partial: String::new(),
			counts: UsageCounts::default(),
		}
	}

	pub fn push(&mut self, chunk: &[u8]) {
		let text = String::from_utf8_lossy(chunk);
		for ch in text.chars() {
			if ch == '\n' {
				let line = std::mem::take(&mut self.partial);
				self.scan_line(line.trim_end_matches('\r'));
			} else if self.partial.len() < SCAN_LINE_CAP {
				self.partial.push(ch);
			}
		}
	}

	fn scan_line(&mut self, line: &str) {
		let Some(data) = line.strip_prefix("data:") else {
			return;
		};
		let data = data.trim();
		if data.is_empty() || data == "[DONE]" {
			return;
		}
		let Ok(event) = serde_json::from_str::<Value>(data) else {
			return;
		};
		match self.provider {
			Provider::Anthropic => match event["type"].as_str() {
				Some("message_start") => {
					self.counts.merge(UsageCounts {
						prompt_tokens: event["message"]["usage"]["input_tokens"].as_u64(),
						completion_tokens: event["message"]["usage"]["output_tokens"].as_u64(),
						total_tokens: None,
						model: event["message"]["model"].as_str().map(str::to_string),
					});
				},
				Some("message_delta") => {
					self.counts.merge(UsageCounts {
						prompt_tokens: None,
						completion_tokens: event["usage"]["output_tokens"].as_u64(),
						total_tokens: None,
						model: None,
					});
				},
				_ => {},
			},
			// openai emits usage on the final chunk (when requested);
			// gemini repeats usageMetadata on every chunk.
			Provider::OpenAi | Provider::Gemini => {
				self.counts.merge(extract_usage(self.provider, &event));
			},
		}
	}

	pub fn finish(self) -> UsageCounts {
		self.counts.finalize()
	}
}

/// Everything the tracker needs to account for one completed forward.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
	pub user_id: String,
	pub project_id: Option<String>,
	pub provider: Provider,
	pub endpoint: String,
	pub method: String,
	pub model: Option<String>,
	pub counts: UsageCounts,
	pub status_code: u16,
	pub response_time_ms: u64,
}

/// Runs after the forwarder completes (including at stream end): emits a
/// UsageRecord and advances the owning project's counters atomically.
/// Failures are logged and swallowed; accounting never fails the response.
#[derive(Clone)]
pub struct UsageTracker {
	stores: Stores,
}

impl UsageTracker {
	pub fn new(stores: Stores) -> Self {
		Self { stores }
	}

	pub fn record(&self, outcome: RequestOutcome) {
		let stores = self.stores.clone();
		tokio::spawn(async move {
			let model = outcome.counts.model.clone().or(outcome.model);
			let cost = match (&model, outcome.counts.prompt_tokens, outcome.counts.completion_tokens) {
				(Some(m), Some(p), Some(c)) => cost_for(m, p, c),
				_ => None,
			};

			let record = UsageRecord {
				user_id: outcome.user_id,
				project_id: outcome.project_id.clone(),
				provider: outcome.provider,
				endpoint: outcome.endpoint,
				method: outcome.method,
				model,
				prompt_tokens: outcome.counts.prompt_tokens,
				completion_tokens: outcome.counts.completion_tokens,
				total_tokens: outcome.counts.total_tokens,
				cost,
				response_time_ms: outcome.response_time_ms,
				status_code: outcome.status_code,
				timestamp: Utc::now(),
				metadata: None,
			};
			if let Err(e) = stores.usage.insert(&record).await {
				warn!(error = %e, "failed to persist usage record");
			}

			if let Some(project_id) = &outcome.project_id {
				let tokens = outcome.counts.total_tokens.unwrap_or(1);
				if let Err(e) = stores
					.projects
					.increment_usage(project_id, 1, tokens, cost.unwrap_or(0.0))
					.await
				{
					warn!(project_id, error = %e, "failed to advance usage counters");
				} else {
					debug!(project_id, tokens, "advanced usage counters");
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn openai_usage_extraction() {
		let body = json!({
			"model": "gpt-4o-2024-08-06",
			"usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46},
		});
		let counts = extract_usage(Provider::OpenAi, &body);
		assert_eq!(counts.prompt_tokens, Some(12));
		assert_eq!(counts.completion_tokens, Some(34));
		assert_eq!(counts.total_tokens, Some(46));
		assert_eq!(counts.model.as_deref(), Some("gpt-4o-2024-08-06"));
	}

	#[test]
	fn anthropic_total_is_input_plus_output() {
		let body = json!({
			"model": "claude-3-sonnet-20240229",
			"usage": {"input_tokens": 10, "output_tokens": 5},
		});
		let counts = extract_usage(Provider::Anthropic, &body);
		assert_eq!(counts.total_tokens, Some(15));
	}

	#[test]
	fn gemini_usage_and_model_from_path() {
		let body = json!({
			"usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10},
		});
		let counts = extract_usage(Provider::Gemini, &body);
		assert_eq!(counts.total_tokens, Some(10));
		assert_eq!(
			model_for_request(
				Provider::Gemini,
				None,
				"/v1beta/models/gemini-1.5-pro/generateContent",
			)
			.as_deref(),
			Some("gemini-1.5-pro")
		);
	}

	#[test]
	fn missing_fields_are_tolerated() {
		let counts = extract_usage(Provider::OpenAi, &json!({"id": "x"}));
		assert_eq!(counts, UsageCounts {
			model: None,
			prompt_tokens: None,
			completion_tokens: None,
			total_tokens: None,
		});
	}

	#[test]
	fn cost_lookup_by_substring() {
		let cost = cost_for("claude-3-sonnet-20240229", 1000, 1000).unwrap();
		assert!((cost - 0.018).abs() < 1e-9);
		assert!(cost_for("some-unknown-model", 1000, 1000).is_none());
		// Specific families take precedence over their prefixes.
		let mini = cost_for("gpt-4o-mini-2024-07-18", 1000, 0).unwrap();
		assert!((mini - 0.000_15).abs() < 1e-9);
	}

	#[test]
	fn stream_scanner_reads_anthropic_terminal_events() {
		let mut scanner = StreamScanner::new(Provider::Anthropic);
		scanner.push(b"event: message_start\n");
		scanner.push(
			br#"data: {"type":"message_start","message":{"model":"claude-3-sonnet-20240229","usage":{"input_tokens":9,"output_tokens":1}}}"#,
		);
		scanner.push(b"\n\n");
		// Split a frame across chunks to exercise the line buffer.
		scanner.push(br#"data: {"type":"message_delta","usage":{"out"#);
		scanner.push(br#"put_tokens":23}}"#);
		scanner.push(b"\n");
		scanner.push(b"data: {\"type\":\"message_stop\"}\n");

		let counts = scanner.finish();
		assert_eq!(counts.prompt_tokens, Some(9));
		assert_eq!(counts.completion_tokens, Some(23));
		assert_eq!(counts.total_tokens, Some(32));
		assert_eq!(counts.model.as_deref(), Some("claude-3-sonnet-20240229"));
	}

	#[test]
	fn stream_scanner_reads_openai_final_usage() {
		let mut scanner = StreamScanner::new(Provider::OpenAi);
		scanner.push(b"data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"h\"}}]}\n");
		scanner.push(
			b"data: {\"model\":\"gpt-4o\",\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":7,\"total_tokens\":10}}\n",
		);
		scanner.push(b"data: [DONE]\n");
		let counts = scanner.finish();
		assert_eq!(counts.total_tokens, Some(10));
		assert_eq!(counts.model.as_deref(), Some("gpt-4o"));
	}

	#[tokio::test]
	async fn tracker_advances_counters_once_per_request() {
		use crate::models::Project;

		let stores = Stores::in_memory();
		let project = Project::new("demo", "u1");
		stores.projects.insert(&project).await.unwrap();

		let tracker = UsageTracker::new(stores.clone());
		tracker.record(RequestOutcome {
			user_id: "u1".to_string(),
			project_id: Some(project.id.clone()),
			provider: Provider::Anthropic,
			endpoint: "/v1/messages".to_string(),
			method: "POST".to_string(),
			model: Some("claude-3-sonnet-20240229".to_string()),
			counts: UsageCounts {
				prompt_tokens: Some(10),
				completion_tokens: Some(5),
				total_tokens: Some(15),
				model: None,
			},
			status_code: 200,
			response_time_ms: 42,
		});

		// The tracker records asynchronously.
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;

		let got = stores.projects.find(&project.id).await.unwrap().unwrap();
		assert_eq!(got.usage.current_day.requests, 1);
		assert_eq!(got.usage.current_day.tokens, 15);
		assert!(got.usage.current_day.cost > 0.0);
	}
}
