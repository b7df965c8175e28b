//! Memo codec for inbound transfers.
//!
//! A transfer memo is a JSON object. Two top-level keys matter to the hub:
//!
//! * `eibc`: `{"fee": "<decimal>"}` turns the transfer into a demand order.
//! * `forward`: packet-forward metadata naming the next hop.
//!
//! Parsing never fails the transfer. A memo that cannot be understood is
//! reported as [`MemoResult::Malformed`] and the transfer is treated as an
//! ordinary one.

use eibc_types::Amount;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

mod duration;

pub use duration::parse_go_duration;

/// Top-level memo key carrying the eIBC fee.
pub const EIBC_MEMO_KEY: &str = "eibc";
/// Top-level memo key carrying packet-forward metadata.
pub const FORWARD_MEMO_KEY: &str = "forward";

const FEE_KEY: &str = "fee";
const DEFAULT_FORWARD_PORT: &str = "transfer";
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoError {
	#[error("memo is not valid JSON: {0}")]
	InvalidJson(String),

	#[error("memo is not a JSON object")]
	NotAnObject,

	#[error("{0} must be a JSON object")]
	SectionNotAnObject(&'static str),

	#[error("eibc.fee is missing")]
	MissingFee,

	#[error("eibc.fee must be a decimal string, got {0}")]
	InvalidFee(String),

	#[error("unknown field eibc.{0}")]
	UnknownField(String),

	#[error("forward.{0} is missing or empty")]
	MissingForwardField(&'static str),

	#[error("invalid forward.{field}: {reason}")]
	InvalidForwardField { field: &'static str, reason: String },
}

/// eIBC part of a memo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EibcMemo {
	pub fee: Amount,
}

/// Packet-forward part of a memo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardMemo {
	pub receiver: String,
	pub port: String,
	pub channel: String,
	pub timeout: Duration,
	pub retries: Option<u8>,
	/// Memo for the next hop, re-encoded as a JSON string.
	pub next: Option<String>,
}

impl ForwardMemo {
	pub fn new(receiver: impl Into<String>, channel: impl Into<String>) -> Self {
		Self {
			receiver: receiver.into(),
			port: DEFAULT_FORWARD_PORT.to_string(),
			channel: channel.into(),
			timeout: DEFAULT_FORWARD_TIMEOUT,
			retries: None,
			next: None,
		}
	}

	/// Encodes this instruction as a transfer memo.
	pub fn to_memo(&self) -> String {
		let mut forward = Map::new();
		forward.insert("receiver".into(), Value::from(self.receiver.clone()));
		forward.insert("port".into(), Value::from(self.port.clone()));
		forward.insert("channel".into(), Value::from(self.channel.clone()));
		forward.insert("timeout".into(), Value::from(self.timeout.as_nanos() as u64));
		if let Some(retries) = self.retries {
			forward.insert("retries".into(), Value::from(retries));
		}
		if let Some(next) = &self.next {
			let next = serde_json::from_str(next).unwrap_or_else(|_| Value::from(next.clone()));
			forward.insert("next".into(), next);
		}

		let mut memo = Map::new();
		memo.insert(FORWARD_MEMO_KEY.into(), Value::Object(forward));
		Value::Object(memo).to_string()
	}
}

/// Everything the hub understood from a memo.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedMemo {
	pub eibc: Option<EibcMemo>,
	pub forward: Option<ForwardMemo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoResult {
	Parsed(ParsedMemo),
	/// Nothing the hub acts on.
	Ignore,
	Malformed(MemoError),
}

impl MemoResult {
	pub fn is_malformed(&self) -> bool {
		matches!(self, Self::Malformed(_))
	}
}

/// Builds the memo a rollapp user attaches to request an eIBC order.
pub fn build_eibc_memo(fee: Amount) -> String {
	let mut eibc = Map::new();
	eibc.insert(FEE_KEY.into(), Value::from(fee.to_string()));
	let mut memo = Map::new();
	memo.insert(EIBC_MEMO_KEY.into(), Value::Object(eibc));
	Value::Object(memo).to_string()
}

/// Parses a transfer memo. Pure; never panics on any input.
pub fn parse(memo: &str) -> MemoResult {
	if memo.trim().is_empty() {
		return MemoResult::Ignore;
	}

	let value: Value = match serde_json::from_str(memo) {
		Ok(value) => value,
		Err(e) => return MemoResult::Malformed(MemoError::InvalidJson(e.to_string())),
	};
	let Value::Object(root) = value else {
		return MemoResult::Malformed(MemoError::NotAnObject);
	};

	let eibc = root.get(EIBC_MEMO_KEY);
	let forward = root.get(FORWARD_MEMO_KEY);
	if eibc.is_none() && forward.is_none() {
		return MemoResult::Ignore;
	}

	let parsed = (|| -> Result<ParsedMemo, MemoError> {
		Ok(ParsedMemo {
			eibc: eibc.map(parse_eibc).transpose()?,
			forward: forward.map(parse_forward).transpose()?,
		})
	})();

	match parsed {
		Ok(parsed) => MemoResult::Parsed(parsed),
		Err(e) => {
			tracing::debug!(error = %e, "Malformed transfer memo");
			MemoResult::Malformed(e)
		}
	}
}

fn parse_eibc(value: &Value) -> Result<EibcMemo, MemoError> {
	let section = value
		.as_object()
		.ok_or(MemoError::SectionNotAnObject(EIBC_MEMO_KEY))?;

	if let Some(unknown) = section.keys().find(|k| k.as_str() != FEE_KEY) {
		return Err(MemoError::UnknownField(unknown.clone()));
	}

	let fee = section.get(FEE_KEY).ok_or(MemoError::MissingFee)?;
	let raw = fee
		.as_str()
		.ok_or_else(|| MemoError::InvalidFee(fee.to_string()))?;

	if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
		return Err(MemoError::InvalidFee(raw.to_string()));
	}
	let fee = raw
		.parse::<Amount>()
		.map_err(|_| MemoError::InvalidFee(raw.to_string()))?;

	Ok(EibcMemo { fee })
}

fn parse_forward(value: &Value) -> Result<ForwardMemo, MemoError> {
	let section = value
		.as_object()
		.ok_or(MemoError::SectionNotAnObject(FORWARD_MEMO_KEY))?;

	let required = |field: &'static str| {
		section
			.get(field)
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.ok_or(MemoError::MissingForwardField(field))
	};

	let receiver = required("receiver")?;
	let channel = required("channel")?;

	let port = match section.get("port") {
		None | Some(Value::Null) => DEFAULT_FORWARD_PORT.to_string(),
		Some(Value::String(port)) if !port.is_empty() => port.clone(),
		Some(other) => {
			return Err(MemoError::InvalidForwardField {
				field: "port",
				reason: format!("expected non-empty string, got {}", other),
			})
		}
	};

	let timeout = match section.get("timeout") {
		None | Some(Value::Null) => DEFAULT_FORWARD_TIMEOUT,
		Some(Value::Number(n)) => n.as_u64().map(Duration::from_nanos).ok_or_else(|| {
			MemoError::InvalidForwardField {
				field: "timeout",
				reason: format!("expected non-negative nanoseconds, got {}", n),
			}
		})?,
		Some(Value::String(s)) => {
			parse_go_duration(s).map_err(|reason| MemoError::InvalidForwardField {
				field: "timeout",
				reason,
			})?
		}
		Some(other) => {
			return Err(MemoError::InvalidForwardField {
				field: "timeout",
				reason: format!("unsupported value {}", other),
			})
		}
	};

	let retries = match section.get("retries") {
		None | Some(Value::Null) => None,
		Some(value) => Some(
			value
				.as_u64()
				.and_then(|r| u8::try_from(r).ok())
				.ok_or_else(|| MemoError::InvalidForwardField {
					field: "retries",
					reason: format!("expected 0..=255, got {}", value),
				})?,
		),
	};

	let next = match section.get("next") {
		None | Some(Value::Null) => None,
		Some(Value::String(s)) => Some(s.clone()),
		Some(object @ Value::Object(_)) => Some(object.to_string()),
		Some(other) => {
			return Err(MemoError::InvalidForwardField {
				field: "next",
				reason: format!("expected object or string, got {}", other),
			})
		}
	};

	Ok(ForwardMemo {
		receiver,
		port,
		channel,
		timeout,
		retries,
		next,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_eibc_fee_memo() {
		let memo = build_eibc_memo(200);
		assert_eq!(memo, r#"{"eibc":{"fee":"200"}}"#);

		match parse(&memo) {
			MemoResult::Parsed(parsed) => {
				assert_eq!(parsed.eibc, Some(EibcMemo { fee: 200 }));
				assert!(parsed.forward.is_none());
			}
			other => panic!("unexpected result: {:?}", other),
		}
	}

	#[test]
	fn test_corrupted_eibc_memos_are_malformed() {
		let cases = [
			r#"{"eibc": [{"fee": "200"}]}"#,
			r#"{"eibc": {"feebaba": "200"}}"#,
			r#"{"eibc": {"fee": "this-should-be-number"}}"#,
			r#"{"eibc": {"fee": 200}}"#,
			r#"{"eibc": {"fee": "-5"}}"#,
			r#"{"eibc": {"fee": ""}}"#,
			r#"{"eibc": {"fee": "1", "extra": true}}"#,
			r#"{"eibc": {"fee": "340282366920938463463374607431768211456"}}"#,
			r#"{"eibc": {}}"#,
			"not json at all",
			"[1, 2, 3]",
		];

		for memo in cases {
			assert!(parse(memo).is_malformed(), "expected malformed: {}", memo);
		}
	}

	#[test]
	fn test_irrelevant_memos_are_ignored() {
		assert_eq!(parse(""), MemoResult::Ignore);
		assert_eq!(parse("   "), MemoResult::Ignore);
		assert_eq!(parse(r#"{"wasm": {"contract": "x"}}"#), MemoResult::Ignore);
	}

	#[test]
	fn test_forward_memo_defaults() {
		let memo = r#"{"forward":{"receiver":"cosmos1dest","channel":"channel-1"}}"#;
		let MemoResult::Parsed(parsed) = parse(memo) else {
			panic!("forward memo should parse");
		};
		let forward = parsed.forward.unwrap();
		assert_eq!(forward.port, "transfer");
		assert_eq!(forward.timeout, Duration::from_secs(300));
		assert_eq!(forward.retries, None);
	}

	#[test]
	fn test_forward_memo_full() {
		let memo = r#"{"forward":{"receiver":"cosmos1dest","port":"transfer","channel":"channel-1","timeout":"1h30m","retries":2,"next":{"forward":{"receiver":"osmo1x","channel":"channel-4"}}}}"#;
		let MemoResult::Parsed(parsed) = parse(memo) else {
			panic!("forward memo should parse");
		};
		let forward = parsed.forward.unwrap();
		assert_eq!(forward.timeout, Duration::from_secs(90 * 60));
		assert_eq!(forward.retries, Some(2));

		let next = forward.next.clone().unwrap();
		assert!(matches!(parse(&next), MemoResult::Parsed(ParsedMemo { forward: Some(_), .. })));

		// Encoding keeps the same instruction.
		let MemoResult::Parsed(again) = parse(&forward.to_memo()) else {
			panic!("encoded memo should parse");
		};
		assert_eq!(again.forward, Some(forward));
	}

	#[test]
	fn test_forward_memo_rejects_missing_fields() {
		assert_eq!(
			parse(r#"{"forward":{"channel":"channel-1"}}"#),
			MemoResult::Malformed(MemoError::MissingForwardField("receiver"))
		);
		assert!(parse(r#"{"forward":{"receiver":"a","channel":"channel-1","timeout":"soon"}}"#)
			.is_malformed());
		assert!(parse(r#"{"forward":{"receiver":"a","channel":"channel-1","retries":300}}"#)
			.is_malformed());
	}

	#[test]
	fn test_forward_timeout_in_nanoseconds() {
		let memo = ForwardMemo::new("cosmos1dest", "channel-1").to_memo();
		assert!(memo.contains(r#""timeout":300000000000"#));
	}
}
