//! ICS-20 transfer packets and denom traces.

use crate::common::{Address, Amount, ChainName, Denom, Height};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Port bound by the fungible token transfer module.
pub const TRANSFER_PORT: &str = "transfer";

/// Path of port/channel hops a token took, plus its base denomination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DenomTrace {
	/// `port/channel` pairs joined by `/`, empty for native tokens.
	pub path: String,
	pub base_denom: Denom,
}

impl DenomTrace {
	pub fn native(base_denom: impl Into<Denom>) -> Self {
		Self {
			path: String::new(),
			base_denom: base_denom.into(),
		}
	}

	/// Splits a full denom path (`transfer/channel-0/urax`) into trace and
	/// base denom. Only segments shaped like `port/channel-N` count as hops.
	pub fn parse(full: &str) -> Self {
		let segments: Vec<&str> = full.split('/').collect();
		let mut hops = 0;

		while hops * 2 + 2 < segments.len() && is_channel_id(segments[hops * 2 + 1]) {
			hops += 1;
		}

		Self {
			path: segments[..hops * 2].join("/"),
			base_denom: segments[hops * 2..].join("/"),
		}
	}

	pub fn is_native(&self) -> bool {
		self.path.is_empty()
	}

	pub fn full_path(&self) -> String {
		if self.is_native() {
			self.base_denom.clone()
		} else {
			format!("{}/{}", self.path, self.base_denom)
		}
	}

	/// Bank denom on the chain holding this trace: the base denom for
	/// native tokens, `ibc/<SHA256(full path)>` otherwise.
	pub fn ibc_denom(&self) -> Denom {
		if self.is_native() {
			return self.base_denom.clone();
		}
		let hash = Sha256::digest(self.full_path().as_bytes());
		format!("ibc/{}", hex::encode_upper(hash))
	}

	/// Trace after the token crossed one more hop into `port/channel`.
	pub fn prefixed(&self, port: &str, channel: &str) -> Self {
		let path = if self.is_native() {
			format!("{}/{}", port, channel)
		} else {
			format!("{}/{}/{}", port, channel, self.path)
		};
		Self {
			path,
			base_denom: self.base_denom.clone(),
		}
	}

	/// ICS-20 receive rule: a token coming back over the channel it left
	/// through is unwound, anything else gets the receiving hop prepended.
	pub fn on_receive(
		source_port: &str,
		source_channel: &str,
		dest_port: &str,
		dest_channel: &str,
		packet_denom: &str,
	) -> Self {
		let source_prefix = format!("{}/{}/", source_port, source_channel);
		match packet_denom.strip_prefix(&source_prefix) {
			Some(unwound) => Self::parse(unwound),
			None => Self::parse(packet_denom).prefixed(dest_port, dest_channel),
		}
	}
}

impl fmt::Display for DenomTrace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.full_path())
	}
}

fn is_channel_id(segment: &str) -> bool {
	segment
		.strip_prefix("channel-")
		.map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
		.unwrap_or(false)
}

/// A transfer packet delivered to the hub by a relayer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTransfer {
	pub sequence: u64,
	pub source_port: String,
	pub source_channel: String,
	pub dest_port: String,
	pub dest_channel: String,
	/// Chain that sent the packet.
	pub source_chain: ChainName,
	/// Height of the sending chain at which the packet was committed.
	pub source_height: Height,
	/// Denom as written in the packet (sender-side full path).
	pub denom: String,
	#[serde(with = "crate::serde_helpers::amount")]
	pub amount: Amount,
	pub sender: Address,
	pub receiver: Address,
	#[serde(default)]
	pub memo: String,
}

impl InboundTransfer {
	/// `port/channel/sequence` on the receiving side; unique per packet.
	pub fn packet_key(&self) -> String {
		format!("{}/{}/{}", self.dest_port, self.dest_channel, self.sequence)
	}

	/// Stable identifier derived from the packet key.
	pub fn packet_id(&self) -> String {
		hex::encode(Sha256::digest(self.packet_key().as_bytes()))
	}

	/// Denom trace of the voucher this packet creates on the hub.
	pub fn hub_denom_trace(&self) -> DenomTrace {
		DenomTrace::on_receive(
			&self.source_port,
			&self.source_channel,
			&self.dest_port,
			&self.dest_channel,
			&self.denom,
		)
	}
}

/// Outbound transfer request submitted to a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
	pub source_port: String,
	pub source_channel: String,
	pub sender: Address,
	pub receiver: Address,
	/// Denom trace on the sending chain (`transfer/channel-0/urax`, or the
	/// base denom for native tokens).
	pub denom: Denom,
	#[serde(with = "crate::serde_helpers::amount")]
	pub amount: Amount,
	#[serde(default)]
	pub memo: String,
}

/// Identifies a packet once it has been committed on the sending chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketHandle {
	pub source_port: String,
	pub source_channel: String,
	pub sequence: u64,
}

impl fmt::Display for PacketHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}/{}/{}",
			self.source_port, self.source_channel, self.sequence
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_denom_trace() {
		let trace = DenomTrace::parse("transfer/channel-0/urax");
		assert_eq!(trace.path, "transfer/channel-0");
		assert_eq!(trace.base_denom, "urax");

		let native = DenomTrace::parse("adym");
		assert!(native.is_native());
		assert_eq!(native.ibc_denom(), "adym");

		// Base denoms may contain slashes themselves.
		let nested = DenomTrace::parse("transfer/channel-3/gamm/pool/1");
		assert_eq!(nested.path, "transfer/channel-3");
		assert_eq!(nested.base_denom, "gamm/pool/1");
	}

	#[test]
	fn test_ibc_denom_matches_ibc_go() {
		// Well-known ATOM voucher on Osmosis.
		let trace = DenomTrace::parse("transfer/channel-0/uatom");
		assert_eq!(
			trace.ibc_denom(),
			"ibc/27394FB092D2ECCD56123C74F36E4C1F926001CEADA9CA97EA622B25F41E5EB2"
		);
	}

	#[test]
	fn test_on_receive_prefixes_foreign_tokens() {
		let trace = DenomTrace::on_receive("transfer", "channel-0", "transfer", "channel-5", "urax");
		assert_eq!(trace.full_path(), "transfer/channel-5/urax");

		let second_hop = trace.prefixed("transfer", "channel-9");
		assert_eq!(second_hop.full_path(), "transfer/channel-9/transfer/channel-5/urax");
		assert_ne!(trace.ibc_denom(), second_hop.ibc_denom());
	}

	#[test]
	fn test_on_receive_unwinds_returning_tokens() {
		let trace = DenomTrace::on_receive(
			"transfer",
			"channel-2",
			"transfer",
			"channel-7",
			"transfer/channel-2/adym",
		);
		assert!(trace.is_native());
		assert_eq!(trace.ibc_denom(), "adym");
	}

	#[test]
	fn test_packet_id_is_stable_per_packet() {
		let transfer = InboundTransfer {
			sequence: 7,
			source_port: TRANSFER_PORT.to_string(),
			source_channel: "channel-0".to_string(),
			dest_port: TRANSFER_PORT.to_string(),
			dest_channel: "channel-1".to_string(),
			source_chain: "rollappevm_1234-1".to_string(),
			source_height: 42,
			denom: "urax".to_string(),
			amount: 1_000_000,
			sender: "ethm1sender".to_string(),
			receiver: "dym1receiver".to_string(),
			memo: String::new(),
		};

		assert_eq!(transfer.packet_key(), "transfer/channel-1/7");
		assert_eq!(transfer.packet_id(), transfer.clone().packet_id());
		assert_eq!(transfer.packet_id().len(), 64);

		let mut other = transfer.clone();
		other.sequence = 8;
		assert_ne!(transfer.packet_id(), other.packet_id());
	}
}
