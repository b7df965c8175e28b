//! Common types used throughout the eIBC workspace.

/// Block height on any chain (hub or rollapp).
pub type Height = u64;

/// Token amount. Cosmos amounts are unbounded integers; `u128` covers every
/// realistic supply.
pub type Amount = u128;

/// Bech32 account address.
pub type Address = String;

/// Bank denomination, e.g. `adym` or `ibc/27394FB0...`.
pub type Denom = String;

/// Demand order identifier.
pub type OrderId = String;

/// Chain identifier, e.g. `rollappevm_1234-1`.
pub type ChainName = String;

/// Transaction hash (upper hex).
pub type TxHash = String;

/// Module account holding funds of packets that are not yet final.
pub const ESCROW_ACCOUNT: &str = "eibc_escrow";

/// Prefix of the accounts holding tokens escrowed for a port and channel.
pub const CHANNEL_ESCROW_PREFIX: &str = "escrow/";

/// Account holding tokens escrowed for `port/channel` on the sending side.
pub fn channel_escrow_address(port: &str, channel: &str) -> String {
	format!("{}{}/{}", CHANNEL_ESCROW_PREFIX, port, channel)
}

/// Whether `address` belongs to a module rather than a user. Module
/// accounts never sign transactions.
pub fn is_module_account(address: &str) -> bool {
	address == ESCROW_ACCOUNT || address.starts_with(CHANNEL_ESCROW_PREFIX)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_module_accounts() {
		assert!(is_module_account(ESCROW_ACCOUNT));
		assert!(is_module_account(&channel_escrow_address("transfer", "channel-0")));
		assert!(!is_module_account("dym1marketmaker"));
		assert!(!is_module_account("eibc_escrow2"));
	}
}
