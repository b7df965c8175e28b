//! In-memory bank keeper.

use async_trait::async_trait;
use eibc_types::{Address, Amount, BankError, BankKeeper, Denom};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Balances keyed by `(address, denom)`, guarded by a single lock so every
/// operation is atomic.
#[derive(Default)]
pub struct MemoryBank {
	balances: RwLock<HashMap<(Address, Denom), Amount>>,
}

impl MemoryBank {
	pub fn new() -> Self {
		Self::default()
	}

	/// Total amount of `denom` held across all accounts.
	pub async fn supply(&self, denom: &str) -> Amount {
		self.balances
			.read()
			.await
			.iter()
			.filter(|((_, d), _)| d == denom)
			.map(|(_, amount)| *amount)
			.sum()
	}

	/// All non-zero balances of `address`.
	pub async fn balances_of(&self, address: &str) -> Vec<(Denom, Amount)> {
		let mut balances: Vec<_> = self
			.balances
			.read()
			.await
			.iter()
			.filter(|((a, _), amount)| a == address && **amount > 0)
			.map(|((_, d), amount)| (d.clone(), *amount))
			.collect();
		balances.sort();
		balances
	}
}

fn key(address: &str, denom: &str) -> (Address, Denom) {
	(address.to_string(), denom.to_string())
}

fn debit(
	balances: &mut HashMap<(Address, Denom), Amount>,
	address: &str,
	denom: &str,
	amount: Amount,
) -> Result<(), BankError> {
	let available = balances.get(&key(address, denom)).copied().unwrap_or(0);
	if available < amount {
		return Err(BankError::InsufficientFunds {
			address: address.to_string(),
			denom: denom.to_string(),
			available,
			required: amount,
		});
	}
	balances.insert(key(address, denom), available - amount);
	Ok(())
}

fn credit(
	balances: &mut HashMap<(Address, Denom), Amount>,
	address: &str,
	denom: &str,
	amount: Amount,
) -> Result<(), BankError> {
	let entry = balances.entry(key(address, denom)).or_insert(0);
	*entry = entry.checked_add(amount).ok_or_else(|| BankError::Overflow {
		address: address.to_string(),
		denom: denom.to_string(),
	})?;
	Ok(())
}

#[async_trait]
impl BankKeeper for MemoryBank {
	async fn balance(&self, address: &str, denom: &str) -> Amount {
		self.balances
			.read()
			.await
			.get(&key(address, denom))
			.copied()
			.unwrap_or(0)
	}

	async fn send(
		&self,
		from: &str,
		to: &str,
		denom: &str,
		amount: Amount,
	) -> Result<(), BankError> {
		if amount == 0 {
			return Err(BankError::ZeroAmount(denom.to_string()));
		}
		let mut balances = self.balances.write().await;

		// Check the credit side first so a failure leaves nothing debited.
		let to_balance = balances.get(&key(to, denom)).copied().unwrap_or(0);
		if from != to && to_balance.checked_add(amount).is_none() {
			return Err(BankError::Overflow {
				address: to.to_string(),
				denom: denom.to_string(),
			});
		}

		debit(&mut balances, from, denom, amount)?;
		credit(&mut balances, to, denom, amount)?;
		debug!(from, to, denom, %amount, "Bank send");
		Ok(())
	}

	async fn mint(&self, to: &str, denom: &str, amount: Amount) -> Result<(), BankError> {
		if amount == 0 {
			return Err(BankError::ZeroAmount(denom.to_string()));
		}
		let mut balances = self.balances.write().await;
		credit(&mut balances, to, denom, amount)?;
		debug!(to, denom, %amount, "Bank mint");
		Ok(())
	}

	async fn burn(&self, from: &str, denom: &str, amount: Amount) -> Result<(), BankError> {
		if amount == 0 {
			return Err(BankError::ZeroAmount(denom.to_string()));
		}
		let mut balances = self.balances.write().await;
		debit(&mut balances, from, denom, amount)?;
		debug!(from, denom, %amount, "Bank burn");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_send_moves_funds() {
		let bank = MemoryBank::new();
		bank.mint("alice", "adym", 100).await.unwrap();
		bank.send("alice", "bob", "adym", 40).await.unwrap();

		assert_eq!(bank.balance("alice", "adym").await, 60);
		assert_eq!(bank.balance("bob", "adym").await, 40);
		assert_eq!(bank.supply("adym").await, 100);
	}

	#[tokio::test]
	async fn test_insufficient_funds_changes_nothing() {
		let bank = MemoryBank::new();
		bank.mint("alice", "adym", 10).await.unwrap();

		let err = bank.send("alice", "bob", "adym", 11).await.unwrap_err();
		assert!(matches!(err, BankError::InsufficientFunds { available: 10, required: 11, .. }));
		assert!(err.to_string().contains("insufficient funds"));

		assert_eq!(bank.balance("alice", "adym").await, 10);
		assert_eq!(bank.balance("bob", "adym").await, 0);
	}

	#[tokio::test]
	async fn test_mint_and_burn() {
		let bank = MemoryBank::new();
		bank.mint("escrow", "ibc/AB", 5).await.unwrap();
		assert!(bank.burn("escrow", "ibc/AB", 6).await.is_err());
		bank.burn("escrow", "ibc/AB", 5).await.unwrap();
		assert_eq!(bank.supply("ibc/AB").await, 0);
		assert!(matches!(
			bank.mint("escrow", "ibc/AB", 0).await,
			Err(BankError::ZeroAmount(_))
		));
	}

	#[tokio::test]
	async fn test_overflow_is_rejected() {
		let bank = MemoryBank::new();
		bank.mint("a", "x", Amount::MAX).await.unwrap();
		bank.mint("b", "x", 1).await.unwrap();
		assert!(matches!(
			bank.send("b", "a", "x", 1).await,
			Err(BankError::Overflow { .. })
		));
		assert_eq!(bank.balance("b", "x").await, 1);
	}
}
