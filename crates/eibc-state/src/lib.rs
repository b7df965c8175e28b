//! Demand order ledger and hub balances.

pub mod bank;
pub mod ledger;
pub mod types;

pub use bank::MemoryBank;
pub use ledger::{DemandOrderLedger, OrderGuard};
pub use types::LedgerError;
