//! # eIBC Core
//!
//! The settlement engine that ties the memo codec, the demand order ledger,
//! fulfillment, finalization and forwarding together behind one entry point
//! per hub action: a packet arrives, a fulfillment is submitted, a block is
//! produced.

pub mod engine;
pub mod error;
pub mod event_bus;
pub mod lifecycle;

pub use engine::{
	codes, BlockReport, EibcEngine, EngineConfig, RecvOutcome, RollappRoute, TxOutcome,
};
pub use error::CoreError;
pub use event_bus::EventBus;
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use eibc_forwarding::TickReport;
pub use eibc_settlement::{FinalizationReport, PendingPacket, RevertReport};
