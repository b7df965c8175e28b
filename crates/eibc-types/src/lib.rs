//! Shared domain types for the eIBC settlement core.
//!
//! Everything that crosses a crate boundary lives here: demand orders,
//! forward instructions, inbound packets and denom traces, chain events,
//! and the traits through which the core talks to the surrounding
//! infrastructure (chain adapters, bank, finality, forwarding transport).

pub mod bank;
pub mod chains;
pub mod common;
pub mod errors;
pub mod events;
pub mod forward;
pub mod order;
pub mod serde_helpers;
pub mod transfer;

pub use bank::*;
pub use chains::*;
pub use common::*;
pub use errors::*;
pub use events::*;
pub use forward::*;
pub use order::*;
pub use transfer::*;
