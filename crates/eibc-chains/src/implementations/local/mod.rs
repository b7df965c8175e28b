//! In-process chains.
//!
//! `LocalHub` owns the settlement engine and turns its results into
//! indexed blocks. `LocalRollapp` produces the transfers the hub receives
//! and `RollappFinality` decides, from submitted state updates and their
//! dispute periods, which rollapp heights are final. Outbound packets go
//! through `LocalForwardTransport` to `CounterpartyChain`s.

mod finality;
mod hub;
mod rollapp;
mod transport;


pub use finality::{RollappFinality, StateUpdate};
pub use hub::LocalHub;
pub use rollapp::LocalRollapp;
pub use transport::{CounterpartyChain, LocalForwardTransport};

pub use eibc_types::channel_escrow_address;
