//! Chain implementations.
//!
//! - **local**: in-process hub, rollapps and counterparty chains sharing
//!   one tokio runtime with the engine.

pub mod local;
