//! HTLC Swap Coordinator - cross-chain atomic swaps over hash time-locked contracts
//!
//! An intent marketplace pairs complementary swap requests; the coordinator
//! then drives each match through HTLC creation, secret reveal and claim on
//! both ledgers, with refunds once timelocks pass.

pub mod api;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod intents;
pub mod ledger;
pub mod metrics;
pub mod secret;
pub mod store;
pub mod types;

pub use error::{SwapError, SwapResult};
