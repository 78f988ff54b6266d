//! Cross-chain coordination of matched swaps
//!
//! - `timelock` plans T1/T2 and enforces their ordering
//! - `coordinator` drives one match step by step for either role
//! - `engine` follows ledger events and sweeps stale records

pub mod coordinator;
pub mod engine;
pub mod timelock;

pub use coordinator::{Role, Step, StepReport, SwapCoordinator};
pub use engine::CoordinationEngine;
pub use timelock::TimelockPolicy;
