//! Intent marketplace - intents, matches and the registry that binds them

pub mod rates;
pub mod registry;
pub mod types;

pub use rates::{quote, RateSource, StaticRates};
pub use registry::{IntentRegistry, RegistryStats, SweepReport};
pub use types::{
    ContractRef, Intent, IntentStatus, IntentUpdate, Lease, Match, MatchStatus, MatchUpdate,
    NewIntent, Side,
};
