#![allow(dead_code)]

use htlc_swap_coordinator::clock::{Clock, ManualClock};
use htlc_swap_coordinator::config::Settings;
use htlc_swap_coordinator::coordination::{CoordinationEngine, SwapCoordinator};
use htlc_swap_coordinator::intents::{IntentRegistry, NewIntent, StaticRates};
use htlc_swap_coordinator::ledger::{LedgerContract, LedgerManager, MemoryLedger};
use htlc_swap_coordinator::secret::Commitments;
use htlc_swap_coordinator::store::{MatchingStore, MemoryStore};
use htlc_swap_coordinator::types::{to_base_units, Address};

use std::sync::Arc;

pub const START: u64 = 1_700_000_000;

pub const ALICE: &str = "0x00000000000000000000000000000000000000a1";
pub const BOB: &str = "0x00000000000000000000000000000000000000b1";
pub const CAROL: &str = "0x00000000000000000000000000000000000000c1";
pub const OWNER: &str = "0x00000000000000000000000000000000000000ff";

pub const CONFIG: &str = r#"
[coordinator]
instance_id = "test-coordinator"
poll_interval_ms = 50
call_timeout_secs = 5
max_retries = 2
retry_delay_ms = 10
max_retry_delay_ms = 100
lease_ttl_secs = 60
sweep_interval_secs = 3600
health_check_interval_secs = 30

[protocol]
hash_function = "keccak256"
safety_margin_secs = 1800
intent_expiry_secs = 86400
amount_tolerance = 0.001

[api]
host = "127.0.0.1"
port = 0

[metrics]
enabled = false
port = 0

[rates]
AVAX_ETH = 0.0135
ETH_AVAX = 74.07

[networks.fuji]
chain_id = 43113
name = "Avalanche Fuji Testnet"
currency = "AVAX"
kind = "memory"
confirmation_blocks = 1
block_time_secs = 2
initiator_window_secs = 10800
participant_window_secs = 3600
min_timelock_secs = 1800
max_timelock_secs = 172800
max_swaps_per_window = 10
rate_limit_window_secs = 86400
owner = "0x00000000000000000000000000000000000000ff"
enabled = true

[networks.sepolia]
chain_id = 11155111
name = "Ethereum Sepolia Testnet"
currency = "ETH"
kind = "memory"
confirmation_blocks = 12
block_time_secs = 12
initiator_window_secs = 14400
participant_window_secs = 3600
min_timelock_secs = 1800
max_timelock_secs = 172800
max_swaps_per_window = 10
rate_limit_window_secs = 86400
owner = "0x00000000000000000000000000000000000000ff"
enabled = true
"#;

/// Two in-memory ledgers wired to a registry, coordinator and engine
pub struct World {
    pub settings: Settings,
    pub clock: Arc<ManualClock>,
    pub fuji: Arc<MemoryLedger>,
    pub sepolia: Arc<MemoryLedger>,
    pub store: Arc<dyn MatchingStore>,
    pub ledgers: Arc<LedgerManager>,
    pub registry: Arc<IntentRegistry>,
    pub coordinator: Arc<SwapCoordinator>,
    pub engine: CoordinationEngine,
}

pub fn addr(raw: &str) -> Address {
    Address::new(raw)
}

pub fn units(amount: f64) -> u128 {
    to_base_units(amount, 18).unwrap()
}

pub async fn world() -> World {
    world_with(CONFIG).await
}

pub async fn world_with(config: &str) -> World {
    let settings = Settings::from_toml_str(config).unwrap();
    let protocol_hash = settings.protocol.hash_function;
    let clock = Arc::new(ManualClock::new(START));
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let fuji = Arc::new(
        MemoryLedger::from_config(
            "fuji",
            settings.network("fuji").unwrap(),
            protocol_hash,
            dyn_clock.clone(),
        )
        .unwrap(),
    );
    let sepolia = Arc::new(
        MemoryLedger::from_config(
            "sepolia",
            settings.network("sepolia").unwrap(),
            protocol_hash,
            dyn_clock.clone(),
        )
        .unwrap(),
    );
    for account in [ALICE, BOB, CAROL] {
        fuji.fund(&addr(account), units(100.0)).await;
        sepolia.fund(&addr(account), units(10.0)).await;
    }

    let store: Arc<dyn MatchingStore> = Arc::new(MemoryStore::new());
    let ledgers = Arc::new(
        LedgerManager::from_ledgers(
            &settings,
            vec![
                ("fuji".to_string(), fuji.clone() as Arc<dyn LedgerContract>),
                ("sepolia".to_string(), sepolia.clone() as Arc<dyn LedgerContract>),
            ],
            store.clone(),
            dyn_clock.clone(),
        )
        .await
        .unwrap(),
    );

    let registry = Arc::new(IntentRegistry::new(
        &settings,
        store.clone(),
        Arc::new(StaticRates::new(settings.rates.clone())),
        dyn_clock,
    ));
    let watcher = ledgers.secret_watcher(settings.coordinator.poll_interval_ms);
    let coordinator = Arc::new(SwapCoordinator::new(
        &settings,
        registry.clone(),
        ledgers.clone(),
        watcher.clone(),
    ));
    let engine = CoordinationEngine::new(
        registry.clone(),
        ledgers.clone(),
        watcher,
        Commitments::new(settings.protocol.hash_function),
        settings.coordinator.sweep_interval_secs,
        settings.coordinator.health_check_interval_secs,
    );

    World {
        settings,
        clock,
        fuji,
        sepolia,
        store,
        ledgers,
        registry,
        coordinator,
        engine,
    }
}

impl World {
    /// Read new events from both ledgers and apply them
    pub async fn pump(&self) -> usize {
        let mut events = self.ledgers.subscribe_events();
        for network in ["fuji", "sepolia"] {
            self.ledgers
                .listener(network)
                .unwrap()
                .poll_once()
                .await
                .unwrap();
        }

        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.engine.handle_event(event).await.unwrap();
            handled += 1;
        }
        handled
    }
}

pub fn avax_for_eth(initiator: &str, amount: f64) -> NewIntent {
    NewIntent {
        initiator: initiator.to_string(),
        from_token: "AVAX".to_string(),
        to_token: "ETH".to_string(),
        from_amount: amount,
        from_network: "fuji".to_string(),
        to_network: "sepolia".to_string(),
        user_input: None,
    }
}

pub fn eth_for_avax(initiator: &str, amount: f64) -> NewIntent {
    NewIntent {
        initiator: initiator.to_string(),
        from_token: "ETH".to_string(),
        to_token: "AVAX".to_string(),
        from_amount: amount,
        from_network: "sepolia".to_string(),
        to_network: "fuji".to_string(),
        user_input: None,
    }
}
