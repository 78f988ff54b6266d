//! Exchange rate sources used to price intents

use std::collections::HashMap;
use tracing::warn;

/// Source of `from -> to` conversion rates
pub trait RateSource: Send + Sync {
    fn rate(&self, from_token: &str, to_token: &str) -> Option<f64>;
}

/// Fixed rate table keyed `FROM_TO`
#[derive(Debug, Clone, Default)]
pub struct StaticRates {
    rates: HashMap<String, f64>,
}

impl StaticRates {
    pub fn new(rates: HashMap<String, f64>) -> Self {
        let rates = rates
            .into_iter()
            .map(|(pair, rate)| (pair.to_uppercase(), rate))
            .collect();
        Self { rates }
    }
}

impl RateSource for StaticRates {
    fn rate(&self, from_token: &str, to_token: &str) -> Option<f64> {
        if from_token.eq_ignore_ascii_case(to_token) {
            return Some(1.0);
        }
        let key = format!("{}_{}", from_token, to_token).to_uppercase();
        self.rates.get(&key).copied()
    }
}

/// Quote `amount` of `from_token` in `to_token`, rounded to 6 decimals
///
/// Unknown pairs are quoted at 1.0.
pub fn quote(source: &dyn RateSource, amount: f64, from_token: &str, to_token: &str) -> f64 {
    let rate = source.rate(from_token, to_token).unwrap_or_else(|| {
        warn!("No rate for {}_{}, quoting 1:1", from_token, to_token);
        1.0
    });
    (amount * rate * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StaticRates {
        StaticRates::new(HashMap::from([
            ("AVAX_ETH".to_string(), 0.0135),
            ("eth_avax".to_string(), 74.07),
        ]))
    }

    #[test]
    fn test_quote_rounds_to_six_decimals() {
        let rates = table();
        assert_eq!(quote(&rates, 1.0, "AVAX", "ETH"), 0.0135);
        assert_eq!(quote(&rates, 0.0135, "ETH", "AVAX"), 0.999945);
        assert_eq!(quote(&rates, 2.5, "avax", "eth"), 0.03375);
    }

    #[test]
    fn test_unknown_pair_is_one_to_one() {
        assert_eq!(quote(&table(), 3.0, "BTC", "ETH"), 3.0);
        assert_eq!(table().rate("ETH", "eth"), Some(1.0));
    }
}
