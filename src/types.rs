//! Shared identifier and amount types

use crate::error::{SwapError, SwapResult};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Account identity on a ledger, compared case-insensitively
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Address(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Address {
    fn from(raw: String) -> Self {
        Address::new(raw)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Address::new(raw)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode a 0x-prefixed (or bare) 32-byte hex string
pub fn decode_hex32(input: &str) -> Result<[u8; 32], String> {
    let trimmed = input.trim();
    let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {}", e))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Defines a public 32-byte value rendered as 0x-prefixed hex
macro_rules! bytes32_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", ::hex::encode(self.0))
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $crate::types::decode_hex32(s).map($name)
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                raw.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use bytes32_newtype;

bytes32_newtype!(
    /// Identifier of an HTLC instance on one ledger
    ContractId
);

/// Reference to a ledger transaction (hash on EVM ledgers)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialise base-unit amounts as decimal strings; JSON numbers lose precision past 2^53
pub mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Convert a decimal display amount into integer base units
pub fn to_base_units(amount: f64, decimals: u32) -> SwapResult<u128> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(SwapError::Validation(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    let scaled = (amount * 10f64.powi(decimals as i32)).round();
    if scaled < 1.0 || scaled >= u128::MAX as f64 {
        return Err(SwapError::Validation(format!(
            "amount {} is not representable with {} decimals",
            amount, decimals
        )));
    }
    Ok(scaled as u128)
}

/// Convert integer base units back to a decimal display amount
pub fn from_base_units(amount: u128, decimals: u32) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_case_insensitive() {
        let a = Address::new("0xAbCdEF0000000000000000000000000000000001");
        let b = Address::new(" 0xabcdef0000000000000000000000000000000001 ");
        assert_eq!(a, b);
    }

    #[test]
    fn test_contract_id_hex() {
        let id = ContractId([0xab; 32]);
        let parsed: ContractId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("0x1234".parse::<ContractId>().is_err());
    }

    #[test]
    fn test_base_units() {
        assert_eq!(to_base_units(1.0, 18).unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(to_base_units(13.5, 6).unwrap(), 13_500_000);
        assert!(to_base_units(0.0, 18).is_err());
        assert!(to_base_units(-1.0, 18).is_err());
        assert!((from_base_units(13_500_000, 6) - 13.5).abs() < 1e-9);
    }
}
