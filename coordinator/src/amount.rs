//! Monetary amounts exchanged with the wallet backend.
//!
//! The backend speaks plain JSON numbers; internally every amount is a
//! `rust_decimal::Decimal` so balances never accumulate float drift.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{WalletError, WalletResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Amount(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Subtract without going below zero; cached balances are never negative.
    pub fn saturating_debit(self, other: Amount) -> Amount {
        match self.checked_sub(other) {
            Some(result) if result.0 >= Decimal::ZERO => result,
            _ => Amount::ZERO,
        }
    }

    fn parse_number(text: &str) -> WalletResult<Self> {
        Decimal::from_str(text)
            .or_else(|_| Decimal::from_scientific(text))
            .map(|value| Amount(value.normalize()))
            .map_err(|_| WalletError::ValidationError(format!("Invalid amount '{}'", text)))
    }
}

impl FromStr for Amount {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(WalletError::ValidationError(
                "Amount cannot be empty".to_string(),
            ));
        }
        Self::parse_number(trimmed)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount(value)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(Decimal::from(value))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self
            .0
            .to_f64()
            .ok_or_else(|| serde::ser::Error::custom("amount out of range"))?;
        serializer.serialize_f64(value)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(serde_json::Number),
    Text(String),
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = match RawAmount::deserialize(deserializer)? {
            RawAmount::Number(number) => number.to_string(),
            RawAmount::Text(text) => text,
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}
