//! Market configuration
//!
//! Amounts are `u128`, which TOML cannot represent; they go through the
//! [`amount`] and [`wad`] serde adapters so configuration files can write
//! them as integers or strings (`"2000.5"` for WAD values).

use serde::{Deserialize, Serialize};

use crate::epoch::{Frequency, REFERENCE_TS};
use crate::error::{Error, Result};
use crate::math::{WAD, WAD_DECIMALS};
use crate::token::AccountId;

/// How the locked liquidity of a new epoch is spread across strikes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Allocation {
    /// One strike at the oracle price, split 50/50 between up and down
    SingleStrike,
    /// Strikes at basis-point offsets from the oracle price, capital split
    /// evenly across strikes and 50/50 within each
    StrikeLadder { offsets_bps: Vec<i32> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketConfig {
    pub base_decimals: u8,
    pub side_decimals: u8,
    pub frequency: Frequency,
    #[serde(with = "amount")]
    pub max_deposit: u128,
    pub allocation: Allocation,
    /// Clock of the market when it is created
    pub genesis: u64,
    /// Custody account of the pooled assets
    pub vault_account: AccountId,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_decimals: 6,
            side_decimals: 18,
            frequency: Frequency::Weekly,
            max_deposit: 1_000_000_000_000,
            allocation: Allocation::SingleStrike,
            genesis: REFERENCE_TS,
            vault_account: AccountId::from_label("vault"),
        }
    }
}

impl MarketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_decimals > WAD_DECIMALS || self.side_decimals > WAD_DECIMALS {
            return Err(Error::InvalidConfig(format!(
                "decimals must be at most {WAD_DECIMALS} (base {}, side {})",
                self.base_decimals, self.side_decimals
            )));
        }
        if self.max_deposit == 0 {
            return Err(Error::InvalidConfig("max_deposit must be positive".into()));
        }
        if self.vault_account.is_zero() {
            return Err(Error::InvalidConfig("vault_account must be set".into()));
        }
        if let Allocation::StrikeLadder { offsets_bps } = &self.allocation {
            if offsets_bps.is_empty() {
                return Err(Error::InvalidConfig("strike ladder needs at least one offset".into()));
            }
            if offsets_bps.iter().any(|bps| *bps <= -10_000) {
                return Err(Error::InvalidConfig("strike offsets must stay above -100%".into()));
            }
            let mut sorted = offsets_bps.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != offsets_bps.len() {
                return Err(Error::InvalidConfig("duplicate strike offsets".into()));
            }
        }
        Ok(())
    }
}

/// Parse a decimal string ("2000", "0.0005") into WAD
pub fn parse_wad(text: &str) -> Result<u128> {
    let invalid = || Error::InvalidConfig(format!("invalid decimal value '{text}'"));
    let (whole, frac) = match text.trim().split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (text.trim(), ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > WAD_DECIMALS as usize || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let mut frac_value: u128 = if frac.is_empty() { 0 } else { frac.parse().map_err(|_| invalid())? };
    for _ in frac.len()..WAD_DECIMALS as usize {
        frac_value *= 10;
    }
    whole
        .checked_mul(WAD)
        .and_then(|w| w.checked_add(frac_value))
        .ok_or(Error::Overflow)
}

/// Render a WAD value as a decimal string without trailing zeros
pub fn format_wad(value: u128) -> String {
    let whole = value / WAD;
    let frac = value % WAD;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:018}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Serde adapter for `u128` amounts: integers or digit strings
pub mod amount {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        match u64::try_from(*value) {
            Ok(small) => serializer.serialize_u64(small),
            Err(_) => serializer.serialize_str(&value.to_string()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }

    struct AmountVisitor;

    impl<'de> Visitor<'de> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a non-negative integer or a string of digits")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(v as u128)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom("amount must be non-negative"))
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            v.replace('_', "").parse().map_err(E::custom)
        }
    }
}

/// Serde adapter for WAD values written as decimal strings or integers
pub mod wad {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    use crate::math::WAD;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_wad(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(WadVisitor)
    }

    struct WadVisitor;

    impl<'de> Visitor<'de> for WadVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a decimal string or a whole number")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            (v as u128).checked_mul(WAD).ok_or_else(|| E::custom("value overflows"))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            let v = u64::try_from(v).map_err(|_| E::custom("value must be non-negative"))?;
            self.visit_u64(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            super::parse_wad(v).map_err(E::custom)
        }
    }
}
