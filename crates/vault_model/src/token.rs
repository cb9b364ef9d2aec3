//! Token balances: account identities, fungible ledgers and the asset bank
//!
//! The bank holds the two pool assets for every account (users, the vault's
//! custody account, the exchange, the fee collector). The vault keeps its
//! own [`TokenLedger`] for shares.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::math::{add, sub};

/// 32-byte account identity
///
/// Serialized as its label, so scenario files and reports stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub const ZERO: AccountId = AccountId([0u8; 32]);

    /// Derive an identity from a human label (first 32 bytes, zero padded)
    pub fn from_label(label: &str) -> Self {
        let mut bytes = [0u8; 32];
        for (dst, src) in bytes.iter_mut().zip(label.as_bytes()) {
            *dst = *src;
        }
        AccountId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({self})")
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(32);
        match core::str::from_utf8(&self.0[..end]) {
            Ok(label) if !label.is_empty() && label.chars().all(|c| c.is_ascii_graphic()) => {
                f.write_str(label)
            }
            _ => {
                for b in &self.0[..4] {
                    write!(f, "{b:02x}")?;
                }
                f.write_str("..")
            }
        }
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> String {
        id.to_string()
    }
}

impl From<String> for AccountId {
    fn from(label: String) -> AccountId {
        AccountId::from_label(&label)
    }
}

/// The two pool assets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    /// Settlement asset: deposits, premiums and payoffs are paid in it
    Base,
    /// Secondary asset bought and sold to hedge positions
    Side,
}

/// Fungible balance ledger (ERC20-like)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenLedger {
    balances: BTreeMap<AccountId, u128>,
    total_supply: u128,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &AccountId) -> u128 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn total_supply(&self) -> u128 {
        self.total_supply
    }

    /// Number of accounts with a non-zero balance
    pub fn holders(&self) -> usize {
        self.balances.len()
    }

    pub fn mint(&mut self, to: AccountId, amount: u128) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let supply = add(self.total_supply, amount)?;
        let balance = add(self.balance_of(&to), amount)?;
        self.total_supply = supply;
        self.balances.insert(to, balance);
        Ok(())
    }

    /// Burn from `from`; `asset` only labels the error
    pub fn burn(&mut self, from: AccountId, amount: u128, asset: Asset) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let balance = self.balance_of(&from);
        if balance < amount {
            return Err(Error::InsufficientBalance { asset });
        }
        self.total_supply = sub(self.total_supply, amount)?;
        self.set_balance(from, balance - amount);
        Ok(())
    }

    pub fn transfer(&mut self, from: AccountId, to: AccountId, amount: u128, asset: Asset) -> Result<()> {
        if amount == 0 || from == to {
            return Ok(());
        }
        let from_balance = self.balance_of(&from);
        if from_balance < amount {
            return Err(Error::InsufficientBalance { asset });
        }
        let to_balance = add(self.balance_of(&to), amount)?;
        self.set_balance(from, from_balance - amount);
        self.balances.insert(to, to_balance);
        Ok(())
    }

    fn set_balance(&mut self, account: AccountId, balance: u128) {
        if balance == 0 {
            self.balances.remove(&account);
        } else {
            self.balances.insert(account, balance);
        }
    }
}

/// Balances of both pool assets for every account
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bank {
    base: TokenLedger,
    side: TokenLedger,
}

impl Bank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self, asset: Asset) -> &TokenLedger {
        match asset {
            Asset::Base => &self.base,
            Asset::Side => &self.side,
        }
    }

    pub fn ledger_mut(&mut self, asset: Asset) -> &mut TokenLedger {
        match asset {
            Asset::Base => &mut self.base,
            Asset::Side => &mut self.side,
        }
    }

    pub fn balance_of(&self, asset: Asset, account: &AccountId) -> u128 {
        self.ledger(asset).balance_of(account)
    }

    pub fn mint(&mut self, asset: Asset, to: AccountId, amount: u128) -> Result<()> {
        self.ledger_mut(asset).mint(to, amount)
    }

    pub fn burn(&mut self, asset: Asset, from: AccountId, amount: u128) -> Result<()> {
        self.ledger_mut(asset).burn(from, amount, asset)
    }

    pub fn transfer(&mut self, asset: Asset, from: AccountId, to: AccountId, amount: u128) -> Result<()> {
        self.ledger_mut(asset).transfer(from, to, amount, asset)
    }
}
