//! Position ledger: outstanding notional per epoch, owner and strike

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::math::{add, sub};
use crate::notional::Amount;
use crate::token::AccountId;

/// An open position
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub epoch: u64,
    pub strike: u128,
    pub amount_up: u128,
    pub amount_down: u128,
    /// Premium (fees included) paid over the position's lifetime
    pub premium: u128,
}

impl Position {
    pub fn amount(&self) -> Amount {
        Amount::new(self.amount_up, self.amount_down)
    }

    pub fn exists(&self) -> bool {
        self.amount_up > 0 || self.amount_down > 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PositionKey {
    owner: AccountId,
    strike: u128,
}

/// Positions keyed by epoch, then by (owner, strike)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PositionLedger {
    epochs: BTreeMap<u64, BTreeMap<PositionKey, Position>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, epoch: u64, owner: &AccountId, strike: u128) -> Option<&Position> {
        let key = PositionKey { owner: *owner, strike };
        self.epochs.get(&epoch).and_then(|positions| positions.get(&key))
    }

    /// Open positions of `owner` across every epoch
    pub fn of_owner<'a>(&'a self, owner: &'a AccountId) -> impl Iterator<Item = &'a Position> + 'a {
        self.epochs
            .values()
            .flat_map(|positions| positions.iter())
            .filter(move |(key, pos)| key.owner == *owner && pos.exists())
            .map(|(_, pos)| pos)
    }

    /// Sum of the outstanding amounts of an epoch and strike
    pub fn outstanding(&self, epoch: u64, strike: u128) -> Result<Amount> {
        let mut total = Amount::ZERO;
        if let Some(positions) = self.epochs.get(&epoch) {
            for (key, pos) in positions {
                if key.strike == strike {
                    total = total.checked_add(&pos.amount())?;
                }
            }
        }
        Ok(total)
    }

    pub fn increase(
        &mut self,
        epoch: u64,
        owner: AccountId,
        strike: u128,
        amount: &Amount,
        premium: u128,
    ) -> Result<()> {
        let key = PositionKey { owner, strike };
        let current = self.get(epoch, &owner, strike).copied().unwrap_or(Position {
            epoch,
            strike,
            ..Position::default()
        });
        let updated = Position {
            amount_up: add(current.amount_up, amount.up)?,
            amount_down: add(current.amount_down, amount.down)?,
            premium: add(current.premium, premium)?,
            ..current
        };
        self.epochs.entry(epoch).or_default().insert(key, updated);
        Ok(())
    }

    /// Reduce a position; fails without mutation when the amount exceeds it
    pub fn decrease(&mut self, epoch: u64, owner: AccountId, strike: u128, amount: &Amount) -> Result<()> {
        let key = PositionKey { owner, strike };
        let position = self
            .epochs
            .get_mut(&epoch)
            .and_then(|positions| positions.get_mut(&key))
            .ok_or(Error::PositionNotFound)?;
        if !amount.fits_within(&position.amount()) {
            return Err(Error::CantBurnMoreThanMinted);
        }
        position.amount_up = sub(position.amount_up, amount.up)?;
        position.amount_down = sub(position.amount_down, amount.down)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_accumulates() {
        let mut ledger = PositionLedger::new();
        let alice = AccountId::from_label("alice");
        ledger.increase(1, alice, 100, &Amount::new(5, 0), 2).unwrap();
        ledger.increase(1, alice, 100, &Amount::new(1, 3), 1).unwrap();

        let pos = ledger.get(1, &alice, 100).unwrap();
        assert_eq!(pos.amount(), Amount::new(6, 3));
        assert_eq!(pos.premium, 3);
        assert_eq!(pos.epoch, 1);
        assert_eq!(pos.strike, 100);
    }

    #[test]
    fn test_decrease_more_than_held_is_rejected() {
        let mut ledger = PositionLedger::new();
        let alice = AccountId::from_label("alice");
        ledger.increase(1, alice, 100, &Amount::new(5, 5), 0).unwrap();

        let before = ledger.clone();
        assert_eq!(
            ledger.decrease(1, alice, 100, &Amount::new(6, 0)),
            Err(Error::CantBurnMoreThanMinted)
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_decrease_missing_position() {
        let mut ledger = PositionLedger::new();
        let bob = AccountId::from_label("bob");
        assert_eq!(ledger.decrease(1, bob, 100, &Amount::new(1, 0)), Err(Error::PositionNotFound));
    }

    #[test]
    fn test_outstanding_sums_owners() {
        let mut ledger = PositionLedger::new();
        let alice = AccountId::from_label("alice");
        let bob = AccountId::from_label("bob");
        ledger.increase(1, alice, 100, &Amount::new(5, 1), 0).unwrap();
        ledger.increase(1, bob, 100, &Amount::new(2, 2), 0).unwrap();
        ledger.increase(1, bob, 200, &Amount::new(9, 9), 0).unwrap();

        assert_eq!(ledger.outstanding(1, 100).unwrap(), Amount::new(7, 3));
        assert_eq!(ledger.of_owner(&bob).count(), 2);
    }
}
