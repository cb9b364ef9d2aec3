//! Notional ledger: per-strike capital of one epoch
//!
//! For every strike the ledger tracks the initial capital allocated at the
//! roll, the part currently used by open positions, and the residual payoff
//! set aside when the epoch closed. Each quantity is split between the two
//! symmetric strategies ("up" and "down").
//!
//! # Invariants
//! - `used.up <= initial.up` and `used.down <= initial.down` (enforced by
//!   the DVP before calling `increase_usage`)
//! - `payoff` is accounted once per epoch and only decreases afterwards

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::math::{add, sub, unwrap_decimals, wdiv, wmul, wrap_decimals};

/// Pair of values for the up and down strategies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub up: u128,
    pub down: u128,
}

impl Amount {
    pub const ZERO: Amount = Amount { up: 0, down: 0 };

    pub fn new(up: u128, down: u128) -> Self {
        Self { up, down }
    }

    pub fn is_zero(&self) -> bool {
        self.up == 0 && self.down == 0
    }

    pub fn total(&self) -> Result<u128> {
        add(self.up, self.down)
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount> {
        Ok(Amount {
            up: add(self.up, other.up)?,
            down: add(self.down, other.down)?,
        })
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Amount> {
        Ok(Amount {
            up: sub(self.up, other.up)?,
            down: sub(self.down, other.down)?,
        })
    }

    /// Component-wise `self <= other`
    pub fn fits_within(&self, other: &Amount) -> bool {
        self.up <= other.up && self.down <= other.down
    }
}

/// Capital bookkeeping of one strike
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Info {
    pub initial: Amount,
    pub used: Amount,
    pub payoff: Amount,
}

/// Notional ledger of a single epoch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotionalLedger {
    strikes: BTreeMap<u128, Info>,
}

impl NotionalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, strike: u128) -> Info {
        self.strikes.get(&strike).copied().unwrap_or_default()
    }

    pub fn strikes(&self) -> impl Iterator<Item = u128> + '_ {
        self.strikes.keys().copied()
    }

    pub fn set_initial(&mut self, strike: u128, notional: Amount) {
        self.strikes.entry(strike).or_default().initial = notional;
    }

    pub fn used(&self, strike: u128) -> Amount {
        self.info(strike).used
    }

    pub fn accounted_payoff(&self, strike: u128) -> Amount {
        self.info(strike).payoff
    }

    /// Capital still available for new positions
    pub fn available(&self, strike: u128) -> Result<Amount> {
        let info = self.info(strike);
        info.initial.checked_sub(&info.used)
    }

    /// Utilization of the strike if `used` were outstanding (WAD, 0 when empty)
    pub fn utilization(&self, strike: u128, used: &Amount) -> Result<u128> {
        let initial = self.info(strike).initial.total()?;
        if initial == 0 {
            return Ok(0);
        }
        wdiv(used.total()?, initial)
    }

    pub fn increase_usage(&mut self, strike: u128, amount: &Amount) -> Result<()> {
        let info = self.strikes.entry(strike).or_default();
        info.used = info.used.checked_add(amount)?;
        Ok(())
    }

    pub fn decrease_usage(&mut self, strike: u128, amount: &Amount) -> Result<()> {
        let info = self.strikes.entry(strike).or_default();
        info.used = info.used.checked_sub(amount)?;
        Ok(())
    }

    /// Record the residual payoff owed to the open positions of `strike`
    pub fn account_payoffs(&mut self, strike: u128, payoff: Amount) {
        self.strikes.entry(strike).or_default().payoff = payoff;
    }

    pub fn decrease_payoff(&mut self, strike: u128, payoff: &Amount) -> Result<()> {
        let info = self.strikes.entry(strike).or_default();
        info.payoff = info.payoff.checked_sub(payoff)?;
        Ok(())
    }

    /// Share of the accounted payoff owed to `amount` of used notional
    ///
    /// amount : used = share : payoff, computed in WAD precision. Closing the
    /// whole remaining notional of a side receives the whole remaining
    /// payoff, so the pool is exhausted exactly.
    pub fn share_of_payoff(&self, strike: u128, amount: &Amount, decimals: u8) -> Result<Amount> {
        let info = self.info(strike);
        Ok(Amount {
            up: side_share(amount.up, info.used.up, info.payoff.up, decimals)?,
            down: side_share(amount.down, info.used.down, info.payoff.down, decimals)?,
        })
    }

    /// Sum of initial, used and payoff amounts over every strike
    pub fn totals(&self) -> Result<Info> {
        let mut total = Info::default();
        for info in self.strikes.values() {
            total.initial = total.initial.checked_add(&info.initial)?;
            total.used = total.used.checked_add(&info.used)?;
            total.payoff = total.payoff.checked_add(&info.payoff)?;
        }
        Ok(total)
    }
}

fn side_share(amount: u128, used: u128, payoff: u128, decimals: u8) -> Result<u128> {
    if amount == 0 || payoff == 0 || used == 0 {
        return Ok(0);
    }
    if amount >= used {
        return Ok(payoff);
    }
    let amount_wad = wrap_decimals(amount, decimals)?;
    let used_wad = wrap_decimals(used, decimals)?;
    let payoff_wad = wrap_decimals(payoff, decimals)?;

    let share = unwrap_decimals(wdiv(wmul(amount_wad, payoff_wad)?, used_wad)?, decimals)?;
    Ok(share.min(payoff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const STRIKE: u128 = 2_000 * crate::math::WAD;

    #[test]
    fn test_available_tracks_usage() {
        let mut ledger = NotionalLedger::new();
        ledger.set_initial(STRIKE, Amount::new(500, 500));
        ledger.increase_usage(STRIKE, &Amount::new(200, 0)).unwrap();

        assert_eq!(ledger.available(STRIKE).unwrap(), Amount::new(300, 500));

        ledger.decrease_usage(STRIKE, &Amount::new(50, 0)).unwrap();
        assert_eq!(ledger.available(STRIKE).unwrap(), Amount::new(350, 500));
        let used = ledger.used(STRIKE);
        assert_eq!(ledger.utilization(STRIKE, &used).unwrap(), crate::math::WAD * 15 / 100);
    }

    #[test]
    fn test_unknown_strike_has_no_capacity() {
        let ledger = NotionalLedger::new();
        assert_eq!(ledger.available(7).unwrap(), Amount::ZERO);
        assert_eq!(ledger.utilization(7, &Amount::new(1, 1)).unwrap(), 0);
    }

    #[test]
    fn test_decrease_usage_underflow() {
        let mut ledger = NotionalLedger::new();
        ledger.set_initial(STRIKE, Amount::new(10, 10));
        assert_eq!(ledger.decrease_usage(STRIKE, &Amount::new(1, 0)), Err(Error::Underflow));
    }

    #[test]
    fn test_share_of_payoff_pro_rata() {
        let mut ledger = NotionalLedger::new();
        ledger.set_initial(STRIKE, Amount::new(1_000_000, 1_000_000));
        ledger.increase_usage(STRIKE, &Amount::new(300_000, 100_000)).unwrap();
        ledger.account_payoffs(STRIKE, Amount::new(90_000, 0));

        let share = ledger.share_of_payoff(STRIKE, &Amount::new(100_000, 50_000), 6).unwrap();
        assert_eq!(share, Amount::new(30_000, 0));
    }

    #[test]
    fn test_share_of_payoff_exhausts_pool() {
        let mut ledger = NotionalLedger::new();
        ledger.set_initial(STRIKE, Amount::new(1_000, 0));
        ledger.increase_usage(STRIKE, &Amount::new(3, 0)).unwrap();
        ledger.account_payoffs(STRIKE, Amount::new(10, 0));

        let mut paid = 0;
        for _ in 0..3 {
            let one = Amount::new(1, 0);
            let share = ledger.share_of_payoff(STRIKE, &one, 6).unwrap();
            ledger.decrease_payoff(STRIKE, &share).unwrap();
            ledger.decrease_usage(STRIKE, &one).unwrap();
            paid += share.up;
        }
        assert_eq!(paid, 10);
        assert_eq!(ledger.accounted_payoff(STRIKE), Amount::ZERO);
    }
}
