//! Deposit receipts, withdrawals and share conversions
//!
//! A deposit is two-phase: its principal waits in `amount` until the epoch
//! it was made in is priced by a roll, and only then becomes shares owed to
//! the depositor (`unredeemed_shares`). [`DepositReceipt::settle`] is the
//! pure reconciliation between those two states.

use crate::error::{Error, Result};
use crate::math::{mul_div_floor, sub, unit};

/// Per-depositor record of pending principal and owed shares
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DepositReceipt {
    /// Epoch of the last deposit (or of the last settlement)
    pub epoch: u64,
    /// Principal of `epoch` not yet priced into shares
    pub amount: u128,
    /// Principal deposited over time, net of proportional withdrawals
    pub cumulative_amount: u128,
    /// Shares from past epochs, priced but not yet claimed
    pub unredeemed_shares: u128,
}

impl DepositReceipt {
    /// Convert the pending principal of a past epoch into owed shares
    ///
    /// `price` must be the share price recorded for `self.epoch`. A receipt
    /// of the current epoch is returned untouched.
    pub fn settle(self, current_epoch: u64, price: u128, decimals: u8) -> Result<Self> {
        if self.epoch == current_epoch {
            return Ok(self);
        }
        let minted = asset_to_shares(self.amount, price, decimals)?;
        Ok(DepositReceipt {
            epoch: current_epoch,
            amount: 0,
            cumulative_amount: self.cumulative_amount,
            unredeemed_shares: self
                .unredeemed_shares
                .checked_add(minted)
                .ok_or(Error::Overflow)?,
        })
    }

    /// Principal waiting in `current_epoch`, not yet backed by shares
    pub fn pending_in(&self, current_epoch: u64) -> u128 {
        if self.epoch == current_epoch {
            self.amount
        } else {
            0
        }
    }

    /// Reduce the cumulative principal in proportion to `shares` out of
    /// `owned` shares, returning the released amount
    ///
    /// Principal still pending in the current epoch is not backed by shares
    /// and is excluded from the proportion.
    pub fn release_cumulative(&mut self, current_epoch: u64, shares: u128, owned: u128) -> Result<u128> {
        if owned == 0 {
            return Ok(0);
        }
        let settled = sub(self.cumulative_amount, self.pending_in(current_epoch))?;
        let released = mul_div_floor(settled, shares, owned)?;
        self.cumulative_amount = sub(self.cumulative_amount, released)?;
        Ok(released)
    }
}

/// Shares locked in vault custody, to be paid at the price of `epoch`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Withdrawal {
    pub epoch: u64,
    pub shares: u128,
}

/// Price of one whole share in base units; bootstraps to 1:1 with no shares
pub fn price_per_share(assets: u128, shares: u128, decimals: u8) -> Result<u128> {
    if shares == 0 {
        return unit(decimals);
    }
    mul_div_floor(assets, unit(decimals)?, shares)
}

pub fn asset_to_shares(assets: u128, price: u128, decimals: u8) -> Result<u128> {
    if assets == 0 {
        return Ok(0);
    }
    mul_div_floor(assets, unit(decimals)?, price)
}

pub fn shares_to_asset(shares: u128, price: u128, decimals: u8) -> Result<u128> {
    mul_div_floor(shares, price, unit(decimals)?)
}
