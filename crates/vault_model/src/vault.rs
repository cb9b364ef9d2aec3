//! Vault ledger
//!
//! Owns the pooled assets (held by [`Vault::id`] in the [`Bank`]), the share
//! token and the two-phase deposit and withdrawal receipts. Deposits and
//! withdrawals are only priced at epoch boundaries: `roll_epoch` computes a
//! single share price for the closing epoch, converts pending deposits into
//! shares, reserves the assets owed to withdrawing holders and to expired
//! positions, and rebalances the portfolio between the two assets.
//!
//! # Custody layout
//! The base balance of the vault account is split into
//! - `pending_deposits`: principal of the open epoch, not yet in shares
//! - `pending_withdrawals`: assets owed to holders of priced withdrawals
//! - `pending_payoffs`: residual payoffs owed to expired positions
//! - the notional base, which together with the side balance forms the
//!   portfolio value backing outstanding shares

use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Serialize;

use crate::collaborators::Exchange;
use crate::config::MarketConfig;
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::math::{add, sub, to_signed};
use crate::receipt::{asset_to_shares, price_per_share, shares_to_asset, DepositReceipt, Withdrawal};
use crate::token::{AccountId, Asset, Bank, TokenLedger};

/// Liquidity bookkeeping, in base units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Liquidity {
    /// Portfolio value at the start of the epoch, allocated to the DVP
    pub locked_initially: u128,
    pub pending_deposits: u128,
    pub pending_withdrawals: u128,
    pub pending_payoffs: u128,
    /// Residual payoffs reported by the DVP for the closing epoch
    pub new_pending_payoffs: u128,
    /// Principal deposited and not withdrawn, checked against the cap
    pub total_deposit: u128,
    /// Uncovered reservations after the last rebalance (0 when healthy)
    pub shortfall: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeldShares {
    /// Shares in custody whose payout is already reserved
    pub held_shares: u128,
    /// Shares locked during the open epoch, priced at the next roll
    pub new_held_shares: u128,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VaultState {
    pub liquidity: Liquidity,
    pub withdrawals: HeldShares,
    /// Terminal state: no more rolls, rescue only
    pub dead: bool,
    /// Set by the admin; the vault dies at the next roll
    pub killed: bool,
}

/// Result of a successful roll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollOutcome {
    pub closed_epoch: u64,
    pub share_price: u128,
    pub died: bool,
}

/// Result of a rescue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rescue {
    /// Terminal-epoch principal returned as is
    pub refunded: u128,
    /// Shares burned at their reserved price
    pub shares: u128,
    /// Base paid for those shares
    pub amount: u128,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vault {
    id: AccountId,
    base_decimals: u8,
    side_decimals: u8,
    epoch: Epoch,
    shares: TokenLedger,
    state: VaultState,
    max_deposit: u128,
    deposit_receipts: BTreeMap<AccountId, DepositReceipt>,
    withdrawals: BTreeMap<AccountId, Withdrawal>,
    epoch_price: BTreeMap<u64, u128>,
}

impl Vault {
    pub fn new(config: &MarketConfig) -> Self {
        Self {
            id: config.vault_account,
            base_decimals: config.base_decimals,
            side_decimals: config.side_decimals,
            epoch: Epoch::with_frequency(config.frequency),
            shares: TokenLedger::new(),
            state: VaultState::default(),
            max_deposit: config.max_deposit,
            deposit_receipts: BTreeMap::new(),
            withdrawals: BTreeMap::new(),
            epoch_price: BTreeMap::new(),
        }
    }

    // ========================================
    // Views
    // ========================================

    /// Custody account of the pooled assets
    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    pub fn state(&self) -> &VaultState {
        &self.state
    }

    pub fn shares(&self) -> &TokenLedger {
        &self.shares
    }

    pub fn base_decimals(&self) -> u8 {
        self.base_decimals
    }

    pub fn side_decimals(&self) -> u8 {
        self.side_decimals
    }

    pub fn max_deposit(&self) -> u128 {
        self.max_deposit
    }

    pub fn is_dead(&self) -> bool {
        self.state.dead
    }

    pub fn locked_initially(&self) -> u128 {
        self.state.liquidity.locked_initially
    }

    pub fn deposit_receipt(&self, account: &AccountId) -> Option<DepositReceipt> {
        self.deposit_receipts.get(account).copied()
    }

    pub fn withdrawal(&self, account: &AccountId) -> Option<Withdrawal> {
        self.withdrawals.get(account).copied()
    }

    pub fn epoch_price_per_share(&self, epoch: u64) -> Option<u128> {
        self.epoch_price.get(&epoch).copied()
    }

    /// Base and side balances held by the vault
    pub fn balances(&self, bank: &Bank) -> (u128, u128) {
        (bank.balance_of(Asset::Base, &self.id), bank.balance_of(Asset::Side, &self.id))
    }

    /// Share balance held by `account` and shares owed to it but not redeemed
    pub fn share_balances(&self, account: &AccountId) -> Result<(u128, u128)> {
        let owed = match self.deposit_receipts.get(account) {
            Some(_) => self.settled_receipt(account)?.unredeemed_shares,
            None => 0,
        };
        Ok((self.shares.balance_of(account), owed))
    }

    /// Base balance not reserved for pending operations
    pub fn notional_base(&self, bank: &Bank) -> Result<u128> {
        let liquidity = &self.state.liquidity;
        let reserved = add(
            add(liquidity.pending_withdrawals, liquidity.pending_deposits)?,
            liquidity.pending_payoffs,
        )?;
        bank.balance_of(Asset::Base, &self.id)
            .checked_sub(reserved)
            .ok_or(Error::InsufficientLiquidity("reservations exceed base balance"))
    }

    /// Notional base plus the side balance valued at the exchange quote
    pub fn portfolio_value(&self, bank: &Bank, exchange: &dyn Exchange) -> Result<u128> {
        let side = bank.balance_of(Asset::Side, &self.id);
        let side_value = if side == 0 {
            0
        } else {
            exchange.get_output_amount(Asset::Side, Asset::Base, side)?
        };
        add(self.notional_base(bank)?, side_value)
    }

    // ========================================
    // Deposits
    // ========================================

    pub fn deposit(
        &mut self,
        bank: &mut Bank,
        now: u64,
        caller: AccountId,
        amount: u128,
        receiver: AccountId,
    ) -> Result<()> {
        self.ensure_alive()?;
        self.epoch.ensure_open(now)?;
        if amount == 0 {
            return Err(Error::AmountZero);
        }
        self.ensure_user(&caller)?;
        self.ensure_user(&receiver)?;
        let total_deposit = add(self.state.liquidity.total_deposit, amount)?;
        if total_deposit > self.max_deposit {
            return Err(Error::ExceedsMaxDeposit);
        }

        let mut receipt = self.settled_receipt(&receiver)?;
        receipt.amount = add(receipt.amount, amount)?;
        receipt.cumulative_amount = add(receipt.cumulative_amount, amount)?;

        self.state.liquidity.pending_deposits = add(self.state.liquidity.pending_deposits, amount)?;
        self.state.liquidity.total_deposit = total_deposit;
        self.deposit_receipts.insert(receiver, receipt);

        bank.transfer(Asset::Base, caller, self.id, amount)
    }

    /// Claim `shares` owed from past deposits into the caller's balance
    pub fn redeem(&mut self, account: AccountId, shares: u128) -> Result<u128> {
        self.ensure_alive()?;
        self.ensure_user(&account)?;
        if shares == 0 {
            return Err(Error::AmountZero);
        }
        self.redeem_owed(account, shares, false)
    }

    /// Claim every owed share; a no-op when nothing is owed
    pub fn redeem_max(&mut self, account: AccountId) -> Result<u128> {
        self.ensure_alive()?;
        self.ensure_user(&account)?;
        self.redeem_owed(account, 0, true)
    }

    fn redeem_owed(&mut self, account: AccountId, shares: u128, is_max: bool) -> Result<u128> {
        if !self.deposit_receipts.contains_key(&account) {
            return if is_max { Ok(0) } else { Err(Error::ExceedsAvailable) };
        }
        let mut receipt = self.settled_receipt(&account)?;
        let shares = if is_max { receipt.unredeemed_shares } else { shares };
        if shares > receipt.unredeemed_shares {
            return Err(Error::ExceedsAvailable);
        }
        receipt.unredeemed_shares -= shares;
        self.deposit_receipts.insert(account, receipt);

        self.shares.transfer(self.id, account, shares, Asset::Base)?;
        Ok(shares)
    }

    /// Receipt of `account` with any priced past-epoch principal converted
    ///
    /// The terminal epoch of a dead vault is priced but its deposits never
    /// became shares, so such receipts stay as they are (see `rescue`).
    fn settled_receipt(&self, account: &AccountId) -> Result<DepositReceipt> {
        let current = self.epoch.current;
        let receipt = match self.deposit_receipts.get(account) {
            Some(receipt) => *receipt,
            None => {
                return Ok(DepositReceipt {
                    epoch: current,
                    ..DepositReceipt::default()
                })
            }
        };
        if receipt.epoch == current {
            return Ok(receipt);
        }
        if receipt.amount == 0 {
            return Ok(DepositReceipt {
                epoch: current,
                ..receipt
            });
        }
        if self.state.dead && receipt.epoch == self.epoch.previous {
            return Ok(receipt);
        }
        let price = self
            .epoch_price_per_share(receipt.epoch)
            .ok_or(Error::MissingSharePrice(receipt.epoch))?;
        receipt.settle(current, price, self.base_decimals)
    }

    // ========================================
    // Withdrawals
    // ========================================

    /// Lock shares for payout at the price of the open epoch
    ///
    /// Owed shares are redeemed first. The depositor's cumulative principal
    /// and the vault's total deposit shrink by the share of settled principal
    /// the withdrawn shares represent.
    pub fn initiate_withdraw(&mut self, now: u64, account: AccountId, shares: u128, is_max: bool) -> Result<u128> {
        self.ensure_alive()?;
        self.epoch.ensure_open(now)?;
        self.ensure_user(&account)?;

        self.redeem_owed(account, 0, true)?;

        let owned = self.shares.balance_of(&account);
        let shares = if is_max { owned } else { shares };
        if shares == 0 {
            return Err(Error::AmountZero);
        }
        if shares > owned {
            return Err(Error::ExceedsAvailable);
        }

        let current = self.epoch.current;
        let withdrawal = self.withdrawals.get(&account).copied().unwrap_or_default();
        if withdrawal.shares > 0 && withdrawal.epoch < current {
            return Err(Error::ExistingIncompleteWithdraw);
        }

        if let Some(receipt) = self.deposit_receipts.get_mut(&account) {
            let released = receipt.release_cumulative(current, shares, owned)?;
            self.state.liquidity.total_deposit = sub(self.state.liquidity.total_deposit, released)?;
        }

        let held = &mut self.state.withdrawals;
        held.new_held_shares = add(held.new_held_shares, shares)?;
        self.withdrawals.insert(
            account,
            Withdrawal {
                epoch: current,
                shares: add(withdrawal.shares, shares)?,
            },
        );

        self.shares.transfer(account, self.id, shares, Asset::Base)?;
        Ok(shares)
    }

    /// Pay out a withdrawal priced by a past roll
    pub fn complete_withdraw(&mut self, bank: &mut Bank, account: AccountId) -> Result<(u128, u128)> {
        self.ensure_user(&account)?;
        let withdrawal = self.withdrawals.get(&account).copied().unwrap_or_default();
        if withdrawal.shares == 0 {
            return Err(Error::WithdrawNotInitiated);
        }
        if withdrawal.epoch == self.epoch.current && !self.state.dead {
            return Err(Error::WithdrawTooEarly);
        }
        let price = self
            .epoch_price_per_share(withdrawal.epoch)
            .ok_or(Error::MissingSharePrice(withdrawal.epoch))?;
        let amount = shares_to_asset(withdrawal.shares, price, self.base_decimals)?;

        self.state.withdrawals.held_shares = sub(self.state.withdrawals.held_shares, withdrawal.shares)?;
        self.state.liquidity.pending_withdrawals = sub(self.state.liquidity.pending_withdrawals, amount)?;
        self.withdrawals.remove(&account);
        self.shares.burn(self.id, withdrawal.shares, Asset::Base)?;

        bank.transfer(Asset::Base, self.id, account, amount)?;
        Ok((withdrawal.shares, amount))
    }

    pub fn transfer_shares(&mut self, from: AccountId, to: AccountId, shares: u128) -> Result<()> {
        if shares == 0 {
            return Err(Error::AmountZero);
        }
        self.ensure_user(&from)?;
        self.ensure_user(&to)?;
        self.shares.transfer(from, to, shares, Asset::Base)
    }

    // ========================================
    // Admin
    // ========================================

    pub fn set_max_deposit(&mut self, amount: u128) -> Result<()> {
        if amount == 0 {
            return Err(Error::AmountZero);
        }
        self.max_deposit = amount;
        Ok(())
    }

    pub fn kill(&mut self) -> Result<()> {
        self.ensure_alive()?;
        self.state.killed = true;
        Ok(())
    }

    /// Sell every side token for base; only once the epoch is finished
    pub fn emergency_rebalance(&mut self, bank: &mut Bank, exchange: &mut dyn Exchange, now: u64) -> Result<(u128, u128)> {
        if !self.epoch.is_finished(now) {
            return Err(Error::EpochNotFinished);
        }
        let sold = bank.balance_of(Asset::Side, &self.id);
        let received = self.sell_all_side(bank, exchange)?;
        warn!("emergency rebalance sold {sold} side for {received} base");
        Ok((sold, received))
    }

    /// Return everything `account` is owed by a dead vault
    ///
    /// Terminal-epoch principal is refunded as is; owed shares are redeemed
    /// and, together with any share balance and open withdrawal, paid at the
    /// prices reserved when the vault died.
    pub fn rescue(&mut self, bank: &mut Bank, account: AccountId) -> Result<Rescue> {
        if !self.state.dead {
            return Err(Error::VaultNotDead);
        }
        self.ensure_user(&account)?;
        let mut rescue = Rescue::default();
        let terminal = self.epoch.previous;

        if let Some(mut receipt) = self.deposit_receipts.get(&account).copied() {
            if receipt.epoch == terminal && receipt.amount > 0 {
                rescue.refunded = receipt.amount;
                let liquidity = &mut self.state.liquidity;
                liquidity.pending_deposits = sub(liquidity.pending_deposits, receipt.amount)?;
                liquidity.total_deposit = sub(liquidity.total_deposit, receipt.amount)?;
                receipt.cumulative_amount = sub(receipt.cumulative_amount, receipt.amount)?;
                receipt.amount = 0;
                self.deposit_receipts.insert(account, receipt);
            }
        }
        self.redeem_owed(account, 0, true)?;

        if self.withdrawals.get(&account).is_some_and(|w| w.shares > 0) {
            let (shares, amount) = self.complete_withdraw(bank, account)?;
            rescue.shares = shares;
            rescue.amount = amount;
        }

        let balance = self.shares.balance_of(&account);
        if balance > 0 {
            let price = self
                .epoch_price_per_share(terminal)
                .ok_or(Error::MissingSharePrice(terminal))?;
            let amount = shares_to_asset(balance, price, self.base_decimals)?;
            self.state.withdrawals.held_shares = sub(self.state.withdrawals.held_shares, balance)?;
            self.state.liquidity.pending_withdrawals = sub(self.state.liquidity.pending_withdrawals, amount)?;
            self.shares.burn(account, balance, Asset::Base)?;
            rescue.shares = add(rescue.shares, balance)?;
            rescue.amount = add(rescue.amount, amount)?;
            bank.transfer(Asset::Base, self.id, account, amount)?;
        }

        if rescue == Rescue::default() {
            return Err(Error::NothingToRescue);
        }
        if rescue.refunded > 0 {
            bank.transfer(Asset::Base, self.id, account, rescue.refunded)?;
        }
        Ok(rescue)
    }

    // ========================================
    // DVP entry points
    // ========================================

    /// Buy (positive) or sell (negative) side tokens; returns the base
    /// amount spent or received
    pub(crate) fn delta_hedge(&mut self, bank: &mut Bank, exchange: &mut dyn Exchange, side_delta: i128) -> Result<u128> {
        let amount = side_delta.unsigned_abs();
        if amount == 0 {
            return Ok(0);
        }
        if side_delta > 0 {
            let required = exchange.get_input_amount(Asset::Base, Asset::Side, amount)?;
            let available = self.notional_base(bank)?;
            if required > available {
                return Err(Error::InsufficientLiquidity("base to buy side"));
            }
            let max_in = exchange
                .get_input_amount_max(Asset::Base, Asset::Side, amount)?
                .min(available);
            let spent = exchange.swap_out(bank, self.id, Asset::Base, Asset::Side, amount, max_in)?;
            debug!("hedge bought {amount} side for {spent} base");
            Ok(spent)
        } else {
            if bank.balance_of(Asset::Side, &self.id) < amount {
                return Err(Error::InsufficientLiquidity("side to sell"));
            }
            let received = exchange.swap_in(bank, self.id, Asset::Side, Asset::Base, amount)?;
            debug!("hedge sold {amount} side for {received} base");
            Ok(received)
        }
    }

    /// Residual payoff of the closing epoch, reserved by the next roll
    pub(crate) fn reserve_payoff(&mut self, amount: u128) -> Result<()> {
        self.ensure_alive()?;
        self.state.liquidity.new_pending_payoffs = amount;
        Ok(())
    }

    /// Pay `amount` of base to `recipient`
    ///
    /// Payoffs of expired epochs come out of the reserved payoffs; live
    /// payoffs out of the unreserved notional base.
    pub(crate) fn transfer_payoff(&mut self, bank: &mut Bank, recipient: AccountId, amount: u128, is_past: bool) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        if is_past {
            let liquidity = &mut self.state.liquidity;
            liquidity.pending_payoffs = liquidity
                .pending_payoffs
                .checked_sub(amount)
                .ok_or(Error::InsufficientLiquidity("reserved payoffs"))?;
        } else if self.notional_base(bank)? < amount {
            return Err(Error::InsufficientLiquidity("base for payoff"));
        }
        bank.transfer(Asset::Base, self.id, recipient, amount)
    }

    // ========================================
    // Epoch roll
    // ========================================

    pub(crate) fn roll_epoch(&mut self, bank: &mut Bank, exchange: &mut dyn Exchange, now: u64) -> Result<RollOutcome> {
        self.epoch.ensure_rollable(now)?;
        let closed_epoch = self.epoch.current;
        let (share_price, died) = self.before_roll(bank, exchange)?;
        self.epoch.roll(now)?;
        self.after_roll(bank, exchange)?;
        Ok(RollOutcome {
            closed_epoch,
            share_price,
            died,
        })
    }

    /// Price the closing epoch and settle its pending operations
    fn before_roll(&mut self, bank: &Bank, exchange: &dyn Exchange) -> Result<(u128, bool)> {
        self.ensure_alive()?;
        let decimals = self.base_decimals;
        let value = self.portfolio_value(bank, exchange)?;

        let liquidity = self.state.liquidity;
        if liquidity.new_pending_payoffs > value {
            return Err(Error::InsufficientLiquidity("residual payoffs exceed portfolio value"));
        }
        let locked = value - liquidity.new_pending_payoffs;

        let outstanding = sub(self.shares.total_supply(), self.state.withdrawals.held_shares)?;
        let price = price_per_share(locked, outstanding, decimals)?;
        self.epoch_price.insert(self.epoch.current, price);
        debug!(
            "epoch {} priced: value={value} locked={locked} outstanding={outstanding} price={price}",
            self.epoch.current
        );

        let died = self.state.killed || (price == 0 && liquidity.pending_deposits > 0);
        if died {
            warn!("vault dies at epoch {} (price {price})", self.epoch.current);
            self.state.dead = true;
        } else {
            let minted = asset_to_shares(liquidity.pending_deposits, price, decimals)?;
            self.shares.mint(self.id, minted)?;
        }

        let held = &mut self.state.withdrawals;
        held.held_shares = add(held.held_shares, held.new_held_shares)?;
        let mut reserved = shares_to_asset(held.new_held_shares, price, decimals)?;

        if died {
            // Every remaining share becomes a withdrawal at the terminal price
            let remaining = sub(self.shares.total_supply(), held.held_shares)?;
            held.held_shares = add(held.held_shares, remaining)?;
            reserved = add(reserved, shares_to_asset(remaining, price, decimals)?)?;
        }

        let liquidity = &mut self.state.liquidity;
        liquidity.pending_withdrawals = add(liquidity.pending_withdrawals, reserved)?;
        liquidity.pending_payoffs = add(liquidity.pending_payoffs, liquidity.new_pending_payoffs)?;
        Ok((price, died))
    }

    fn after_roll(&mut self, bank: &mut Bank, exchange: &mut dyn Exchange) -> Result<()> {
        self.state.liquidity.new_pending_payoffs = 0;
        self.state.withdrawals.new_held_shares = 0;

        if self.state.dead {
            // Pending deposits stay reserved for refunds
            self.sell_all_side(bank, exchange)?;
            self.state.liquidity.locked_initially = 0;
            return Ok(());
        }
        self.state.liquidity.pending_deposits = 0;

        self.rebalance(bank, exchange)?;

        let liquidity = self.state.liquidity;
        let pendings = add(liquidity.pending_withdrawals, liquidity.pending_payoffs)?;
        let base = bank.balance_of(Asset::Base, &self.id);
        if base < pendings {
            let shortfall = pendings - base;
            warn!("vault cannot cover reservations after rebalance, shortfall {shortfall}");
            self.state.liquidity.shortfall = shortfall;
            self.state.liquidity.locked_initially = 0;
        } else {
            self.state.liquidity.shortfall = 0;
            self.state.liquidity.locked_initially = self.portfolio_value(bank, exchange)?;
        }
        Ok(())
    }

    /// Equal-weight split of the unreserved portfolio between the two assets
    fn rebalance(&mut self, bank: &mut Bank, exchange: &mut dyn Exchange) -> Result<()> {
        let liquidity = self.state.liquidity;
        let pendings = add(liquidity.pending_withdrawals, liquidity.pending_payoffs)?;
        let (base, side) = self.balances(bank);

        if base < pendings {
            let missing = pendings - base;
            let side_needed = exchange.get_input_amount(Asset::Side, Asset::Base, missing)?;
            if side_needed > side {
                debug!("rebalance: selling all {side} side, {missing} base missing");
                self.sell_all_side(bank, exchange)?;
                return Ok(());
            }
            let max_in = exchange.get_input_amount_max(Asset::Side, Asset::Base, missing)?.min(side);
            exchange.swap_out(bank, self.id, Asset::Side, Asset::Base, missing, max_in)?;

            let half = bank.balance_of(Asset::Side, &self.id) / 2;
            debug!("rebalance: covered {missing} base, selling {half} side");
            if half > 0 {
                exchange.swap_in(bank, self.id, Asset::Side, Asset::Base, half)?;
            }
            return Ok(());
        }

        let half_value = self.portfolio_value(bank, exchange)? / 2;
        let target = if half_value == 0 {
            0
        } else {
            exchange.get_output_amount(Asset::Base, Asset::Side, half_value)?
        };
        let delta = to_signed(target)? - to_signed(side)?;
        debug!("rebalance: side target {target}, delta {delta}");
        self.delta_hedge(bank, exchange, delta)?;
        Ok(())
    }

    fn sell_all_side(&mut self, bank: &mut Bank, exchange: &mut dyn Exchange) -> Result<u128> {
        let side = bank.balance_of(Asset::Side, &self.id);
        if side == 0 {
            return Ok(0);
        }
        exchange.swap_in(bank, self.id, Asset::Side, Asset::Base, side)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state.dead {
            return Err(Error::VaultDead);
        }
        Ok(())
    }

    /// Users are any non-zero identity other than the custody account
    pub(crate) fn ensure_user(&self, account: &AccountId) -> Result<()> {
        if account.is_zero() {
            return Err(Error::AddressZero);
        }
        if *account == self.id {
            return Err(Error::VaultAccount);
        }
        Ok(())
    }
}
