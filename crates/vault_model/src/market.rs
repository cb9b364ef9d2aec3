//! Market: the vault, the DVP and their collaborators behind one atomic API
//!
//! Every mutating call runs inside [`Market::transact`]: the ledgers and the
//! bank are snapshotted first and restored if the call fails, so an error
//! never leaves a partial mutation behind. Privileged calls take the
//! capability returned by [`Market::new`].

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use serde::Serialize;

use crate::collaborators::Externals;
use crate::config::MarketConfig;
use crate::dvp::{BurnOrder, Dvp, Env, MintOrder, Reader, Trade};
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::notional::{Amount, Info};
use crate::position::Position;
use crate::token::{AccountId, Asset, Bank};
use crate::vault::{Rescue, Vault, VaultState};

/// Source of market identities, so capabilities cannot cross markets
static NEXT_MARKET_ID: AtomicU64 = AtomicU64::new(1);

/// Capability for the admin-only calls of one market
#[derive(Debug)]
pub struct AdminCap {
    market: u64,
}

/// Capability for rolling the epochs of one market
#[derive(Debug)]
pub struct RollerCap {
    market: u64,
}

/// Point-in-time view of a market
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MarketSummary {
    pub now: u64,
    pub epoch: Epoch,
    pub vault: VaultState,
    pub base_balance: u128,
    pub side_balance: u128,
    pub share_supply: u128,
    pub share_price: Option<u128>,
    pub strikes: Vec<u128>,
    pub notional_initial: Amount,
    pub notional_used: Amount,
}

pub struct Market {
    id: u64,
    bank: Bank,
    vault: Vault,
    dvp: Dvp,
    externals: Externals,
    now: u64,
    events: Vec<Event>,
}

impl Market {
    pub fn new(config: MarketConfig, externals: Externals) -> Result<(Self, AdminCap, RollerCap)> {
        config.validate()?;
        let id = NEXT_MARKET_ID.fetch_add(1, Ordering::Relaxed);
        let market = Self {
            id,
            bank: Bank::new(),
            vault: Vault::new(&config),
            dvp: Dvp::new(&config),
            externals,
            now: config.genesis,
            events: Vec::new(),
        };
        Ok((market, AdminCap { market: id }, RollerCap { market: id }))
    }

    fn authorize(&self, issuer: u64) -> Result<()> {
        if issuer != self.id {
            return Err(Error::ForeignCapability);
        }
        Ok(())
    }

    /// Run `op` atomically: on error every ledger is restored
    fn transact<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let bank = self.bank.clone();
        let vault = self.vault.clone();
        let dvp = self.dvp.clone();
        let events = self.events.len();

        let result = op(self);
        if result.is_err() {
            self.bank = bank;
            self.vault = vault;
            self.dvp = dvp;
            self.events.truncate(events);
        }
        result
    }

    fn reader(&self) -> Reader<'_> {
        Reader {
            vault: &self.vault,
            bank: &self.bank,
            ext: &self.externals,
            now: self.now,
        }
    }

    // ========================================
    // Clock
    // ========================================

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn set_time(&mut self, now: u64) -> Result<()> {
        if now < self.now {
            return Err(Error::InvalidConfig(format!("clock cannot go back from {} to {now}", self.now)));
        }
        self.now = now;
        Ok(())
    }

    pub fn advance_time(&mut self, seconds: u64) -> Result<()> {
        self.now = self.now.checked_add(seconds).ok_or(Error::Overflow)?;
        Ok(())
    }

    /// Credit `amount` of `asset` to `account` out of thin air
    pub fn fund(&mut self, account: AccountId, asset: Asset, amount: u128) -> Result<()> {
        if account.is_zero() {
            return Err(Error::AddressZero);
        }
        self.bank.mint(asset, account, amount)
    }

    // ========================================
    // Vault operations
    // ========================================

    pub fn deposit(&mut self, caller: AccountId, amount: u128, receiver: AccountId) -> Result<()> {
        self.transact(|m| {
            m.vault.deposit(&mut m.bank, m.now, caller, amount, receiver)?;
            info!("deposit: {caller} deposited {amount} for {receiver}");
            m.events.push(Event::Deposit {
                epoch: m.vault.epoch().current,
                caller,
                receiver,
                amount,
            });
            Ok(())
        })
    }

    pub fn redeem(&mut self, account: AccountId, shares: u128) -> Result<u128> {
        self.transact(|m| {
            let shares = m.vault.redeem(account, shares)?;
            m.record_redeem(account, shares);
            Ok(shares)
        })
    }

    pub fn redeem_max(&mut self, account: AccountId) -> Result<u128> {
        self.transact(|m| {
            let shares = m.vault.redeem_max(account)?;
            m.record_redeem(account, shares);
            Ok(shares)
        })
    }

    fn record_redeem(&mut self, account: AccountId, shares: u128) {
        if shares > 0 {
            info!("redeem: {account} claimed {shares} shares");
            self.events.push(Event::Redeem { account, shares });
        }
    }

    pub fn initiate_withdraw(&mut self, account: AccountId, shares: u128) -> Result<u128> {
        self.withdraw(account, shares, false)
    }

    pub fn initiate_withdraw_max(&mut self, account: AccountId) -> Result<u128> {
        self.withdraw(account, 0, true)
    }

    fn withdraw(&mut self, account: AccountId, shares: u128, is_max: bool) -> Result<u128> {
        self.transact(|m| {
            let shares = m.vault.initiate_withdraw(m.now, account, shares, is_max)?;
            let epoch = m.vault.epoch().current;
            info!("withdraw: {account} locked {shares} shares in epoch {epoch}");
            m.events.push(Event::WithdrawInitiated { epoch, account, shares });
            Ok(shares)
        })
    }

    /// Returns the base amount paid
    pub fn complete_withdraw(&mut self, account: AccountId) -> Result<u128> {
        self.transact(|m| {
            let (shares, amount) = m.vault.complete_withdraw(&mut m.bank, account)?;
            info!("withdraw: {account} burned {shares} shares for {amount}");
            m.events.push(Event::WithdrawCompleted { account, shares, amount });
            Ok(amount)
        })
    }

    pub fn transfer_shares(&mut self, from: AccountId, to: AccountId, shares: u128) -> Result<()> {
        self.transact(|m| {
            m.vault.transfer_shares(from, to, shares)?;
            m.events.push(Event::ShareTransfer { from, to, shares });
            Ok(())
        })
    }

    pub fn rescue(&mut self, account: AccountId) -> Result<Rescue> {
        self.transact(|m| {
            let rescue = m.vault.rescue(&mut m.bank, account)?;
            info!(
                "rescue: {account} refunded {}, {} shares paid {}",
                rescue.refunded, rescue.shares, rescue.amount
            );
            m.events.push(Event::Rescue {
                account,
                refunded: rescue.refunded,
                shares: rescue.shares,
                amount: rescue.amount,
            });
            Ok(rescue)
        })
    }

    // ========================================
    // DVP operations
    // ========================================

    pub fn mint(&mut self, payer: AccountId, order: &MintOrder) -> Result<Trade> {
        self.transact(|m| {
            let mut env = Env {
                vault: &mut m.vault,
                bank: &mut m.bank,
                ext: &mut m.externals,
                now: m.now,
            };
            let trade = m.dvp.mint(&mut env, payer, order)?;
            let epoch = m.dvp.epoch().current;
            info!(
                "mint: {} strike {} {:?} premium {} fee {}",
                order.recipient, order.strike, order.amount, trade.premium, trade.fee
            );
            m.events.push(Event::Mint {
                epoch,
                payer,
                recipient: order.recipient,
                strike: order.strike,
                amount: order.amount,
                premium: trade.premium,
                fee: trade.fee,
            });
            Ok(trade)
        })
    }

    /// Close a position of `owner`; `Trade::premium` is the amount paid out
    pub fn burn(&mut self, owner: AccountId, order: &BurnOrder) -> Result<Trade> {
        self.transact(|m| {
            let mut env = Env {
                vault: &mut m.vault,
                bank: &mut m.bank,
                ext: &mut m.externals,
                now: m.now,
            };
            let trade = m.dvp.burn(&mut env, owner, order)?;
            info!(
                "burn: {owner} epoch {} strike {} {:?} paid {} fee {}",
                order.epoch, order.strike, order.amount, trade.premium, trade.fee
            );
            m.events.push(Event::Burn {
                epoch: order.epoch,
                owner,
                recipient: order.recipient,
                strike: order.strike,
                amount: order.amount,
                paid: trade.premium,
                fee: trade.fee,
            });
            Ok(trade)
        })
    }

    pub fn roll_epoch(&mut self, cap: &RollerCap) -> Result<()> {
        self.authorize(cap.market)?;
        self.transact(|m| {
            let mut env = Env {
                vault: &mut m.vault,
                bank: &mut m.bank,
                ext: &mut m.externals,
                now: m.now,
            };
            let outcome = m.dvp.roll_epoch(&mut env)?;
            let current = m.dvp.epoch().current;
            let locked = m.vault.locked_initially();
            info!(
                "roll: epoch {} closed at share price {}, epoch {current} locks {locked}",
                outcome.closed_epoch, outcome.share_price
            );
            m.events.push(Event::EpochRolled {
                closed: outcome.closed_epoch,
                current,
                share_price: outcome.share_price,
                locked_liquidity: locked,
            });
            if outcome.died {
                m.events.push(Event::VaultDead {
                    epoch: outcome.closed_epoch,
                });
            }
            Ok(())
        })
    }

    // ========================================
    // Admin
    // ========================================

    pub fn kill_vault(&mut self, cap: &AdminCap) -> Result<()> {
        self.authorize(cap.market)?;
        self.transact(|m| {
            m.vault.kill()?;
            info!("admin: vault killed, dies at the next roll");
            m.events.push(Event::VaultKilled);
            Ok(())
        })
    }

    pub fn set_max_deposit(&mut self, cap: &AdminCap, amount: u128) -> Result<()> {
        self.authorize(cap.market)?;
        self.transact(|m| {
            m.vault.set_max_deposit(amount)?;
            info!("admin: max deposit set to {amount}");
            m.events.push(Event::MaxDepositChanged { amount });
            Ok(())
        })
    }

    pub fn emergency_rebalance(&mut self, cap: &AdminCap) -> Result<(u128, u128)> {
        self.authorize(cap.market)?;
        self.transact(|m| {
            let (sold, received) = m
                .vault
                .emergency_rebalance(&mut m.bank, m.externals.exchange.as_mut(), m.now)?;
            m.events.push(Event::EmergencyRebalance { sold, received });
            Ok((sold, received))
        })
    }

    /// Drain the events emitted since the last call
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    // ========================================
    // Views
    // ========================================

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn dvp(&self) -> &Dvp {
        &self.dvp
    }

    pub fn epoch(&self) -> &Epoch {
        self.dvp.epoch()
    }

    pub fn vault_state(&self) -> &VaultState {
        self.vault.state()
    }

    /// Base and side balances of the vault
    pub fn balances(&self) -> (u128, u128) {
        self.vault.balances(&self.bank)
    }

    pub fn share_balances(&self, account: &AccountId) -> Result<(u128, u128)> {
        self.vault.share_balances(account)
    }

    pub fn epoch_price_per_share(&self, epoch: u64) -> Option<u128> {
        self.vault.epoch_price_per_share(epoch)
    }

    /// Initial, used and reserved notional of the current epoch
    pub fn notional(&self) -> Result<Info> {
        match self.dvp.notional(self.dvp.epoch().current) {
            Some(ledger) => ledger.totals(),
            None => Ok(Info::default()),
        }
    }

    pub fn position(&self, epoch: u64, owner: &AccountId, strike: u128) -> Option<Position> {
        self.dvp.position(epoch, owner, strike).copied()
    }

    pub fn strikes(&self) -> &[u128] {
        self.dvp.strikes()
    }

    pub fn available_liquidity(&self, strike: u128) -> Result<Amount> {
        self.dvp.available_liquidity(strike)
    }

    /// Premium and fee for minting `amount` at `strike` right now
    pub fn premium(&self, strike: u128, amount: &Amount) -> Result<Trade> {
        self.dvp.premium(self.reader(), strike, amount)
    }

    /// Net payoff and fee for burning `amount` of a position of `epoch`
    pub fn payoff(&self, epoch: u64, strike: u128, amount: &Amount) -> Result<(u128, u128)> {
        self.dvp.payoff(self.reader(), epoch, strike, amount)
    }

    pub fn portfolio_value(&self) -> Result<u128> {
        self.vault.portfolio_value(&self.bank, self.externals.exchange.as_ref())
    }

    pub fn summary(&self) -> Result<MarketSummary> {
        let epoch = *self.dvp.epoch();
        let (base_balance, side_balance) = self.balances();
        let notional = self.notional()?;
        Ok(MarketSummary {
            now: self.now,
            epoch,
            vault: *self.vault.state(),
            base_balance,
            side_balance,
            share_supply: self.vault.shares().total_supply(),
            share_price: self.vault.epoch_price_per_share(epoch.previous),
            strikes: self.dvp.strikes().to_vec(),
            notional_initial: notional.initial,
            notional_used: notional.used,
        })
    }
}
