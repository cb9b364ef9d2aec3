//! DVP engine
//!
//! Mints and burns positions against the notional allocated by the vault at
//! each roll. Live positions are priced by the [`PricingModel`] and hedged
//! through the vault; positions of expired epochs share the payoff reserved
//! for their strike when the epoch closed.
//!
//! [`PricingModel`]: crate::collaborators::PricingModel

use std::collections::BTreeMap;

use log::debug;

use crate::collaborators::{Externals, Pricing, PricingParams};
use crate::config::{Allocation, MarketConfig};
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use crate::math::{add, mul_div_floor, sub, wdiv, wmul, wrap_decimals};
use crate::notional::{Amount, NotionalLedger};
use crate::position::{Position, PositionLedger};
use crate::token::{AccountId, Asset, Bank};
use crate::vault::Vault;

const BPS: i64 = 10_000;

/// Order to open or increase a position in the current epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MintOrder {
    pub recipient: AccountId,
    pub strike: u128,
    pub amount: Amount,
    /// Premium the payer agreed to, before slippage
    pub expected_premium: u128,
    /// Tolerated slippage (WAD)
    pub max_slippage: u128,
}

/// Order to close (part of) a position of `epoch`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BurnOrder {
    pub epoch: u64,
    pub recipient: AccountId,
    pub strike: u128,
    pub amount: Amount,
    pub expected_market_value: u128,
    pub max_slippage: u128,
}

/// Premium and fee charged by a mint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trade {
    pub premium: u128,
    pub fee: u128,
}

/// Mutable access to everything a DVP operation touches
pub(crate) struct Env<'a> {
    pub vault: &'a mut Vault,
    pub bank: &'a mut Bank,
    pub ext: &'a mut Externals,
    pub now: u64,
}

impl Env<'_> {
    fn reader(&self) -> Reader<'_> {
        Reader {
            vault: &*self.vault,
            bank: &*self.bank,
            ext: &*self.ext,
            now: self.now,
        }
    }
}

/// Read-only view used for quotes
#[derive(Clone, Copy)]
pub(crate) struct Reader<'a> {
    pub vault: &'a Vault,
    pub bank: &'a Bank,
    pub ext: &'a Externals,
    pub now: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dvp {
    epoch: Epoch,
    base_decimals: u8,
    side_decimals: u8,
    allocation: Allocation,
    liquidity: BTreeMap<u64, NotionalLedger>,
    positions: PositionLedger,
    strikes: Vec<u128>,
}

impl Dvp {
    pub fn new(config: &MarketConfig) -> Self {
        Self {
            epoch: Epoch::with_frequency(config.frequency),
            base_decimals: config.base_decimals,
            side_decimals: config.side_decimals,
            allocation: config.allocation.clone(),
            liquidity: BTreeMap::new(),
            positions: PositionLedger::new(),
            strikes: Vec::new(),
        }
    }

    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    /// Strikes offered in the current epoch
    pub fn strikes(&self) -> &[u128] {
        &self.strikes
    }

    pub fn notional(&self, epoch: u64) -> Option<&NotionalLedger> {
        self.liquidity.get(&epoch)
    }

    pub fn position(&self, epoch: u64, owner: &AccountId, strike: u128) -> Option<&Position> {
        self.positions.get(epoch, owner, strike)
    }

    pub fn positions(&self) -> &PositionLedger {
        &self.positions
    }

    /// Notional still available at `strike` in the current epoch
    pub fn available_liquidity(&self, strike: u128) -> Result<Amount> {
        match self.liquidity.get(&self.epoch.current) {
            Some(ledger) => ledger.available(strike),
            None => Ok(Amount::ZERO),
        }
    }

    // ========================================
    // Trading
    // ========================================

    pub(crate) fn mint(&mut self, env: &mut Env<'_>, payer: AccountId, order: &MintOrder) -> Result<Trade> {
        self.epoch.ensure_open(env.now)?;
        if env.vault.is_dead() {
            return Err(Error::VaultDead);
        }
        if order.amount.is_zero() {
            return Err(Error::AmountZero);
        }
        env.vault.ensure_user(&payer)?;
        env.vault.ensure_user(&order.recipient)?;
        if !order.amount.fits_within(&self.available_liquidity(order.strike)?) {
            return Err(Error::NotEnoughLiquidity);
        }

        let (strike, amount) = (order.strike, order.amount);
        let spot = env.ext.price_oracle.get_price(Asset::Side, Asset::Base, env.now)?;
        let params = self.pricing_params(env.reader(), strike, &amount, spot, true)?;
        let pricing = env.ext.pricer.price_and_delta(&params)?;

        let premium = match self.hedge(env, &pricing)? {
            Some(swap_price) => {
                let repriced = env.ext.pricer.price_and_delta(&PricingParams { spot: swap_price, ..params })?;
                pricing.premium.max(repriced.premium)
            }
            None => pricing.premium,
        };
        let fee = env
            .ext
            .fee_manager
            .calculate_trade_fee(amount.total()?, premium, self.base_decimals, false)?
            .charged();

        let limit = add(order.expected_premium, wmul(order.expected_premium, order.max_slippage)?)?;
        let cost = add(premium, fee)?;
        if cost > limit {
            debug!("mint slipped: cost {cost} above limit {limit}");
            return Err(Error::SlippedMarketValue);
        }

        let current = self.epoch.current;
        self.liquidity.entry(current).or_default().increase_usage(strike, &amount)?;
        self.positions.increase(current, order.recipient, strike, &amount, cost)?;

        let fee_account = env.ext.fee_manager.account();
        env.bank.transfer(Asset::Base, payer, env.vault.id(), premium)?;
        env.bank.transfer(Asset::Base, payer, fee_account, fee)?;
        env.ext.fee_manager.receive_fee(fee)?;
        Ok(Trade { premium, fee })
    }

    /// Close `order.amount` of the position `owner` holds; returns the
    /// amount paid to the recipient and the fee
    pub(crate) fn burn(&mut self, env: &mut Env<'_>, owner: AccountId, order: &BurnOrder) -> Result<Trade> {
        if order.amount.is_zero() {
            return Err(Error::AmountZero);
        }
        env.vault.ensure_user(&owner)?;
        env.vault.ensure_user(&order.recipient)?;
        let position = self
            .positions
            .get(order.epoch, &owner, order.strike)
            .filter(|pos| pos.exists())
            .ok_or(Error::PositionNotFound)?;
        if !order.amount.fits_within(&position.amount()) {
            return Err(Error::CantBurnMoreThanMinted);
        }

        let (strike, amount) = (order.strike, order.amount);
        let expired = order.epoch != self.epoch.current;
        let (value, payoff_share) = if expired {
            let share = self.expired_share(order.epoch, strike, &amount)?;
            (share.total()?, share)
        } else {
            self.epoch.ensure_open(env.now)?;
            let spot = env.ext.price_oracle.get_price(Asset::Side, Asset::Base, env.now)?;
            let params = self.pricing_params(env.reader(), strike, &amount, spot, false)?;
            let pricing = env.ext.pricer.price_and_delta(&params)?;
            let value = match self.hedge(env, &pricing)? {
                Some(swap_price) => {
                    let repriced = env.ext.pricer.price_and_delta(&PricingParams { spot: swap_price, ..params })?;
                    pricing.premium.min(repriced.premium)
                }
                None => pricing.premium,
            };
            (value, Amount::ZERO)
        };

        let fee = env
            .ext
            .fee_manager
            .calculate_trade_fee(amount.total()?, value, self.base_decimals, expired)?
            .charged()
            .min(value);
        let paid = value - fee;

        let floor = order
            .expected_market_value
            .saturating_sub(wmul(order.expected_market_value, order.max_slippage)?);
        if paid < floor {
            debug!("burn slipped: payout {paid} below floor {floor}");
            return Err(Error::SlippedMarketValue);
        }

        self.positions.decrease(order.epoch, owner, strike, &amount)?;
        let ledger = self.liquidity.entry(order.epoch).or_default();
        if expired {
            ledger.decrease_payoff(strike, &payoff_share)?;
        }
        ledger.decrease_usage(strike, &amount)?;

        let fee_account = env.ext.fee_manager.account();
        env.vault.transfer_payoff(env.bank, order.recipient, paid, expired)?;
        env.vault.transfer_payoff(env.bank, fee_account, fee, expired)?;
        env.ext.fee_manager.receive_fee(fee)?;
        Ok(Trade { premium: paid, fee })
    }

    /// Net payoff and fee `burn` would settle, without hedging
    pub(crate) fn payoff(&self, reader: Reader<'_>, epoch: u64, strike: u128, amount: &Amount) -> Result<(u128, u128)> {
        let expired = epoch != self.epoch.current;
        let value = if expired {
            self.expired_share(epoch, strike, amount)?.total()?
        } else {
            let spot = reader.ext.price_oracle.get_price(Asset::Side, Asset::Base, reader.now)?;
            let params = self.pricing_params(reader, strike, amount, spot, false)?;
            reader.ext.pricer.price_and_delta(&params)?.premium
        };
        let fee = reader
            .ext
            .fee_manager
            .calculate_trade_fee(amount.total()?, value, self.base_decimals, expired)?
            .charged()
            .min(value);
        Ok((value - fee, fee))
    }

    /// Premium and fee a mint would charge at the oracle price, before hedging
    pub(crate) fn premium(&self, reader: Reader<'_>, strike: u128, amount: &Amount) -> Result<Trade> {
        let spot = reader.ext.price_oracle.get_price(Asset::Side, Asset::Base, reader.now)?;
        let params = self.pricing_params(reader, strike, amount, spot, true)?;
        let premium = reader.ext.pricer.price_and_delta(&params)?.premium;
        let fee = reader
            .ext
            .fee_manager
            .calculate_trade_fee(amount.total()?, premium, self.base_decimals, false)?
            .charged();
        Ok(Trade { premium, fee })
    }

    fn expired_share(&self, epoch: u64, strike: u128, amount: &Amount) -> Result<Amount> {
        match self.liquidity.get(&epoch) {
            Some(ledger) => ledger.share_of_payoff(strike, amount, self.base_decimals),
            None => Ok(Amount::ZERO),
        }
    }

    /// Execute the hedge of a quote; returns the realized side price when
    /// anything was traded
    fn hedge(&self, env: &mut Env<'_>, pricing: &Pricing) -> Result<Option<u128>> {
        if pricing.hedge_delta == 0 {
            return Ok(None);
        }
        let base = env
            .vault
            .delta_hedge(env.bank, env.ext.exchange.as_mut(), pricing.hedge_delta)?;
        if base == 0 {
            return Ok(None);
        }
        let side = pricing.hedge_delta.unsigned_abs();
        let swap_price = wdiv(
            wrap_decimals(base, self.base_decimals)?,
            wrap_decimals(side, self.side_decimals)?,
        )?;
        debug!("hedged {} side at {swap_price}", pricing.hedge_delta);
        Ok(Some(swap_price))
    }

    fn pricing_params(
        &self,
        reader: Reader<'_>,
        strike: u128,
        amount: &Amount,
        spot: u128,
        is_buy: bool,
    ) -> Result<PricingParams> {
        let ledger = self.liquidity.get(&self.epoch.current);
        let used = ledger.map(|l| l.used(strike)).unwrap_or_default();
        let used_after = if is_buy {
            used.checked_add(amount)?
        } else {
            used.checked_sub(amount)?
        };
        let utilization = match ledger {
            Some(ledger) => ledger.utilization(strike, &used_after)?,
            None => 0,
        };
        let market = &reader.ext.market_oracle;
        Ok(PricingParams {
            strike,
            spot,
            amount: *amount,
            used_after,
            utilization,
            time_to_expiry: self.epoch.time_to_next(reader.now),
            epoch_length: self.epoch.frequency.seconds(),
            volatility: market.implied_volatility(strike, self.epoch.frequency)?,
            rate: market.risk_free_rate()?,
            is_buy,
            side_balance: reader.bank.balance_of(Asset::Side, &reader.vault.id()),
            base_decimals: self.base_decimals,
            side_decimals: self.side_decimals,
        })
    }

    // ========================================
    // Epoch roll
    // ========================================

    /// Reserve residual payoffs, roll the vault, then allocate the new epoch
    pub(crate) fn roll_epoch(&mut self, env: &mut Env<'_>) -> Result<crate::vault::RollOutcome> {
        self.epoch.ensure_rollable(env.now)?;

        if self.epoch.is_initialized() {
            let residual = self.account_residual_payoffs(env.reader())?;
            env.vault.reserve_payoff(residual)?;
        }

        let outcome = env.vault.roll_epoch(env.bank, env.ext.exchange.as_mut(), env.now)?;
        self.epoch.roll(env.now)?;

        if !env.vault.is_dead() {
            self.allocate(env.reader())?;
        }
        Ok(outcome)
    }

    /// Store the payoff owed to the open positions of every strike of the
    /// closing epoch, at the closing oracle price; returns their total
    fn account_residual_payoffs(&mut self, reader: Reader<'_>) -> Result<u128> {
        let current = self.epoch.current;
        let Some(ledger) = self.liquidity.get(&current) else {
            return Ok(0);
        };
        let spot = reader.ext.price_oracle.get_price(Asset::Side, Asset::Base, reader.now)?;
        let market = &reader.ext.market_oracle;

        let mut payoffs = Vec::new();
        for strike in ledger.strikes() {
            let used = ledger.used(strike);
            if used.is_zero() {
                continue;
            }
            let params = PricingParams {
                strike,
                spot,
                amount: used,
                used_after: Amount::ZERO,
                utilization: 0,
                time_to_expiry: 0,
                epoch_length: self.epoch.frequency.seconds(),
                volatility: market.implied_volatility(strike, self.epoch.frequency)?,
                rate: market.risk_free_rate()?,
                is_buy: false,
                side_balance: reader.bank.balance_of(Asset::Side, &reader.vault.id()),
                base_decimals: self.base_decimals,
                side_decimals: self.side_decimals,
            };
            let perc = reader.ext.pricer.price_and_delta(&params)?.payoff_perc;
            let payoff = Amount {
                up: wmul(used.up, perc.up)?.min(used.up),
                down: wmul(used.down, perc.down)?.min(used.down),
            };
            payoffs.push((strike, payoff));
        }

        let ledger = self.liquidity.entry(current).or_default();
        let mut total = 0;
        for (strike, payoff) in payoffs {
            debug!("epoch {current} strike {strike}: residual payoff {payoff:?}");
            ledger.account_payoffs(strike, payoff);
            total = add(total, payoff.total()?)?;
        }
        Ok(total)
    }

    /// Spread the vault's locked liquidity over the strikes of the new epoch
    fn allocate(&mut self, reader: Reader<'_>) -> Result<()> {
        let spot = reader.ext.price_oracle.get_price(Asset::Side, Asset::Base, reader.now)?;
        let strikes = match &self.allocation {
            Allocation::SingleStrike => vec![spot],
            Allocation::StrikeLadder { offsets_bps } => offsets_bps
                .iter()
                .map(|bps| {
                    let factor = u128::try_from(BPS + i64::from(*bps)).map_err(|_| Error::Underflow)?;
                    mul_div_floor(spot, factor, BPS as u128)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let capital = reader.vault.locked_initially();
        let per_strike = capital / strikes.len() as u128;
        let up = per_strike / 2;
        let down = sub(per_strike, up)?;

        let mut ledger = NotionalLedger::new();
        for strike in &strikes {
            ledger.set_initial(*strike, Amount::new(up, down));
        }
        debug!("epoch {} allocated {capital} over {} strikes", self.epoch.current, strikes.len());
        self.liquidity.insert(self.epoch.current, ledger);
        self.strikes = strikes;
        Ok(())
    }
}
