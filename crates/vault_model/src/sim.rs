//! Reference collaborators
//!
//! Deterministic implementations of the collaborator traits driven by a
//! shared [`PriceFeed`]. The scenario harness and the tests run on them;
//! they are deliberately simple and do not model order books or a
//! volatility surface.

use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::collaborators::{
    Exchange, Externals, FeeManager, MarketOracle, PriceOracle, Pricing, PricingModel, PricingParams, TradeFee,
};
use crate::config::{wad, MarketConfig};
use crate::epoch::{Frequency, HOUR};
use crate::error::{Error, Result};
use crate::math::{add, mul_div_ceil, mul_div_floor, sub, to_signed, unit, unwrap_decimals, wdiv, wmul, WAD};
use crate::notional::Amount;
use crate::token::{AccountId, Asset, Bank};

/// Shared handle on the side/base spot price and its update time
#[derive(Clone, Debug)]
pub struct PriceFeed {
    state: Rc<Cell<(u128, u64)>>,
}

impl PriceFeed {
    pub fn new(price: u128, updated_at: u64) -> Self {
        Self {
            state: Rc::new(Cell::new((price, updated_at))),
        }
    }

    /// Side price in base (WAD)
    pub fn price(&self) -> u128 {
        self.state.get().0
    }

    pub fn updated_at(&self) -> u64 {
        self.state.get().1
    }

    pub fn set(&self, price: u128, now: u64) {
        self.state.set((price, now));
    }
}

/// Oracle reading the feed, failing once the price is older than `max_delay`
pub struct FeedOracle {
    feed: PriceFeed,
    max_delay: u64,
}

impl FeedOracle {
    pub fn new(feed: PriceFeed, max_delay: u64) -> Self {
        Self { feed, max_delay }
    }
}

impl PriceOracle for FeedOracle {
    fn get_price(&self, token: Asset, numeraire: Asset, now: u64) -> Result<u128> {
        if now > self.feed.updated_at().saturating_add(self.max_delay) {
            return Err(Error::StalePrice);
        }
        let price = self.feed.price();
        if price == 0 {
            return Err(Error::Collaborator("oracle price is zero".into()));
        }
        match (token, numeraire) {
            (Asset::Side, Asset::Base) => Ok(price),
            (Asset::Base, Asset::Side) => wdiv(WAD, price),
            _ => Ok(WAD),
        }
    }
}

/// Flat volatility and rate
#[derive(Clone, Copy, Debug)]
pub struct StaticMarketOracle {
    pub volatility: u128,
    pub rate: u128,
}

impl MarketOracle for StaticMarketOracle {
    fn implied_volatility(&self, _strike: u128, _frequency: Frequency) -> Result<u128> {
        Ok(self.volatility)
    }

    fn risk_free_rate(&self) -> Result<u128> {
        Ok(self.rate)
    }
}

/// Swaps at the feed price against an unlimited counterparty
///
/// `fee` (WAD) is taken from the output; `slippage` (WAD) widens the
/// maximum-input quote.
pub struct FeedExchange {
    feed: PriceFeed,
    base_decimals: u8,
    side_decimals: u8,
    fee: u128,
    slippage: u128,
}

impl FeedExchange {
    pub fn new(feed: PriceFeed, base_decimals: u8, side_decimals: u8) -> Self {
        Self {
            feed,
            base_decimals,
            side_decimals,
            fee: 0,
            slippage: 0,
        }
    }

    pub fn with_fees(mut self, fee: u128, slippage: u128) -> Self {
        self.fee = fee;
        self.slippage = slippage;
        self
    }

    /// Value of `amount` of `token_in` in `token_out` at the feed price
    fn convert(&self, token_in: Asset, token_out: Asset, amount: u128, round_up: bool) -> Result<u128> {
        let mul_div = if round_up { mul_div_ceil } else { mul_div_floor };
        let price = self.feed.price();
        if price == 0 {
            return Err(Error::Collaborator("exchange price is zero".into()));
        }
        let (bu, su) = (unit(self.base_decimals)?, unit(self.side_decimals)?);
        match (token_in, token_out) {
            (Asset::Side, Asset::Base) => mul_div(mul_div(amount, price, WAD)?, bu, su),
            (Asset::Base, Asset::Side) => mul_div(mul_div(amount, su, bu)?, WAD, price),
            _ => Ok(amount),
        }
    }
}

impl Exchange for FeedExchange {
    fn get_output_amount(&self, token_in: Asset, token_out: Asset, amount_in: u128) -> Result<u128> {
        let gross = self.convert(token_in, token_out, amount_in, false)?;
        mul_div_floor(gross, sub(WAD, self.fee)?, WAD)
    }

    fn get_input_amount(&self, token_in: Asset, token_out: Asset, amount_out: u128) -> Result<u128> {
        let gross = mul_div_ceil(amount_out, WAD, sub(WAD, self.fee)?)?;
        self.convert(token_out, token_in, gross, true)
    }

    fn get_input_amount_max(&self, token_in: Asset, token_out: Asset, amount_out: u128) -> Result<u128> {
        let input = self.get_input_amount(token_in, token_out, amount_out)?;
        add(input, mul_div_ceil(input, self.slippage, WAD)?)
    }

    fn swap_in(
        &mut self,
        bank: &mut Bank,
        payer: AccountId,
        token_in: Asset,
        token_out: Asset,
        amount_in: u128,
    ) -> Result<u128> {
        let output = self.get_output_amount(token_in, token_out, amount_in)?;
        bank.burn(token_in, payer, amount_in)?;
        bank.mint(token_out, payer, output)?;
        Ok(output)
    }

    fn swap_out(
        &mut self,
        bank: &mut Bank,
        payer: AccountId,
        token_in: Asset,
        token_out: Asset,
        amount_out: u128,
        max_in: u128,
    ) -> Result<u128> {
        let input = self.get_input_amount(token_in, token_out, amount_out)?;
        if input > max_in {
            return Err(Error::Collaborator(format!("swap needs {input}, above maximum {max_in}")));
        }
        bank.burn(token_in, payer, input)?;
        bank.mint(token_out, payer, amount_out)?;
        Ok(input)
    }
}

/// Fee on notional, capped by a share of the premium, with a floor
pub struct FlatFeeManager {
    account: AccountId,
    notional_rate: u128,
    premium_cap: u128,
    /// Minimum fee in whole tokens (WAD)
    min_fee: u128,
    expired_rate: u128,
    collected: u128,
}

impl FlatFeeManager {
    pub fn new(account: AccountId, params: &FeeParams) -> Self {
        Self {
            account,
            notional_rate: params.notional_rate,
            premium_cap: params.premium_cap,
            min_fee: params.min_fee,
            expired_rate: params.expired_rate,
            collected: 0,
        }
    }

    pub fn collected(&self) -> u128 {
        self.collected
    }
}

impl FeeManager for FlatFeeManager {
    fn calculate_trade_fee(&self, notional: u128, premium: u128, decimals: u8, expired: bool) -> Result<TradeFee> {
        if expired {
            return Ok(TradeFee {
                fee: mul_div_floor(notional, self.expired_rate, WAD)?,
                min_fee: 0,
            });
        }
        let fee = mul_div_floor(notional, self.notional_rate, WAD)?;
        let cap = mul_div_floor(premium, self.premium_cap, WAD)?;
        Ok(TradeFee {
            fee: fee.min(cap),
            min_fee: unwrap_decimals(self.min_fee, decimals)?,
        })
    }

    fn account(&self) -> AccountId {
        self.account
    }

    fn receive_fee(&mut self, amount: u128) -> Result<()> {
        self.collected = add(self.collected, amount)?;
        Ok(())
    }
}

/// Intrinsic value plus a linear time value, with an optional hedge
///
/// The up leg pays `(spot - strike) / spot` of its notional above the strike,
/// the down leg `(strike - spot) / strike` below it. The premium rate of each
/// leg is its payoff rate plus `volatility * time_left * time_value`, marked
/// up by utilization and capped at the whole notional.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntrinsicPricer {
    pub time_value: u128,
    pub utilization_markup: u128,
    /// Fraction of the net up-minus-down notional hedged in side tokens
    pub hedge_ratio: u128,
}

impl PricingModel for IntrinsicPricer {
    fn price_and_delta(&self, params: &PricingParams) -> Result<Pricing> {
        let (spot, strike) = (params.spot, params.strike);
        if spot == 0 || strike == 0 {
            return Err(Error::Collaborator("pricing needs a positive spot and strike".into()));
        }
        let payoff_perc = Amount {
            up: if spot > strike { wdiv(spot - strike, spot)? } else { 0 },
            down: if strike > spot { wdiv(strike - spot, strike)? } else { 0 },
        };

        let time_left = if params.epoch_length == 0 {
            0
        } else {
            wdiv(params.time_to_expiry as u128, params.epoch_length as u128)?
        };
        let time_rate = wmul(wmul(params.volatility, time_left)?, self.time_value)?;
        let markup = wmul(params.utilization, self.utilization_markup)?;
        let leg_rate = |payoff: u128| -> Result<u128> {
            let rate = add(payoff, time_rate)?;
            Ok(add(rate, wmul(rate, markup)?)?.min(WAD))
        };
        let premium = add(
            wmul(params.amount.up, leg_rate(payoff_perc.up)?)?,
            wmul(params.amount.down, leg_rate(payoff_perc.down)?)?,
        )?;

        let net_up = to_signed(params.amount.up)? - to_signed(params.amount.down)?;
        let hedged_base = wmul(net_up.unsigned_abs(), self.hedge_ratio)?;
        let side_units = mul_div_floor(
            mul_div_floor(hedged_base, unit(params.side_decimals)?, unit(params.base_decimals)?)?,
            WAD,
            spot,
        )?;
        let mut hedge_delta = to_signed(side_units)?;
        if (net_up < 0) == params.is_buy {
            hedge_delta = -hedge_delta;
        }

        Ok(Pricing {
            premium,
            payoff_perc,
            hedge_delta,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeeParams {
    #[serde(with = "wad")]
    pub notional_rate: u128,
    #[serde(with = "wad")]
    pub premium_cap: u128,
    #[serde(with = "wad")]
    pub min_fee: u128,
    #[serde(with = "wad")]
    pub expired_rate: u128,
}

impl Default for FeeParams {
    fn default() -> Self {
        Self {
            notional_rate: WAD / 2_000,
            premium_cap: WAD / 8,
            min_fee: 0,
            expired_rate: WAD / 4_000,
        }
    }
}

/// Parameters of the reference collaborators
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Initial side price in base
    #[serde(with = "wad")]
    pub price: u128,
    /// Seconds a price stays fresh
    pub oracle_max_delay: u64,
    #[serde(with = "wad")]
    pub swap_fee: u128,
    #[serde(with = "wad")]
    pub swap_slippage: u128,
    #[serde(with = "wad")]
    pub volatility: u128,
    #[serde(with = "wad")]
    pub rate: u128,
    #[serde(with = "wad")]
    pub time_value: u128,
    #[serde(with = "wad")]
    pub utilization_markup: u128,
    #[serde(with = "wad")]
    pub hedge_ratio: u128,
    pub fee_account: AccountId,
    pub fees: FeeParams,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            price: 2_000 * WAD,
            oracle_max_delay: HOUR,
            swap_fee: 0,
            swap_slippage: WAD / 100,
            volatility: WAD / 2,
            rate: WAD / 50,
            time_value: WAD / 10,
            utilization_markup: WAD / 10,
            hedge_ratio: 0,
            fee_account: AccountId::from_label("fees"),
            fees: FeeParams::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.price == 0 {
            return Err(Error::InvalidConfig("price must be positive".into()));
        }
        if self.swap_fee >= WAD {
            return Err(Error::InvalidConfig("swap_fee must be below 1".into()));
        }
        if self.fee_account.is_zero() {
            return Err(Error::InvalidConfig("fee_account must be set".into()));
        }
        Ok(())
    }

    /// Wire the reference collaborators to a fresh feed published at `now`
    pub fn build(&self, market: &MarketConfig, now: u64) -> (PriceFeed, Externals) {
        let feed = PriceFeed::new(self.price, now);
        let externals = Externals {
            price_oracle: Box::new(FeedOracle::new(feed.clone(), self.oracle_max_delay)),
            market_oracle: Box::new(StaticMarketOracle {
                volatility: self.volatility,
                rate: self.rate,
            }),
            exchange: Box::new(
                FeedExchange::new(feed.clone(), market.base_decimals, market.side_decimals)
                    .with_fees(self.swap_fee, self.swap_slippage),
            ),
            fee_manager: Box::new(FlatFeeManager::new(self.fee_account, &self.fees)),
            pricer: Box::new(IntrinsicPricer {
                time_value: self.time_value,
                utilization_markup: self.utilization_markup,
                hedge_ratio: self.hedge_ratio,
            }),
        };
        (feed, externals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC: u128 = 1_000_000;

    fn exchange(fee: u128) -> FeedExchange {
        FeedExchange::new(PriceFeed::new(2_000 * WAD, 0), 6, 18).with_fees(fee, WAD / 100)
    }

    #[test]
    fn test_oracle_staleness() {
        let feed = PriceFeed::new(2_000 * WAD, 100);
        let oracle = FeedOracle::new(feed.clone(), 60);
        assert_eq!(oracle.get_price(Asset::Side, Asset::Base, 160).unwrap(), 2_000 * WAD);
        assert_eq!(oracle.get_price(Asset::Base, Asset::Side, 100).unwrap(), WAD / 2_000);
        assert_eq!(oracle.get_price(Asset::Side, Asset::Base, 161), Err(Error::StalePrice));

        feed.set(2_500 * WAD, 200);
        assert_eq!(oracle.get_price(Asset::Side, Asset::Base, 200).unwrap(), 2_500 * WAD);
    }

    #[test]
    fn test_exchange_quotes() {
        let ex = exchange(0);
        assert_eq!(ex.get_output_amount(Asset::Side, Asset::Base, WAD).unwrap(), 2_000 * USDC);
        assert_eq!(ex.get_output_amount(Asset::Base, Asset::Side, 500 * USDC).unwrap(), WAD / 4);
        assert_eq!(ex.get_input_amount(Asset::Side, Asset::Base, 500 * USDC).unwrap(), WAD / 4);
        assert_eq!(ex.get_input_amount_max(Asset::Side, Asset::Base, 500 * USDC).unwrap(), WAD / 4 + WAD / 400);
    }

    #[test]
    fn test_exchange_fee_rounds_against_trader() {
        // 1% fee
        let ex = exchange(WAD / 100);
        assert_eq!(ex.get_output_amount(Asset::Side, Asset::Base, WAD).unwrap(), 1_980 * USDC);
        let input = ex.get_input_amount(Asset::Side, Asset::Base, 1_980 * USDC).unwrap();
        assert_eq!(input, WAD);
        assert!(ex.get_input_amount(Asset::Side, Asset::Base, 1_980 * USDC + 1).unwrap() > WAD);
    }

    #[test]
    fn test_swaps_move_bank_balances() {
        let mut ex = exchange(0);
        let mut bank = Bank::new();
        let vault = AccountId::from_label("vault");
        bank.mint(Asset::Base, vault, 1_000 * USDC).unwrap();

        let spent = ex
            .swap_out(&mut bank, vault, Asset::Base, Asset::Side, WAD / 4, 600 * USDC)
            .unwrap();
        assert_eq!(spent, 500 * USDC);
        assert_eq!(bank.balance_of(Asset::Side, &vault), WAD / 4);

        let received = ex.swap_in(&mut bank, vault, Asset::Side, Asset::Base, WAD / 4).unwrap();
        assert_eq!(received, 500 * USDC);
        assert_eq!(bank.balance_of(Asset::Base, &vault), 1_000 * USDC);

        assert!(matches!(
            ex.swap_out(&mut bank, vault, Asset::Base, Asset::Side, WAD, 1),
            Err(Error::Collaborator(_))
        ));
    }

    #[test]
    fn test_fee_manager() {
        let params = FeeParams {
            notional_rate: WAD / 1_000,
            premium_cap: WAD / 10,
            min_fee: WAD / 2,
            expired_rate: WAD / 2_000,
        };
        let fees = FlatFeeManager::new(AccountId::from_label("fees"), &params);
        // 0.1% of 10_000 = 10, capped at 10% of 50 = 5, floor 0.5
        let fee = fees.calculate_trade_fee(10_000 * USDC, 50 * USDC, 6, false).unwrap();
        assert_eq!(fee, TradeFee { fee: 5 * USDC, min_fee: USDC / 2 });
        assert_eq!(fee.charged(), 5 * USDC);

        let fee = fees.calculate_trade_fee(10_000 * USDC, 0, 6, true).unwrap();
        assert_eq!(fee.charged(), 5 * USDC);
    }

    #[test]
    fn test_intrinsic_pricer() {
        let pricer = IntrinsicPricer {
            time_value: 0,
            utilization_markup: 0,
            hedge_ratio: WAD / 2,
        };
        let params = PricingParams {
            strike: 2_000 * WAD,
            spot: 2_500 * WAD,
            amount: Amount::new(1_000 * USDC, 500 * USDC),
            is_buy: true,
            base_decimals: 6,
            side_decimals: 18,
            epoch_length: 86_400,
            ..PricingParams::default()
        };
        let pricing = pricer.price_and_delta(&params).unwrap();
        // Up leg pays 500 / 2500 = 20% of notional
        assert_eq!(pricing.payoff_perc, Amount::new(WAD / 5, 0));
        assert_eq!(pricing.premium, 200 * USDC);
        // Half of 500 net up notional, in side at 2500
        assert_eq!(pricing.hedge_delta, (WAD / 10) as i128);

        let sell = pricer.price_and_delta(&PricingParams { is_buy: false, ..params }).unwrap();
        assert_eq!(sell.hedge_delta, -((WAD / 10) as i128));
    }
}
