//! Interfaces of the external collaborators
//!
//! The ledger core never prices, quotes or charges anything by itself. It
//! consumes these traits and treats every implementation as untrusted: each
//! call happens after the internal counters it could observe are final.

use crate::epoch::Frequency;
use crate::error::Result;
use crate::notional::Amount;
use crate::token::{AccountId, Asset, Bank};

/// Spot prices
pub trait PriceOracle {
    /// Price of one `token` expressed in `numeraire` (WAD)
    ///
    /// Fails with [`crate::Error::StalePrice`] when the last update is older
    /// than the oracle's tolerated delay.
    fn get_price(&self, token: Asset, numeraire: Asset, now: u64) -> Result<u128>;
}

/// Volatility and rates used by the pricing model
pub trait MarketOracle {
    /// Annualized implied volatility at `strike` (WAD)
    fn implied_volatility(&self, strike: u128, frequency: Frequency) -> Result<u128>;

    /// Annualized risk-free rate (WAD)
    fn risk_free_rate(&self) -> Result<u128>;
}

/// Swap venue between the two pool assets
///
/// Quotes are exact; `get_input_amount_max` adds the venue's slippage
/// allowance and is the bound passed to `swap_out`.
pub trait Exchange {
    fn get_output_amount(&self, token_in: Asset, token_out: Asset, amount_in: u128) -> Result<u128>;

    fn get_input_amount(&self, token_in: Asset, token_out: Asset, amount_out: u128) -> Result<u128>;

    fn get_input_amount_max(&self, token_in: Asset, token_out: Asset, amount_out: u128) -> Result<u128>;

    /// Sell exactly `amount_in` of `token_in` held by `payer`; returns the output
    fn swap_in(
        &mut self,
        bank: &mut Bank,
        payer: AccountId,
        token_in: Asset,
        token_out: Asset,
        amount_in: u128,
    ) -> Result<u128>;

    /// Buy exactly `amount_out` of `token_out`, spending at most `max_in`;
    /// returns the input spent
    fn swap_out(
        &mut self,
        bank: &mut Bank,
        payer: AccountId,
        token_in: Asset,
        token_out: Asset,
        amount_out: u128,
        max_in: u128,
    ) -> Result<u128>;
}

/// Fee quote for a trade
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TradeFee {
    pub fee: u128,
    pub min_fee: u128,
}

impl TradeFee {
    /// Amount actually charged
    pub fn charged(&self) -> u128 {
        self.fee.max(self.min_fee)
    }
}

pub trait FeeManager {
    /// Fee on a trade of `notional` for `premium`, both in `decimals`
    fn calculate_trade_fee(&self, notional: u128, premium: u128, decimals: u8, expired: bool) -> Result<TradeFee>;

    /// Account collecting the fees
    fn account(&self) -> AccountId;

    /// Notification that `amount` was transferred to [`FeeManager::account`]
    fn receive_fee(&mut self, amount: u128) -> Result<()>;
}

/// Inputs of the option pricing function
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PricingParams {
    pub strike: u128,
    /// Side price in base (WAD)
    pub spot: u128,
    /// Traded notional (base decimals)
    pub amount: Amount,
    /// Used notional at the strike after the trade (base decimals)
    pub used_after: Amount,
    /// Post-trade utilization of the strike (WAD)
    pub utilization: u128,
    pub time_to_expiry: u64,
    pub epoch_length: u64,
    pub volatility: u128,
    pub rate: u128,
    pub is_buy: bool,
    /// Side tokens held by the vault
    pub side_balance: u128,
    pub base_decimals: u8,
    pub side_decimals: u8,
}

/// Output of the option pricing function
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pricing {
    /// Premium for `amount` (base decimals)
    pub premium: u128,
    /// Payoff owed per unit of notional, per side (WAD)
    pub payoff_perc: Amount,
    /// Side tokens the vault should buy (positive) or sell (negative)
    pub hedge_delta: i128,
}

/// `priceAndDelta` as a pure function of its parameters
pub trait PricingModel {
    fn price_and_delta(&self, params: &PricingParams) -> Result<Pricing>;
}

/// The full set of collaborators a market is wired to
pub struct Externals {
    pub price_oracle: Box<dyn PriceOracle>,
    pub market_oracle: Box<dyn MarketOracle>,
    pub exchange: Box<dyn Exchange>,
    pub fee_manager: Box<dyn FeeManager>,
    pub pricer: Box<dyn PricingModel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_fee_charges_minimum() {
        assert_eq!(TradeFee { fee: 3, min_fee: 10 }.charged(), 10);
        assert_eq!(TradeFee { fee: 30, min_fee: 10 }.charged(), 30);
    }
}
