//! Scenario replay against a market wired to the reference collaborators

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use vault_model::dvp::{BurnOrder, MintOrder};
use vault_model::sim::PriceFeed;
use vault_model::{AccountId, AdminCap, Amount, Event, Market, MarketSummary, RollerCap};

use crate::config::{Action, Scenario};
use crate::report::{format_timestamp, format_units};

/// Why a step could not be carried out
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Market(#[from] vault_model::Error),

    #[error("strike index {index} out of range ({open} strikes open)")]
    UnknownStrike { index: usize, open: usize },

    #[error("no epoch {0} rolls back")]
    UnknownEpoch(usize),

    #[error("{account} holds no position in epoch {epoch}")]
    NoPosition { account: String, epoch: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: &'static str,
    pub time: String,
    pub passed: bool,
    pub detail: String,
}

/// State of the vault right after a roll
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub closed: u64,
    pub closed_at: String,
    pub current: u64,
    pub share_price: Option<u128>,
    pub locked_liquidity: u128,
    pub base_balance: u128,
    pub side_balance: u128,
    pub pending_withdrawals: u128,
    pub pending_payoffs: u128,
    pub shortfall: u128,
    pub strikes: Vec<u128>,
    pub dead: bool,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub steps: Vec<StepRecord>,
    pub epochs: Vec<EpochReport>,
    pub events: Vec<Event>,
    pub summary: MarketSummary,
    pub failures: usize,
}

pub struct Runner {
    market: Market,
    admin: AdminCap,
    roller: RollerCap,
    feed: PriceFeed,
    /// Epochs opened by successful rolls, oldest first
    epochs: Vec<u64>,
    decimals: u8,
}

impl Runner {
    pub fn new(scenario: &Scenario) -> Result<Self> {
        let (feed, externals) = scenario.sim.build(&scenario.market, scenario.market.genesis);
        let (market, admin, roller) =
            Market::new(scenario.market.clone(), externals).context("Failed to create market")?;
        Ok(Self {
            market,
            admin,
            roller,
            feed,
            epochs: Vec::new(),
            decimals: scenario.market.base_decimals,
        })
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    /// Replay every step; stops at the first failure unless `keep_going`
    pub fn run(mut self, scenario: &Scenario, keep_going: bool) -> Result<RunReport> {
        let mut steps = Vec::with_capacity(scenario.steps.len());
        let mut epochs = Vec::new();
        let mut events = Vec::new();
        let mut failures = 0;

        for (index, step) in scenario.steps.iter().enumerate() {
            let index = index + 1;
            let result = self.apply(&step.action);
            let (passed, detail) = match (result, step.expect_error.as_deref()) {
                (Ok(detail), None) => (true, detail),
                (Ok(detail), Some(expected)) => (false, format!("expected failure '{expected}', got: {detail}")),
                (Err(e), Some(expected)) if e.to_string().contains(expected) => (true, format!("failed as expected: {e}")),
                (Err(e), Some(expected)) => (false, format!("expected '{expected}', got: {e}")),
                (Err(e), None) => (false, e.to_string()),
            };
            debug!("step {index} {}: passed={passed} {detail}", step.action.name());

            if passed && matches!(step.action, Action::Roll) && step.expect_error.is_none() {
                epochs.push(self.epoch_report());
            }
            events.extend(self.market.take_events());
            steps.push(StepRecord {
                index,
                action: step.action.name(),
                time: format_timestamp(self.market.now()),
                passed,
                detail,
            });

            if !passed {
                failures += 1;
                warn!("step {index} failed");
                if !keep_going {
                    break;
                }
            }
        }

        let summary = self.market.summary().context("Failed to summarize market")?;
        Ok(RunReport {
            scenario: scenario.name.clone(),
            steps,
            epochs,
            events,
            summary,
            failures,
        })
    }

    fn units(&self, value: u128) -> String {
        format_units(value, self.decimals)
    }

    fn apply(&mut self, action: &Action) -> Result<String, StepError> {
        let now = self.market.now();
        match action {
            Action::Fund { account, asset, amount } => {
                self.market.fund(id(account), *asset, *amount)?;
                Ok(format!("{account} credited {amount} {asset:?}"))
            }
            Action::Deposit { account, amount, receiver } => {
                let receiver = receiver.as_deref().unwrap_or(account);
                self.market.deposit(id(account), *amount, id(receiver))?;
                Ok(format!("{account} deposited {} for {receiver}", self.units(*amount)))
            }
            Action::Redeem { account, shares } => {
                let shares = match shares {
                    Some(shares) => self.market.redeem(id(account), *shares)?,
                    None => self.market.redeem_max(id(account))?,
                };
                Ok(format!("{account} redeemed {} shares", self.units(shares)))
            }
            Action::InitiateWithdraw { account, shares } => {
                let shares = match shares {
                    Some(shares) => self.market.initiate_withdraw(id(account), *shares)?,
                    None => self.market.initiate_withdraw_max(id(account))?,
                };
                Ok(format!("{account} locked {} shares", self.units(shares)))
            }
            Action::CompleteWithdraw { account } => {
                let amount = self.market.complete_withdraw(id(account))?;
                Ok(format!("{account} withdrew {}", self.units(amount)))
            }
            Action::TransferShares { from, to, shares } => {
                self.market.transfer_shares(id(from), id(to), *shares)?;
                Ok(format!("{from} sent {} shares to {to}", self.units(*shares)))
            }
            Action::Mint {
                account,
                strike,
                up,
                down,
                slippage,
            } => {
                let strikes = self.market.strikes();
                let strike = *strikes.get(*strike).ok_or(StepError::UnknownStrike {
                    index: *strike,
                    open: strikes.len(),
                })?;
                let amount = Amount::new(*up, *down);
                let quote = self.market.premium(strike, &amount)?;
                let order = MintOrder {
                    recipient: id(account),
                    strike,
                    amount,
                    expected_premium: quote.premium + quote.fee,
                    max_slippage: *slippage,
                };
                let trade = self.market.mint(id(account), &order)?;
                Ok(format!(
                    "{account} bought {}/{} at strike {} for {} (fee {})",
                    self.units(*up),
                    self.units(*down),
                    vault_model::config::format_wad(strike),
                    self.units(trade.premium),
                    self.units(trade.fee)
                ))
            }
            Action::Burn {
                account,
                epochs_ago,
                up,
                down,
                slippage,
            } => {
                let epoch = self.epoch_ago(*epochs_ago)?;
                let owner = id(account);
                let position = self
                    .market
                    .dvp()
                    .positions()
                    .of_owner(&owner)
                    .find(|pos| pos.epoch == epoch)
                    .copied()
                    .ok_or_else(|| StepError::NoPosition {
                        account: account.clone(),
                        epoch,
                    })?;
                let amount = match (up, down) {
                    (None, None) => position.amount(),
                    (up, down) => Amount::new(up.unwrap_or(0), down.unwrap_or(0)),
                };
                let (expected, _) = self.market.payoff(epoch, position.strike, &amount)?;
                let order = BurnOrder {
                    epoch,
                    recipient: owner,
                    strike: position.strike,
                    amount,
                    expected_market_value: expected,
                    max_slippage: *slippage,
                };
                let trade = self.market.burn(owner, &order)?;
                Ok(format!(
                    "{account} sold {}/{} for {} (fee {})",
                    self.units(amount.up),
                    self.units(amount.down),
                    self.units(trade.premium),
                    self.units(trade.fee)
                ))
            }
            Action::Roll => {
                let epoch = *self.market.epoch();
                if epoch.is_initialized() && now < epoch.current {
                    self.market.set_time(epoch.current)?;
                }
                self.feed.set(self.feed.price(), self.market.now());
                self.market.roll_epoch(&self.roller)?;
                let current = self.market.epoch().current;
                self.epochs.push(current);
                Ok(format!("epoch {} opened", format_timestamp(current)))
            }
            Action::SetPrice { price } => {
                self.feed.set(*price, now);
                Ok(format!("price {}", vault_model::config::format_wad(*price)))
            }
            Action::AdvanceTime { seconds, refresh_price } => {
                self.market.advance_time(*seconds)?;
                if *refresh_price {
                    self.feed.set(self.feed.price(), self.market.now());
                }
                Ok(format!("clock at {}", format_timestamp(self.market.now())))
            }
            Action::SetMaxDeposit { amount } => {
                self.market.set_max_deposit(&self.admin, *amount)?;
                Ok(format!("max deposit {}", self.units(*amount)))
            }
            Action::Kill => {
                self.market.kill_vault(&self.admin)?;
                Ok("vault killed".to_string())
            }
            Action::EmergencyRebalance => {
                let (sold, received) = self.market.emergency_rebalance(&self.admin)?;
                Ok(format!("sold {sold} side for {}", self.units(received)))
            }
            Action::Rescue { account } => {
                let rescue = self.market.rescue(id(account))?;
                Ok(format!(
                    "{account} refunded {}, {} shares paid {}",
                    self.units(rescue.refunded),
                    self.units(rescue.shares),
                    self.units(rescue.amount)
                ))
            }
        }
    }

    fn epoch_ago(&self, epochs_ago: usize) -> Result<u64, StepError> {
        if epochs_ago == 0 {
            return Ok(self.market.epoch().current);
        }
        self.epochs
            .len()
            .checked_sub(epochs_ago + 1)
            .map(|index| self.epochs[index])
            .ok_or(StepError::UnknownEpoch(epochs_ago))
    }

    fn epoch_report(&self) -> EpochReport {
        let epoch = self.market.epoch();
        let state = self.market.vault_state();
        let (base_balance, side_balance) = self.market.balances();
        EpochReport {
            closed: epoch.previous,
            closed_at: format_timestamp(epoch.previous),
            current: epoch.current,
            share_price: self.market.epoch_price_per_share(epoch.previous),
            locked_liquidity: state.liquidity.locked_initially,
            base_balance,
            side_balance,
            pending_withdrawals: state.liquidity.pending_withdrawals,
            pending_payoffs: state.liquidity.pending_payoffs,
            shortfall: state.liquidity.shortfall,
            strikes: self.market.strikes().to_vec(),
            dead: state.dead,
        }
    }
}

fn id(label: &str) -> AccountId {
    AccountId::from_label(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_scenario, SAMPLE_SCENARIO};

    #[test]
    fn test_sample_scenario_runs_clean() {
        let scenario = parse_scenario(SAMPLE_SCENARIO).unwrap();
        let report = Runner::new(&scenario).unwrap().run(&scenario, false).unwrap();

        assert_eq!(report.failures, 0, "{:#?}", report.steps);
        assert_eq!(report.steps.len(), scenario.steps.len());
        assert_eq!(report.epochs.len(), 3);
        assert!(report.epochs.iter().all(|epoch| !epoch.dead && epoch.shortfall == 0));
        assert!(report.events.iter().any(|e| matches!(e, Event::Burn { .. })));
        assert_eq!(report.summary.epoch.roll_count, 3);
    }

    #[test]
    fn test_unexpected_failure_stops_the_run() {
        let scenario = parse_scenario(
            r#"
            name = "stops"

            [[steps]]
            action = "complete-withdraw"
            account = "alice"

            [[steps]]
            action = "roll"
            "#,
        )
        .unwrap();
        let report = Runner::new(&scenario).unwrap().run(&scenario, false).unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.steps.len(), 1);
        assert!(report.steps[0].detail.contains("no withdrawal initiated"));

        let report = Runner::new(&scenario).unwrap().run(&scenario, true).unwrap();
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps[1].passed);
    }

    #[test]
    fn test_expected_error_that_does_not_happen_fails() {
        let scenario = parse_scenario(
            r#"
            name = "expectation"

            [[steps]]
            action = "roll"
            expect_error = "vault is dead"
            "#,
        )
        .unwrap();
        let report = Runner::new(&scenario).unwrap().run(&scenario, true).unwrap();
        assert_eq!(report.failures, 1);
        assert!(report.epochs.is_empty());
    }

    #[test]
    fn test_burn_of_unknown_epoch() {
        let scenario = parse_scenario(
            r#"
            name = "burn"

            [[steps]]
            action = "roll"

            [[steps]]
            action = "burn"
            account = "trader"
            epochs_ago = 3
            expect_error = "no epoch 3 rolls back"
            "#,
        )
        .unwrap();
        let runner = Runner::new(&scenario).unwrap();
        assert_eq!(runner.market().now(), scenario.market.genesis);
        let report = runner.run(&scenario, false).unwrap();
        assert_eq!(report.failures, 0, "{:#?}", report.steps);
    }
}
