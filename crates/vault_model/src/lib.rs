//! Epoch vault and DVP position ledger
//!
//! This crate models a pooled-liquidity vault that settles deposits and
//! withdrawals at fixed epoch boundaries, paired with a derivative-position
//! engine (DVP) that mints and burns option-like positions against the pool.
//!
//! The core guarantees:
//! 1. No asset is created: vault custody always covers pending deposits,
//!    pending withdrawals, reserved payoffs and locked liquidity
//! 2. Nobody is paid from another user's reserved funds
//! 3. Every operation is atomic: a failed call leaves no trace
//! 4. Expired positions share their reserved payoff pro rata, exhausting it
//!    exactly once every position is closed
//!
//! Prices, volatility, swaps, fees and option math are consumed through the
//! collaborator traits in [`collaborators`]; [`sim`] ships reference
//! implementations used by the scenario harness and the tests.

#![forbid(unsafe_code)]

pub mod collaborators;
pub mod config;
pub mod dvp;
pub mod epoch;
pub mod error;
pub mod events;
pub mod market;
pub mod math;
pub mod notional;
pub mod position;
pub mod receipt;
pub mod sim;
pub mod token;
pub mod vault;

pub use collaborators::*;
pub use config::{Allocation, MarketConfig};
pub use dvp::Dvp;
pub use epoch::{Epoch, Frequency};
pub use error::{Error, Result};
pub use events::Event;
pub use market::{AdminCap, Market, MarketSummary, RollerCap};
pub use notional::Amount;
pub use token::{AccountId, Asset, Bank, TokenLedger};
pub use vault::Vault;
