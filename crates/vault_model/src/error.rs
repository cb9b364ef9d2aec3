//! Error taxonomy shared by the vault, the DVP and the collaborators

use thiserror::Error;

use crate::token::Asset;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    // ========================================
    // Input validation
    // ========================================
    #[error("amount is zero")]
    AmountZero,

    #[error("zero account identity")]
    AddressZero,

    #[error("the vault custody account cannot act as a user")]
    VaultAccount,

    // ========================================
    // Capacity / availability
    // ========================================
    #[error("deposit would exceed the vault cap")]
    ExceedsMaxDeposit,

    #[error("requested more than available")]
    ExceedsAvailable,

    #[error("not enough notional liquidity at strike")]
    NotEnoughLiquidity,

    #[error("position not found")]
    PositionNotFound,

    #[error("cannot burn more than minted")]
    CantBurnMoreThanMinted,

    #[error("insufficient {asset:?} balance")]
    InsufficientBalance { asset: Asset },

    // ========================================
    // Temporal
    // ========================================
    #[error("epoch not finished")]
    EpochNotFinished,

    #[error("epoch finished, roll required")]
    EpochFinished,

    #[error("unsupported epoch frequency: {0}s")]
    UnsupportedFrequency(u64),

    #[error("a withdrawal from a previous epoch must be completed first")]
    ExistingIncompleteWithdraw,

    #[error("no withdrawal initiated")]
    WithdrawNotInitiated,

    #[error("withdrawal can be completed only after the epoch roll")]
    WithdrawTooEarly,

    #[error("price is stale")]
    StalePrice,

    // ========================================
    // Solvency
    // ========================================
    #[error("insufficient liquidity: {0}")]
    InsufficientLiquidity(&'static str),

    #[error("market value slipped beyond tolerance")]
    SlippedMarketValue,

    // ========================================
    // Access
    // ========================================
    #[error("capability was issued by another market")]
    ForeignCapability,

    // ========================================
    // Lifecycle
    // ========================================
    #[error("vault is dead")]
    VaultDead,

    #[error("vault is not dead")]
    VaultNotDead,

    #[error("nothing to rescue")]
    NothingToRescue,

    #[error("no share price recorded for epoch {0}")]
    MissingSharePrice(u64),

    // ========================================
    // Arithmetic
    // ========================================
    #[error("arithmetic overflow")]
    Overflow,

    #[error("arithmetic underflow")]
    Underflow,

    #[error("division by zero")]
    DivisionByZero,

    // ========================================
    // Collaborators / configuration
    // ========================================
    #[error("collaborator failure: {0}")]
    Collaborator(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = core::result::Result<T, Error>;
