//! Events emitted by committed operations

use serde::Serialize;

use crate::notional::Amount;
use crate::token::AccountId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Deposit {
        epoch: u64,
        caller: AccountId,
        receiver: AccountId,
        amount: u128,
    },
    Redeem {
        account: AccountId,
        shares: u128,
    },
    WithdrawInitiated {
        epoch: u64,
        account: AccountId,
        shares: u128,
    },
    WithdrawCompleted {
        account: AccountId,
        shares: u128,
        amount: u128,
    },
    Mint {
        epoch: u64,
        payer: AccountId,
        recipient: AccountId,
        strike: u128,
        amount: Amount,
        premium: u128,
        fee: u128,
    },
    Burn {
        epoch: u64,
        owner: AccountId,
        recipient: AccountId,
        strike: u128,
        amount: Amount,
        paid: u128,
        fee: u128,
    },
    EpochRolled {
        closed: u64,
        current: u64,
        share_price: u128,
        locked_liquidity: u128,
    },
    ShareTransfer {
        from: AccountId,
        to: AccountId,
        shares: u128,
    },
    MaxDepositChanged {
        amount: u128,
    },
    VaultKilled,
    VaultDead {
        epoch: u64,
    },
    Rescue {
        account: AccountId,
        refunded: u128,
        shares: u128,
        amount: u128,
    },
    EmergencyRebalance {
        sold: u128,
        received: u128,
    },
}
