//! Scenario files: market and collaborator parameters plus a list of steps

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use vault_model::config::{amount, wad};
use vault_model::sim::SimConfig;
use vault_model::{Asset, MarketConfig};

/// Scenario shipped with the binary (`vaultsim sample`)
pub const SAMPLE_SCENARIO: &str = include_str!("../scenarios/weekly.toml");

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One scenario step; `expect_error` turns it into a negative check that
/// passes only if the action fails with a message containing that text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    /// Credit an account out of thin air
    Fund {
        account: String,
        #[serde(default = "default_asset")]
        asset: Asset,
        #[serde(with = "amount")]
        amount: u128,
    },
    Deposit {
        account: String,
        #[serde(with = "amount")]
        amount: u128,
        /// Defaults to the depositing account
        #[serde(default)]
        receiver: Option<String>,
    },
    /// Claim owed shares; all of them when `shares` is omitted
    Redeem {
        account: String,
        #[serde(default, with = "optional_amount")]
        shares: Option<u128>,
    },
    /// Lock shares for withdrawal; all of them when `shares` is omitted
    InitiateWithdraw {
        account: String,
        #[serde(default, with = "optional_amount")]
        shares: Option<u128>,
    },
    CompleteWithdraw {
        account: String,
    },
    TransferShares {
        from: String,
        to: String,
        #[serde(with = "amount")]
        shares: u128,
    },
    /// Buy a position at one of the current strikes (index into the list)
    Mint {
        account: String,
        #[serde(default)]
        strike: usize,
        #[serde(default, with = "amount")]
        up: u128,
        #[serde(default, with = "amount")]
        down: u128,
        #[serde(default = "default_slippage", with = "wad")]
        slippage: u128,
    },
    /// Sell a position; the whole position when neither leg is given
    Burn {
        account: String,
        /// 0 for the current epoch, 1 for the one before, ...
        #[serde(default)]
        epochs_ago: usize,
        #[serde(default, with = "optional_amount")]
        up: Option<u128>,
        #[serde(default, with = "optional_amount")]
        down: Option<u128>,
        #[serde(default = "default_slippage", with = "wad")]
        slippage: u128,
    },
    /// Move to the end of the epoch and roll it
    Roll,
    SetPrice {
        #[serde(with = "wad")]
        price: u128,
    },
    AdvanceTime {
        seconds: u64,
        /// Republish the current price at the new time
        #[serde(default = "default_true")]
        refresh_price: bool,
    },
    SetMaxDeposit {
        #[serde(with = "amount")]
        amount: u128,
    },
    Kill,
    EmergencyRebalance,
    Rescue {
        account: String,
    },
}

fn default_asset() -> Asset {
    Asset::Base
}

fn default_slippage() -> u128 {
    vault_model::math::WAD / 100
}

fn default_true() -> bool {
    true
}

impl Action {
    /// Short label for reports
    pub fn name(&self) -> &'static str {
        match self {
            Action::Fund { .. } => "fund",
            Action::Deposit { .. } => "deposit",
            Action::Redeem { .. } => "redeem",
            Action::InitiateWithdraw { .. } => "initiate-withdraw",
            Action::CompleteWithdraw { .. } => "complete-withdraw",
            Action::TransferShares { .. } => "transfer-shares",
            Action::Mint { .. } => "mint",
            Action::Burn { .. } => "burn",
            Action::Roll => "roll",
            Action::SetPrice { .. } => "set-price",
            Action::AdvanceTime { .. } => "advance-time",
            Action::SetMaxDeposit { .. } => "set-max-deposit",
            Action::Kill => "kill",
            Action::EmergencyRebalance => "emergency-rebalance",
            Action::Rescue { .. } => "rescue",
        }
    }

    fn accounts(&self) -> Vec<&str> {
        match self {
            Action::Fund { account, .. }
            | Action::Redeem { account, .. }
            | Action::InitiateWithdraw { account, .. }
            | Action::CompleteWithdraw { account }
            | Action::Mint { account, .. }
            | Action::Burn { account, .. }
            | Action::Rescue { account } => vec![account.as_str()],
            Action::Deposit { account, receiver, .. } => {
                let mut accounts = vec![account.as_str()];
                accounts.extend(receiver.as_deref());
                accounts
            }
            Action::TransferShares { from, to, .. } => vec![from.as_str(), to.as_str()],
            _ => Vec::new(),
        }
    }
}

impl Scenario {
    pub fn validate(&self) -> Result<()> {
        self.market.validate().map_err(|e| anyhow!("[market] {e}"))?;
        self.sim.validate().map_err(|e| anyhow!("[sim] {e}"))?;
        if self.steps.is_empty() {
            bail!("Scenario '{}' has no steps", self.name);
        }
        for (index, step) in self.steps.iter().enumerate() {
            for label in step.action.accounts() {
                if label.is_empty() || label.len() > 32 {
                    bail!(
                        "Step {} ({}): account labels must be 1 to 32 bytes, got '{}'",
                        index + 1,
                        step.action.name(),
                        label
                    );
                }
            }
        }
        Ok(())
    }
}

/// Parse a scenario from TOML text
pub fn parse_scenario(text: &str) -> Result<Scenario> {
    let scenario: Scenario = toml::from_str(text).context("Failed to parse scenario TOML")?;
    scenario.validate()?;
    Ok(scenario)
}

/// Load and validate a scenario file
pub fn load_scenario(path: &Path) -> Result<Scenario> {
    if !path.exists() {
        bail!("Scenario file not found: {}", path.display());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
    parse_scenario(&text).with_context(|| format!("Invalid scenario: {}", path.display()))
}

/// `Option<u128>` counterpart of [`amount`]
mod optional_amount {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "vault_model::config::amount")] u128);

    pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => vault_model::config::amount::serialize(v, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(v)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sample_scenario_parses() {
        let scenario = parse_scenario(SAMPLE_SCENARIO).unwrap();
        assert!(!scenario.steps.is_empty());
        assert!(matches!(scenario.steps[0].action, Action::Fund { .. }));
    }

    #[test]
    fn test_step_fields() {
        let scenario = parse_scenario(
            r#"
            name = "fields"

            [market]
            max_deposit = "5_000_000_000"

            [sim]
            price = "1850.5"

            [[steps]]
            action = "deposit"
            account = "alice"
            amount = 1000000

            [[steps]]
            action = "redeem"
            account = "alice"

            [[steps]]
            action = "complete-withdraw"
            account = "alice"
            expect_error = "no withdrawal"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.market.max_deposit, 5_000_000_000);
        assert_eq!(scenario.sim.price, 1_850 * vault_model::math::WAD + vault_model::math::WAD / 2);
        assert!(matches!(
            &scenario.steps[0].action,
            Action::Deposit { amount: 1_000_000, receiver: None, .. }
        ));
        assert!(matches!(&scenario.steps[1].action, Action::Redeem { shares: None, .. }));
        assert_eq!(scenario.steps[2].expect_error.as_deref(), Some("no withdrawal"));
    }

    #[test]
    fn test_rejects_bad_scenarios() {
        assert!(parse_scenario("name = \"empty\"").is_err());
        assert!(parse_scenario(
            r#"
            name = "label"
            [[steps]]
            action = "deposit"
            account = ""
            amount = 1
            "#
        )
        .is_err());
        assert!(parse_scenario(
            r#"
            name = "market"
            [market]
            base_decimals = 19
            [[steps]]
            action = "roll"
            "#
        )
        .is_err());
    }

    #[test]
    fn test_load_scenario_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_SCENARIO.as_bytes()).unwrap();
        let scenario = load_scenario(file.path()).unwrap();
        assert_eq!(scenario.name, "weekly-sample");

        let missing = file.path().with_extension("missing");
        let err = load_scenario(&missing).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
