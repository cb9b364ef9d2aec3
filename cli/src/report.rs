//! Human-readable and JSON output of a scenario run

use anyhow::{Context, Result};
use chrono::DateTime;
use colored::Colorize;
use std::fs;
use std::path::Path;

use crate::scenario::{EpochReport, RunReport};

/// Render `value` with `decimals` fractional digits, trailing zeros trimmed
pub fn format_units(value: u128, decimals: u8) -> String {
    let scale = 10u128.pow(decimals as u32);
    let (whole, frac) = (value / scale, value % scale);
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:0width$}", width = decimals as usize);
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// UTC rendering of a unix timestamp; "-" for the unset epoch 0
pub fn format_timestamp(ts: u64) -> String {
    if ts == 0 {
        return "-".to_string();
    }
    match i64::try_from(ts).ok().and_then(|secs| DateTime::from_timestamp(secs, 0)) {
        Some(time) => time.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => ts.to_string(),
    }
}

pub fn print_report(report: &RunReport, decimals: u8) {
    println!("{}", format!("=== Scenario: {} ===", report.scenario).bright_green().bold());

    println!("\n{}", "Steps:".bright_yellow());
    for step in &report.steps {
        let mark = if step.passed { "✓".bright_green() } else { "✗".bright_red() };
        println!(
            "  {} {:>3} {:<20} {} {}",
            mark,
            step.index,
            step.action.bright_cyan(),
            step.time.dimmed(),
            step.detail
        );
    }

    if !report.epochs.is_empty() {
        println!("\n{}", "Epochs:".bright_yellow());
        for epoch in &report.epochs {
            print_epoch(epoch, decimals);
        }
    }

    let summary = &report.summary;
    println!("\n{}", "Final state:".bright_yellow());
    println!("  {} {}", "Clock:".bright_cyan(), format_timestamp(summary.now));
    println!("  {} {}", "Epoch ends:".bright_cyan(), format_timestamp(summary.epoch.current));
    println!("  {} {}", "Base balance:".bright_cyan(), format_units(summary.base_balance, decimals));
    println!("  {} {}", "Side balance:".bright_cyan(), summary.side_balance);
    println!("  {} {}", "Share supply:".bright_cyan(), format_units(summary.share_supply, decimals));
    println!(
        "  {} {}/{} of {}/{}",
        "Notional used:".bright_cyan(),
        format_units(summary.notional_used.up, decimals),
        format_units(summary.notional_used.down, decimals),
        format_units(summary.notional_initial.up, decimals),
        format_units(summary.notional_initial.down, decimals)
    );
    if summary.vault.dead {
        println!("  {}", "Vault is dead".bright_red());
    }

    println!();
    if report.failures == 0 {
        println!("{} {} steps passed", "✓".bright_green(), report.steps.len());
    } else {
        println!("{} {} of {} steps failed", "✗".bright_red(), report.failures, report.steps.len());
    }
}

fn print_epoch(epoch: &EpochReport, decimals: u8) {
    let price = match epoch.share_price {
        Some(price) => format_units(price, decimals),
        None => "-".to_string(),
    };
    println!(
        "  {} {} {} {}",
        "├─".dimmed(),
        "closed".bright_cyan(),
        epoch.closed_at,
        format!("share price {price}").bold()
    );
    println!(
        "  {}   locked {}, base {}, side {}",
        "│".dimmed(),
        format_units(epoch.locked_liquidity, decimals),
        format_units(epoch.base_balance, decimals),
        epoch.side_balance
    );
    println!(
        "  {}   reserved withdrawals {}, payoffs {}",
        "│".dimmed(),
        format_units(epoch.pending_withdrawals, decimals),
        format_units(epoch.pending_payoffs, decimals)
    );
    if epoch.shortfall > 0 {
        println!(
            "  {}   {}",
            "│".dimmed(),
            format!("shortfall {}", format_units(epoch.shortfall, decimals)).yellow()
        );
    }
    if epoch.dead {
        println!("  {}   {}", "│".dimmed(), "vault died".bright_red());
    }
}

pub fn write_json(report: &RunReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))
}
