//! Epoch controller
//!
//! Tracks the active settlement period. Boundaries are aligned on a
//! reference timestamp so that every engine driven by the same frequency
//! expires at the same instants.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Friday 2023-04-21 08:00:00 UTC, the anchor of every epoch boundary
pub const REFERENCE_TS: u64 = 1_682_064_000;

pub const HOUR: u64 = 3_600;
pub const DAY: u64 = 24 * HOUR;
pub const WEEK: u64 = 7 * DAY;

/// Supported epoch lengths
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
    Daily,
    Weekly,
    FourWeeks,
}

impl Frequency {
    pub fn seconds(&self) -> u64 {
        match self {
            Frequency::Daily => DAY,
            Frequency::Weekly => WEEK,
            Frequency::FourWeeks => 4 * WEEK,
        }
    }
}

impl TryFrom<u64> for Frequency {
    type Error = Error;

    fn try_from(seconds: u64) -> Result<Self> {
        match seconds {
            DAY => Ok(Frequency::Daily),
            WEEK => Ok(Frequency::Weekly),
            s if s == 4 * WEEK => Ok(Frequency::FourWeeks),
            other => Err(Error::UnsupportedFrequency(other)),
        }
    }
}

/// First boundary strictly after `from`
pub fn next_expiry(from: u64, frequency: Frequency) -> Result<u64> {
    if from < REFERENCE_TS {
        return Ok(REFERENCE_TS);
    }
    let span = frequency.seconds();
    let periods = (from - REFERENCE_TS) / span + 1;
    periods
        .checked_mul(span)
        .and_then(|offset| REFERENCE_TS.checked_add(offset))
        .ok_or(Error::Overflow)
}

/// Settlement period state
///
/// `current == 0` means the controller has never been rolled; the first
/// roll is always allowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    /// Expiry timestamp of the active epoch (also its identifier)
    pub current: u64,
    /// Expiry timestamp of the last closed epoch
    pub previous: u64,
    pub frequency: Frequency,
    pub roll_count: u64,
}

impl Epoch {
    pub fn init(frequency_seconds: u64) -> Result<Self> {
        let frequency = Frequency::try_from(frequency_seconds)?;
        Ok(Self::with_frequency(frequency))
    }

    pub fn with_frequency(frequency: Frequency) -> Self {
        Self {
            current: 0,
            previous: 0,
            frequency,
            roll_count: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.current > 0
    }

    /// True once wall-clock time reached the active boundary
    pub fn is_finished(&self, now: u64) -> bool {
        self.is_initialized() && now >= self.current
    }

    pub fn time_to_next(&self, now: u64) -> u64 {
        self.current.saturating_sub(now)
    }

    /// Reject operations that must happen inside an open epoch window
    pub fn ensure_open(&self, now: u64) -> Result<()> {
        if self.is_finished(now) {
            return Err(Error::EpochFinished);
        }
        Ok(())
    }

    pub fn ensure_rollable(&self, now: u64) -> Result<()> {
        if self.is_initialized() && now < self.current {
            return Err(Error::EpochNotFinished);
        }
        Ok(())
    }

    /// Close the active epoch and open the next one
    ///
    /// If rolls were missed, the next boundary is re-aligned on `now` so the
    /// new epoch never starts already expired.
    pub fn roll(&mut self, now: u64) -> Result<()> {
        self.ensure_rollable(now)?;

        let from = if self.is_initialized() { self.current } else { now };
        let mut next = next_expiry(from, self.frequency)?;
        if next <= now {
            next = next_expiry(now, self.frequency)?;
        }

        self.previous = self.current;
        self.current = next;
        self.roll_count = self.roll_count.checked_add(1).ok_or(Error::Overflow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_rejects_unknown_frequency() {
        assert_eq!(Epoch::init(12 * HOUR), Err(Error::UnsupportedFrequency(12 * HOUR)));
        let epoch = Epoch::init(WEEK).unwrap();
        assert_eq!(epoch.frequency, Frequency::Weekly);
        assert!(!epoch.is_initialized());
    }

    #[test]
    fn test_first_roll_aligns_on_reference() {
        let mut epoch = Epoch::with_frequency(Frequency::Daily);
        let now = REFERENCE_TS + 10 * DAY + 5 * HOUR;
        epoch.roll(now).unwrap();

        assert_eq!(epoch.current, REFERENCE_TS + 11 * DAY);
        assert_eq!(epoch.previous, 0);
        assert_eq!(epoch.roll_count, 1);
        assert_eq!(epoch.time_to_next(now), 19 * HOUR);
    }

    #[test]
    fn test_roll_before_expiry_fails() {
        let mut epoch = Epoch::with_frequency(Frequency::Weekly);
        epoch.roll(REFERENCE_TS).unwrap();
        let before = epoch;

        assert_eq!(epoch.roll(epoch.current - 1), Err(Error::EpochNotFinished));
        assert_eq!(epoch, before);
    }

    #[test]
    fn test_roll_on_time_advances_one_period() {
        let mut epoch = Epoch::with_frequency(Frequency::Weekly);
        epoch.roll(REFERENCE_TS + 1).unwrap();
        let first = epoch.current;

        epoch.roll(first).unwrap();
        assert_eq!(epoch.previous, first);
        assert_eq!(epoch.current, first + WEEK);
    }

    #[test]
    fn test_missed_rolls_self_heal() {
        let mut epoch = Epoch::with_frequency(Frequency::Daily);
        epoch.roll(REFERENCE_TS + 1).unwrap();
        let first = epoch.current;

        // Five days late
        let now = first + 5 * DAY + HOUR;
        epoch.roll(now).unwrap();
        assert_eq!(epoch.previous, first);
        assert!(epoch.current > now);
        assert_eq!(epoch.current, first + 6 * DAY);
    }

    #[test]
    fn test_finished_and_open_window() {
        let mut epoch = Epoch::with_frequency(Frequency::Daily);
        // Uninitialized epochs accept operations
        assert!(epoch.ensure_open(REFERENCE_TS).is_ok());

        epoch.roll(REFERENCE_TS + 1).unwrap();
        assert!(!epoch.is_finished(epoch.current - 1));
        assert!(epoch.is_finished(epoch.current));
        assert_eq!(epoch.ensure_open(epoch.current), Err(Error::EpochFinished));
    }

    #[test]
    fn test_before_reference_expires_at_reference() {
        let mut epoch = Epoch::with_frequency(Frequency::FourWeeks);
        epoch.roll(1_000).unwrap();
        assert_eq!(epoch.current, REFERENCE_TS);
    }
}
