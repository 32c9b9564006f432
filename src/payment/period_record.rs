//! Per-quorum ring buffer of period usage bins.
//!
//! Each quorum keeps `num_bins` slots addressed by `index % num_bins`, where
//! `index` is the absolute period number (`period_start / window`). A slot
//! whose stored index is older than the one addressed is stale and reads as
//! empty; a slot holding a newer index has moved on and cannot be addressed
//! for the older period any more.

use crate::error::{Error, Result};
use crate::payment::types::QuorumId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default ring depth per quorum.
///
/// Three slots cover the previous, current and overflow periods without the
/// overflow target sharing a slot with the current period.
pub const MIN_NUM_BINS: usize = 3;

/// Usage recorded for one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeriodRecord {
    /// Absolute period number.
    pub index: u32,
    /// Symbols consumed in that period.
    pub usage: u64,
}

/// Result of a successful [`QuorumPeriodRecords::update_usage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageUpdate {
    /// Symbols added to the addressed period bin.
    pub added: u64,
    /// Symbols placed in the overflow bin, if the request overflowed.
    pub overflow: Option<u64>,
}

/// Usage bins for every quorum of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumPeriodRecords {
    num_bins: usize,
    records: BTreeMap<QuorumId, Vec<Option<PeriodRecord>>>,
}

impl Default for QuorumPeriodRecords {
    fn default() -> Self {
        Self::with_num_bins(MIN_NUM_BINS)
    }
}

impl QuorumPeriodRecords {
    /// Empty records with `num_bins` slots per quorum (at least [`MIN_NUM_BINS`]).
    #[must_use]
    pub fn with_num_bins(num_bins: usize) -> Self {
        Self {
            num_bins: num_bins.max(MIN_NUM_BINS),
            records: BTreeMap::new(),
        }
    }

    /// Slots per quorum.
    #[must_use]
    pub const fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Whether no quorum has any record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.values().all(|slots| slots.iter().all(Option::is_none))
    }

    /// Quorums with at least one slot allocated.
    pub fn quorums(&self) -> impl Iterator<Item = QuorumId> + '_ {
        self.records.keys().copied()
    }

    /// Populated records for `quorum`, in slot order.
    pub fn records(&self, quorum: QuorumId) -> impl Iterator<Item = &PeriodRecord> + '_ {
        self.records
            .get(&quorum)
            .into_iter()
            .flat_map(|slots| slots.iter().flatten())
    }

    /// Record stored for exactly `index`, if any.
    #[must_use]
    pub fn get(&self, quorum: QuorumId, index: u32) -> Option<PeriodRecord> {
        let slot = self.slot(index);
        self.records
            .get(&quorum)
            .and_then(|slots| slots[slot])
            .filter(|r| r.index == index)
    }

    /// Usage of `index`; stale or missing slots read as zero.
    #[must_use]
    pub fn usage(&self, quorum: QuorumId, index: u32) -> u64 {
        self.get(quorum, index).map_or(0, |r| r.usage)
    }

    /// Charge `usage` symbols to period `index`, spilling into
    /// `overflow_index` at most once.
    ///
    /// State is left untouched on error.
    ///
    /// # Errors
    ///
    /// - `usage` alone is larger than `bin_limit`
    /// - the bin was already at its limit before this request
    /// - the overflow bin already holds usage
    /// - either slot has moved on to a newer period
    pub fn update_usage(
        &mut self,
        quorum: QuorumId,
        index: u32,
        overflow_index: u32,
        usage: u64,
        bin_limit: u64,
    ) -> Result<UsageUpdate> {
        if usage > bin_limit {
            return Err(Error::UsageExceedsBinLimit {
                quorum,
                usage,
                bin_limit,
            });
        }

        let current = self.live_usage(quorum, index)?;
        let new_usage = current.saturating_add(usage);
        if new_usage <= bin_limit {
            self.record_mut(quorum, index).usage = new_usage;
            return Ok(UsageUpdate {
                added: usage,
                overflow: None,
            });
        }

        if current >= bin_limit {
            return Err(Error::ReservationLimitExceeded { quorum });
        }

        let overflow = new_usage - bin_limit;
        if self.live_usage(quorum, overflow_index)? > 0 {
            return Err(Error::OverflowBinOccupied {
                quorum,
                index: overflow_index,
            });
        }

        self.record_mut(quorum, index).usage = bin_limit;
        self.record_mut(quorum, overflow_index).usage = overflow;
        Ok(UsageUpdate {
            added: bin_limit - current,
            overflow: Some(overflow),
        })
    }

    /// Remove `amount` symbols from period `index`.
    ///
    /// # Errors
    ///
    /// Fails if no record for `index` exists or it holds less than `amount`.
    pub fn subtract_usage(&mut self, quorum: QuorumId, index: u32, amount: u64) -> Result<()> {
        let slot = self.slot(index);
        let record = self
            .records
            .get_mut(&quorum)
            .and_then(|slots| slots[slot].as_mut())
            .filter(|r| r.index == index)
            .ok_or_else(|| {
                Error::InvalidRevert(format!(
                    "no period record for quorum {quorum} period {index}"
                ))
            })?;
        if record.usage < amount {
            return Err(Error::InvalidRevert(format!(
                "insufficient usage to subtract: quorum {quorum} period {index} holds {}, revert {amount}",
                record.usage
            )));
        }
        record.usage -= amount;
        Ok(())
    }

    /// Overwrite the usage of `index`, resetting a stale slot first.
    ///
    /// # Errors
    ///
    /// Fails if the slot already holds a newer period.
    pub fn set_usage(&mut self, quorum: QuorumId, index: u32, usage: u64) -> Result<()> {
        self.live_usage(quorum, index)?;
        self.record_mut(quorum, index).usage = usage;
        Ok(())
    }

    /// Place a decoded record into its slot, keeping whichever of the
    /// incoming and resident records is newer.
    pub fn insert_record(&mut self, quorum: QuorumId, record: PeriodRecord) {
        let slot = self.slot(record.index);
        let slots = self.slots_mut(quorum);
        if !matches!(slots[slot], Some(existing) if existing.index > record.index) {
            slots[slot] = Some(record);
        }
    }

    fn slot(&self, index: u32) -> usize {
        index as usize % self.num_bins
    }

    fn slots_mut(&mut self, quorum: QuorumId) -> &mut Vec<Option<PeriodRecord>> {
        let num_bins = self.num_bins;
        self.records
            .entry(quorum)
            .or_insert_with(|| vec![None; num_bins])
    }

    fn live_usage(&self, quorum: QuorumId, index: u32) -> Result<u64> {
        let slot = self.slot(index);
        match self.records.get(&quorum).and_then(|slots| slots[slot]) {
            Some(r) if r.index == index => Ok(r.usage),
            Some(r) if r.index > index => Err(Error::PeriodSuperseded { quorum, index }),
            _ => Ok(0),
        }
    }

    // Callers check `live_usage` first, so a newer resident never reaches here.
    fn record_mut(&mut self, quorum: QuorumId, index: u32) -> &mut PeriodRecord {
        let slot = self.slot(index);
        let entry = &mut self.slots_mut(quorum)[slot];
        if !matches!(entry, Some(r) if r.index == index) {
            *entry = Some(PeriodRecord { index, usage: 0 });
        }
        entry.get_or_insert(PeriodRecord { index, usage: 0 })
    }
}
