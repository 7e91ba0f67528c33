//! Bus quality bookkeeping.
//!
//! Counters only ever grow until [`BusQualityCounters::reset`], which the
//! engine calls when the dialect changes. Qualities are integer percentages
//! of the good outcomes among all outcomes of a category, 100 while a
//! category has seen nothing.

/// Per-category counters of the Rx and Tx pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct BusQualityCounters {
    /// Valid telegrams received, echoes included.
    pub telegrams: u32,
    /// Captures rejected for a CRC mismatch.
    pub crc_errors: u32,
    /// Captures rejected for a malformed header or length.
    pub frame_errors: u32,
    /// Valid telegrams from the other bus mask.
    pub foreign: u32,
    /// Identical captures folded into one.
    pub duplicates: u32,
    /// Polls seen on the bus, for anyone.
    pub polls: u32,
    /// Read requests that got their response.
    pub reads_ok: u32,
    /// Read requests dropped after the last retry.
    pub read_failures: u32,
    /// Responses that did not arrive within the dialect's budget.
    pub read_timeouts: u32,
    /// Writes acknowledged with success.
    pub writes_ok: u32,
    /// Writes dropped after the last retry.
    pub write_failures: u32,
    /// Attempts re-queued at the front of the Tx queue.
    pub retries: u32,
}

impl BusQualityCounters {
    /// Zeroes every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Percentage of captures that decoded to a valid telegram.
    pub fn rx_quality(&self) -> u8 {
        percent(self.telegrams, self.crc_errors.saturating_add(self.frame_errors))
    }

    /// Percentage of read requests that were answered.
    pub fn read_quality(&self) -> u8 {
        percent(self.reads_ok, self.read_failures)
    }

    /// Percentage of writes that were acknowledged.
    pub fn write_quality(&self) -> u8 {
        percent(self.writes_ok, self.write_failures)
    }

    /// Combined quality: valid telegrams against CRC errors and terminal Tx failures.
    pub fn bus_quality(&self) -> u8 {
        let bad = self
            .crc_errors
            .saturating_add(self.read_failures)
            .saturating_add(self.write_failures);
        percent(self.telegrams, bad)
    }
}

fn percent(good: u32, bad: u32) -> u8 {
    let total = u64::from(good) + u64::from(bad);
    if total == 0 {
        return 100;
    }
    (u64::from(good) * 100 / total) as u8
}
