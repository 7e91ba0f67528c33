//! Receive pipeline: classification, validation and filtering of captures.
//!
//! [`RxService`] turns each [`RawCapture`] handed up by the driver into at
//! most one [`RxEvent`]:
//!
//! - a single byte is a poll, or the acknowledgement of our last write when
//!   the Tx pipeline is waiting for one
//! - anything longer is decoded; CRC failures and malformed frames are
//!   counted and dropped
//! - the bus mask is learned from the first valid telegram of another device,
//!   and telegrams of the other mask are counted as foreign and dropped
//! - a capture identical to the previous one from the same main-loop tick is
//!   a duplicate
//!
//! Telegrams whose source is our own bus id are the loopback of our own
//! sends. They are still reported (flagged as echo) so the device layer can
//! log them.

use heapless::Vec;
use log::{debug, info, trace};

use crate::consts::{EMS_ID_MASK, EMS_MAXBUFFERSIZE};
use crate::dialect::BusMask;
use crate::driver::RawCapture;
use crate::error::FrameError;
use crate::stats::BusQualityCounters;
use crate::telegram::{Telegram, decode};

/// Outcome of one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum RxEvent {
    /// A poll, carrying the raw poll byte.
    Poll(u8),
    /// The single-byte answer to our last write.
    WriteAck(u8),
    /// A valid telegram from the active bus.
    Telegram {
        /// Running number of accepted telegrams
        sequence: u32,
        /// Source is our own bus id
        echo: bool,
        /// Length of the capture on the wire, CRC included
        frame_len: usize,
        /// The decoded telegram
        telegram: Telegram,
    },
}

/// State of the receive side.
#[derive(Debug)]
pub struct RxService {
    bus_id: u8,
    mask: BusMask,
    sequence: u32,
    last_epoch: Option<u32>,
    last_frame: Vec<u8, EMS_MAXBUFFERSIZE>,
}

impl RxService {
    /// Creates the pipeline for our bus id. An [`BusMask::Unset`] mask is learned.
    pub fn new(bus_id: u8, mask: BusMask) -> Self {
        Self {
            bus_id,
            mask,
            sequence: 0,
            last_epoch: None,
            last_frame: Vec::new(),
        }
    }

    /// Active bus mask.
    pub fn mask(&self) -> BusMask {
        self.mask
    }

    /// Number of telegrams accepted so far.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Whether a poll byte hands the bus to us.
    pub fn is_poll_for_us(&self, byte: u8) -> bool {
        byte ^ 0x80 ^ self.mask.bits() == self.bus_id
    }

    /// Forgets the learned mask (unless `mask` is set) and the duplicate filter.
    pub fn reset(&mut self, mask: BusMask) {
        self.mask = mask;
        self.last_epoch = None;
        self.last_frame.clear();
    }

    /// Classifies and validates one capture.
    ///
    /// `expect_ack` routes a single byte to [`RxEvent::WriteAck`] instead of
    /// [`RxEvent::Poll`]. Returns `None` for everything that is dropped; the
    /// reason is recorded in `counters`.
    pub fn process(
        &mut self,
        capture: &RawCapture,
        expect_ack: bool,
        counters: &mut BusQualityCounters,
    ) -> Option<RxEvent> {
        let frame = capture.frame();
        if self.is_duplicate(capture) {
            counters.duplicates = counters.duplicates.wrapping_add(1);
            trace!("Rx duplicate {:02X?}", frame);
            return None;
        }
        self.last_epoch = Some(capture.epoch);
        self.last_frame.clone_from(&capture.bytes);

        if let [byte] = frame {
            if expect_ack {
                return Some(RxEvent::WriteAck(*byte));
            }
            counters.polls = counters.polls.wrapping_add(1);
            return Some(RxEvent::Poll(*byte));
        }

        let telegram = match decode(frame) {
            Ok(telegram) => telegram,
            Err(e @ FrameError::BadCrc { .. }) => {
                counters.crc_errors = counters.crc_errors.wrapping_add(1);
                trace!("Rx {:02X?} ({})", frame, e);
                return None;
            }
            Err(e) => {
                counters.frame_errors = counters.frame_errors.wrapping_add(1);
                debug!("Rx {:02X?} dropped: {}", frame, e);
                return None;
            }
        };

        let echo = frame[0] & EMS_ID_MASK == self.bus_id;
        if self.mask == BusMask::Unset && !echo {
            self.mask = BusMask::from_src(frame[0]);
            info!("bus mask detected: {:?}", self.mask);
        }
        if !self.mask.accepts(frame[0]) {
            counters.foreign = counters.foreign.wrapping_add(1);
            trace!("Rx foreign {:02X?}", frame);
            return None;
        }

        counters.telegrams = counters.telegrams.wrapping_add(1);
        self.sequence = self.sequence.wrapping_add(1);
        trace!("Rx #{}: {:02X?}", self.sequence, frame);
        Some(RxEvent::Telegram {
            sequence: self.sequence,
            echo,
            frame_len: frame.len(),
            telegram,
        })
    }

    fn is_duplicate(&self, capture: &RawCapture) -> bool {
        self.last_epoch == Some(capture.epoch) && self.last_frame == capture.bytes
    }
}
