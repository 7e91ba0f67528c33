//! Transmit pipeline: the Tx queue and its poll-gated state machine.
//!
//! ```text
//!            enqueue               poll for us             sent ok
//!   Idle ─────────────▶ WaitingForPoll ─────────▶ Sending ─────────▶ AwaitingAck
//!    ▲                        ▲                      │ raw: done          │
//!    │                        │ retry (front)        ▼                    │ ack / response
//!    └──────── queue empty ───┴───────────── Success | Retry | Failed ◀───┘   / timeout
//! ```
//!
//! The bus master hands the bus to one device at a time with a single poll
//! byte. [`TxService`] only ever produces a frame from
//! [`on_poll_for_us`](TxService::on_poll_for_us), so there is never more
//! than one of our telegrams in flight.
//!
//! A write is answered with one byte ([`TX_WRITE_SUCCESS`] or
//! [`TX_WRITE_FAIL`]); a read is answered with a telegram from the device we
//! asked, addressed to us, carrying the requested type. Anything else that
//! arrives while we wait is left to the response timeout.
//!
//! Failed attempts go back to the front of the queue until
//! [`MAXIMUM_TX_RETRIES`] is spent, then the entry is dropped and counted.
//! Outcomes are reported as [`TxOutcome`] values and logged; nothing calls
//! back into the application.

use heapless::{Deque, Vec};
use log::{debug, error, warn};

use crate::consts::{
    EMS_BUS_TIMEOUT_MS, EMS_ID_MASK, EMS_MAX_RAW_LENGTH, EMS_MAX_TELEGRAM_LENGTH,
    EMS_MIN_TELEGRAM_LENGTH, MAXIMUM_TX_RETRIES, MAX_TX_TELEGRAMS, TX_WRITE_FAIL, TX_WRITE_SUCCESS,
};
use crate::error::{BusTxError, FrameError, QueueError};
use crate::stats::BusQualityCounters;
use crate::telegram::{FrameBuf, Operation, Telegram, encode, seal};

/// Identifies a queued request in logs and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct QueueHandle(pub u16);

/// What a queue entry puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TxOperation {
    /// Data for a device, acknowledged with a single byte.
    Write,
    /// Request for data, answered with a telegram.
    Read,
    /// Preformatted bytes, CRC appended on send, no response expected.
    RawWrite,
}

/// One pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct TxQueueEntry {
    /// Handle returned when the entry was queued.
    pub handle: QueueHandle,
    /// Kind of request.
    pub op: TxOperation,
    /// Addressed device, 7-bit.
    pub dest: u8,
    /// Type to read or write.
    pub type_id: u16,
    /// Offset into the type's data block.
    pub offset: u8,
    /// Write payload, or the whole raw frame for [`TxOperation::RawWrite`]. Empty for reads.
    pub payload: Vec<u8, EMS_MAX_RAW_LENGTH>,
    /// Failed attempts so far.
    pub retry_count: u8,
    /// Type to read back from `dest` once a write is acknowledged.
    pub validate_type_id: Option<u16>,
}

/// Where the Tx state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TxState {
    /// Nothing queued.
    #[default]
    Idle,
    /// Entries queued, waiting for the master to poll us.
    WaitingForPoll,
    /// Front entry handed to the driver.
    Sending,
    /// Sent, waiting for the write ack or the read response.
    AwaitingAck,
}

/// Result of a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TxOutcome {
    /// The request completed.
    Success {
        /// The completed entry
        handle: QueueHandle,
        /// Its operation
        op: TxOperation,
    },
    /// The attempt failed and the entry is back at the front of the queue.
    Retry {
        /// The re-queued entry
        handle: QueueHandle,
        /// Failed attempts so far
        attempt: u8,
    },
    /// The entry was dropped.
    Failed {
        /// The dropped entry
        handle: QueueHandle,
        /// Its operation
        op: TxOperation,
    },
}

#[derive(Debug)]
struct InFlight {
    entry: TxQueueEntry,
    sent_at_ms: u32,
}

/// Queue and state machine of the transmit side.
#[derive(Debug)]
pub struct TxService {
    bus_id: u8,
    mask_bits: u8,
    read_only: bool,
    response_timeout_ms: u32,
    queue: Deque<TxQueueEntry, MAX_TX_TELEGRAMS>,
    state: TxState,
    in_flight: Option<InFlight>,
    next_handle: u16,
    last_poll_ms: Option<u32>,
    poll_reply_pending: bool,
}

impl TxService {
    /// Creates an empty pipeline.
    ///
    /// # Arguments
    /// - `bus_id`: our own 7-bit device id
    /// - `response_timeout_ms`: budget for a write ack or read response
    /// - `read_only`: never transmit; polls are still tracked
    pub fn new(bus_id: u8, response_timeout_ms: u32, read_only: bool) -> Self {
        Self {
            bus_id,
            mask_bits: 0,
            read_only,
            response_timeout_ms,
            queue: Deque::new(),
            state: TxState::Idle,
            in_flight: None,
            next_handle: 1,
            last_poll_ms: None,
            poll_reply_pending: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Entries waiting, the one in flight excluded.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    /// Waiting entries, front first.
    pub fn queue(&self) -> impl Iterator<Item = &TxQueueEntry> {
        self.queue.iter()
    }

    /// The entry whose response we are waiting for.
    pub fn in_flight(&self) -> Option<&TxQueueEntry> {
        self.in_flight.as_ref().map(|f| &f.entry)
    }

    /// Whether a single-byte frame now is the answer to our write.
    pub fn awaiting_write_ack(&self) -> bool {
        self.state == TxState::AwaitingAck
            && matches!(self.in_flight(), Some(e) if e.op == TxOperation::Write)
    }

    /// Our source byte and poll reply carry the bus mask.
    pub fn set_mask(&mut self, mask_bits: u8) {
        self.mask_bits = mask_bits;
    }

    /// Budget for write acks and read responses.
    pub fn set_response_timeout(&mut self, ms: u32) {
        self.response_timeout_ms = ms;
    }

    /// Our own device id, used for the source byte, read matching and the poll reply.
    pub fn set_bus_id(&mut self, bus_id: u8) {
        self.bus_id = bus_id;
    }

    /// Switches listen-only mode.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Whether the master polled us within the last 30 seconds.
    pub fn bus_connected(&self, now_ms: u32) -> bool {
        self.last_poll_ms
            .is_some_and(|t| now_ms.wrapping_sub(t) < EMS_BUS_TIMEOUT_MS)
    }

    /// Poll reply that hands the bus back, if one is owed.
    pub fn take_poll_reply(&mut self) -> Option<u8> {
        if core::mem::take(&mut self.poll_reply_pending) {
            Some(self.bus_id ^ self.mask_bits)
        } else {
            None
        }
    }

    /// Queues a read of `type_id` from `dest`.
    pub fn send_read_request(
        &mut self,
        type_id: u16,
        dest: u8,
        offset: u8,
    ) -> Result<QueueHandle, QueueError> {
        check_target(type_id, dest)?;
        let entry = self.entry(TxOperation::Read, dest, type_id, offset, Vec::new(), None);
        Ok(self.push_back(entry))
    }

    /// Queues a write of `payload` to `dest`.
    ///
    /// With `validate_type_id` set, a positive ack queues a read of that type
    /// from the same device.
    pub fn send_write_request(
        &mut self,
        type_id: u16,
        dest: u8,
        offset: u8,
        payload: &[u8],
        validate_type_id: Option<u16>,
    ) -> Result<QueueHandle, QueueError> {
        check_target(type_id, dest)?;
        let candidate = Telegram::new(Operation::Write, self.bus_id, dest, type_id, offset, payload)
            .and_then(|t| encode(&t));
        match candidate {
            Ok(_) => {}
            Err(FrameError::ReservedTypeId(t)) => return Err(QueueError::ReservedTypeId(t)),
            Err(_) => return Err(QueueError::PayloadTooLong(payload.len())),
        }
        let payload =
            Vec::from_slice(payload).map_err(|_| QueueError::PayloadTooLong(payload.len()))?;
        let entry = self.entry(
            TxOperation::Write,
            dest,
            type_id,
            offset,
            payload,
            validate_type_id,
        );
        Ok(self.push_back(entry))
    }

    /// Queues a preformatted telegram given as hex bytes, e.g. `"0B 90 F7 00 FF 01 A5"`.
    ///
    /// Bytes are separated by spaces or commas. The CRC is appended on send.
    pub fn send_raw(&mut self, hex: &str) -> Result<QueueHandle, QueueError> {
        let mut raw: Vec<u8, EMS_MAX_RAW_LENGTH> = Vec::new();
        let mut count = 0usize;
        for token in hex.split([' ', ',']).filter(|t| !t.is_empty()) {
            let byte = u8::from_str_radix(token, 16).map_err(|_| QueueError::InvalidHex)?;
            count += 1;
            // keep counting so the error carries the full length
            let _ = raw.push(byte);
        }
        if count > EMS_MAX_RAW_LENGTH {
            return Err(QueueError::PayloadTooLong(count));
        }
        if count < EMS_MIN_TELEGRAM_LENGTH - 1 {
            return Err(QueueError::RawTooShort(count));
        }
        let entry = self.entry(
            TxOperation::RawWrite,
            raw[1] & EMS_ID_MASK,
            u16::from(raw[2]),
            raw[3],
            raw,
            None,
        );
        Ok(self.push_back(entry))
    }

    /// Drops every pending entry, including the one in flight.
    pub fn flush(&mut self) {
        if !self.is_empty() {
            debug!("Tx queue flushed, {} entries dropped", self.len());
        }
        self.queue.clear();
        self.in_flight = None;
        self.poll_reply_pending = false;
        self.state = TxState::Idle;
    }

    /// A poll addressed to us: hands out the front entry as a ready-to-send frame.
    ///
    /// Always records bus activity. Returns `None` in listen-only mode, with
    /// nothing queued, or while an earlier send is unresolved.
    pub fn on_poll_for_us(
        &mut self,
        now_ms: u32,
        counters: &mut BusQualityCounters,
    ) -> Option<FrameBuf> {
        self.last_poll_ms = Some(now_ms);
        if self.read_only || self.state != TxState::WaitingForPoll {
            return None;
        }
        while let Some(entry) = self.queue.pop_front() {
            match self.frame_for(&entry) {
                Ok(frame) => {
                    debug!(
                        "Tx #{}: {:?} to {:#04x}, type {:#06x}",
                        entry.handle.0, entry.op, entry.dest, entry.type_id
                    );
                    self.in_flight = Some(InFlight {
                        entry,
                        sent_at_ms: now_ms,
                    });
                    self.state = TxState::Sending;
                    return Some(frame);
                }
                Err(e) => {
                    error!("Tx #{} cannot be framed: {}", entry.handle.0, e);
                    count_failure(entry.op, counters);
                }
            }
        }
        self.settle();
        None
    }

    /// Result of handing the frame to the driver.
    pub fn on_sent(
        &mut self,
        result: Result<(), BusTxError>,
        now_ms: u32,
        counters: &mut BusQualityCounters,
    ) -> Option<TxOutcome> {
        if self.state != TxState::Sending {
            return None;
        }
        let mut flight = self.in_flight.take()?;
        match result {
            Ok(()) if flight.entry.op == TxOperation::RawWrite => {
                counters.writes_ok = counters.writes_ok.wrapping_add(1);
                self.settle();
                Some(TxOutcome::Success {
                    handle: flight.entry.handle,
                    op: TxOperation::RawWrite,
                })
            }
            Ok(()) => {
                flight.sent_at_ms = now_ms;
                self.in_flight = Some(flight);
                self.state = TxState::AwaitingAck;
                None
            }
            Err(e) if e.is_retryable() => {
                warn!("Tx #{} failed: {}", flight.entry.handle.0, e);
                Some(self.retry(flight.entry, counters))
            }
            Err(e) => {
                error!("Tx #{} dropped: {}", flight.entry.handle.0, e);
                count_failure(flight.entry.op, counters);
                self.settle();
                Some(TxOutcome::Failed {
                    handle: flight.entry.handle,
                    op: flight.entry.op,
                })
            }
        }
    }

    /// A timer-paced send was cut short by a foreign break after `transmit` returned.
    pub fn on_interrupted(&mut self, counters: &mut BusQualityCounters) -> Option<TxOutcome> {
        if self.state != TxState::AwaitingAck {
            return None;
        }
        let flight = self.in_flight.take()?;
        warn!(
            "Tx #{} failed: {}",
            flight.entry.handle.0,
            BusTxError::BreakDuringSend
        );
        Some(self.retry(flight.entry, counters))
    }

    /// Single-byte answer to the outstanding write.
    pub fn on_write_ack(
        &mut self,
        byte: u8,
        counters: &mut BusQualityCounters,
    ) -> Option<TxOutcome> {
        if !self.awaiting_write_ack() {
            return None;
        }
        let flight = self.in_flight.take()?;
        let entry = flight.entry;
        match byte {
            TX_WRITE_SUCCESS => {
                debug!("Tx #{} write acknowledged", entry.handle.0);
                counters.writes_ok = counters.writes_ok.wrapping_add(1);
                self.poll_reply_pending = true;
                if let Some(type_id) = entry.validate_type_id {
                    let query =
                        self.entry(TxOperation::Read, entry.dest, type_id, 0, Vec::new(), None);
                    self.push_front(query);
                }
                self.settle();
                Some(TxOutcome::Success {
                    handle: entry.handle,
                    op: TxOperation::Write,
                })
            }
            TX_WRITE_FAIL => {
                // the host refused the data; the exchange itself is complete
                error!(
                    "Tx #{} write rejected by {:#04x}",
                    entry.handle.0, entry.dest
                );
                self.poll_reply_pending = true;
                self.settle();
                Some(TxOutcome::Success {
                    handle: entry.handle,
                    op: TxOperation::Write,
                })
            }
            other => {
                warn!("Tx #{} unexpected write ack {:#04x}", entry.handle.0, other);
                Some(self.retry(entry, counters))
            }
        }
    }

    /// A valid non-echo telegram; resolves the outstanding read if it is the answer.
    ///
    /// `frame_len` is the length of the capture on the wire, CRC included. A
    /// response that fills a whole telegram queues a read of the next block.
    pub fn on_telegram(
        &mut self,
        telegram: &Telegram,
        frame_len: usize,
        counters: &mut BusQualityCounters,
    ) -> Option<TxOutcome> {
        if self.state != TxState::AwaitingAck {
            return None;
        }
        let entry = &self.in_flight.as_ref()?.entry;
        let answers = entry.op == TxOperation::Read
            && telegram.dest == self.bus_id
            && telegram.src == entry.dest
            && telegram.type_id == entry.type_id;
        if !answers {
            return None;
        }

        let entry = self.in_flight.take()?.entry;
        debug!("Tx #{} read answered", entry.handle.0);
        counters.reads_ok = counters.reads_ok.wrapping_add(1);
        self.poll_reply_pending = true;
        if frame_len == usize::from(EMS_MAX_TELEGRAM_LENGTH) {
            let next = telegram.offset.wrapping_add(telegram.message_length());
            let query = self.entry(
                TxOperation::Read,
                entry.dest,
                entry.type_id,
                next,
                Vec::new(),
                None,
            );
            self.push_front(query);
        }
        self.settle();
        Some(TxOutcome::Success {
            handle: entry.handle,
            op: TxOperation::Read,
        })
    }

    /// Spends a retry when the response budget ran out.
    pub fn check_timeout(
        &mut self,
        now_ms: u32,
        counters: &mut BusQualityCounters,
    ) -> Option<TxOutcome> {
        if self.state != TxState::AwaitingAck {
            return None;
        }
        let sent_at = self.in_flight.as_ref()?.sent_at_ms;
        if now_ms.wrapping_sub(sent_at) < self.response_timeout_ms {
            return None;
        }
        let flight = self.in_flight.take()?;
        counters.read_timeouts = counters.read_timeouts.wrapping_add(1);
        warn!(
            "Tx #{} no response after {} ms",
            flight.entry.handle.0, self.response_timeout_ms
        );
        Some(self.retry(flight.entry, counters))
    }

    fn retry(&mut self, mut entry: TxQueueEntry, counters: &mut BusQualityCounters) -> TxOutcome {
        entry.retry_count = entry.retry_count.saturating_add(1);
        let handle = entry.handle;
        if entry.retry_count <= MAXIMUM_TX_RETRIES {
            let attempt = entry.retry_count;
            warn!("Tx #{} retry {}/{}", handle.0, attempt, MAXIMUM_TX_RETRIES);
            counters.retries = counters.retries.wrapping_add(1);
            self.push_front(entry);
            self.settle();
            TxOutcome::Retry { handle, attempt }
        } else {
            error!(
                "Tx #{} {:?} to {:#04x} failed after {} retries",
                handle.0, entry.op, entry.dest, MAXIMUM_TX_RETRIES
            );
            count_failure(entry.op, counters);
            self.settle();
            TxOutcome::Failed {
                handle,
                op: entry.op,
            }
        }
    }

    fn frame_for(&self, entry: &TxQueueEntry) -> Result<FrameBuf, FrameError> {
        let src = self.bus_id ^ self.mask_bits;
        match entry.op {
            TxOperation::RawWrite => seal(&entry.payload),
            TxOperation::Read => encode(&Telegram::new(
                Operation::Read,
                src,
                entry.dest,
                entry.type_id,
                entry.offset,
                &[EMS_MAX_TELEGRAM_LENGTH],
            )?),
            TxOperation::Write => encode(&Telegram::new(
                Operation::Write,
                src,
                entry.dest,
                entry.type_id,
                entry.offset,
                &entry.payload,
            )?),
        }
    }

    fn entry(
        &mut self,
        op: TxOperation,
        dest: u8,
        type_id: u16,
        offset: u8,
        payload: Vec<u8, EMS_MAX_RAW_LENGTH>,
        validate_type_id: Option<u16>,
    ) -> TxQueueEntry {
        let handle = QueueHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        TxQueueEntry {
            handle,
            op,
            dest,
            type_id,
            offset,
            payload,
            retry_count: 0,
            validate_type_id,
        }
    }

    fn push_back(&mut self, entry: TxQueueEntry) -> QueueHandle {
        let handle = entry.handle;
        if self.queue.is_full() {
            if let Some(dropped) = self.queue.pop_front() {
                warn!("Tx queue full, dropping #{}", dropped.handle.0);
            }
        }
        let _ = self.queue.push_back(entry);
        debug!("Tx #{} queued, {} waiting", handle.0, self.queue.len());
        self.settle();
        handle
    }

    fn push_front(&mut self, entry: TxQueueEntry) {
        if self.queue.is_full() {
            if let Some(dropped) = self.queue.pop_back() {
                warn!("Tx queue full, dropping #{}", dropped.handle.0);
            }
        }
        let _ = self.queue.push_front(entry);
    }

    fn settle(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        self.state = if self.queue.is_empty() {
            TxState::Idle
        } else {
            TxState::WaitingForPoll
        };
    }
}

fn check_target(type_id: u16, dest: u8) -> Result<(), QueueError> {
    if dest > EMS_ID_MASK {
        return Err(QueueError::InvalidDeviceId(dest));
    }
    if (0xF0..=0xFF).contains(&type_id) {
        return Err(QueueError::ReservedTypeId(type_id));
    }
    Ok(())
}

fn count_failure(op: TxOperation, counters: &mut BusQualityCounters) {
    match op {
        TxOperation::Read => counters.read_failures = counters.read_failures.wrapping_add(1),
        TxOperation::Write | TxOperation::RawWrite => {
            counters.write_failures = counters.write_failures.wrapping_add(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::EMS_DEFAULT_BUS_ID;
    use crate::telegram::decode;

    const SHORT: usize = 10;

    const ME: u8 = EMS_DEFAULT_BUS_ID;
    const BOILER: u8 = 0x08;

    fn service() -> (TxService, BusQualityCounters) {
        (TxService::new(ME, 300, false), BusQualityCounters::default())
    }

    fn response(type_id: u16, offset: u8, len: usize) -> Telegram {
        let data = [0x11u8; 27];
        Telegram::new(Operation::Write, BOILER, ME, type_id, offset, &data[..len]).unwrap()
    }

    #[test]
    fn test_enqueue_waits_for_poll() {
        let (mut tx, _) = service();
        assert_eq!(tx.state(), TxState::Idle);
        let handle = tx.send_read_request(0x18, BOILER, 0).unwrap();
        assert_eq!(handle, QueueHandle(1));
        assert_eq!(tx.state(), TxState::WaitingForPoll);
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_no_frame_without_queue_or_in_listen_only() {
        let (mut tx, mut counters) = service();
        assert!(tx.on_poll_for_us(0, &mut counters).is_none());
        assert!(tx.bus_connected(10));

        tx.set_read_only(true);
        let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        assert!(tx.on_poll_for_us(10, &mut counters).is_none());
        assert_eq!(tx.state(), TxState::WaitingForPoll);
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_poll_moves_exactly_one_entry() {
        let (mut tx, mut counters) = service();
        let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.send_read_request(0x19, BOILER, 0).unwrap();

        let frame = tx.on_poll_for_us(0, &mut counters).unwrap();
        assert_eq!(tx.state(), TxState::Sending);
        assert_eq!(tx.len(), 1);
        assert_eq!(&frame[..5], &[ME, BOILER | 0x80, 0x18, 0x00, 32]);

        // a second poll while the first is unresolved sends nothing
        assert!(tx.on_poll_for_us(1, &mut counters).is_none());
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_read_resolved_by_matching_response() {
        let (mut tx, mut counters) = service();
        let handle = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        assert_eq!(tx.on_sent(Ok(()), 5, &mut counters), None);
        assert_eq!(tx.state(), TxState::AwaitingAck);
        assert!(!tx.awaiting_write_ack());

        // wrong type, wrong sender, not for us
        assert_eq!(tx.on_telegram(&response(0x19, 0, 4), SHORT, &mut counters), None);
        let mut other = response(0x18, 0, 4);
        other.src = 0x10;
        assert_eq!(tx.on_telegram(&other, SHORT, &mut counters), None);
        let mut broadcast = response(0x18, 0, 4);
        broadcast.dest = 0x00;
        assert_eq!(tx.on_telegram(&broadcast, SHORT, &mut counters), None);

        assert_eq!(
            tx.on_telegram(&response(0x18, 0, 4), SHORT, &mut counters),
            Some(TxOutcome::Success {
                handle,
                op: TxOperation::Read
            })
        );
        assert_eq!(counters.reads_ok, 1);
        assert_eq!(tx.take_poll_reply(), Some(ME));
        assert_eq!(tx.take_poll_reply(), None);
        assert_eq!(tx.state(), TxState::Idle);
    }

    #[test]
    fn test_full_response_queues_continuation() {
        let (mut tx, mut counters) = service();
        let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.send_read_request(0x33, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        let _ = tx
            .on_telegram(&response(0x18, 0, 27), 32, &mut counters)
            .unwrap();

        let next = tx.queue().next().unwrap();
        assert_eq!(next.op, TxOperation::Read);
        assert_eq!(next.type_id, 0x18);
        assert_eq!(next.offset, 27);
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_full_f7_response_queues_continuation() {
        let (mut tx, mut counters) = service();
        let _ = tx.send_read_request(0x01A5, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);

        // 8 header bytes, 23 data bytes and the CRC fill the whole telegram
        let mut body = std::vec![BOILER, ME, 0xF7, 0x00, 0xFF, 0x00, 0xA5, 0x00];
        body.extend_from_slice(&[0x22; 23]);
        let frame = seal(&body).unwrap();
        assert_eq!(frame.len(), 32);
        let reply = decode(&frame).unwrap();
        assert_eq!(reply.type_id, 0x01A5);
        assert_eq!(reply.message_length(), 23);
        assert!(reply.frame_length() < frame.len());

        let _ = tx.on_telegram(&reply, frame.len(), &mut counters).unwrap();
        let next = tx.queue().next().unwrap();
        assert_eq!((next.type_id, next.offset), (0x01A5, 23));
    }

    #[test]
    fn test_short_response_ends_read() {
        let (mut tx, mut counters) = service();
        let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        let _ = tx
            .on_telegram(&response(0x18, 0, 20), 25, &mut counters)
            .unwrap();
        assert!(tx.is_empty());
    }

    #[test]
    fn test_write_ack_success_queues_validation() {
        let (mut tx, mut counters) = service();
        let handle = tx
            .send_write_request(0x35, BOILER, 3, &[0x01], Some(0x33))
            .unwrap();
        let frame = tx.on_poll_for_us(0, &mut counters).unwrap();
        assert_eq!(&frame[..5], &[ME, BOILER, 0x35, 0x03, 0x01]);
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        assert!(tx.awaiting_write_ack());

        assert_eq!(
            tx.on_write_ack(TX_WRITE_SUCCESS, &mut counters),
            Some(TxOutcome::Success {
                handle,
                op: TxOperation::Write
            })
        );
        assert_eq!(counters.writes_ok, 1);
        assert_eq!(tx.take_poll_reply(), Some(ME));
        let query = tx.queue().next().unwrap();
        assert_eq!((query.op, query.dest, query.type_id), (TxOperation::Read, BOILER, 0x33));
        assert_eq!(tx.state(), TxState::WaitingForPoll);
    }

    #[test]
    fn test_write_ack_04_resolves_without_retry() {
        let (mut tx, mut counters) = service();
        let handle = tx
            .send_write_request(0x35, BOILER, 0, &[0x01], Some(0x33))
            .unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        assert_eq!(
            tx.on_write_ack(TX_WRITE_FAIL, &mut counters),
            Some(TxOutcome::Success {
                handle,
                op: TxOperation::Write
            })
        );
        assert_eq!(counters.write_failures, 0);
        assert_eq!(counters.retries, 0);
        assert_eq!(counters.write_quality(), 100);
        assert_eq!(tx.take_poll_reply(), Some(ME));
        // no validation read for a refused write
        assert!(tx.is_empty());
        assert_eq!(tx.state(), TxState::Idle);
    }

    #[test]
    fn test_retry_bound_for_always_failing_entry() {
        let (mut tx, mut counters) = service();
        let handle = tx.send_write_request(0x35, BOILER, 0, &[0x01], None).unwrap();
        let mut sends = 0;
        let mut last = None;
        for tick in 0..10u32 {
            if tx.on_poll_for_us(tick, &mut counters).is_none() {
                break;
            }
            sends += 1;
            last = tx.on_sent(Err(BusTxError::BreakDuringSend), tick, &mut counters);
        }
        assert_eq!(sends, 1 + usize::from(MAXIMUM_TX_RETRIES));
        assert_eq!(
            last,
            Some(TxOutcome::Failed {
                handle,
                op: TxOperation::Write
            })
        );
        assert_eq!(counters.retries, u32::from(MAXIMUM_TX_RETRIES));
        assert_eq!(counters.write_failures, 1);
        assert_eq!(tx.state(), TxState::Idle);
    }

    #[test]
    fn test_retry_goes_ahead_of_newer_entries() {
        let (mut tx, mut counters) = service();
        let first = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.send_read_request(0x19, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);

        assert_eq!(tx.check_timeout(299, &mut counters), None);
        assert_eq!(
            tx.check_timeout(300, &mut counters),
            Some(TxOutcome::Retry {
                handle: first,
                attempt: 1
            })
        );
        assert_eq!(counters.read_timeouts, 1);
        let front = tx.queue().next().unwrap();
        assert_eq!((front.handle, front.retry_count), (first, 1));
    }

    #[test]
    fn test_unexpected_ack_byte_retries() {
        let (mut tx, mut counters) = service();
        let handle = tx.send_write_request(0x35, BOILER, 0, &[0x01], None).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        assert_eq!(
            tx.on_write_ack(0x7F, &mut counters),
            Some(TxOutcome::Retry { handle, attempt: 1 })
        );
    }

    #[test]
    fn test_interrupted_send_retries() {
        let (mut tx, mut counters) = service();
        let handle = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        assert_eq!(
            tx.on_interrupted(&mut counters),
            Some(TxOutcome::Retry { handle, attempt: 1 })
        );
    }

    #[test]
    fn test_raw_write_completes_on_send() {
        let (mut tx, mut counters) = service();
        let handle = tx.send_raw("0B 90 F7 00,FF 01 A5").unwrap();
        let entry = tx.queue().next().unwrap();
        assert_eq!((entry.dest, entry.type_id), (0x10, 0xF7));

        let frame = tx.on_poll_for_us(0, &mut counters).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame[..7], &[0x0B, 0x90, 0xF7, 0x00, 0xFF, 0x01, 0xA5]);
        assert!(decode(&frame).is_ok());
        assert_eq!(
            tx.on_sent(Ok(()), 0, &mut counters),
            Some(TxOutcome::Success {
                handle,
                op: TxOperation::RawWrite
            })
        );
        assert_eq!(tx.take_poll_reply(), None);
    }

    #[test]
    fn test_send_raw_rejects_bad_input() {
        let (mut tx, _) = service();
        assert_eq!(tx.send_raw("0B 9G 18 00"), Err(QueueError::InvalidHex));
        assert_eq!(tx.send_raw("0B 88 18"), Err(QueueError::RawTooShort(3)));
        let long = "00 ".repeat(32);
        assert_eq!(tx.send_raw(&long), Err(QueueError::PayloadTooLong(32)));
        assert!(tx.is_empty());
    }

    #[test]
    fn test_request_validation() {
        let (mut tx, _) = service();
        assert_eq!(
            tx.send_read_request(0xF7, BOILER, 0),
            Err(QueueError::ReservedTypeId(0xF7))
        );
        assert_eq!(
            tx.send_read_request(0x18, 0x88, 0),
            Err(QueueError::InvalidDeviceId(0x88))
        );
        assert_eq!(
            tx.send_write_request(0x1A5, BOILER, 0, &[0u8; 26], None),
            Err(QueueError::PayloadTooLong(26))
        );
        assert!(tx.send_write_request(0x18, BOILER, 0, &[0u8; 27], None).is_ok());
    }

    #[test]
    fn test_mask_applied_to_source_and_poll_reply() {
        let (mut tx, mut counters) = service();
        tx.set_mask(0x80);
        let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let frame = tx.on_poll_for_us(0, &mut counters).unwrap();
        assert_eq!(frame[0], ME | 0x80);
        let _ = tx.on_sent(Ok(()), 0, &mut counters);
        let _ = tx.on_telegram(&response(0x18, 0, 4), SHORT, &mut counters).unwrap();
        assert_eq!(tx.take_poll_reply(), Some(ME | 0x80));
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let (mut tx, _) = service();
        for _ in 0..MAX_TX_TELEGRAMS {
            let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        }
        let newest = tx.send_read_request(0x19, BOILER, 0).unwrap();
        assert_eq!(tx.len(), MAX_TX_TELEGRAMS);
        assert_eq!(tx.queue().next().unwrap().handle, QueueHandle(2));
        assert_eq!(tx.queue().last().unwrap().handle, newest);
    }

    #[test]
    fn test_flush_resets_to_idle() {
        let (mut tx, mut counters) = service();
        let _ = tx.send_read_request(0x18, BOILER, 0).unwrap();
        let _ = tx.send_read_request(0x19, BOILER, 0).unwrap();
        let _ = tx.on_poll_for_us(0, &mut counters).unwrap();
        tx.flush();
        assert!(tx.is_empty());
        assert_eq!(tx.state(), TxState::Idle);
        assert_eq!(tx.on_sent(Ok(()), 0, &mut counters), None);
    }

    #[test]
    fn test_bus_connected_times_out() {
        let (mut tx, mut counters) = service();
        assert!(!tx.bus_connected(0));
        let _ = tx.on_poll_for_us(1_000, &mut counters);
        assert!(tx.bus_connected(30_999));
        assert!(!tx.bus_connected(31_000));
    }
}
