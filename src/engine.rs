//! The bus engine: one owner for the driver, both pipelines and the counters.
//!
//! [`BusEngine`] is what the firmware keeps alive between `start` and `stop`.
//! The interrupt context only ever calls [`on_break`](BusEngine::on_break)
//! and [`on_tx_timer`](BusEngine::on_tx_timer); everything else happens in
//! [`loop_once`](BusEngine::loop_once), called from the main loop with a
//! free-running millisecond clock.
//!
//! Per call of `loop_once`:
//!
//! 1. captures are drained oldest first, until one telegram has been handed
//!    to the [`TelegramSink`] or the Tx state machine has moved once
//! 2. a poll for us hands the front of the Tx queue to the driver
//! 3. an outstanding request whose budget ran out spends a retry
//! 4. a poll reply owed after a completed request closes the bus
//!
//! ## Example
//!
//! ```rust,ignore
//! use emsbus::engine::{BusConfig, BusEngine};
//!
//! let mut engine = BusEngine::new(uart, delay, sink);
//! engine.start(BusConfig::default())?;
//! let _ = engine.send_read_request(0x18, 0x08, 0)?;
//! loop {
//!     engine.loop_once(millis());
//! }
//! ```

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::consts::{EMS_DEFAULT_BUS_ID, EMS_ID_MASK};
use crate::dialect::{BusMask, Dialect};
use crate::driver::{BusDriver, BusUart};
use crate::error::{ConfigError, QueueError};
use crate::rx::{RxEvent, RxService};
use crate::stats::BusQualityCounters;
use crate::telegram::Telegram;
use crate::tx::{QueueHandle, TxOutcome, TxService, TxState};

/// Receiver of decoded telegrams, the device layer.
pub trait TelegramSink {
    /// A valid telegram from another device.
    fn on_telegram(&mut self, telegram: &Telegram);

    /// The loopback of one of our own telegrams.
    fn on_echo(&mut self, _telegram: &Telegram) {}
}

/// Settings supplied at [`BusEngine::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct BusConfig {
    /// Our own device id, `0x01..=0x7F`.
    pub bus_id: u8,
    /// Timing dialect.
    pub dialect: Dialect,
    /// UART receive pin.
    pub rx_pin: u8,
    /// UART transmit pin.
    pub tx_pin: u8,
    /// Listen only, never transmit.
    pub read_only: bool,
    /// Fixed bus mask, or [`BusMask::Unset`] to learn it.
    pub bus_mask: BusMask,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_id: EMS_DEFAULT_BUS_ID,
            dialect: Dialect::Default,
            rx_pin: 23,
            tx_pin: 5,
            read_only: false,
            bus_mask: BusMask::Unset,
        }
    }
}

impl BusConfig {
    /// Builds a config from the numeric `tx_mode` setting.
    pub fn with_tx_mode(mut self, tx_mode: u8) -> Result<Self, ConfigError> {
        self.dialect = Dialect::from_tx_mode(tx_mode)?;
        Ok(self)
    }

    /// Checks everything that does not need the hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_id == 0 || self.bus_id > EMS_ID_MASK {
            return Err(ConfigError::InvalidBusId(self.bus_id));
        }
        if self.rx_pin == self.tx_pin {
            return Err(ConfigError::PinConflict(self.rx_pin));
        }
        self.dialect.validate()
    }
}

/// Bus transport and protocol engine.
#[derive(Debug)]
pub struct BusEngine<U, D, S>
where
    U: BusUart,
    D: DelayNs,
    S: TelegramSink,
{
    driver: BusDriver<U, D>,
    sink: S,
    config: Option<BusConfig>,
    rx: RxService,
    tx: TxService,
    counters: BusQualityCounters,
    tick: u32,
    last_outcome: Option<TxOutcome>,
}

impl<U, D, S> BusEngine<U, D, S>
where
    U: BusUart,
    D: DelayNs,
    S: TelegramSink,
{
    /// Builds a stopped engine.
    pub fn new(uart: U, delay: D, sink: S) -> Self {
        let defaults = BusConfig::default();
        Self {
            driver: BusDriver::new(uart, delay),
            sink,
            config: None,
            rx: RxService::new(defaults.bus_id, defaults.bus_mask),
            tx: TxService::new(
                defaults.bus_id,
                defaults.dialect.response_timeout_ms(),
                defaults.read_only,
            ),
            counters: BusQualityCounters::default(),
            tick: 0,
            last_outcome: None,
        }
    }

    /// Validates `config`, configures the UART and starts listening.
    ///
    /// On a running engine the whole new config is applied: the Tx queue is
    /// flushed, the counters reset and the Rx filter rebuilt for the new bus
    /// id and mask. Changed pins move the UART.
    ///
    /// # Errors
    /// Any [`ConfigError`]; the engine then keeps its old config. If the UART
    /// refuses the old pins as well, the engine ends up stopped.
    pub fn start(&mut self, config: BusConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let pins = (config.rx_pin, config.tx_pin);
        match self.config {
            None => self.driver.start(config.dialect, pins.0, pins.1)?,
            Some(current) if (current.rx_pin, current.tx_pin) == pins => {
                self.driver.restart(config.dialect)
            }
            Some(current) => {
                self.driver.stop();
                if let Err(e) = self.driver.start(config.dialect, pins.0, pins.1) {
                    // back onto the old pins
                    let old = self
                        .driver
                        .start(current.dialect, current.rx_pin, current.tx_pin);
                    if let Err(lost) = old {
                        warn!("EMS bus stopped, old pins unavailable: {}", lost);
                        self.config = None;
                        self.tx.flush();
                    }
                    return Err(e);
                }
            }
        }
        self.apply(config);
        info!(
            "EMS bus started: id {:#04x}, {:?}{}",
            config.bus_id,
            config.dialect,
            if config.read_only { ", read only" } else { "" }
        );
        Ok(())
    }

    /// Switches the dialect of a running engine.
    ///
    /// Pending Tx entries are flushed, the counters reset and the next
    /// capture dropped.
    pub fn restart(&mut self, dialect: Dialect) -> Result<(), ConfigError> {
        dialect.validate()?;
        let mut config = self.config.ok_or(ConfigError::NotStarted)?;
        config.dialect = dialect;
        self.driver.restart(dialect);
        self.apply(config);
        info!("EMS bus restarted with {:?}", dialect);
        Ok(())
    }

    /// Stops the driver and drops everything queued.
    pub fn stop(&mut self) {
        if self.config.take().is_some() {
            self.driver.stop();
            self.tx.flush();
            info!("EMS bus stopped");
        }
    }

    /// Whether the engine runs.
    pub fn is_started(&self) -> bool {
        self.config.is_some()
    }

    /// Active configuration.
    pub fn config(&self) -> Option<&BusConfig> {
        self.config.as_ref()
    }

    /// Break-detect interrupt entry point.
    pub fn on_break(&mut self) {
        self.driver.on_break();
    }

    /// Transmit-timer interrupt entry point.
    pub fn on_tx_timer(&mut self) {
        self.driver.on_tx_timer();
    }

    /// Polls the raw break status, for builds without a UART interrupt.
    pub fn poll_break(&mut self) {
        if self.driver.uart().break_detected() {
            self.driver.on_break();
        }
    }

    /// Runs one main-loop iteration.
    pub fn loop_once(&mut self, now_ms: u32) {
        if !self.is_started() {
            return;
        }
        self.tick = self.tick.wrapping_add(1);
        self.driver.set_epoch(self.tick);

        let mut moved = false;
        if self.driver.take_tx_interrupted() {
            let outcome = self.tx.on_interrupted(&mut self.counters);
            moved = self.record(outcome);
        }

        while !moved {
            let Some(capture) = self.driver.take_capture() else {
                break;
            };
            let expect_ack = self.tx.awaiting_write_ack();
            match self.rx.process(&capture, expect_ack, &mut self.counters) {
                None => {}
                Some(RxEvent::Poll(byte)) => {
                    if self.rx.is_poll_for_us(byte) {
                        moved = self.send_next(now_ms);
                    }
                }
                Some(RxEvent::WriteAck(byte)) => {
                    let outcome = self.tx.on_write_ack(byte, &mut self.counters);
                    moved = self.record(outcome);
                }
                Some(RxEvent::Telegram {
                    telegram,
                    echo,
                    frame_len,
                    ..
                }) => {
                    if echo {
                        self.sink.on_echo(&telegram);
                    } else {
                        let outcome =
                            self.tx
                                .on_telegram(&telegram, frame_len, &mut self.counters);
                        let _ = self.record(outcome);
                        self.sink.on_telegram(&telegram);
                    }
                    break;
                }
            }
        }
        self.tx.set_mask(self.rx.mask().bits());

        if !moved {
            let outcome = self.tx.check_timeout(now_ms, &mut self.counters);
            let _ = self.record(outcome);
        }

        if let Some(reply) = self.tx.take_poll_reply() {
            if let Err(e) = self.driver.send_poll(reply) {
                debug!("poll reply {:#04x} not sent: {}", reply, e);
            }
        }
    }

    /// Queues a read request.
    pub fn send_read_request(
        &mut self,
        type_id: u16,
        dest: u8,
        offset: u8,
    ) -> Result<QueueHandle, QueueError> {
        self.tx.send_read_request(type_id, dest, offset)
    }

    /// Queues a write request, optionally followed by a read of `validate_type_id`.
    pub fn send_write_request(
        &mut self,
        type_id: u16,
        dest: u8,
        offset: u8,
        payload: &[u8],
        validate_type_id: Option<u16>,
    ) -> Result<QueueHandle, QueueError> {
        self.tx
            .send_write_request(type_id, dest, offset, payload, validate_type_id)
    }

    /// Queues a raw telegram given as hex bytes.
    pub fn send_raw(&mut self, hex: &str) -> Result<QueueHandle, QueueError> {
        self.tx.send_raw(hex)
    }

    /// Drops every pending Tx entry.
    pub fn flush_tx(&mut self) {
        self.tx.flush();
    }

    /// Combined bus quality in percent.
    pub fn bus_quality(&self) -> u8 {
        self.counters.bus_quality()
    }

    /// Valid telegrams received since the last reset.
    pub fn telegram_count(&self) -> u32 {
        self.counters.telegrams
    }

    /// CRC failures since the last reset.
    pub fn telegram_error_count(&self) -> u32 {
        self.counters.crc_errors
    }

    /// All counters.
    pub fn counters(&self) -> &BusQualityCounters {
        &self.counters
    }

    /// Zeroes the counters.
    pub fn reset_counters(&mut self) {
        self.counters.reset();
    }

    /// Whether the bus master polled us within the last 30 seconds.
    pub fn bus_connected(&self, now_ms: u32) -> bool {
        self.tx.bus_connected(now_ms)
    }

    /// Detected or configured bus mask.
    pub fn bus_mask(&self) -> BusMask {
        self.rx.mask()
    }

    /// State of the Tx state machine.
    pub fn tx_state(&self) -> TxState {
        self.tx.state()
    }

    /// The Tx pipeline, for inspection.
    pub fn tx(&self) -> &TxService {
        &self.tx
    }

    /// Outcome of the last finished Tx attempt.
    pub fn last_outcome(&self) -> Option<TxOutcome> {
        self.last_outcome
    }

    /// The device layer.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The device layer, mutably.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// The bus driver.
    pub fn driver(&self) -> &BusDriver<U, D> {
        &self.driver
    }

    /// The bus driver, mutably.
    pub fn driver_mut(&mut self) -> &mut BusDriver<U, D> {
        &mut self.driver
    }

    fn apply(&mut self, config: BusConfig) {
        self.rx = RxService::new(config.bus_id, config.bus_mask);
        self.tx.flush();
        self.tx.set_bus_id(config.bus_id);
        self.tx.set_read_only(config.read_only);
        self.tx
            .set_response_timeout(config.dialect.response_timeout_ms());
        self.tx.set_mask(self.rx.mask().bits());
        self.counters.reset();
        self.last_outcome = None;
        self.config = Some(config);
    }

    fn send_next(&mut self, now_ms: u32) -> bool {
        let Some(frame) = self.tx.on_poll_for_us(now_ms, &mut self.counters) else {
            return false;
        };
        let result = self.driver.transmit(&frame);
        let outcome = self.tx.on_sent(result, now_ms, &mut self.counters);
        let _ = self.record(outcome);
        true
    }

    fn record(&mut self, outcome: Option<TxOutcome>) -> bool {
        let Some(outcome) = outcome else {
            return false;
        };
        match outcome {
            TxOutcome::Success { handle, op } => debug!("Tx #{} {:?} done", handle.0, op),
            TxOutcome::Retry { handle, attempt } => {
                debug!("Tx #{} back in queue, attempt {}", handle.0, attempt)
            }
            TxOutcome::Failed { handle, op } => warn!("Tx #{} {:?} given up", handle.0, op),
        }
        self.last_outcome = Some(outcome);
        true
    }
}
