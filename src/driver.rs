//! UART bus driver for the EMS heating bus.
//!
//! This module provides the [`BusDriver`] struct, which owns the UART of the
//! gateway and implements the two interrupt entry points of the bus:
//!
//! - [`on_break()`](BusDriver::on_break): the line went into break, so the
//!   bytes in the rx FIFO form one complete telegram. They are copied into the
//!   next free slot of the [`CapturePool`] for the main loop.
//! - [`on_tx_timer()`](BusDriver::on_tx_timer): the one-shot timer of the
//!   timer-paced dialects expired, so the next byte (or the closing break)
//!   goes out.
//!
//! Register access sits behind the [`BusUart`] trait, so the whole driver runs
//! on the host with a mock UART.
//!
//! ## Transmit strategies
//!
//! | [`TxStrategy`] | Bytes | Terminating break |
//! |---|---|---|
//! | `TimerPaced` | one per timer callback | held for one timer period, break IRQ masked |
//! | `Burst` | all at once into the FIFO | generated by the UART once the FIFO drains |
//! | `MicroDelay` | busy-wait after each byte | timed pulse |
//! | `EchoVerified` | each byte waits for its echo | pulse until the break is seen |
//!
//! ## Example
//!
//! ```rust,ignore
//! use emsbus::dialect::Dialect;
//! use emsbus::driver::BusDriver;
//!
//! let mut driver = BusDriver::new(uart, delay);
//! driver.start(Dialect::Ht3, 23, 5)?;
//!
//! // from the UART interrupt
//! driver.on_break();
//!
//! // from the main loop
//! while let Some(capture) = driver.take_capture() {
//!     // decode capture.frame()
//! }
//! ```
//!
//! ## Design Notes
//!
//! The driver never retries and never decodes. A send that collides with a
//! foreign break is reported once (as an error from
//! [`transmit()`](BusDriver::transmit), or through
//! [`take_tx_interrupted()`](BusDriver::take_tx_interrupted) for the
//! interrupt-paced strategy) and the next capture is discarded, since it holds
//! our own truncated bytes.

use core::convert::Infallible;
use core::fmt::Debug;
use core::mem;

use embedded_hal::delay::DelayNs;
use heapless::Vec;
use log::{debug, info, warn};

use crate::consts::{EMS_CAPTURE_SLOTS, EMS_MAXBUFFERSIZE, EMS_MAX_TELEGRAM_LENGTH};
pub use crate::dialect::TxStrategy;
use crate::dialect::Dialect;
use crate::error::{BusTxError, ConfigError};
use crate::timer::{TX_BRK_EMS_US, TX_BUSY_WAIT_US, TX_TIMEOUT_LOOPS};

/// Register-level access to the bus UART.
///
/// Implementations wrap the platform HAL. The UART runs at 9600 baud 8N1
/// with only the break-detect interrupt enabled.
pub trait BusUart {
    /// Error reported by [`configure`](BusUart::configure).
    type Error: Debug;

    /// Routes the UART to the given pins and sets up 9600 8N1 with break detection.
    fn configure(&mut self, rx_pin: u8, tx_pin: u8) -> Result<(), Self::Error>;
    /// Releases the pins and disables the peripheral.
    fn shutdown(&mut self);
    /// Masks or unmasks the break-detect interrupt.
    fn enable_break_interrupt(&mut self, enable: bool);
    /// Clears a pending break-detect status.
    fn acknowledge_break(&mut self);
    /// Pops one byte from the rx FIFO.
    fn read_byte(&mut self) -> Option<u8>;
    /// Number of bytes waiting in the rx FIFO.
    fn rx_fifo_count(&self) -> u8;
    /// Pushes one byte into the tx FIFO.
    fn write_byte(&mut self, byte: u8);
    /// Drives the tx line into (or out of) break.
    ///
    /// For the burst strategy the hardware holds the requested break back
    /// until the tx FIFO has drained.
    fn set_break(&mut self, on: bool);
    /// Raw break-detect status, whether or not the interrupt is enabled.
    fn break_detected(&self) -> bool;
    /// Resets both FIFOs.
    fn flush_fifos(&mut self);
    /// Starts the one-shot transmit timer.
    fn arm_tx_timer(&mut self, us: u32);
    /// Stops the one-shot transmit timer.
    fn disarm_tx_timer(&mut self);
}

/// One telegram as captured between two breaks, break marker stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct RawCapture {
    /// Captured bytes: a 1-byte poll/ack or a 4 to 32 byte telegram.
    pub bytes: Vec<u8, EMS_MAXBUFFERSIZE>,
    /// Main-loop tick during which the break arrived.
    pub epoch: u32,
}

impl RawCapture {
    /// Bytes of the capture.
    pub fn frame(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether this is a single-byte poll or write acknowledgement.
    pub fn is_single_byte(&self) -> bool {
        self.bytes.len() == 1
    }
}

/// Fixed ring of capture slots between the break interrupt and the main loop.
///
/// The interrupt side writes through [`push`](CapturePool::push), the main loop
/// reads through [`pop`](CapturePool::pop). When every slot is occupied the
/// newest capture is lost and counted.
#[derive(Debug)]
pub struct CapturePool {
    slots: [RawCapture; EMS_CAPTURE_SLOTS],
    write: usize,
    read: usize,
    len: usize,
    overruns: u32,
}

impl Default for CapturePool {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| RawCapture::default()),
            write: 0,
            read: 0,
            len: 0,
            overruns: 0,
        }
    }

    /// Copies a frame into the next free slot.
    ///
    /// Returns `false` when the pool is full and the frame was dropped.
    pub fn push(&mut self, frame: &[u8], epoch: u32) -> bool {
        if self.len == EMS_CAPTURE_SLOTS {
            self.overruns = self.overruns.wrapping_add(1);
            return false;
        }
        let slot = &mut self.slots[self.write];
        slot.bytes.clear();
        if slot.bytes.extend_from_slice(frame).is_err() {
            return false;
        }
        slot.epoch = epoch;
        self.write = (self.write + 1) % EMS_CAPTURE_SLOTS;
        self.len += 1;
        true
    }

    /// Takes the oldest capture out of the pool.
    pub fn pop(&mut self) -> Option<RawCapture> {
        if self.len == 0 {
            return None;
        }
        let capture = mem::take(&mut self.slots[self.read]);
        self.read = (self.read + 1) % EMS_CAPTURE_SLOTS;
        self.len -= 1;
        Some(capture)
    }

    /// Number of captures waiting.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no capture is waiting.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Captures lost because every slot was occupied.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Discards every waiting capture.
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Progress of an interrupt-driven send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TxPhase {
    #[default]
    Idle,
    /// Timer-paced bytes still going out
    Bytes,
    /// Timer-paced closing break on the line
    Break,
    /// Burst written, waiting for the hardware break
    HardwareBreak,
}

/// Break-delimited UART driver with the four transmit strategies of the bus dialects.
///
/// ## Type Parameters
///
/// - `U`: the [`BusUart`] wrapping the platform peripheral
/// - `D`: an [`embedded_hal::delay::DelayNs`] for the busy-wait strategies
///
/// ## Notes
///
/// - Only one `BusDriver` should be active if you're using interrupts; see
///   [`crate::timer`] for the `critical-section` glue.
/// - Nothing here blocks except the micro-delay and echo-verified sends, and
///   those are bounded by the timing constants.
#[derive(Debug)]
pub struct BusDriver<U, D>
where
    U: BusUart,
    D: DelayNs,
{
    uart: U,
    delay: D,
    dialect: Option<Dialect>,
    captures: CapturePool,
    drop_next_rx: bool,
    epoch: u32,
    tx_buf: Vec<u8, EMS_MAXBUFFERSIZE>,
    tx_index: usize,
    tx_phase: TxPhase,
    tx_interrupted: bool,
}

impl<U, D> BusDriver<U, D>
where
    U: BusUart,
    D: DelayNs,
{
    /// Wraps a UART and a delay source. The driver stays stopped until [`start`](Self::start).
    pub fn new(uart: U, delay: D) -> Self {
        Self {
            uart,
            delay,
            dialect: None,
            captures: CapturePool::new(),
            drop_next_rx: true,
            epoch: 0,
            tx_buf: Vec::new(),
            tx_index: 0,
            tx_phase: TxPhase::Idle,
            tx_interrupted: false,
        }
    }

    /// Configures the UART and begins listening.
    ///
    /// Starting an already running driver only switches the dialect, see
    /// [`restart`](Self::restart).
    ///
    /// # Errors
    /// - [`ConfigError::PinConflict`] when rx and tx share a pin
    /// - [`ConfigError::UartRejected`] when the UART refuses the pins
    ///
    /// On error the driver is left stopped.
    pub fn start(&mut self, dialect: Dialect, rx_pin: u8, tx_pin: u8) -> Result<(), ConfigError> {
        dialect.validate()?;
        if self.dialect.is_some() {
            self.restart(dialect);
            return Ok(());
        }
        if rx_pin == tx_pin {
            return Err(ConfigError::PinConflict(rx_pin));
        }
        if let Err(e) = self.uart.configure(rx_pin, tx_pin) {
            warn!("UART rejected rx {} / tx {}: {:?}", rx_pin, tx_pin, e);
            return Err(ConfigError::UartRejected {
                rx: rx_pin,
                tx: tx_pin,
            });
        }
        self.uart.enable_break_interrupt(false);
        self.uart.flush_fifos();
        self.captures.clear();
        info!("bus driver started, dialect {:?}", dialect);
        self.restart(dialect);
        Ok(())
    }

    /// Switches the dialect and re-arms the break interrupt.
    ///
    /// A break that arrived while the interrupt was masked means the next
    /// capture is partial, so it is dropped.
    pub fn restart(&mut self, dialect: Dialect) {
        self.uart.enable_break_interrupt(false);
        self.abort_tx();
        self.dialect = Some(dialect);
        if self.uart.break_detected() {
            self.uart.acknowledge_break();
            self.drop_next_rx = true;
        }
        self.uart.enable_break_interrupt(true);
        debug!("bus driver restarted, strategy {:?}", dialect.strategy());
    }

    /// Masks every interrupt and releases the UART.
    pub fn stop(&mut self) {
        self.uart.enable_break_interrupt(false);
        self.abort_tx();
        self.uart.shutdown();
        self.dialect = None;
        self.drop_next_rx = true;
        info!("bus driver stopped");
    }

    /// Whether [`start`](Self::start) succeeded and [`stop`](Self::stop) was not called since.
    pub fn is_started(&self) -> bool {
        self.dialect.is_some()
    }

    /// Active dialect, if started.
    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    /// Tags subsequent captures with the main-loop tick they arrive in.
    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
    }

    /// Break-detect interrupt entry point.
    ///
    /// Drains the rx FIFO, skips a leading stray zero, strips the trailing
    /// break marker and keeps single-byte frames and frames of 4 to 32 bytes.
    pub fn on_break(&mut self) {
        self.uart.acknowledge_break();

        let mut buf: Vec<u8, EMS_MAXBUFFERSIZE> = Vec::new();
        while let Some(rx) = self.uart.read_byte() {
            if buf.is_empty() && rx == 0 {
                continue;
            }
            if buf.push(rx).is_err() {
                self.drop_next_rx = true;
            }
        }

        let frame = match buf.split_last() {
            Some((&0, rest)) => rest,
            _ => &buf[..],
        };
        let keep = frame.len() == 1
            || (4..=usize::from(EMS_MAX_TELEGRAM_LENGTH)).contains(&frame.len());
        if self.is_started() && !self.drop_next_rx && keep {
            let _ = self.captures.push(frame, self.epoch);
        }
        self.drop_next_rx = false;

        match self.tx_phase {
            TxPhase::Bytes => {
                // foreign break while our bytes were still going out
                self.uart.disarm_tx_timer();
                self.tx_phase = TxPhase::Idle;
                self.tx_interrupted = true;
                self.drop_next_rx = true;
            }
            TxPhase::HardwareBreak => {
                self.uart.set_break(false);
                self.tx_phase = TxPhase::Idle;
            }
            TxPhase::Break | TxPhase::Idle => {}
        }
    }

    /// One-shot timer entry point of the timer-paced strategy.
    pub fn on_tx_timer(&mut self) {
        let (wait_us, brk_us) = match self.dialect.map(|d| d.strategy()) {
            Some(TxStrategy::TimerPaced { wait_us, brk_us }) => (wait_us, brk_us),
            _ => return,
        };
        match self.tx_phase {
            TxPhase::Bytes => {
                if let Some(&byte) = self.tx_buf.get(self.tx_index) {
                    self.uart.write_byte(byte);
                    self.tx_index += 1;
                    self.uart.arm_tx_timer(wait_us);
                } else {
                    // our own break must not be captured as a telegram end
                    self.uart.enable_break_interrupt(false);
                    self.uart.set_break(true);
                    self.tx_phase = TxPhase::Break;
                    self.uart.arm_tx_timer(brk_us);
                }
            }
            TxPhase::Break => {
                // the break status stays pending, so the echo of our bytes
                // is delivered as a capture of its own
                self.uart.set_break(false);
                self.tx_phase = TxPhase::Idle;
                self.uart.enable_break_interrupt(true);
            }
            TxPhase::Idle | TxPhase::HardwareBreak => {}
        }
    }

    /// Sends a complete frame, CRC included, followed by a break.
    ///
    /// The timer-paced and burst strategies return once the first bytes are
    /// queued; poll [`sending`](Self::sending) or [`wait_sent`](Self::wait_sent)
    /// for completion. The busy-wait strategies return when the break is done.
    ///
    /// # Errors
    /// - [`BusTxError::NotStarted`], [`BusTxError::Empty`], [`BusTxError::TooLong`]
    /// - [`BusTxError::Busy`] while an interrupt-driven send is in flight
    /// - [`BusTxError::BreakDuringSend`] when the bus master cut us off
    /// - [`BusTxError::WatchdogTimeout`] when an echo did not arrive in time
    pub fn transmit(&mut self, bytes: &[u8]) -> Result<(), BusTxError> {
        let strategy = self
            .dialect
            .map(|d| d.strategy())
            .ok_or(BusTxError::NotStarted)?;
        if bytes.is_empty() {
            return Err(BusTxError::Empty);
        }
        if bytes.len() > usize::from(EMS_MAX_TELEGRAM_LENGTH) {
            return Err(BusTxError::TooLong);
        }
        if self.sending() {
            return Err(BusTxError::Busy);
        }
        self.uart.set_break(false);

        match strategy {
            TxStrategy::TimerPaced { wait_us, .. } => {
                self.tx_buf.clear();
                self.tx_buf
                    .extend_from_slice(bytes)
                    .map_err(|_| BusTxError::TooLong)?;
                self.tx_index = 1;
                self.tx_phase = TxPhase::Bytes;
                self.uart.write_byte(bytes[0]);
                self.uart.arm_tx_timer(wait_us);
                Ok(())
            }
            TxStrategy::Burst => {
                for &byte in bytes {
                    self.uart.write_byte(byte);
                }
                self.uart.set_break(true);
                self.tx_phase = TxPhase::HardwareBreak;
                Ok(())
            }
            TxStrategy::MicroDelay {
                wait_us,
                first_wait_us,
                brk_us,
            } => self.send_micro_delay(bytes, wait_us, first_wait_us, brk_us),
            TxStrategy::EchoVerified => {
                self.uart.enable_break_interrupt(false);
                self.uart.flush_fifos();
                let result = self.send_echo_verified(bytes);
                if result.is_err() {
                    self.drop_next_rx = true;
                }
                self.uart.enable_break_interrupt(true);
                result
            }
        }
    }

    /// Sends a single poll or poll-reply byte followed by a break.
    pub fn send_poll(&mut self, byte: u8) -> Result<(), BusTxError> {
        self.transmit(&[byte])
    }

    /// Whether an interrupt-driven send is still in progress.
    pub fn sending(&self) -> bool {
        self.tx_phase != TxPhase::Idle
    }

    /// Non-blocking completion check, for use with `nb::block!`.
    pub fn wait_sent(&self) -> nb::Result<(), Infallible> {
        if self.sending() {
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    /// Reports (once) that a timer-paced send was cut short by a foreign break.
    pub fn take_tx_interrupted(&mut self) -> bool {
        mem::take(&mut self.tx_interrupted)
    }

    /// Takes the oldest capture handed up by the break interrupt.
    pub fn take_capture(&mut self) -> Option<RawCapture> {
        self.captures.pop()
    }

    /// Captures waiting for the main loop.
    pub fn pending_captures(&self) -> usize {
        self.captures.len()
    }

    /// Captures lost to a full pool since construction.
    pub fn capture_overruns(&self) -> u32 {
        self.captures.overruns()
    }

    /// Shared access to the UART.
    pub fn uart(&self) -> &U {
        &self.uart
    }

    /// Exclusive access to the UART, for platform glue.
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    /// Gives back the UART and the delay source.
    pub fn release(self) -> (U, D) {
        (self.uart, self.delay)
    }

    fn abort_tx(&mut self) {
        self.uart.disarm_tx_timer();
        self.uart.set_break(false);
        self.tx_phase = TxPhase::Idle;
        self.tx_index = 0;
        self.tx_buf.clear();
        self.tx_interrupted = false;
    }

    fn break_pulse(&mut self, brk_us: u32) {
        self.uart.set_break(true);
        self.delay.delay_us(brk_us);
        self.uart.set_break(false);
    }

    fn send_micro_delay(
        &mut self,
        bytes: &[u8],
        wait_us: u32,
        first_wait_us: u32,
        brk_us: u32,
    ) -> Result<(), BusTxError> {
        for (i, &byte) in bytes.iter().enumerate() {
            self.uart.write_byte(byte);
            self.delay.delay_us(wait_us);
            if i == 0 && first_wait_us > 0 {
                self.delay.delay_us(first_wait_us);
            }
            if self.uart.break_detected() {
                self.drop_next_rx = true;
                return Err(BusTxError::BreakDuringSend);
            }
        }
        self.break_pulse(brk_us);
        Ok(())
    }

    fn send_echo_verified(&mut self, bytes: &[u8]) -> Result<(), BusTxError> {
        for &byte in bytes {
            let before = self.uart.rx_fifo_count();
            self.uart.write_byte(byte);
            let mut budget = TX_TIMEOUT_LOOPS;
            while self.uart.rx_fifo_count() == before {
                if self.uart.break_detected() {
                    return Err(BusTxError::BreakDuringSend);
                }
                budget -= 1;
                if budget == 0 {
                    return Err(BusTxError::WatchdogTimeout);
                }
                self.delay.delay_us(TX_BUSY_WAIT_US);
            }
        }
        if self.uart.break_detected() {
            return Err(BusTxError::BreakDuringSend);
        }

        // closing break, held until the loopback sees it
        self.uart.set_break(true);
        let mut budget = TX_TIMEOUT_LOOPS;
        while !self.uart.break_detected() && budget > 0 {
            budget -= 1;
            self.delay.delay_us(TX_BUSY_WAIT_US);
        }
        if budget == 0 {
            self.delay.delay_us(TX_BRK_EMS_US);
        }
        self.uart.set_break(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockUart;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    fn started(uart: MockUart, dialect: Dialect) -> BusDriver<MockUart, NoopDelay> {
        let mut driver = BusDriver::new(uart, NoopDelay::new());
        driver.start(dialect, 23, 5).unwrap();
        driver
    }

    #[test]
    fn test_start_rejects_shared_pin() {
        let mut driver = BusDriver::new(MockUart::new(), NoopDelay::new());
        assert_eq!(driver.start(Dialect::Default, 4, 4), Err(ConfigError::PinConflict(4)));
        assert!(!driver.is_started());
        assert!(driver.uart().configured.is_none());
    }

    #[test]
    fn test_start_reports_uart_failure() {
        let mut uart = MockUart::new();
        uart.reject_configure = true;
        let mut driver = BusDriver::new(uart, NoopDelay::new());
        assert_eq!(
            driver.start(Dialect::Default, 23, 5),
            Err(ConfigError::UartRejected { rx: 23, tx: 5 })
        );
        assert!(!driver.is_started());
        assert!(!driver.uart().break_irq);
    }

    #[test]
    fn test_start_enables_break_interrupt() {
        let driver = started(MockUart::new(), Dialect::Ht3);
        assert!(driver.uart().break_irq);
        assert_eq!(driver.uart().configured, Some((23, 5)));
        assert_eq!(driver.uart().flushes, 1);
    }

    #[test]
    fn test_first_capture_after_start_is_dropped() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.uart_mut().feed(&[0x08, 0x00, 0x18, 0x00, 0x11, 0x00]);
        driver.on_break();
        assert!(driver.take_capture().is_none());

        driver.uart_mut().feed(&[0x8B, 0x00]);
        driver.on_break();
        let capture = driver.take_capture().unwrap();
        assert_eq!(capture.frame(), &[0x8B]);
        assert!(capture.is_single_byte());
    }

    #[test]
    fn test_capture_strips_marker_and_leading_zero() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.on_break();
        driver.set_epoch(7);
        driver
            .uart_mut()
            .feed(&[0x00, 0x08, 0x00, 0x18, 0x00, 0x11, 0x00]);
        driver.on_break();
        let capture = driver.take_capture().unwrap();
        assert_eq!(capture.frame(), &[0x08, 0x00, 0x18, 0x00, 0x11]);
        assert_eq!(capture.epoch, 7);
    }

    #[test]
    fn test_capture_without_marker_keeps_last_byte() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.on_break();
        driver.uart_mut().feed(&[0x08, 0x00, 0x18, 0x00, 0x11]);
        driver.on_break();
        assert_eq!(driver.take_capture().unwrap().frame().len(), 5);
    }

    #[test]
    fn test_short_captures_are_ignored() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.on_break();
        for noise in [&[0x00][..], &[0x08, 0x00, 0x00], &[0x08, 0x00, 0x18, 0x00]] {
            driver.uart_mut().feed(noise);
            driver.on_break();
        }
        assert_eq!(driver.pending_captures(), 0);
    }

    #[test]
    fn test_overflow_drops_capture() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.on_break();
        driver.uart_mut().feed(&[0x55; 40]);
        driver.on_break();
        assert_eq!(driver.pending_captures(), 0);
        driver.uart_mut().feed(&[0x8B, 0x00]);
        driver.on_break();
        assert_eq!(driver.pending_captures(), 1);
    }

    #[test]
    fn test_capture_pool_full_counts_overrun() {
        let mut pool = CapturePool::new();
        for i in 0..EMS_CAPTURE_SLOTS {
            assert!(pool.push(&[i as u8], 0));
        }
        assert!(!pool.push(&[0xFF], 0));
        assert_eq!(pool.overruns(), 1);
        assert_eq!(pool.pop().unwrap().frame(), &[0x00]);
        assert!(pool.push(&[0xFE], 1));
        assert_eq!(pool.len(), EMS_CAPTURE_SLOTS);
        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_transmit_validation() {
        let mut driver = BusDriver::new(MockUart::new(), NoopDelay::new());
        assert_eq!(driver.transmit(&[0x0B]), Err(BusTxError::NotStarted));
        let mut driver = started(MockUart::new(), Dialect::Ht3);
        assert_eq!(driver.transmit(&[]), Err(BusTxError::Empty));
        assert_eq!(driver.transmit(&[0u8; 33]), Err(BusTxError::TooLong));
    }

    #[test]
    fn test_timer_paced_send() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.transmit(&[0x0B, 0x88, 0x18, 0x00]).unwrap();
        assert!(driver.sending());
        assert_eq!(driver.wait_sent(), Err(nb::Error::WouldBlock));
        assert_eq!(driver.uart().written, [0x0B]);
        assert_eq!(driver.transmit(&[0x0B]), Err(BusTxError::Busy));

        for _ in 0..3 {
            driver.on_tx_timer();
        }
        assert_eq!(driver.uart().written, [0x0B, 0x88, 0x18, 0x00]);

        driver.on_tx_timer();
        assert!(driver.uart().break_level);
        assert!(!driver.uart().break_irq);

        driver.on_tx_timer();
        assert!(!driver.uart().break_level);
        assert!(driver.uart().break_irq);
        assert!(!driver.sending());
        assert_eq!(driver.wait_sent(), Ok(()));
        assert_eq!(driver.uart().break_pulses, [true, false]);
    }

    #[test]
    fn test_timer_paced_echo_is_its_own_capture() {
        let mut driver = started(MockUart::echoing(), Dialect::Default);
        driver.on_break();
        let frame = [0x0B, 0x08, 0x35, 0x00, 0x01, 0x25];
        driver.transmit(&frame).unwrap();
        while driver.sending() {
            driver.on_tx_timer();
        }
        // our own break is still pending once the interrupt is unmasked
        assert!(driver.uart().break_irq);
        assert!(driver.uart().break_detected());
        driver.on_break();
        assert_eq!(driver.take_capture().unwrap().frame(), &frame);

        driver.uart_mut().feed(&[0x01, 0x00]);
        driver.on_break();
        assert_eq!(driver.take_capture().unwrap().frame(), &[0x01]);
    }

    #[test]
    fn test_timer_paced_custom_spacing() {
        let mut driver = started(MockUart::new(), Dialect::Custom(150));
        driver.send_poll(0x8B).unwrap();
        assert_eq!(driver.uart().timer, Some(150 * 104));
    }

    #[test]
    fn test_break_interrupts_timer_paced_send() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.on_break();
        driver.transmit(&[0x0B, 0x88, 0x18, 0x00, 0x20, 0x5C]).unwrap();
        driver.on_tx_timer();

        driver.uart_mut().feed(&[0x08, 0x00, 0x18, 0x00, 0x11, 0x00]);
        driver.on_break();
        assert!(!driver.sending());
        assert!(driver.uart().timer.is_none());
        assert!(driver.take_tx_interrupted());
        assert!(!driver.take_tx_interrupted());
        assert_eq!(driver.pending_captures(), 1);

        // our truncated bytes are discarded
        driver.uart_mut().feed(&[0x0B, 0x88, 0x18, 0x00, 0x00]);
        driver.on_break();
        assert_eq!(driver.pending_captures(), 1);
    }

    #[test]
    fn test_burst_send_waits_for_hardware_break() {
        let mut driver = started(MockUart::new(), Dialect::Hardware);
        driver.transmit(&[0x0B, 0x08, 0x35, 0x00, 0x01, 0x99]).unwrap();
        assert_eq!(driver.uart().written.len(), 6);
        assert!(driver.uart().break_level);
        assert!(driver.sending());
        driver.on_break();
        assert!(!driver.uart().break_level);
        assert!(!driver.sending());
    }

    #[test]
    fn test_micro_delay_send() {
        let mut driver = started(MockUart::new(), Dialect::EmsPlus);
        driver.transmit(&[0x0B, 0x88, 0x18, 0x00, 0x20, 0x5C]).unwrap();
        assert_eq!(driver.uart().written.len(), 6);
        assert_eq!(driver.uart().break_pulses, [true, false]);
        assert!(!driver.sending());
    }

    #[test]
    fn test_micro_delay_collision() {
        let mut uart = MockUart::new();
        uart.break_after_writes = Some(2);
        let mut driver = started(uart, Dialect::Ht3);
        assert_eq!(
            driver.transmit(&[0x0B, 0x88, 0x18, 0x00, 0x20, 0x5C]),
            Err(BusTxError::BreakDuringSend)
        );
        assert_eq!(driver.uart().written.len(), 2);
        assert!(driver.uart().break_pulses.is_empty());
    }

    #[test]
    fn test_echo_verified_send() {
        let mut driver = started(MockUart::echoing(), Dialect::EchoVerified);
        driver.on_break();
        driver.transmit(&[0x0B, 0x88, 0x18, 0x00, 0x20, 0x5C]).unwrap();
        assert_eq!(driver.uart().written.len(), 6);
        assert_eq!(driver.uart().break_pulses, [true, false]);
        assert!(driver.uart().break_irq);

        // the loopback frame is captured at the break like any other
        driver.on_break();
        assert_eq!(
            driver.take_capture().unwrap().frame(),
            &[0x0B, 0x88, 0x18, 0x00, 0x20, 0x5C]
        );
    }

    #[test]
    fn test_echo_verified_watchdog() {
        let mut driver = started(MockUart::new(), Dialect::EchoVerified);
        assert_eq!(driver.transmit(&[0x0B, 0x88]), Err(BusTxError::WatchdogTimeout));
        assert_eq!(driver.uart().written, [0x0B]);
        assert!(driver.uart().break_irq);

        driver.uart_mut().feed(&[0x8B, 0x00]);
        driver.on_break();
        assert_eq!(driver.pending_captures(), 0);
    }

    #[test]
    fn test_echo_verified_break_during_send() {
        let mut uart = MockUart::new();
        uart.break_after_writes = Some(1);
        let mut driver = started(uart, Dialect::EchoVerified);
        assert_eq!(driver.transmit(&[0x0B, 0x88]), Err(BusTxError::BreakDuringSend));
    }

    #[test]
    fn test_restart_switches_strategy() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.transmit(&[0x0B, 0x88, 0x18, 0x00]).unwrap();
        driver.start(Dialect::Hardware, 23, 5).unwrap();
        assert_eq!(driver.dialect(), Some(Dialect::Hardware));
        assert!(!driver.sending());
        assert!(driver.uart().timer.is_none());
    }

    #[test]
    fn test_stop_releases_uart() {
        let mut driver = started(MockUart::new(), Dialect::Default);
        driver.stop();
        assert!(!driver.is_started());
        assert!(!driver.uart().break_irq);
        assert!(driver.uart().configured.is_none());
        driver.uart_mut().feed(&[0x8B, 0x00]);
        driver.on_break();
        assert_eq!(driver.pending_captures(), 0);
        let (uart, _delay) = driver.release();
        assert!(uart.rx_fifo.is_empty());
    }
}
