//! Host-side UART double for the driver and engine tests.

use std::collections::VecDeque;
use std::vec::Vec;

use crate::driver::BusUart;

/// Records everything the driver does and plays back scripted bus traffic.
#[derive(Debug, Default)]
pub(crate) struct MockUart {
    pub rx_fifo: VecDeque<u8>,
    pub written: Vec<u8>,
    /// Loop written bytes back into the rx FIFO, like the bus master echo.
    pub echo: bool,
    /// Raw break status bit.
    pub break_flag: bool,
    /// Raise the break status after this many written bytes.
    pub break_after_writes: Option<usize>,
    pub break_irq: bool,
    pub break_level: bool,
    /// Every change of the tx break level, in order.
    pub break_pulses: Vec<bool>,
    pub timer: Option<u32>,
    pub configured: Option<(u8, u8)>,
    pub reject_configure: bool,
    pub flushes: usize,
}

impl MockUart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Queues bytes as if they arrived on the wire.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx_fifo.extend(bytes.iter().copied());
    }
}

impl BusUart for MockUart {
    type Error = ();

    fn configure(&mut self, rx_pin: u8, tx_pin: u8) -> Result<(), Self::Error> {
        if self.reject_configure {
            return Err(());
        }
        self.configured = Some((rx_pin, tx_pin));
        Ok(())
    }

    fn shutdown(&mut self) {
        self.configured = None;
    }

    fn enable_break_interrupt(&mut self, enable: bool) {
        self.break_irq = enable;
    }

    fn acknowledge_break(&mut self) {
        self.break_flag = false;
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx_fifo.pop_front()
    }

    fn rx_fifo_count(&self) -> u8 {
        self.rx_fifo.len().min(usize::from(u8::MAX)) as u8
    }

    fn write_byte(&mut self, byte: u8) {
        self.written.push(byte);
        if self.echo {
            self.rx_fifo.push_back(byte);
        }
        if self.break_after_writes == Some(self.written.len()) {
            self.break_flag = true;
        }
    }

    fn set_break(&mut self, on: bool) {
        if on != self.break_level {
            self.break_pulses.push(on);
        }
        self.break_level = on;
        if on && self.echo {
            self.break_flag = true;
        }
    }

    fn break_detected(&self) -> bool {
        self.break_flag
    }

    fn flush_fifos(&mut self) {
        self.rx_fifo.clear();
        self.flushes += 1;
    }

    fn arm_tx_timer(&mut self, us: u32) {
        self.timer = Some(us);
    }

    fn disarm_tx_timer(&mut self) {
        self.timer = None;
    }
}
