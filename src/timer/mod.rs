//! Bus timing constants, one-shot timer helpers and ISR glue.
//!
//! The EMS bus runs at 9600 baud, 8N1, so one bit lasts ~104 µs and one byte
//! (start + 8 data + stop) ~1040 µs. All dialect delays are expressed in bit
//! times.
//!
//! Contains helpers for polling- and ISR-based scheduling, including:
//! - `compute_timer_reload`: runtime reload calculator for the one-shot Tx timer
//! - `const_timer_reload`: compile-time reload calculator
//! - `run_bus_loop`: blocking main loop for `DelayNs` (feature `delay-loop`)
//! - `global_bus_on_break`, `global_bus_on_tx_timer` and the `ems_*!()` macros:
//!   interrupt entry wrappers (feature `timer-isr`)
//!
//! Common one-shot timer clocks: (For use with `compute_timer_reload`)
//!
//! | Timer clock | Divider | Reload for 1144 µs |
//! |-------------|---------|--------------------|
//! |      80 MHz |      16 |               5720 |
//! |      80 MHz |      80 |               1144 |
//! |      16 MHz |      64 |                286 |

use libm::round;

#[cfg(feature = "delay-loop")]
mod delay;
#[cfg_attr(feature = "delay-loop", allow(unused_imports))]
#[cfg(feature = "delay-loop")]
pub use delay::*;

#[cfg(feature = "timer-isr")]
mod isr;
#[cfg_attr(feature = "timer-isr", allow(unused_imports))]
#[cfg(feature = "timer-isr")]
pub use isr::*;

#[cfg(feature = "timer-isr")]
mod macros;
#[cfg_attr(feature = "timer-isr", allow(unused_imports))]
#[cfg(feature = "timer-isr")]
pub use macros::*;

/// UART baud rate of the EMS bus.
pub const EMSUART_BAUD: u32 = 9_600;
/// One bit at the bus baud rate, rounded down to whole microseconds.
pub const TX_BIT_TIME_US: u32 = 1_000_000 / EMSUART_BAUD;
/// Poll interval while waiting for an echo, 1/8 bit.
pub const TX_BUSY_WAIT_US: u32 = TX_BIT_TIME_US / 8;
/// Poll iterations before an echo wait gives up (20 bit times).
pub const TX_TIMEOUT_LOOPS: u32 = 20 * TX_BIT_TIME_US / TX_BUSY_WAIT_US;
/// Break pulse of the legacy dialects, 10 bit times.
pub const TX_BRK_EMS_US: u32 = bit_times_us(10);
/// Timer-paced spacing: one byte plus one idle bit.
pub const TX_WAIT_DEFAULT_US: u32 = bit_times_us(11);
/// Break held by the timer-paced strategy, 11 bit times.
pub const TX_BRK_TIMER_US: u32 = bit_times_us(11);
/// HT3: one byte plus a 7 bit-time gap.
pub const TX_WAIT_HT3_US: u32 = bit_times_us(17);
/// HT3 break pulse.
pub const TX_BRK_HT3_US: u32 = bit_times_us(11);
/// EMS+: one byte plus another byte time of gap.
pub const TX_WAIT_PLUS_US: u32 = bit_times_us(20);
/// EMS+: extra pause after the first byte for slow receivers.
pub const TX_WAIT_PLUS_FIRST_US: u32 = bit_times_us(20);
/// EMS+ break pulse.
pub const TX_BRK_PLUS_US: u32 = bit_times_us(11);

/// Duration of `bits` bit times at the bus baud rate, in microseconds.
pub const fn bit_times_us(bits: u32) -> u32 {
    bits * TX_BIT_TIME_US
}

/// Computes the reload value of a one-shot timer for a given delay.
///
/// # Arguments
/// - `timer_clock_hz`: input clock of the timer peripheral in Hz
/// - `divider`: timer prescaler (e.g., 16, 80, 256)
/// - `wait_us`: requested delay in microseconds
///
/// # Returns
/// - Timer counts until the callback fires (rounds to nearest integer)
pub fn compute_timer_reload(timer_clock_hz: u32, divider: u32, wait_us: u32) -> u32 {
    let ticks_per_us: f64 = timer_clock_hz as f64 / divider as f64 / 1_000_000.0;
    round(ticks_per_us * wait_us as f64) as u32
}

/// Compile-time reload calculator.
///
/// Integer-only, rounds down. Suitable for `const` tables of dialect delays.
///
/// # Arguments
/// - `timer_clock_hz`: input clock of the timer peripheral in Hz
/// - `divider`: timer prescaler
/// - `wait_us`: requested delay in microseconds
pub const fn const_timer_reload(timer_clock_hz: u32, divider: u32, wait_us: u32) -> u32 {
    ((timer_clock_hz / divider) as u64 * wait_us as u64 / 1_000_000) as u32
}
