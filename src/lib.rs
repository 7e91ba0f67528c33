//! # emsbus
//!
//! A portable, no_std Rust transport for the EMS heating bus spoken by Bosch,
//! Buderus, Junkers and Nefit boilers, thermostats and mixers.
//!
//! The crate sits between a UART peripheral and a device layer:
//! - `embedded-hal` traits for timing, and a small [`driver::BusUart`] trait
//!   for the UART, its break detector and a one-shot transmit timer
//! - break-delimited capture of raw frames from interrupt context
//! - a telegram codec with the EMS CRC, the 0xFF/0xF7/0xF9 EMS+ layouts and
//!   the HT3 source mask
//! - an Rx pipeline that drops duplicates, corrupted and foreign frames
//! - a poll-gated Tx queue with write acknowledgements, read matching,
//!   timeouts and bounded retries
//! - interrupt-safe global access with `critical-section`
//!
//! ## Crate features
//! | Feature               | Description |
//! |-----------------------|-------------|
//! | `std`                 | Disables `#![no_std]` support |
//! | `delay-loop`          | Adds `run_bus_loop` driven by `embedded_hal::delay::DelayNs` |
//! | `timer-isr` (default) | Adds the `critical_section` globals and the `ems_*!()` ISR macros |
//! | `defmt-0-3`           | Derives `defmt::Format` on the public data types |
//!
//! Diagnostics go through the `log` facade; pick any logger for the target.
//!
//! ## Bus dialects
//!
//! | tx_mode | Dialect        | Transmit strategy                              |
//! |---------|----------------|------------------------------------------------|
//! | 1       | `Default`      | one byte per timer tick, 11 bit times apart    |
//! | 2       | `EmsPlus`      | busy-wait 20 bit times, extra first gap        |
//! | 3       | `Ht3`          | busy-wait 17 bit times per byte                |
//! | 4       | `Hardware`     | burst, the UART inserts the break              |
//! | 5       | `EchoVerified` | wait for each byte's echo, timed break         |
//! | > 100   | `Custom(n)`    | one byte per timer tick, `n` bit times apart   |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use emsbus::engine::{BusConfig, BusEngine};
//!
//! let mut engine = BusEngine::new(uart, delay, devices);
//! engine.start(BusConfig::default())?;
//! let _ = engine.send_read_request(0x08, 0x18, 0);
//! loop {
//!     engine.loop_once(millis());
//! }
//! ```
//!
//! Call [`engine::BusEngine::on_break`] from the UART break interrupt and
//! [`engine::BusEngine::on_tx_timer`] from the one-shot timer interrupt, or
//! use the `init_ems_bus!`/`ems_on_break!` macros with the `timer-isr` feature.
//!
//! ## Platform glue
//!
//! The engine asks for one-shot timer delays in microseconds through
//! [`driver::BusUart::arm_tx_timer`]. The HAL side converts those into
//! timer counts with [`timer::compute_timer_reload`], or with
//! [`timer::const_timer_reload`] when the delays are fixed at compile time.
//! [`timer::EMSUART_BAUD`] and [`timer::bit_times_us`] give the UART setup
//! and any custom spacing the same bit time the dialects use.
//!
//! ```rust
//! use emsbus::timer::{const_timer_reload, TX_WAIT_DEFAULT_US};
//!
//! // 80 MHz APB clock, prescaler 80: one count per microsecond
//! const DEFAULT_RELOAD: u32 = const_timer_reload(80_000_000, 80, TX_WAIT_DEFAULT_US);
//! assert_eq!(DEFAULT_RELOAD, 1_144);
//! ```
//!
//! ## Integration Notes
//!
//! - The bus runs at 9600 baud 8N1; the UART must raise an interrupt on a
//!   received break (line held low for more than one character).
//! - Only one engine instance should be active per bus in interrupt-driven mode.
//! - The engine transmits only after the bus master polls its bus id.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(all(test, not(feature = "std")))]
extern crate std;

#[cfg(feature = "timer-isr")]
pub use critical_section;

pub use heapless;

pub mod consts;
pub(crate) mod crc;
pub mod dialect;
pub mod driver;
pub mod engine;
pub mod error;
#[cfg(test)]
#[allow(dead_code)]
mod mock;
pub mod rx;
pub mod stats;
pub mod telegram;
pub mod timer;
pub mod tx;
