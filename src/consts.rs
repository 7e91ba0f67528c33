//! Constants used across the EMS bus implementation.
//!
//! This module defines protocol-wide constants used for buffer sizing,
//! header layout, addressing and Tx bookkeeping.
//!
//! ## Key Concepts
//!
//! - **Frames**: A telegram is at most 32 bytes on the wire including its CRC.
//!   The UART additionally sees the terminating break as a trailing `0x00`.
//! - **Headers**: EMS 1.0 uses a fixed 4-byte header (`src dest type offset`).
//!   EMS+ telegrams carry a sentinel byte (`0xFF`, `0xF7`, `0xF9`) in the type
//!   position followed by a 2-byte type id.
//! - **Addressing**: Device ids are 7 bits. The MSB of `dest` marks a read
//!   request, the MSB of `src` carries the bus mask on HT3 installations.
//! - **Write acknowledgement**: A device answers a write with a single byte,
//!   [`TX_WRITE_SUCCESS`] or [`TX_WRITE_FAIL`].

/// Size of one raw capture buffer: a maximum-length telegram plus the break marker.
pub const EMS_MAXBUFFERSIZE: usize = 33;

/// Maximum length (in bytes) of a complete telegram, CRC included.
pub const EMS_MAX_TELEGRAM_LENGTH: u8 = 32;

/// Maximum size of the message block of a telegram, assuming the EMS 1.0 header.
pub const EMS_MAX_TELEGRAM_MESSAGE_LENGTH: usize = 27;

/// Smallest telegram the codec accepts: `src dest type offset crc`.
pub const EMS_MIN_TELEGRAM_LENGTH: usize = 5;

/// Number of raw-capture slots shared between the break interrupt and the main loop.
pub const EMS_CAPTURE_SLOTS: usize = 8;

/// Type byte announcing an EMS+ telegram with a 2-byte type id.
pub const EMS_TYPE_EXTENDED: u8 = 0xFF;

/// EMS+ type bytes `0xF0..=0xFE` announce the alternative extended layouts (e.g. `0xF7`, `0xF9`).
pub const EMS_TYPE_EXTENSION_MIN: u8 = 0xF0;

/// Offset added to the two extended type bytes, so EMS+ ids never collide with EMS 1.0 ids.
pub const EMS_TYPE_PLUS_BASE: u16 = 0x100;

/// MSB of the `dest` byte: set for read requests.
pub const EMS_READ_FLAG: u8 = 0x80;

/// Mask stripping the read flag / bus mask from an address byte.
pub const EMS_ID_MASK: u8 = 0x7F;

/// Broadcast destination.
pub const EMS_DEVICE_ID_BROADCAST: u8 = 0x00;

/// Bus id used by gateways unless configured otherwise (service key).
pub const EMS_DEFAULT_BUS_ID: u8 = 0x0B;

/// Bus mask of Buderus (EMS 1.0 / EMS+) installations.
pub const EMS_MASK_BUDERUS: u8 = 0x00;

/// Bus mask of Junkers/HT3 installations.
pub const EMS_MASK_HT3: u8 = 0x80;

/// Single-byte answer to a successful write.
pub const TX_WRITE_SUCCESS: u8 = 0x01;

/// Single-byte answer to a rejected write.
pub const TX_WRITE_FAIL: u8 = 0x04;

/// Retries after the first attempt before an entry is dropped.
pub const MAXIMUM_TX_RETRIES: u8 = 3;

/// Capacity of the Tx queue.
pub const MAX_TX_TELEGRAMS: usize = 30;

/// Milliseconds without a poll addressed to us before the bus counts as disconnected.
pub const EMS_BUS_TIMEOUT_MS: u32 = 30_000;

/// Longest raw telegram accepted by
/// [`TxService::send_raw`](crate::tx::TxService::send_raw), without CRC.
pub const EMS_MAX_RAW_LENGTH: usize = (EMS_MAX_TELEGRAM_LENGTH - 1) as usize;

/// Tx-mode values above this are a custom inter-byte delay in bit times.
pub const TX_MODE_CUSTOM_THRESHOLD: u8 = 100;
