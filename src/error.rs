//! Error types of the bus core.
//!
//! Frame and transmit errors are routine on a shared, lossy wire: the engine
//! absorbs them into [`BusQualityCounters`](crate::stats::BusQualityCounters)
//! and never hands them to the device layer. Only [`ConfigError`] reaches the
//! caller, from [`BusEngine::start`](crate::engine::BusEngine::start).

use thiserror::Error;

/// Reasons a raw capture is not a usable telegram.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than the smallest header plus CRC.
    #[error("telegram too short: {len} bytes")]
    TooShort {
        /// Length of the rejected frame
        len: usize,
    },
    /// More bytes than fit in one telegram.
    #[error("telegram too long: {len} bytes")]
    TooLong {
        /// Length of the rejected frame
        len: usize,
    },
    /// The trailing CRC byte does not match the computed one.
    #[error("bad CRC: computed {computed:#04x}, received {received:#04x}")]
    BadCrc {
        /// CRC computed over the frame
        computed: u8,
        /// CRC byte found at the end of the frame
        received: u8,
    },
    /// An EMS+ header too short to carry its 2-byte type id.
    #[error("EMS+ telegram without type id")]
    MissingTypeId,
    /// The type id cannot be encoded: `0xF0..=0xFF` are header sentinels.
    #[error("type id {0:#06x} is reserved for EMS+ headers")]
    ReservedTypeId(u16),
}

/// Failures of a single transmission attempt.
///
/// None of these are retried by the driver; the Tx pipeline owns the retry policy.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BusTxError {
    /// Nothing to send.
    #[error("nothing to send")]
    Empty,
    /// The frame does not fit in the transmit buffer.
    #[error("frame too long for the bus")]
    TooLong,
    /// A break was seen on the line while our bytes were going out.
    #[error("break detected during send")]
    BreakDuringSend,
    /// The bus master stopped echoing our bytes.
    #[error("watchdog timeout waiting for echo")]
    WatchdogTimeout,
    /// A timer-paced send is still in progress.
    #[error("transmitter busy")]
    Busy,
    /// The driver has not been started.
    #[error("bus driver not started")]
    NotStarted,
}

impl BusTxError {
    /// Whether the Tx pipeline should spend a retry on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusTxError::BreakDuringSend | BusTxError::WatchdogTimeout | BusTxError::Busy
        )
    }
}

/// Invalid configuration handed to [`BusEngine::start`](crate::engine::BusEngine::start).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum ConfigError {
    /// Numeric tx mode that selects no dialect.
    #[error("tx mode {0} selects no bus dialect")]
    InvalidDialect(u8),
    /// A custom dialect with a zero delay.
    #[error("custom dialect needs a non-zero delay")]
    ZeroCustomDelay,
    /// Bus ids are 7-bit and non-zero.
    #[error("bus id {0:#04x} out of range")]
    InvalidBusId(u8),
    /// Rx and tx on the same pin.
    #[error("rx and tx pins must differ (both {0})")]
    PinConflict(u8),
    /// The UART refused the pin assignment.
    #[error("UART rejected rx pin {rx} / tx pin {tx}")]
    UartRejected {
        /// Requested rx pin
        rx: u8,
        /// Requested tx pin
        tx: u8,
    },
    /// The engine is not running, so it cannot be restarted.
    #[error("bus engine not started")]
    NotStarted,
}

/// Problems adding an entry to the Tx queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum QueueError {
    /// Payload longer than a telegram can carry.
    #[error("payload of {0} bytes does not fit in a telegram")]
    PayloadTooLong(usize),
    /// A raw telegram string that is not a list of hex bytes.
    #[error("invalid hex in raw telegram")]
    InvalidHex,
    /// A raw telegram shorter than a header.
    #[error("raw telegram too short ({0} bytes)")]
    RawTooShort(usize),
    /// The type id cannot be put on the wire.
    #[error("type id {0:#06x} is reserved for EMS+ headers")]
    ReservedTypeId(u16),
    /// Device ids are 7-bit.
    #[error("device id {0:#04x} out of range")]
    InvalidDeviceId(u8),
}
