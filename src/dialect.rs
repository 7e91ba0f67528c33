//! Bus timing dialects and bus masks.
//!
//! A [`Dialect`] selects the transmit strategy of the
//! [`BusDriver`](crate::driver::BusDriver) and the response budget of the
//! [`TxService`](crate::tx::TxService) at the same time; the two are never
//! configured independently.
//!
//! | tx mode | Dialect | Strategy |
//! |---------|---------|----------|
//! | 1 | [`Default`](Dialect::Default) | timer-paced, one byte per timer callback |
//! | 2 | [`EmsPlus`](Dialect::EmsPlus) | busy-wait micro delays, long wait after the first byte |
//! | 3 | [`Ht3`](Dialect::Ht3) | busy-wait micro delays |
//! | 4 | [`Hardware`](Dialect::Hardware) | FIFO burst, hardware break |
//! | 5 | [`EchoVerified`](Dialect::EchoVerified) | every byte waits for its echo |
//! | > 100 | [`Custom`](Dialect::Custom) | timer-paced with `n` bit times between bytes |

use crate::consts::{EMS_MASK_BUDERUS, EMS_MASK_HT3, TX_MODE_CUSTOM_THRESHOLD};
use crate::error::ConfigError;
use crate::timer::{
    TX_BRK_HT3_US, TX_BRK_PLUS_US, TX_BRK_TIMER_US, TX_WAIT_DEFAULT_US, TX_WAIT_HT3_US,
    TX_WAIT_PLUS_FIRST_US, TX_WAIT_PLUS_US, bit_times_us,
};

/// Timing and collision strategy used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Dialect {
    /// Legacy EMS 1.0 timing, paced by the one-shot timer.
    #[default]
    Default,
    /// Legacy timing where each byte waits for the bus master's echo.
    EchoVerified,
    /// Junkers/HT3: fixed 17 bit-time spacing, 11 bit-time break.
    Ht3,
    /// EMS+: 20 bit-time spacing and a long pause after the first byte.
    EmsPlus,
    /// Burst straight into the FIFO; the UART generates the break.
    Hardware,
    /// Timer-paced with a field-tuned inter-byte delay, in bit times.
    Custom(u16),
}

/// How the driver puts bytes on the wire for a given dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum TxStrategy {
    /// One byte per timer callback, `wait_us` apart, then a timed break.
    TimerPaced {
        /// Delay between bytes
        wait_us: u32,
        /// Length of the terminating break
        brk_us: u32,
    },
    /// All bytes into the FIFO, break generated by the UART once it drains.
    Burst,
    /// Busy-wait between bytes, then a timed break pulse.
    MicroDelay {
        /// Delay after every byte
        wait_us: u32,
        /// Additional delay after the first byte only
        first_wait_us: u32,
        /// Length of the break pulse
        brk_us: u32,
    },
    /// Every byte waits for its echo within the watchdog budget.
    EchoVerified,
}

impl Dialect {
    /// Maps the numeric `tx_mode` setting to a dialect.
    ///
    /// # Errors
    /// [`ConfigError::InvalidDialect`] for `0` and `6..=100`.
    pub fn from_tx_mode(tx_mode: u8) -> Result<Self, ConfigError> {
        match tx_mode {
            1 => Ok(Dialect::Default),
            2 => Ok(Dialect::EmsPlus),
            3 => Ok(Dialect::Ht3),
            4 => Ok(Dialect::Hardware),
            5 => Ok(Dialect::EchoVerified),
            n if n > TX_MODE_CUSTOM_THRESHOLD => Ok(Dialect::Custom(u16::from(n))),
            n => Err(ConfigError::InvalidDialect(n)),
        }
    }

    /// Numeric `tx_mode` of this dialect, the inverse of [`from_tx_mode`](Self::from_tx_mode)
    /// for values that fit a byte.
    pub fn tx_mode(&self) -> Option<u8> {
        match self {
            Dialect::Default => Some(1),
            Dialect::EmsPlus => Some(2),
            Dialect::Ht3 => Some(3),
            Dialect::Hardware => Some(4),
            Dialect::EchoVerified => Some(5),
            Dialect::Custom(n) => u8::try_from(*n)
                .ok()
                .filter(|n| *n > TX_MODE_CUSTOM_THRESHOLD),
        }
    }

    /// Rejects dialects that cannot drive the bus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Dialect::Custom(0) => Err(ConfigError::ZeroCustomDelay),
            _ => Ok(()),
        }
    }

    /// Transmit strategy the driver uses for this dialect.
    pub fn strategy(&self) -> TxStrategy {
        match self {
            Dialect::Default => TxStrategy::TimerPaced {
                wait_us: TX_WAIT_DEFAULT_US,
                brk_us: TX_BRK_TIMER_US,
            },
            Dialect::Custom(bit_times) => TxStrategy::TimerPaced {
                wait_us: bit_times_us(u32::from(*bit_times)),
                brk_us: TX_BRK_TIMER_US,
            },
            Dialect::Ht3 => TxStrategy::MicroDelay {
                wait_us: TX_WAIT_HT3_US,
                first_wait_us: 0,
                brk_us: TX_BRK_HT3_US,
            },
            Dialect::EmsPlus => TxStrategy::MicroDelay {
                wait_us: TX_WAIT_PLUS_US,
                first_wait_us: TX_WAIT_PLUS_FIRST_US,
                brk_us: TX_BRK_PLUS_US,
            },
            Dialect::Hardware => TxStrategy::Burst,
            Dialect::EchoVerified => TxStrategy::EchoVerified,
        }
    }

    /// How long the Tx pipeline waits for a response before spending a retry.
    pub fn response_timeout_ms(&self) -> u32 {
        match self {
            Dialect::Default | Dialect::EchoVerified | Dialect::Hardware => 300,
            Dialect::Ht3 => 500,
            Dialect::EmsPlus => 800,
            // a 32 byte telegram at the custom spacing, plus the default budget
            Dialect::Custom(bit_times) => {
                300 + bit_times_us(u32::from(*bit_times)) * 32 / 1_000
            }
        }
    }
}

/// Which logical bus the installation runs, seen in the MSB of every source byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BusMask {
    /// Not detected yet: learned from the first valid telegram.
    #[default]
    Unset,
    /// Buderus EMS 1.0 / EMS+, source MSB clear.
    Buderus,
    /// Junkers/HT3, source MSB set.
    Ht3,
}

impl BusMask {
    /// Derives the mask from the raw source byte of a valid telegram.
    pub fn from_src(src: u8) -> Self {
        if src & EMS_MASK_HT3 != 0 {
            BusMask::Ht3
        } else {
            BusMask::Buderus
        }
    }

    /// Bit pattern xor-ed into our source byte and poll reply.
    pub fn bits(&self) -> u8 {
        match self {
            BusMask::Ht3 => EMS_MASK_HT3,
            BusMask::Unset | BusMask::Buderus => EMS_MASK_BUDERUS,
        }
    }

    /// Whether a frame with this raw source byte belongs to the active bus.
    ///
    /// An unset mask accepts everything.
    pub fn accepts(&self, raw_src: u8) -> bool {
        match self {
            BusMask::Unset => true,
            mask => raw_src & EMS_MASK_HT3 == mask.bits(),
        }
    }
}
