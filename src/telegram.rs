//! Telegram framing: header layouts, CRC validation and serialization.
//!
//! A telegram on the wire is a run of bytes between two breaks:
//!
//! ```text
//! EMS 1.0        src  dest  type  offset  data...                  crc
//! EMS+ (0xFF)    src  dest  FF    offset  type_hi type_lo data...  crc
//! EMS+ read      src  dest  FF    offset  len type_hi type_lo      crc
//! EMS+ (F7/F9)   src  dest  F7    offset  [x] .. type_hi type_lo x data... crc
//! ```
//!
//! The MSB of `dest` marks a read request; the MSB of `src` carries the bus
//! mask and is stripped on decode. EMS+ type ids are stored as
//! `((hi << 8) | lo) + 0x100`.
//!
//! ## Functions
//!
//! - [`decode`]: validates a raw frame and splits it into a [`Telegram`]
//! - [`encode`]: lays out a [`Telegram`] and appends its CRC
//!
//! `decode(encode(t)) == t` for every telegram with 7-bit device ids, a type
//! id outside `0xF0..=0xFF` and a payload that fits the 32-byte frame.

use heapless::Vec;

use crate::consts::{
    EMS_ID_MASK, EMS_MAX_TELEGRAM_LENGTH, EMS_MAX_TELEGRAM_MESSAGE_LENGTH, EMS_MIN_TELEGRAM_LENGTH,
    EMS_READ_FLAG, EMS_TYPE_EXTENDED, EMS_TYPE_EXTENSION_MIN, EMS_TYPE_PLUS_BASE,
};
use crate::crc::calculate_crc;
use crate::error::FrameError;

/// Payload bytes of a telegram.
pub type MessageData = Vec<u8, EMS_MAX_TELEGRAM_MESSAGE_LENGTH>;

/// Encoded frame, CRC included.
pub type FrameBuf = Vec<u8, { EMS_MAX_TELEGRAM_LENGTH as usize }>;

/// Direction of a telegram, taken from the MSB of the `dest` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Operation {
    /// Data pushed to `dest` (writes, responses and broadcasts).
    #[default]
    Write,
    /// Request for `dest` to answer with the data of `type_id`.
    Read,
}

/// One complete bus message.
///
/// Built once by [`decode`] or by the Tx pipeline and never mutated after.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Telegram {
    /// Read request or data.
    pub operation: Operation,
    /// Sending device, 7-bit.
    pub src: u8,
    /// Addressed device, 7-bit, `0x00` for broadcasts.
    pub dest: u8,
    /// Message type, `>= 0x100` for EMS+.
    pub type_id: u16,
    /// Byte offset into the type's data block.
    pub offset: u8,
    /// Payload as received, without header and CRC.
    pub message_data: MessageData,
}

impl Telegram {
    /// Builds a telegram, failing if the payload does not fit.
    pub fn new(
        operation: Operation,
        src: u8,
        dest: u8,
        type_id: u16,
        offset: u8,
        data: &[u8],
    ) -> Result<Self, FrameError> {
        let message_data =
            Vec::from_slice(data).map_err(|_| FrameError::TooLong { len: data.len() })?;
        Ok(Self {
            operation,
            src,
            dest,
            type_id,
            offset,
            message_data,
        })
    }

    /// Number of payload bytes.
    pub fn message_length(&self) -> u8 {
        self.message_data.len() as u8
    }

    /// Whether the type id needs the EMS+ header.
    pub fn is_extended(&self) -> bool {
        self.type_id > 0xFF
    }

    /// Length of this telegram on the wire, CRC included.
    pub fn frame_length(&self) -> usize {
        let header = if self.is_extended() { 6 } else { 4 };
        header + self.message_data.len() + 1
    }

    /// Reads the payload byte at an absolute `index` within the type's data block.
    ///
    /// Returns `None` when the index lies outside what this telegram carries.
    pub fn byte_at(&self, index: u8) -> Option<u8> {
        let pos = index.checked_sub(self.offset)?;
        self.message_data.get(usize::from(pos)).copied()
    }
}

/// Validates a raw frame (break marker already stripped) and splits it into a [`Telegram`].
///
/// # Errors
/// - [`FrameError::TooShort`] / [`FrameError::TooLong`] on bad lengths
/// - [`FrameError::BadCrc`] when the trailing byte does not match; this is routine
///   on a noisy bus and the caller only counts it
/// - [`FrameError::MissingTypeId`] for EMS+ headers cut short
pub fn decode(raw: &[u8]) -> Result<Telegram, FrameError> {
    let len = raw.len();
    if len < EMS_MIN_TELEGRAM_LENGTH {
        return Err(FrameError::TooShort { len });
    }
    if len > usize::from(EMS_MAX_TELEGRAM_LENGTH) {
        return Err(FrameError::TooLong { len });
    }

    let (body, received) = raw.split_at(len - 1);
    let computed = calculate_crc(body);
    if computed != received[0] {
        return Err(FrameError::BadCrc {
            computed,
            received: received[0],
        });
    }

    let src = body[0] & EMS_ID_MASK;
    let dest = body[1] & EMS_ID_MASK;
    let operation = if body[1] & EMS_READ_FLAG != 0 {
        Operation::Read
    } else {
        Operation::Write
    };
    let offset = body[3];

    let mut message_data = MessageData::new();
    let type_id = if body[2] < EMS_TYPE_EXTENSION_MIN || len < 6 {
        // EMS 1.0, data starts after the 4 byte header
        extend(&mut message_data, &body[4..])?;
        u16::from(body[2])
    } else if body[2] == EMS_TYPE_EXTENDED {
        if operation == Operation::Read && body.len() >= 7 {
            // length byte first, then the type
            extend(&mut message_data, &body[4..5])?;
            extend(&mut message_data, &body[7..])?;
            plus_type(body[5], body[6])
        } else if body.len() >= 6 {
            extend(&mut message_data, &body[6..])?;
            plus_type(body[4], body[5])
        } else {
            return Err(FrameError::MissingTypeId);
        }
    } else {
        // F7 / F9: one more header byte unless the 5th is 0xFF, and a
        // status byte after the type
        let shift = usize::from(body[4] != 0xFF);
        if body.len() < 7 + shift {
            return Err(FrameError::MissingTypeId);
        }
        let data_start = (8 + shift).min(body.len());
        extend(&mut message_data, &body[data_start..])?;
        plus_type(body[5 + shift], body[6 + shift])
    };

    Ok(Telegram {
        operation,
        src,
        dest,
        type_id,
        offset,
        message_data,
    })
}

/// Lays out a telegram for the wire and appends its CRC.
///
/// `src` is written as stored; the Tx pipeline folds the bus mask into it
/// beforehand. Read requests get the MSB of `dest` set.
///
/// # Errors
/// - [`FrameError::ReservedTypeId`] for type ids `0xF0..=0xFF`
/// - [`FrameError::TooLong`] when header, payload and CRC exceed 32 bytes
pub fn encode(telegram: &Telegram) -> Result<FrameBuf, FrameError> {
    let mut frame = FrameBuf::new();
    let dest = match telegram.operation {
        Operation::Read => telegram.dest | EMS_READ_FLAG,
        Operation::Write => telegram.dest,
    };

    let data: &[u8] = &telegram.message_data;
    let body_len = if telegram.is_extended() {
        let [hi, lo] = (telegram.type_id - EMS_TYPE_PLUS_BASE).to_be_bytes();
        match (telegram.operation, data.split_first()) {
            (Operation::Read, Some((requested, rest))) => {
                let header = [
                    telegram.src,
                    dest,
                    EMS_TYPE_EXTENDED,
                    telegram.offset,
                    *requested,
                    hi,
                    lo,
                ];
                push_all(&mut frame, &header)?;
                push_all(&mut frame, rest)?;
            }
            _ => {
                let header = [telegram.src, dest, EMS_TYPE_EXTENDED, telegram.offset, hi, lo];
                push_all(&mut frame, &header)?;
                push_all(&mut frame, data)?;
            }
        }
        frame.len()
    } else {
        let type_byte = telegram.type_id as u8;
        if type_byte >= EMS_TYPE_EXTENSION_MIN {
            return Err(FrameError::ReservedTypeId(telegram.type_id));
        }
        push_all(&mut frame, &[telegram.src, dest, type_byte, telegram.offset])?;
        push_all(&mut frame, data)?;
        frame.len()
    };

    let crc = calculate_crc(&frame[..body_len]);
    frame
        .push(crc)
        .map_err(|_| FrameError::TooLong { len: body_len + 1 })?;
    Ok(frame)
}

/// Appends the CRC to an already laid-out frame, as used for raw telegrams.
pub fn seal(raw: &[u8]) -> Result<FrameBuf, FrameError> {
    let mut frame = FrameBuf::new();
    push_all(&mut frame, raw)?;
    let crc = calculate_crc(raw);
    frame
        .push(crc)
        .map_err(|_| FrameError::TooLong { len: raw.len() + 1 })?;
    Ok(frame)
}

fn plus_type(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo]).wrapping_add(EMS_TYPE_PLUS_BASE)
}

fn extend(data: &mut MessageData, bytes: &[u8]) -> Result<(), FrameError> {
    data.extend_from_slice(bytes)
        .map_err(|_| FrameError::TooLong {
            len: data.len() + bytes.len(),
        })
}

fn push_all(frame: &mut FrameBuf, bytes: &[u8]) -> Result<(), FrameError> {
    frame
        .extend_from_slice(bytes)
        .map_err(|_| FrameError::TooLong {
            len: frame.len() + bytes.len() + 1,
        })
}
