/// Folds one byte into the running EMS CRC-8.
///
/// The bus uses a left-shifting CRC with the reduced polynomial `0x19`
/// (`x^8 + x^4 + x^3 + 1`), initial value zero and no final xor. The shift
/// happens before the data byte is mixed in.
pub(crate) fn crc_ems_update(crc: u8, data: &u8) -> u8 {
    let shifted = if crc & 0x80 != 0 {
        (crc << 1) ^ 0x19
    } else {
        crc << 1
    };
    shifted ^ *data
}

/// CRC over a whole slice. Callers pass the frame without its trailing CRC byte.
pub(crate) fn calculate_crc(data: &[u8]) -> u8 {
    data.iter().fold(0, crc_ems_update)
}
