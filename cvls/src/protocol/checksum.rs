//! Fletcher-16 checksum as computed by CVLS units.
//!
//! This is not the textbook Fletcher-16: both sums start at `0xFF`, they are
//! folded every 20 bytes and once more at the end, and the result is emitted
//! as `[sum2, sum1]`.

/// Number of bytes accumulated between two folds.
const BLOCK_LEN: usize = 20;

/// Length of the checksum on the wire.
pub const CHECKSUM_LEN: usize = 2;

#[inline]
fn fold(sum: u16) -> u16 {
    (sum & 0xFF) + (sum >> 8)
}

/// Calculate the unit's Fletcher-16 checksum over `data`.
///
/// Returns `[sum2, sum1]`, the order in which the bytes appear on the wire.
pub fn fletcher16(data: &[u8]) -> [u8; 2] {
    let mut sum1: u16 = 0xFF;
    let mut sum2: u16 = 0xFF;

    for block in data.chunks(BLOCK_LEN) {
        for &byte in block {
            sum1 += u16::from(byte);
            sum2 += sum1;
        }
        sum1 = fold(sum1);
        sum2 = fold(sum2);
    }

    sum1 = fold(sum1);
    sum2 = fold(sum2);

    [(sum2 & 0xFF) as u8, (sum1 & 0xFF) as u8]
}

/// Check that the last two bytes of `data` are the checksum of the rest.
pub fn verify(data: &[u8]) -> bool {
    if data.len() < CHECKSUM_LEN {
        return false;
    }
    let (body, sum) = data.split_at(data.len() - CHECKSUM_LEN);
    fletcher16(body) == sum
}
