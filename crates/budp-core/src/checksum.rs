//! 16-bit one's-complement integrity check.
//!
//! This is the classic Internet checksum (RFC 1071): the payload is summed
//! as big-endian 16-bit words with end-around carry, and the result is
//! complemented. A trailing odd byte is treated as the high half of a final
//! word padded with zero.
//!
//! Word order is fixed big-endian regardless of host byte order, so the
//! rendered value is the same on every platform. Implementations that sum
//! native little-endian words produce byte-swapped values and do not
//! interoperate.
//!
//! It detects every single-bit flip in the payload but is not a MAC; an
//! attacker who can rewrite a frame can also rewrite its checksum.

/// Compute the checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u64;
    }
    if let [last] = words.remainder() {
        sum += (*last as u64) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Check `data` against a checksum carried on the wire.
pub fn verify(data: &[u8], expected: u16) -> bool {
    checksum(data) == expected
}
