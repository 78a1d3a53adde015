//! XOR keystream keyed by the shared secret and the frame sequence number.
//!
//! ```text
//! mask(i) = ((secret >> (i mod 8)) & 0xFF) ^ (seq & 0xFF)
//! ```
//!
//! Encryption and decryption are the same operation. The sequence number
//! travels in clear in the frame header, so a frame always decrypts with
//! its own header value.

use crate::dh::SharedSecret;

/// Mask byte for payload position `index`.
#[inline]
pub fn mask(secret: u64, seq: u32, index: usize) -> u8 {
    (((secret >> (index % 8)) & 0xFF) as u8) ^ (seq & 0xFF) as u8
}

/// Encrypt or decrypt `data` in place.
pub fn apply(secret: &SharedSecret, seq: u32, data: &mut [u8]) {
    let key = secret.value();
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask(key, seq, i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypt(secret: u64, seq: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        apply(&SharedSecret::from_value(secret), seq, &mut buf);
        buf
    }

    #[test]
    fn roundtrip_recovers_plaintext() {
        let payloads: [&[u8]; 4] = [
            b"",
            b"DATA::Hello Server!",
            "DATA::h\u{e9}llo \u{1f980} w\u{f6}rld".as_bytes(),
            &[0x00, 0xff, 0x3a, 0x3a, 0x80, 0x7f],
        ];

        for payload in payloads {
            for (secret, seq) in [(0x1234_5678, 100), (4_294_967_290, u32::MAX), (2, 0)] {
                let encrypted = crypt(secret, seq, payload);
                assert_eq!(crypt(secret, seq, &encrypted), payload);
            }
        }
    }

    #[test]
    fn mask_follows_formula() {
        let secret = 0xA5C3_0F96u64;
        let seq = 0x0102_03FFu32;
        for i in 0..32 {
            let expected = (((secret >> (i % 8)) & 0xFF) ^ (seq as u64 & 0xFF)) as u8;
            assert_eq!(mask(secret, seq, i), expected);
        }
    }

    #[test]
    fn encryption_changes_payload() {
        let plain = b"DATA::attack at dawn";
        let encrypted = crypt(0x00C0_FFEE, 101, plain);
        assert_ne!(&encrypted[..], &plain[..]);
    }

    #[test]
    fn sequence_low_byte_changes_keystream() {
        let plain = b"DATA::same payload";
        assert_ne!(crypt(0x00C0_FFEE, 101, plain), crypt(0x00C0_FFEE, 102, plain));
        // Only the low byte of the sequence participates.
        assert_eq!(crypt(0x00C0_FFEE, 101, plain), crypt(0x00C0_FFEE, 101 + 256, plain));
    }

    #[test]
    fn wrong_secret_does_not_decrypt() {
        let plain = b"DATA::secret";
        let encrypted = crypt(0x1111_1111, 7, plain);
        assert_ne!(crypt(0x2222_2222, 7, &encrypted), plain.to_vec());
    }
}
