//! Per-connection payload scrambling
//!
//! Every byte after the frame header is XORed with a single seed byte taken
//! from the connection identifier. Both ends can derive the seed from the
//! identifier alone, so nothing is negotiated.
//!
//! This hides payloads from naive keyword matching only. It is not
//! encryption and gives no confidentiality or integrity.

/// Position of the seed byte inside a connection identifier
pub const SEED_INDEX: usize = 3;

/// Derive the scrambling seed from raw identifier bytes.
///
/// Identifiers shorter than `SEED_INDEX + 1` bytes yield a zero seed, which
/// leaves payloads untouched.
pub fn seed(id: &[u8]) -> u8 {
    id.get(SEED_INDEX).copied().unwrap_or(0)
}

/// XOR `buf` in place with `seed`. Applying it twice restores the input.
pub fn apply(buf: &mut [u8], seed: u8) {
    if seed == 0 {
        return;
    }
    for b in buf.iter_mut() {
        *b ^= seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_is_involution() {
        let original: Vec<u8> = (0..=255u8).collect();
        for s in [0x01u8, 0x30, 0x61, 0xff] {
            let mut buf = original.clone();
            apply(&mut buf, s);
            assert_ne!(buf, original);
            apply(&mut buf, s);
            assert_eq!(buf, original);
        }
    }

    #[test]
    fn test_seed_is_fourth_byte() {
        assert_eq!(seed(b"0a1b2c3d"), b'b');
        assert_eq!(seed(b"abc"), 0);
    }

    #[test]
    fn test_zero_seed_is_identity() {
        let mut buf = *b"GET / HTTP/1.1";
        apply(&mut buf, 0);
        assert_eq!(&buf, b"GET / HTTP/1.1");
    }
}
