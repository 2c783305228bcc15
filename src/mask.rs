// XOR masking per RFC 6455 section 5.3.

/// Masks or unmasks a payload in place.
///
/// Byte `i` is XORed with `key[i % 4]`, which makes the transform its own
/// inverse: applying it twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    if buf.len() < 32 {
        apply_mask_naive(buf, key);
    } else {
        apply_mask_words(buf, key);
    }
}

/// The plain byte-at-a-time transform.
#[inline(always)]
fn apply_mask_naive(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// XORs eight bytes per step. Chunks of 8 keep the 4-byte key phase, so the
/// remainder continues with the key unrotated.
fn apply_mask_words(buf: &mut [u8], key: [u8; 4]) {
    let word = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let masked = u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk")) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    apply_mask_naive(chunks.into_remainder(), key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn involution() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let original: Vec<u8> = (0..257).map(|i| (i * 31) as u8).collect();

        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);

        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn word_path_matches_naive() {
        let keys = [
            [0x00, 0x00, 0x00, 0x00],
            [0xFF, 0xFF, 0xFF, 0xFF],
            [0x12, 0x34, 0x56, 0x78],
            [0xAA, 0xBB, 0xCC, 0xDD],
        ];

        for key in keys {
            for len in 0..=100 {
                let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();

                let mut naive = data.clone();
                apply_mask_naive(&mut naive, key);

                let mut words = data.clone();
                apply_mask_words(&mut words, key);

                assert_eq!(naive, words, "key {key:?} len {len}");
            }
        }
    }

    #[test]
    fn key_phase() {
        let key = [0x01, 0x02, 0x03, 0x04];
        let mut data = vec![0u8; 67];
        apply_mask(&mut data, key);

        for (i, byte) in data.iter().enumerate() {
            assert_eq!(*byte, key[i % 4], "phase broken at index {i}");
        }
    }

    #[test]
    fn zero_key_is_identity() {
        let original = b"payload ending in zero \x00\x00";
        let mut data = original.to_vec();
        apply_mask(&mut data, [0, 0, 0, 0]);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn short_buffers() {
        let key = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, key);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, key);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }

    #[test]
    fn large_buffer() {
        let key = [0x6D, 0xB6, 0xB2, 0x80];
        let original: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();

        let mut data = original.clone();
        apply_mask(&mut data, key);

        for (i, byte) in data.iter().enumerate() {
            assert_eq!(*byte, original[i] ^ key[i % 4], "index {i}");
        }
    }
}
