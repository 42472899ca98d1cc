// SPDX-License-Identifier: MPL-2.0

//! The word-oriented flavour of Bob Jenkins' 32-bit hash, as shipped by the
//! Linux kernel (`jhash2`).
//!
//! For background, visit: www.burtleburtle.net/bob/hash/doobs.html
//!
//! The hash is fast and well-distributed but not cryptographic; callers must
//! treat it as a change detector, never as an equality witness. Byte input is
//! decoded as little-endian words so results are identical across machines.

#![no_std]
#![deny(unsafe_code)]

/// An arbitrary initial value, same as the kernel's.
const JHASH_INITVAL: u32 = 0xdeadbeef;

/// Hashes a slice of `u32` words.
pub const fn jhash2(words: &[u32], initval: u32) -> u32 {
    let mut a: u32 = JHASH_INITVAL
        .wrapping_add((words.len() as u32) << 2)
        .wrapping_add(initval);
    let mut b: u32 = a;
    let mut c: u32 = a;

    let mut rest = words.len();
    let mut at = 0;
    while rest > 3 {
        a = a.wrapping_add(words[at]);
        b = b.wrapping_add(words[at + 1]);
        c = c.wrapping_add(words[at + 2]);
        (a, b, c) = mix(a, b, c);
        at += 3;
        rest -= 3;
    }

    if rest == 3 {
        c = c.wrapping_add(words[at + 2]);
    }
    if rest >= 2 {
        b = b.wrapping_add(words[at + 1]);
    }
    if rest >= 1 {
        a = a.wrapping_add(words[at]);
        return final_mix(a, b, c);
    }

    c
}

/// Hashes a byte slice as a sequence of little-endian `u32` words.
///
/// The slice length must be a multiple of four. This is equivalent to
/// decoding the bytes into words first and calling [`jhash2`], without the
/// intermediate buffer.
pub fn jhash2_le_bytes(bytes: &[u8], initval: u32) -> u32 {
    debug_assert!(bytes.len() % 4 == 0);
    let nwords = (bytes.len() / 4) as u32;

    let mut a: u32 = JHASH_INITVAL.wrapping_add(nwords << 2).wrapping_add(initval);
    let mut b: u32 = a;
    let mut c: u32 = a;

    let mut chunks = bytes.chunks_exact(4);
    let mut rest = nwords;
    while rest > 3 {
        a = a.wrapping_add(next_word(&mut chunks));
        b = b.wrapping_add(next_word(&mut chunks));
        c = c.wrapping_add(next_word(&mut chunks));
        (a, b, c) = mix(a, b, c);
        rest -= 3;
    }

    if rest == 3 {
        // Tail words are accumulated in reverse slot order, like `jhash2`.
        let (w0, w1, w2) = (
            next_word(&mut chunks),
            next_word(&mut chunks),
            next_word(&mut chunks),
        );
        c = c.wrapping_add(w2);
        b = b.wrapping_add(w1);
        a = a.wrapping_add(w0);
        return final_mix(a, b, c);
    }
    if rest == 2 {
        let (w0, w1) = (next_word(&mut chunks), next_word(&mut chunks));
        b = b.wrapping_add(w1);
        a = a.wrapping_add(w0);
        return final_mix(a, b, c);
    }
    if rest == 1 {
        a = a.wrapping_add(next_word(&mut chunks));
        return final_mix(a, b, c);
    }

    c
}

fn next_word(chunks: &mut core::slice::ChunksExact<'_, u8>) -> u32 {
    let chunk = chunks.next().expect("word count and byte length disagree");
    u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
}

/// One mixing round over the internal state.
const fn mix(mut a: u32, mut b: u32, mut c: u32) -> (u32, u32, u32) {
    a = a.wrapping_sub(c);
    a ^= c.rotate_left(4);
    c = c.wrapping_add(b);

    b = b.wrapping_sub(a);
    b ^= a.rotate_left(6);
    a = a.wrapping_add(c);

    c = c.wrapping_sub(b);
    c ^= b.rotate_left(8);
    b = b.wrapping_add(a);

    a = a.wrapping_sub(c);
    a ^= c.rotate_left(16);
    c = c.wrapping_add(b);

    b = b.wrapping_sub(a);
    b ^= a.rotate_left(19);
    a = a.wrapping_add(c);

    c = c.wrapping_sub(b);
    c ^= b.rotate_left(4);
    b = b.wrapping_add(a);

    (a, b, c)
}

/// Final scrambling of the internal state into the hash value.
const fn final_mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));

    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));

    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));

    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));

    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));

    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));

    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));

    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_and_word_variants_agree() {
        let words = [0x0123_4567u32, 0x89ab_cdef, 0xdead_beef, 0x0bad_f00d, 7, 0];
        let mut bytes = [0u8; 24];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        for len in 0..=words.len() {
            assert_eq!(
                jhash2(&words[..len], 17),
                jhash2_le_bytes(&bytes[..len * 4], 17),
                "mismatch for {} words",
                len
            );
        }
    }

    #[test]
    fn deterministic() {
        let words = [1u32, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(jhash2(&words, 17), jhash2(&words, 17));
    }

    #[test]
    fn sensitive_to_content_seed_and_length() {
        let zeros = [0u32; 1024];
        let mut one_bit = [0u32; 1024];
        one_bit[512] = 1;

        assert_ne!(jhash2(&zeros, 17), jhash2(&one_bit, 17));
        assert_ne!(jhash2(&zeros, 17), jhash2(&zeros, 18));
        assert_ne!(jhash2(&zeros[..1023], 17), jhash2(&zeros, 17));
    }
}
