//! In-band Diffie-Hellman key agreement and record confidentiality.
//!
//! The DH group is configurable rather than fixed. Key derivation is
//! HKDF-style extract-and-expand over HMAC-SHA256 with the IV doubling
//! as the extract salt, since the wire format carries no separate salt
//! field and both peers must derive it from something they already
//! hold. Ciphertext carries a truncated HMAC-SHA256 authentication tag
//! alongside the XOR keystream.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
const KDF_INFO: &[u8] = b"TRUDP Key Derivation";

/// A 64-bit-safe Diffie-Hellman group. The source used `g=5, p=23`, which
/// is far too small for real security; this just widens the toy group to
/// the full 64-bit range and leaves the actual choice to configuration,
/// no cryptographic security claim is made about this group's strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhGroup {
    pub generator: u64,
    pub prime: u64,
}

impl Default for DhGroup {
    fn default() -> Self {
        // 2^64 - 59 is prime; `5` is used as the source does, without a
        // claim of being a verified primitive root for this modulus.
        DhGroup {
            generator: 5,
            prime: 18_446_744_073_709_551_557,
        }
    }
}

impl DhGroup {
    pub fn generate_private(&self) -> u64 {
        rand::thread_rng().gen_range(1..self.prime - 1)
    }

    pub fn public_key(&self, private: u64) -> u64 {
        mod_pow(self.generator, private, self.prime)
    }

    pub fn shared_secret(&self, their_public: u64, our_private: u64) -> u64 {
        mod_pow(their_public, our_private, self.prime)
    }
}

/// Square-and-multiply modular exponentiation; `u128` intermediates avoid
/// overflow for any `base, exp < modulus <= u64::MAX`.
fn mod_pow(base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u128 = 1;
    let modulus = modulus as u128;
    let mut base = (base as u128) % modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            result = (result * base) % modulus;
        }
        exp >>= 1;
        base = (base * base) % modulus;
    }
    result as u64
}

/// HKDF-style extract-and-expand over HMAC-SHA256, producing exactly one
/// 32-byte block (SHA-256's output length), so a single expand round
/// suffices.
pub fn derive_session_key(shared_secret: u64, salt: &[u8; 16]) -> [u8; SESSION_KEY_LEN] {
    let mut extract = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
    extract.update(&shared_secret.to_be_bytes());
    let prk = extract.finalize().into_bytes();

    let mut expand = HmacSha256::new_from_slice(&prk).expect("HMAC accepts any key length");
    expand.update(KDF_INFO);
    expand.update(&[0x01]);
    let okm = expand.finalize().into_bytes();

    let mut key = [0u8; SESSION_KEY_LEN];
    key.copy_from_slice(&okm);
    key
}

pub fn random_iv() -> [u8; 16] {
    rand::thread_rng().gen()
}

fn keystream_block(key: &[u8; SESSION_KEY_LEN], iv: &[u8; 16], counter: u64) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(iv);
    mac.update(&counter.to_be_bytes());
    let block = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&block);
    out
}

/// XOR `data` against the HMAC-SHA256 keystream in 32-byte blocks,
/// starting at block-relative `byte_offset` rather than the beginning of
/// the stream. Lets a segment taken from the middle of an
/// already-encrypted whole payload be decrypted on its own, since the
/// keystream block at any position depends only on `(iv, position / 32)`
/// and not on anything encrypted before it.
pub fn apply_keystream_from(
    key: &[u8; SESSION_KEY_LEN],
    iv: &[u8; 16],
    data: &[u8],
    byte_offset: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = byte_offset;
    let mut consumed = 0usize;
    while consumed < data.len() {
        let block_index = pos / 32;
        let offset_in_block = (pos - block_index * 32) as usize;
        let block = keystream_block(key, iv, block_index);
        let take = (32 - offset_in_block).min(data.len() - consumed);
        for i in 0..take {
            out.push(data[consumed + i] ^ block[offset_in_block + i]);
        }
        consumed += take;
        pos += take as u64;
    }
    out
}

/// XOR `data` against the HMAC-SHA256 keystream in 32-byte blocks. Used
/// for both directions: XOR is its own inverse, so encryption and
/// decryption are the same operation given the same key/IV.
pub fn apply_keystream(key: &[u8; SESSION_KEY_LEN], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    apply_keystream_from(key, iv, data, 0)
}

/// Truncated HMAC-SHA256 tag over ciphertext, authenticating the record
/// the source left unauthenticated (see DESIGN.md / spec §9).
pub fn compute_tag(key: &[u8; SESSION_KEY_LEN], ciphertext: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(ciphertext);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

pub fn verify_tag(key: &[u8; SESSION_KEY_LEN], ciphertext: &[u8], tag: &[u8; TAG_LEN]) -> bool {
    use subtle_eq::constant_time_eq;
    constant_time_eq(&compute_tag(key, ciphertext), tag)
}

/// Minimal constant-time comparison, avoiding a dependency purely for an
/// `a == b` that must not short-circuit on the first differing byte.
mod subtle_eq {
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_exchange_agrees_on_shared_secret() {
        let group = DhGroup::default();
        let client_private = group.generate_private();
        let server_private = group.generate_private();

        let client_public = group.public_key(client_private);
        let server_public = group.public_key(server_private);

        let client_shared = group.shared_secret(server_public, client_private);
        let server_shared = group.shared_secret(client_public, server_private);

        assert_eq!(client_shared, server_shared);
    }

    #[test]
    fn both_peers_derive_identical_session_keys() {
        let group = DhGroup::default();
        let shared = group.shared_secret(group.public_key(3), 5);
        let iv = random_iv();

        let key_a = derive_session_key(shared, &iv);
        let key_b = derive_session_key(shared, &iv);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = [9u8; SESSION_KEY_LEN];
        let iv = [3u8; 16];
        let plaintext = b"the quick brown fox jumps over the lazy dog, repeated to span blocks ".repeat(3);

        let ciphertext = apply_keystream(&key, &iv, &plaintext);
        assert_ne!(ciphertext, plaintext);
        let recovered = apply_keystream(&key, &iv, &ciphertext);
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn keystream_from_offset_matches_a_slice_of_the_whole_stream() {
        let key = [4u8; SESSION_KEY_LEN];
        let iv = [2u8; 16];
        let plaintext = b"segment boundaries should not change the ciphertext bytes at all".repeat(2);

        let whole = apply_keystream(&key, &iv, &plaintext);
        for split in [1usize, 31, 32, 33, 70] {
            let (first, second) = plaintext.split_at(split);
            let a = apply_keystream(&key, &iv, first);
            let b = apply_keystream_from(&key, &iv, second, split as u64);
            assert_eq!(whole[..split], a[..]);
            assert_eq!(whole[split..], b[..]);
        }
    }

    #[test]
    fn tag_detects_tamper() {
        let key = [1u8; SESSION_KEY_LEN];
        let ciphertext = b"ciphertext-bytes".to_vec();
        let tag = compute_tag(&key, &ciphertext);
        assert!(verify_tag(&key, &ciphertext, &tag));

        let mut tampered = ciphertext.clone();
        tampered[0] ^= 1;
        assert!(!verify_tag(&key, &tampered, &tag));
    }
}
