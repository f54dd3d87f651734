//! SHA-256 incremental digests and hex encode/decode.
//!
//! Grounded on `rrdpit::sync::EncodedHash` (hex-encoded digest wrapper over
//! `ring::digest`) and the original `hex_to_bin`/`hex_to_string` helpers
//! referenced (not included) in the source this core was distilled from.
//! Unlike `EncodedHash`, which hashes a complete in-memory buffer in one
//! call, the engine needs an incremental context it can feed as bytes
//! stream in off the wire -- `ring::digest::Context` already supports that
//! directly.

use ring::digest;

/// Length of a SHA-256 digest in bytes.
pub const SHA256_LEN: usize = 32;

/// A raw, binary SHA-256 digest.
pub type Sha256Hash = [u8; SHA256_LEN];

/// An incremental SHA-256 context, fed chunk by chunk as a document streams
/// in, reset per document (one context per in-flight snapshot/delta fetch).
pub struct Sha256Ctx(digest::Context);

impl Sha256Ctx {
    pub fn new() -> Self {
        Sha256Ctx(digest::Context::new(&digest::SHA256))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Sha256Hash {
        let digest = self.0.finish();
        let mut out = [0u8; SHA256_LEN];
        out.copy_from_slice(digest.as_ref());
        out
    }
}

impl Default for Sha256Ctx {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares two digests without leaking timing information about where
/// they first differ.
pub fn hash_eq(a: &Sha256Hash, b: &Sha256Hash) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

/// Decodes a lowercase hex string into a 32-byte SHA-256 digest.
///
/// The RRDP notification/snapshot/delta grammar requires hashes to be
/// lowercase hex of exactly 32 bytes; anything else is a parse error.
pub fn hex_decode(s: &str) -> Result<Sha256Hash, HashError> {
    if s.len() != SHA256_LEN * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(HashError::InvalidHex);
    }
    let bytes = hex::decode(s).map_err(|_| HashError::InvalidHex)?;
    let mut out = [0u8; SHA256_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn hex_encode(h: &Sha256Hash) -> String {
    hex::encode(h)
}

#[derive(Clone, Copy, Debug, Display)]
pub enum HashError {
    #[display("invalid hex-encoded SHA-256 hash")]
    InvalidHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_digest_matches_one_shot_digest_of_the_same_bytes() {
        let mut ctx = Sha256Ctx::new();
        ctx.update(b"rsync://rpki.example/repo/");
        ctx.update(b"snapshot.xml");
        let incremental = ctx.finish();

        let one_shot = digest::digest(&digest::SHA256, b"rsync://rpki.example/repo/snapshot.xml");
        assert_eq!(&incremental[..], one_shot.as_ref());
    }

    #[test]
    fn hash_eq_detects_mismatch() {
        let a = [1u8; SHA256_LEN];
        let b = [2u8; SHA256_LEN];
        assert!(hash_eq(&a, &a));
        assert!(!hash_eq(&a, &b));
    }

    #[test]
    fn hex_round_trips() {
        let h: Sha256Hash = [0xab; SHA256_LEN];
        let encoded = hex_encode(&h);
        assert_eq!(encoded.len(), SHA256_LEN * 2);
        assert_eq!(hex_decode(&encoded).unwrap(), h);
    }

    #[test]
    fn hex_decode_rejects_wrong_length() {
        assert!(matches!(hex_decode("abcd"), Err(HashError::InvalidHex)));
    }

    #[test]
    fn hex_decode_rejects_uppercase() {
        let upper = "AB".repeat(SHA256_LEN);
        assert!(matches!(hex_decode(&upper), Err(HashError::InvalidHex)));
    }

    #[test]
    fn hex_decode_rejects_non_hex_characters() {
        let bad = "zz".repeat(SHA256_LEN);
        assert!(matches!(hex_decode(&bad), Err(HashError::InvalidHex)));
    }
}
