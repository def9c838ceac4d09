//! Strong block checksum used to confirm weak rolling matches.
//!
//! The codec stores a 16-byte strong checksum per block; a block is only
//! referenced from a prior version when both the weak and strong checksums
//! agree.

use digest::Digest;

/// Width of a strong block checksum in bytes.
pub const STRONG_DIGEST_LEN: usize = 16;

/// Streaming MD5 hasher producing the codec's 16-byte block identity.
#[derive(Clone, Debug, Default)]
pub struct Md5 {
    inner: md5::Md5,
}

impl Md5 {
    /// Creates a hasher with an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: md5::Md5::new(),
        }
    }

    /// Feeds additional bytes into the digest state.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalises the digest and returns the 128-bit output.
    #[must_use]
    pub fn finalize(self) -> [u8; STRONG_DIGEST_LEN] {
        self.inner.finalize().into()
    }

    /// Computes the digest of `data` in one shot.
    #[must_use]
    pub fn digest(data: &[u8]) -> [u8; STRONG_DIGEST_LEN] {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_hex(bytes: &[u8]) -> String {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            write!(&mut out, "{byte:02x}").expect("write! to String cannot fail");
        }
        out
    }

    #[test]
    fn streaming_matches_rfc_vectors() {
        let vectors = [
            (b"".as_slice(), "d41d8cd98f00b204e9800998ecf8427e"),
            (b"a".as_slice(), "0cc175b9c0f1b6a831c399e269772661"),
            (b"abc".as_slice(), "900150983cd24fb0d6963f7d28e17f72"),
            (
                b"message digest".as_slice(),
                "f96b697d7cb7938d525a2f31aaf161d0",
            ),
        ];
        for (input, expected) in vectors {
            assert_eq!(to_hex(&Md5::digest(input)), expected);
        }
    }

    #[test]
    fn incremental_update_matches_one_shot() {
        let mut hasher = Md5::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Md5::digest(b"hello world"));
    }
}
