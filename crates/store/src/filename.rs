//! Opaque encrypted filenames.
//!
//! Clients encrypt filenames before upload; the store only ever compares
//! ciphertext for equality and round-trips the bytes. An empty name is not
//! a valid filename.

use std::fmt;

/// An opaque, client-encrypted filename.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StoreFilename(Vec<u8>);

impl StoreFilename {
    /// Wraps the encrypted bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw encrypted bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the name is empty (never valid in a directory).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for StoreFilename {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for StoreFilename {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

// The name bytes are ciphertext; a short hex prefix identifies an entry in
// logs without dumping whole names everywhere.
impl fmt::Debug for StoreFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn[")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, "]")
    }
}
