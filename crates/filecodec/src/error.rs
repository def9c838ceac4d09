use std::io;

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding store-file objects.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The object does not start with the container magic.
    #[error("bad object magic {0:#010x}")]
    BadMagic(u32),
    /// The object failed authentication; nothing in it can be trusted.
    #[error("object HMAC mismatch")]
    HmacMismatch,
    /// A delta object references a base version that was not supplied.
    #[error("delta references missing base version")]
    MissingBase,
    /// A decoded block did not match its recorded strong checksum.
    #[error("block {block} checksum mismatch")]
    ChecksumMismatch {
        /// Index of the offending block.
        block: usize,
    },
    /// The block index is structurally inconsistent with the data region.
    #[error("bad block index: {0}")]
    BadIndex(String),
    /// Underlying I/O failure.
    #[error("codec I/O error: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_magic_formats_as_hex() {
        assert!(CodecError::BadMagic(0xDEADBEEF)
            .to_string()
            .contains("0xdeadbeef"));
    }
}
