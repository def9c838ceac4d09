use std::io;

use thiserror::Error;

/// Result type for configuration loading and verification.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or verifying a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read configuration file: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
    /// The file did not parse as a block/key tree.
    #[error("configuration syntax error: {0}")]
    Syntax(String),
    /// The parsed tree failed schema verification. The message lists every
    /// violation found, one per line.
    #[error("configuration verify failed:\n{0}")]
    Verify(String),
    /// A key was requested that the configuration does not contain.
    #[error("configuration key {0:?} does not exist")]
    NoSuchKey(String),
    /// A key's value could not be interpreted as the requested type.
    #[error("configuration key {key:?} has non-{wanted} value {value:?}")]
    BadValue {
        /// Name of the offending key.
        key: String,
        /// The type that was requested.
        wanted: &'static str,
        /// The raw value found in the file.
        value: String,
    },
    /// A sub-block was requested that the configuration does not contain.
    #[error("configuration block {0:?} does not exist")]
    NoSuchBlock(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_value_names_key_and_type() {
        let err = ConfigError::BadValue {
            key: "BlockSize".to_owned(),
            wanted: "integer",
            value: "many".to_owned(),
        };
        let text = err.to_string();
        assert!(text.contains("BlockSize"));
        assert!(text.contains("integer"));
        assert!(text.contains("many"));
    }

    #[test]
    fn io_error_converts() {
        let err: ConfigError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
