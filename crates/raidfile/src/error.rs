use std::io;

use thiserror::Error;

/// Result type for RAID file operations.
pub type RaidResult<T> = Result<T, RaidError>;

/// Errors raised by the RAID file layer.
#[derive(Debug, Error)]
pub enum RaidError {
    /// The requested disc set is not configured.
    #[error("no such disc set {0}")]
    NoSuchDiscSet(u32),
    /// The RAID configuration file is invalid.
    #[error("bad RAID configuration: {0}")]
    BadConfig(String),
    /// Too many discs of a striped set are missing or damaged to serve the
    /// file.
    #[error("file {name:?} is unrecoverable: {missing} of 3 discs unusable")]
    Unrecoverable {
        /// Logical file name.
        name: String,
        /// Number of unusable discs.
        missing: usize,
    },
    /// The named logical file does not exist on the disc set.
    #[error("raid file {0:?} does not exist")]
    DoesNotExist(String),
    /// Underlying filesystem failure.
    #[error("raid I/O error: {0}")]
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
    fn unrecoverable_names_the_file() {
        let err = RaidError::Unrecoverable {
            name: "o01/x.obj".to_owned(),
            missing: 2,
        };
        assert!(err.to_string().contains("o01/x.obj"));
        assert!(err.to_string().contains("2 of 3"));
    }
}
