use std::io::{self, Read};

use thiserror::Error;

/// Errors raised by invalid rolling-checksum operations.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum RollingError {
    /// The checksum window is empty, so there is nothing to roll out.
    #[error("rolling checksum requires a non-empty window")]
    EmptyWindow,
    /// The window length exceeds what the roll arithmetic can represent.
    #[error("rolling checksum window of {len} bytes exceeds 32-bit limit")]
    WindowTooLarge {
        /// Bytes in the window when the error was raised.
        len: usize,
    },
}

/// Weak rolling checksum used for block matching in the store-file codec.
///
/// `s1` accumulates the byte sum, `s2` accumulates prefix sums, both
/// truncated to 16 bits. The packed [`value`](Self::value) is what block
/// indices carry on the wire; equality of packed values is a *candidate*
/// match to be confirmed with the strong checksum.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    /// Default buffer length used by [`update_reader`](Self::update_reader).
    pub const DEFAULT_READER_BUFFER_LEN: usize = 32 * 1024;

    /// Creates a new rolling checksum with zeroed state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            s1: 0,
            s2: 0,
            len: 0,
        }
    }

    /// Computes the packed checksum of `block` in one shot.
    #[must_use]
    pub fn of_block(block: &[u8]) -> u32 {
        let mut checksum = Self::new();
        checksum.update(block);
        checksum.value()
    }

    /// Resets the checksum back to its initial state.
    pub fn reset(&mut self) {
        self.s1 = 0;
        self.s2 = 0;
        self.len = 0;
    }

    /// Returns the number of bytes that contributed to the current state.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no bytes have been observed yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Updates the checksum with an additional slice of bytes.
    #[inline]
    pub fn update(&mut self, chunk: &[u8]) {
        let mut s1 = self.s1;
        let mut s2 = self.s2;
        for &byte in chunk {
            s1 = s1.wrapping_add(u32::from(byte));
            s2 = s2.wrapping_add(s1);
        }
        self.s1 = s1 & 0xffff;
        self.s2 = s2 & 0xffff;
        self.len = self.len.saturating_add(chunk.len());
    }

    /// Updates the checksum by consuming a reader to EOF, returning the
    /// number of bytes consumed.
    pub fn update_reader<R: Read>(&mut self, reader: &mut R) -> io::Result<u64> {
        let mut buffer = [0u8; Self::DEFAULT_READER_BUFFER_LEN];
        let mut total = 0u64;
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    self.update(&buffer[..n]);
                    total = total.saturating_add(n as u64);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Clears the state and updates with `block`.
    pub fn update_from_block(&mut self, block: &[u8]) {
        self.reset();
        self.update(block);
    }

    /// Rolls the checksum window forward by removing `outgoing` from the
    /// front and appending `incoming` at the back. The window length is
    /// unchanged.
    #[inline]
    pub fn roll(&mut self, outgoing: u8, incoming: u8) -> Result<(), RollingError> {
        if self.len == 0 {
            return Err(RollingError::EmptyWindow);
        }
        let window_len =
            u32::try_from(self.len).map_err(|_| RollingError::WindowTooLarge { len: self.len })?;

        let out = u32::from(outgoing);
        let inn = u32::from(incoming);

        let new_s1 = self.s1.wrapping_sub(out).wrapping_add(inn) & 0xffff;
        let new_s2 = self
            .s2
            .wrapping_sub(window_len.wrapping_mul(out))
            .wrapping_add(new_s1)
            & 0xffff;

        self.s1 = new_s1;
        self.s2 = new_s2;
        Ok(())
    }

    /// Returns the checksum in its packed 32-bit representation
    /// (`s2` high, `s1` low).
    #[must_use]
    pub const fn value(&self) -> u32 {
        (self.s2 << 16) | self.s1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state_packs_to_zero() {
        assert_eq!(RollingChecksum::new().value(), 0);
        assert!(RollingChecksum::new().is_empty());
    }

    #[test]
    fn update_matches_of_block() {
        let data = b"some block of data";
        let mut checksum = RollingChecksum::new();
        checksum.update(data);
        assert_eq!(checksum.value(), RollingChecksum::of_block(data));
        assert_eq!(checksum.len(), data.len());
    }

    #[test]
    fn split_updates_match_single_update() {
        let data: Vec<u8> = (0u16..512).map(|v| (v % 251) as u8).collect();
        let mut whole = RollingChecksum::new();
        whole.update(&data);
        let mut split = RollingChecksum::new();
        split.update(&data[..100]);
        split.update(&data[100..]);
        assert_eq!(whole.value(), split.value());
    }

    #[test]
    fn roll_matches_recompute() {
        let data = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let window = 8;
        let mut rolling = RollingChecksum::new();
        rolling.update(&data[..window]);

        for start in 1..=(data.len() - window) {
            rolling
                .roll(data[start - 1], data[start + window - 1])
                .unwrap();
            assert_eq!(
                rolling.value(),
                RollingChecksum::of_block(&data[start..start + window]),
                "mismatch at offset {start}"
            );
        }
    }

    #[test]
    fn roll_on_empty_window_is_rejected() {
        let mut checksum = RollingChecksum::new();
        assert_eq!(checksum.roll(b'a', b'b'), Err(RollingError::EmptyWindow));
    }

    #[test]
    fn update_reader_consumes_to_eof() {
        let data = vec![7u8; 100_000];
        let mut checksum = RollingChecksum::new();
        let read = checksum.update_reader(&mut &data[..]).unwrap();
        assert_eq!(read, 100_000);
        assert_eq!(checksum.value(), RollingChecksum::of_block(&data));
    }

    #[test]
    fn state_is_masked_to_16_bits() {
        let data = vec![0xffu8; 1 << 16];
        let mut checksum = RollingChecksum::new();
        checksum.update(&data);
        let value = checksum.value();
        // Both halves must fit their 16 bits by construction; the packed
        // value is simply their concatenation.
        assert_eq!(value & 0xffff, value as u16 as u32);
    }
}
