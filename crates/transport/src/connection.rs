use std::time::Duration;

use crate::error::TransportResult;

/// Which direction(s) of a connection to shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownHow {
    /// Stop reading; further reads return 0.
    Read,
    /// Stop writing; the peer observes a clean half-close.
    Write,
    /// Both directions.
    Both,
}

/// A mutually authenticated duplex byte stream.
///
/// Reads return `Ok(0)` both on clean half-close and on timeout; the
/// framed protocol above distinguishes the two from its own state. Writes
/// either transfer the whole buffer within the deadline or fail.
pub trait Connection {
    /// Reads up to `buf.len()` bytes, waiting at most `timeout`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize>;

    /// Writes all of `buf`, retrying partial writes until the cumulative
    /// deadline expires.
    fn write_all(&mut self, buf: &[u8], timeout: Duration) -> TransportResult<()>;

    /// The authenticated peer's identity (X.509 Common Name), if any.
    fn peer_common_name(&self) -> Option<&str>;

    /// Shuts down one or both directions of the stream.
    fn shutdown(&mut self, how: ShutdownHow) -> TransportResult<()>;

    /// Reads exactly `buf.len()` bytes or reports how many arrived before
    /// the stream went quiet.
    ///
    /// Returns `Ok(true)` when the buffer was filled, `Ok(false)` when the
    /// peer closed (or the deadline expired) first with the stream
    /// positioned after the bytes that did arrive.
    fn read_exact_or_eof(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..], timeout)?;
            if n == 0 {
                return Ok(false);
            }
            filled += n;
        }
        Ok(true)
    }
}

/// Accepts inbound connections for a server loop.
pub trait Listener {
    /// The connection type this listener produces.
    type Conn: Connection;

    /// Waits up to `timeout` for an inbound connection. `Ok(None)` means
    /// the timeout elapsed with nothing to accept, so the server loop can
    /// check for shutdown and come back.
    fn accept(&mut self, timeout: Duration) -> TransportResult<Option<Self::Conn>>;
}
