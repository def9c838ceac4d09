//! In-process duplex connection.
//!
//! Local tooling (and the integration tests) talk to a session loop without
//! sockets or TLS: [`pair`] returns two ends of a byte pipe that honour the
//! same read/write/timeout contract as the network transport.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::connection::{Connection, ShutdownHow};
use crate::error::{TransportError, TransportResult};

#[derive(Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) -> TransportResult<()> {
        let mut state = self.state.lock().expect("pipe poisoned");
        if state.closed {
            return Err(TransportError::Write(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer closed",
            )));
        }
        state.data.extend(bytes);
        self.readable.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("pipe poisoned");
        state.closed = true;
        self.readable.notify_all();
    }

    fn pop(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("pipe poisoned");
        loop {
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for slot in &mut buf[..n] {
                    *slot = state.data.pop_front().expect("length checked");
                }
                return n;
            }
            if state.closed {
                return 0;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return 0;
            };
            let (next, timed_out) = self
                .readable
                .wait_timeout(state, remaining)
                .expect("pipe poisoned");
            state = next;
            if timed_out.timed_out() && state.data.is_empty() {
                return 0;
            }
        }
    }
}

/// One end of an in-process duplex byte stream.
pub struct LocalConnection {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    identity: Option<String>,
    read_shut: bool,
}

/// Creates a connected pair of local streams. `first_identity` is what the
/// second end sees as its peer identity and vice versa.
#[must_use]
pub fn pair(
    first_identity: Option<&str>,
    second_identity: Option<&str>,
) -> (LocalConnection, LocalConnection) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    let first = LocalConnection {
        incoming: Arc::clone(&b_to_a),
        outgoing: Arc::clone(&a_to_b),
        identity: second_identity.map(ToOwned::to_owned),
        read_shut: false,
    };
    let second = LocalConnection {
        incoming: a_to_b,
        outgoing: b_to_a,
        identity: first_identity.map(ToOwned::to_owned),
        read_shut: false,
    };
    (first, second)
}

impl Connection for LocalConnection {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        if self.read_shut || buf.is_empty() {
            return Ok(0);
        }
        Ok(self.incoming.pop(buf, timeout))
    }

    fn write_all(&mut self, buf: &[u8], _timeout: Duration) -> TransportResult<()> {
        self.outgoing.push(buf)
    }

    fn peer_common_name(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn shutdown(&mut self, how: ShutdownHow) -> TransportResult<()> {
        match how {
            ShutdownHow::Read => self.read_shut = true,
            ShutdownHow::Write => self.outgoing.close(),
            ShutdownHow::Both => {
                self.read_shut = true;
                self.outgoing.close();
            }
        }
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        // The peer observes a clean half-close rather than hanging forever.
        self.outgoing.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn bytes_flow_both_ways() {
        let (mut a, mut b) = pair(Some("client"), Some("server"));
        a.write_all(b"ping", LONG).unwrap();
        let mut buf = [0u8; 4];
        assert!(b.read_exact_or_eof(&mut buf, LONG).unwrap());
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong", LONG).unwrap();
        assert!(a.read_exact_or_eof(&mut buf, LONG).unwrap());
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn identities_are_crossed() {
        let (a, b) = pair(Some("client"), Some("server"));
        assert_eq!(a.peer_common_name(), Some("server"));
        assert_eq!(b.peer_common_name(), Some("client"));
    }

    #[test]
    fn read_times_out_with_zero_bytes() {
        let (mut a, _b) = pair(None, None);
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf, SHORT).unwrap(), 0);
    }

    #[test]
    fn dropped_peer_reads_as_eof() {
        let (mut a, b) = pair(None, None);
        drop(b);
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf, LONG).unwrap(), 0);
    }

    #[test]
    fn write_after_peer_shutdown_fails() {
        let (mut a, mut b) = pair(None, None);
        b.shutdown(ShutdownHow::Read).unwrap();
        // Read shutdown is local to b; a's writes still land in the pipe.
        a.write_all(b"x", LONG).unwrap();

        a.shutdown(ShutdownHow::Write).unwrap();
        assert!(a.write_all(b"y", LONG).is_err());
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let (mut a, mut b) = pair(None, None);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 5];
            assert!(b.read_exact_or_eof(&mut buf, LONG).unwrap());
            buf
        });
        thread::sleep(Duration::from_millis(20));
        a.write_all(b"hello", LONG).unwrap();
        assert_eq!(&handle.join().unwrap(), b"hello");
    }
}
