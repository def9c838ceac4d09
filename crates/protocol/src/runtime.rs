use std::io::{self, Read};
use std::time::Duration;

use tracing::trace;
use transport::Connection;

use crate::codec::{MessageReader, MessageWriter};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Command, Reply};
use crate::wire;

/// How a stream's length is announced to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSize {
    /// The sender knows the exact byte count up front.
    Exact(u64),
    /// The sender does not know the length; the stream is chunked with
    /// self-delimiting headers.
    Uncertain,
}

/// The framed protocol runtime over one connection.
///
/// Single-threaded by contract: sends and receives are strictly serial, and
/// a stream returned by [`receive_stream`](Self::receive_stream) borrows the
/// runtime mutably, so no frame can be touched until it is consumed.
pub struct Protocol<S: Connection> {
    stream: S,
    handshake_done: bool,
    max_object_size: usize,
    timeout: Duration,
}

impl<S: Connection> Protocol<S> {
    /// Wraps a connection with default limits.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            handshake_done: false,
            max_object_size: wire::DEFAULT_MAX_OBJECT_SIZE,
            timeout: Duration::from_millis(wire::DEFAULT_TIMEOUT_MS),
        }
    }

    /// Sets the per-operation timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Current per-operation timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the maximum accepted object frame payload.
    pub fn set_max_object_size(&mut self, max: usize) {
        self.max_object_size = max;
    }

    /// The authenticated peer identity, if the transport has one.
    #[must_use]
    pub fn peer_common_name(&self) -> Option<&str> {
        self.stream.peer_common_name()
    }

    /// Gives access to the underlying connection (for shutdown).
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Runs the identity exchange if it has not happened yet. Called
    /// automatically by the first send or receive.
    pub fn ensure_handshake(&mut self) -> ProtocolResult<()> {
        if self.handshake_done {
            return Ok(());
        }
        // Both peers send first and then read, so neither deadlocks.
        let ours = wire::handshake_block();
        self.stream.write_all(&ours, self.timeout)?;
        let mut theirs = [0u8; wire::HANDSHAKE_LEN];
        if !self.stream.read_exact_or_eof(&mut theirs, self.timeout)? {
            return Err(ProtocolError::HandshakeFailed);
        }
        if theirs != ours {
            return Err(ProtocolError::HandshakeFailed);
        }
        self.handshake_done = true;
        Ok(())
    }

    /// Sends a client command.
    pub fn send_command(&mut self, command: &Command) -> ProtocolResult<()> {
        let mut writer = MessageWriter::new();
        command.write_fields(&mut writer);
        self.send_object(command.type_tag(), &writer.into_payload())
    }

    /// Sends a server reply.
    pub fn send_reply(&mut self, reply: &Reply) -> ProtocolResult<()> {
        let mut writer = MessageWriter::new();
        reply.write_fields(&mut writer);
        self.send_object(reply.type_tag(), &writer.into_payload())
    }

    /// Receives a client command (server side).
    pub fn receive_command(&mut self) -> ProtocolResult<Command> {
        let (tag, payload) = self.receive_object()?;
        let mut reader = MessageReader::new(&payload);
        let command = Command::read_fields(tag, &mut reader)?;
        reader.finish()?;
        trace!(tag, "received command");
        Ok(command)
    }

    /// Receives a server reply (client side).
    pub fn receive_reply(&mut self) -> ProtocolResult<Reply> {
        let (tag, payload) = self.receive_object()?;
        let mut reader = MessageReader::new(&payload);
        let reply = Reply::read_fields(tag, &mut reader)?;
        reader.finish()?;
        trace!(tag, "received reply");
        Ok(reply)
    }

    /// Sends a byte stream read from `source`.
    ///
    /// With [`StreamSize::Exact`] the bytes are copied verbatim after a
    /// frame announcing the count; with [`StreamSize::Uncertain`] they are
    /// chunked using the self-delimiting header scheme. An exact size too
    /// large for the frame header falls back to uncertain chunking.
    pub fn send_stream<R: Read>(&mut self, source: &mut R, size: StreamSize) -> ProtocolResult<()> {
        self.ensure_handshake()?;
        match size {
            StreamSize::Exact(len) if len <= u64::from(u32::MAX) - wire::FRAME_HEADER_LEN as u64 => {
                self.send_fixed_stream(source, len)
            }
            _ => self.send_uncertain_stream(source),
        }
    }

    /// Receives a stream frame, returning a reader over its bytes. The
    /// reader must be consumed (or the session abandoned) before the next
    /// frame is touched.
    pub fn receive_stream(&mut self) -> ProtocolResult<StreamReader<'_, S>> {
        self.ensure_handshake()?;
        let (frame_size, object_type) = self.read_frame_header()?;
        if object_type != wire::STREAM_OBJECT_TYPE {
            return Err(ProtocolError::ObjectWhenStreamExpected);
        }
        let state = if frame_size == wire::STREAM_SIZE_UNCERTAIN {
            StreamState::Uncertain {
                left_in_block: 0,
                finished: false,
            }
        } else {
            if (frame_size as usize) < wire::FRAME_HEADER_LEN {
                return Err(ProtocolError::BadCommand);
            }
            StreamState::Fixed {
                remaining: u64::from(frame_size) - wire::FRAME_HEADER_LEN as u64,
            }
        };
        Ok(StreamReader {
            protocol: self,
            state,
        })
    }

    fn send_object(&mut self, tag: u32, payload: &[u8]) -> ProtocolResult<()> {
        self.ensure_handshake()?;
        if payload.len() > self.max_object_size {
            return Err(ProtocolError::ObjectTooBig {
                size: payload.len() as u64,
                max: self.max_object_size,
            });
        }
        let frame_size = (payload.len() + wire::FRAME_HEADER_LEN) as u32;
        let mut frame = Vec::with_capacity(payload.len() + wire::FRAME_HEADER_LEN);
        frame.extend_from_slice(&frame_size.to_be_bytes());
        frame.extend_from_slice(&tag.to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame, self.timeout)?;
        Ok(())
    }

    fn receive_object(&mut self) -> ProtocolResult<(u32, Vec<u8>)> {
        self.ensure_handshake()?;
        let (frame_size, object_type) = self.read_frame_header()?;
        if object_type == wire::STREAM_OBJECT_TYPE {
            return Err(ProtocolError::StreamWhenObjectExpected);
        }
        if (frame_size as usize) < wire::FRAME_HEADER_LEN {
            return Err(ProtocolError::BadCommand);
        }
        let payload_len = frame_size as usize - wire::FRAME_HEADER_LEN;
        if payload_len > self.max_object_size {
            // Reject before accepting a byte of payload.
            return Err(ProtocolError::ObjectTooBig {
                size: payload_len as u64,
                max: self.max_object_size,
            });
        }
        let mut payload = vec![0u8; payload_len];
        self.read_exact(&mut payload)?;
        Ok((object_type, payload))
    }

    fn read_frame_header(&mut self) -> ProtocolResult<(u32, u32)> {
        let mut header = [0u8; wire::FRAME_HEADER_LEN];
        if !self.stream.read_exact_or_eof(&mut header, self.timeout)? {
            return Err(ProtocolError::ConnectionClosed);
        }
        let frame_size = u32::from_be_bytes(header[0..4].try_into().expect("length checked"));
        let object_type = u32::from_be_bytes(header[4..8].try_into().expect("length checked"));
        Ok((frame_size, object_type))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ProtocolResult<()> {
        if self.stream.read_exact_or_eof(buf, self.timeout)? {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    fn send_fixed_stream<R: Read>(&mut self, source: &mut R, len: u64) -> ProtocolResult<()> {
        let frame_size = (len + wire::FRAME_HEADER_LEN as u64) as u32;
        let mut header = [0u8; wire::FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(&frame_size.to_be_bytes());
        header[4..8].copy_from_slice(&wire::STREAM_OBJECT_TYPE.to_be_bytes());
        self.stream.write_all(&header, self.timeout)?;

        let mut remaining = len;
        let mut buffer = [0u8; wire::STREAM_64K_SIZE];
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let got = source
                .read(&mut buffer[..want])
                .map_err(|err| ProtocolError::Transport(transport::TransportError::Read(err)))?;
            if got == 0 {
                // Source dried up before the announced byte count.
                return Err(ProtocolError::TimeoutSendingStream);
            }
            self.stream.write_all(&buffer[..got], self.timeout)?;
            remaining -= got as u64;
        }
        Ok(())
    }

    fn send_uncertain_stream<R: Read>(&mut self, source: &mut R) -> ProtocolResult<()> {
        let mut header = [0u8; wire::FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(&wire::STREAM_SIZE_UNCERTAIN.to_be_bytes());
        header[4..8].copy_from_slice(&wire::STREAM_OBJECT_TYPE.to_be_bytes());
        self.stream.write_all(&header, self.timeout)?;

        // One byte of chunk header ahead of a 64 KiB window; the remainder
        // of a short send carries over to the next round.
        let mut buffer = vec![0u8; 1 + wire::STREAM_64K_SIZE];
        let mut bytes_in_block = 0usize;
        let mut source_done = false;
        loop {
            while !source_done && bytes_in_block < wire::STREAM_64K_SIZE {
                let got = source
                    .read(&mut buffer[1 + bytes_in_block..])
                    .map_err(|err| ProtocolError::Transport(transport::TransportError::Read(err)))?;
                if got == 0 {
                    source_done = true;
                } else {
                    bytes_in_block += got;
                }
            }
            if bytes_in_block == 0 {
                break;
            }
            let sent = self.send_stream_block(&mut buffer, bytes_in_block)?;
            buffer.copy_within(1 + sent..1 + bytes_in_block, 1);
            bytes_in_block -= sent;
            if source_done && bytes_in_block == 0 {
                break;
            }
        }
        self.stream
            .write_all(&[wire::STREAM_HEADER_END], self.timeout)?;
        Ok(())
    }

    /// Sends as much of the buffered block as one chunk can carry and
    /// returns the number of payload bytes consumed. `buffer[0]` is
    /// scratch space for the chunk header; payload starts at 1.
    fn send_stream_block(&mut self, buffer: &mut [u8], bytes_in_block: usize) -> ProtocolResult<usize> {
        let (header, write_size) = if bytes_in_block >= wire::STREAM_64K_SIZE {
            (wire::STREAM_HEADER_64K, wire::STREAM_64K_SIZE)
        } else {
            // Greedy: the largest table entry not exceeding the block.
            let mut choice = None;
            for header in (1..=usize::from(wire::STREAM_HEADER_MAX_ENCODED)).rev() {
                let size = usize::from(wire::STREAM_SIZE_TABLE[header]);
                if size <= bytes_in_block {
                    choice = Some((header as u8, size));
                    break;
                }
            }
            choice.ok_or(ProtocolError::BadCommand)?
        };
        buffer[0] = header;
        self.stream
            .write_all(&buffer[..=write_size], self.timeout)?;
        Ok(write_size)
    }
}

enum StreamState {
    Fixed { remaining: u64 },
    Uncertain { left_in_block: usize, finished: bool },
}

/// Reader over an in-band byte stream.
///
/// Borrows the protocol runtime mutably for the stream's lifetime, so the
/// frame sequence cannot be disturbed until the stream is consumed.
pub struct StreamReader<'a, S: Connection> {
    protocol: &'a mut Protocol<S>,
    state: StreamState,
}

impl<S: Connection> StreamReader<'_, S> {
    /// The exact number of bytes left, if the stream announced its size.
    #[must_use]
    pub fn bytes_left(&self) -> Option<u64> {
        match &self.state {
            StreamState::Fixed { remaining } => Some(*remaining),
            StreamState::Uncertain { .. } => None,
        }
    }

    /// Whether the stream has been fully consumed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match &self.state {
            StreamState::Fixed { remaining } => *remaining == 0,
            StreamState::Uncertain {
                finished,
                left_in_block,
            } => *finished && *left_in_block == 0,
        }
    }

    /// Reads the next slice of stream bytes; `Ok(0)` means end of stream.
    pub fn read_some(&mut self, buf: &mut [u8]) -> ProtocolResult<usize> {
        if buf.is_empty() || self.is_finished() {
            return Ok(0);
        }
        match &mut self.state {
            StreamState::Fixed { remaining } => {
                let want = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let timeout = self.protocol.timeout;
                let got = self.protocol.stream.read(&mut buf[..want], timeout)?;
                if got == 0 {
                    return Err(ProtocolError::ConnectionClosed);
                }
                *remaining -= got as u64;
                Ok(got)
            }
            StreamState::Uncertain {
                left_in_block,
                finished,
            } => {
                if *left_in_block == 0 {
                    let mut header = [0u8; 1];
                    let timeout = self.protocol.timeout;
                    if !self
                        .protocol
                        .stream
                        .read_exact_or_eof(&mut header, timeout)?
                    {
                        return Err(ProtocolError::ConnectionClosed);
                    }
                    match header[0] {
                        wire::STREAM_HEADER_END => {
                            *finished = true;
                            return Ok(0);
                        }
                        wire::STREAM_HEADER_64K => *left_in_block = wire::STREAM_64K_SIZE,
                        value if value <= wire::STREAM_HEADER_MAX_ENCODED => {
                            *left_in_block = usize::from(wire::STREAM_SIZE_TABLE[usize::from(value)]);
                        }
                        reserved => return Err(ProtocolError::BadStreamHeader(reserved)),
                    }
                }
                let want = buf.len().min(*left_in_block);
                let timeout = self.protocol.timeout;
                let got = self.protocol.stream.read(&mut buf[..want], timeout)?;
                if got == 0 {
                    return Err(ProtocolError::ConnectionClosed);
                }
                *left_in_block -= got;
                Ok(got)
            }
        }
    }

    /// Reads the whole stream into memory.
    pub fn read_to_vec(mut self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buffer = [0u8; 32 * 1024];
        loop {
            let got = self.read_some(&mut buffer)?;
            if got == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buffer[..got]);
        }
    }

    /// Copies the whole stream into `sink`, returning the byte count.
    pub fn copy_to<W: io::Write>(&mut self, sink: &mut W) -> ProtocolResult<u64> {
        let mut buffer = [0u8; 32 * 1024];
        let mut total = 0u64;
        loop {
            let got = self.read_some(&mut buffer)?;
            if got == 0 {
                return Ok(total);
            }
            sink.write_all(&buffer[..got])
                .map_err(|err| ProtocolError::Transport(transport::TransportError::Write(err)))?;
            total += got as u64;
        }
    }
}

impl<S: Connection> Read for StreamReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_some(buf).map_err(io::Error::other)
    }
}
