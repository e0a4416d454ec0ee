//! Framed control-socket connection.
//!
//! Frame layout: `[u32 BE payload length][payload]`, payload being one
//! JSON-encoded [`ControlMessage`]. Frames above the configured limit are
//! refused on send and drained on receive so the stream stays in sync.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use thiserror::Error;

use crate::protocol::ControlMessage;

/// Default upper bound on a frame payload (64 KiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("peer closed the connection")]
    Closed,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("failed to encode {keyword} message: {source}")]
    Encode {
        keyword: &'static str,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IpcError {
    /// True when the peer is gone and further I/O is pointless.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// One end of a control connection.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    max_frame_len: usize,
}

impl Connection {
    pub fn new(stream: UnixStream, max_frame_len: usize) -> Self {
        Self {
            stream,
            max_frame_len,
        }
    }

    /// Connect to the supervisor's control socket.
    pub fn connect(path: &Path, max_frame_len: usize) -> io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path)?, max_frame_len))
    }

    /// Send one message as a single frame.
    pub fn send(&mut self, msg: &ControlMessage) -> Result<(), IpcError> {
        let payload = msg.encode().map_err(|source| IpcError::Encode {
            keyword: msg.keyword(),
            source,
        })?;
        if payload.len() > self.max_frame_len {
            return Err(IpcError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame_len,
        })?;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);

        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        log::trace!("sent {} ({} bytes)", msg.keyword(), frame.len());
        Ok(())
    }

    /// Receive one message, blocking until a whole frame has arrived.
    ///
    /// Returns [`IpcError::Closed`] when the peer shut down cleanly between
    /// frames.
    pub fn recv(&mut self) -> Result<ControlMessage, IpcError> {
        let mut header = [0u8; HEADER_LEN];
        if !read_exact_or_eof(&mut self.stream, &mut header)? {
            return Err(IpcError::Closed);
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            io::copy(&mut (&mut self.stream).take(len as u64), &mut io::sink())?;
            return Err(IpcError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        let msg = ControlMessage::decode(&payload);
        log::trace!("received {} ({} bytes)", msg.keyword(), len + HEADER_LEN);
        Ok(msg)
    }

    /// Send `msg` and block for the reply.
    pub fn request(&mut self, msg: &ControlMessage) -> Result<ControlMessage, IpcError> {
        self.send(msg)?;
        self.recv()
    }

    #[cfg(test)]
    pub(crate) fn stream(&self) -> &UnixStream {
        &self.stream
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Fill `buf`, returning `Ok(false)` if EOF arrives before the first byte.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
