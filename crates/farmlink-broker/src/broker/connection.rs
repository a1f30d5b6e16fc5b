// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Peer connection framing.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a JSON
//! payload. Framing faults (oversize, truncated frame) terminate the
//! connection; payload faults do not, so [`PeerConnection::read_frame`]
//! hands back raw bytes and leaves parsing to the dispatcher, which
//! answers malformed payloads with an `error` message.

use super::protocol::Message;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A connected peer (chip or client; the transport cannot tell).
pub struct PeerConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl PeerConnection {
    /// Wrap an accepted TCP stream.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, max_message_size: usize) -> Self {
        Self {
            stream,
            peer_addr,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Peer address, for logging.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read one frame, returning the payload bytes.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(ConnectionError::Io(e)),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(ConnectionError::EmptyFrame);
        }
        if len > self.max_message_size {
            return Err(ConnectionError::FrameTooLarge {
                len,
                max: self.max_message_size,
            });
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.stream.read_exact(&mut self.read_buffer).await?;

        Ok(Some(self.read_buffer.clone()))
    }

    /// Send one message.
    pub async fn send_message(&mut self, msg: &Message) -> Result<(), ConnectionError> {
        let json = serde_json::to_vec(msg)?;

        if json.len() > self.max_message_size {
            return Err(ConnectionError::FrameTooLarge {
                len: json.len(),
                max: self.max_message_size,
            });
        }

        let len = json.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&json).await?;
        self.stream.flush().await?;

        Ok(())
    }
}

/// Transport-level connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}
