//! Client-side framing codec for agent channels
//!
//! Requests and responses are length-prefixed, big-endian throughout.
//! Responses stream: the 9-byte header (status, data_len) arrives first,
//! then exactly data_len body bytes which are forwarded to a sink in
//! whatever pieces the channel delivers them. A stall timer guards every
//! wait and is re-armed each time any bytes arrive, so a slow-but-moving
//! channel never trips it while a silent one fails with a named error.

use std::time::Duration;

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::TransferError;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;

/// Response header: u8 status | u64 data_len.
pub const RESPONSE_HEADER_LEN: usize = 9;

pub const DEFAULT_STALL: Duration = Duration::from_secs(30);

/// Encode a read request: u16 path_len | path | u64 offset | u64 length.
pub fn encode_request(path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
    let path_bytes = path.as_bytes();
    if path_bytes.len() > u16::MAX as usize {
        bail!("remote path too long for request frame: {} bytes", path_bytes.len());
    }
    let mut buf = Vec::with_capacity(2 + path_bytes.len() + 16);
    buf.extend_from_slice(&(path_bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(path_bytes);
    buf.extend_from_slice(&offset.to_be_bytes());
    buf.extend_from_slice(&length.to_be_bytes());
    Ok(buf)
}

/// Decode a request frame. The client never does this in production; it is
/// the contract the remote agent implements, kept here so test doubles and
/// the codec can round-trip against each other.
pub fn decode_request(buf: &[u8]) -> Result<(String, u64, u64)> {
    if buf.len() < 2 {
        bail!("request frame truncated before path length");
    }
    let path_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let need = 2 + path_len + 16;
    if buf.len() < need {
        bail!("request frame truncated: have {} bytes, need {}", buf.len(), need);
    }
    let path = std::str::from_utf8(&buf[2..2 + path_len])?.to_string();
    let offset = u64::from_be_bytes(buf[2 + path_len..2 + path_len + 8].try_into().unwrap());
    let length = u64::from_be_bytes(buf[2 + path_len + 8..need].try_into().unwrap());
    Ok((path, offset, length))
}

/// Buffered reader over one agent's stdout.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    stall: Duration,
    agent_id: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, agent_id: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(64 * 1024),
            stall: DEFAULT_STALL,
            agent_id,
        }
    }

    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.stall = stall;
        self
    }

    /// One read from the channel into the buffer, bounded by the stall
    /// window. Callers loop on this, so the window restarts on every
    /// arrival.
    async fn fill(&mut self) -> Result<()> {
        match timeout(self.stall, self.reader.read_buf(&mut self.buf)).await {
            Err(_) => Err(TransferError::AgentStalled {
                id: self.agent_id,
                secs: self.stall.as_secs(),
            }
            .into()),
            Ok(Ok(0)) => Err(TransferError::AgentClosed { id: self.agent_id }.into()),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Wait for a full response header and consume it.
    pub async fn read_header(&mut self) -> Result<(u8, u64)> {
        while self.buf.len() < RESPONSE_HEADER_LEN {
            self.fill().await?;
        }
        let status = self.buf[0];
        let data_len = u64::from_be_bytes(self.buf[1..RESPONSE_HEADER_LEN].try_into().unwrap());
        self.buf.advance(RESPONSE_HEADER_LEN);
        Ok((status, data_len))
    }

    /// Forward exactly `remaining` body bytes to `sink`, in partial pieces
    /// as they arrive.
    pub async fn stream_body(
        &mut self,
        mut remaining: u64,
        sink: &mut (dyn FnMut(&[u8]) -> Result<()> + Send),
    ) -> Result<()> {
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = (self.buf.len() as u64).min(remaining) as usize;
            sink(&self.buf[..take])?;
            self.buf.advance(take);
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Collect a status-1 error payload as text.
    pub async fn read_error_message(&mut self, data_len: u64) -> Result<String> {
        let mut msg = Vec::with_capacity(data_len.min(1000) as usize);
        self.stream_body(data_len, &mut |piece| {
            msg.extend_from_slice(piece);
            Ok(())
        })
        .await?;
        Ok(String::from_utf8_lossy(&msg).into_owned())
    }
}
