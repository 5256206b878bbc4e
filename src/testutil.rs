//! In-process agent doubles shared by the unit tests
//!
//! A fake agent is a task on the far end of a `tokio::io::duplex` pipe
//! answering request frames from a fixed path->contents map, byte-for-byte
//! the way the Python agent answers over SSH.

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::frame::{decode_request, STATUS_ERR, STATUS_OK};
use crate::pool::AgentChannel;

pub(crate) fn files(entries: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
    entries
        .iter()
        .map(|(p, d)| (p.to_string(), d.to_vec()))
        .collect()
}

pub(crate) fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut r = vec![STATUS_OK];
    r.extend_from_slice(&(body.len() as u64).to_be_bytes());
    r.extend_from_slice(body);
    r
}

pub(crate) fn err_response(msg: &str) -> Vec<u8> {
    let mut r = vec![STATUS_ERR];
    r.extend_from_slice(&(msg.len() as u64).to_be_bytes());
    r.extend_from_slice(msg.as_bytes());
    r
}

pub(crate) async fn read_request(stream: &mut DuplexStream) -> Option<(String, u64, u64)> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.ok()?;
    let path_len = u16::from_be_bytes(len_buf) as usize;
    let mut rest = vec![0u8; path_len + 16];
    stream.read_exact(&mut rest).await.ok()?;
    let mut req = len_buf.to_vec();
    req.extend_from_slice(&rest);
    decode_request(&req).ok()
}

pub(crate) fn fake_agent(mut stream: DuplexStream, files: HashMap<String, Vec<u8>>) {
    tokio::spawn(async move {
        while let Some((path, offset, length)) = read_request(&mut stream).await {
            let reply = if path == "/dev/null" {
                ok_response(b"")
            } else if let Some(data) = files.get(&path) {
                let start = (offset as usize).min(data.len());
                let end = (start + length as usize).min(data.len());
                ok_response(&data[start..end])
            } else {
                err_response(&format!("[Errno 2] No such file or directory: {path}"))
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    });
}

/// A ready-to-lease channel backed by a fake agent.
pub(crate) fn fake_channel(id: usize, files: HashMap<String, Vec<u8>>) -> AgentChannel {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    fake_agent(remote, files);
    let (rd, wr) = tokio::io::split(local);
    AgentChannel::new(id, wr, rd)
}
