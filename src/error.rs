//! Transfer error kinds and failure classification
//!
//! Errors cross two very different boundaries here: a problem with an agent
//! channel (stall, EOF, corrupt frame) must quarantine that agent and leave
//! the job's retry budget alone, while a problem with the job itself
//! (permission denied, vanished file) must burn a retry. The scheduler
//! classifies by message because agent errors travel through anyhow context
//! chains; every constructor below keeps its classifying keyword stable.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("bad source '{0}': expected [user@]host:path")]
    Parse(String),

    #[error("authentication setup failed: {0}")]
    Auth(String),

    #[error("remote runtime unsupported: {0}")]
    RuntimeUnsupported(String),

    #[error("agent {id} failed to start: {reason}")]
    AgentSpawn { id: usize, reason: String },

    /// No inbound byte for the full stall window during an active read.
    #[error("Agent {id}: read stalled after {secs}s with no data")]
    AgentStalled { id: usize, secs: u64 },

    /// Channel EOF while a request was outstanding.
    #[error("Agent {id}: connection closed mid-request")]
    AgentClosed { id: usize },

    /// status=1 response from the agent; the message is the remote error.
    #[error("remote read failed: {0}")]
    RemoteRead(String),

    #[error("remote enumeration failed for '{path}': {detail}")]
    Enumeration { path: String, detail: String },

    #[error("local I/O error on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cooperative cancellation. Terminal, but never emitted as `error`.
    #[error("transfer aborted")]
    Aborted,
}

/// Agent-level errors quarantine the agent and re-queue the job for free;
/// anything else counts against the job's retry budget.
pub fn is_agent_level(msg: &str) -> bool {
    msg.contains("stalled")
        || msg.contains("read timeout")
        || msg.contains("read stalled")
        || msg.contains("connection closed")
        || msg.contains("Agent ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_and_close_classify_as_agent_level() {
        let stall = TransferError::AgentStalled { id: 3, secs: 30 };
        assert!(is_agent_level(&stall.to_string()));

        let closed = TransferError::AgentClosed { id: 1 };
        assert!(is_agent_level(&closed.to_string()));
    }

    #[test]
    fn agent_prefix_survives_context_wrapping() {
        let inner = TransferError::AgentClosed { id: 7 };
        let wrapped = anyhow::Error::new(inner).context("downloading /srv/big.iso chunk 2/4");
        assert!(is_agent_level(&format!("{wrapped:#}")));
    }

    #[test]
    fn remote_read_is_job_level() {
        let e = TransferError::RemoteRead("[Errno 13] Permission denied: '/root/x'".into());
        assert!(!is_agent_level(&e.to_string()));

        let e = TransferError::RemoteRead("[Errno 2] No such file or directory".into());
        assert!(!is_agent_level(&e.to_string()));
    }

    #[test]
    fn keyword_variants() {
        assert!(is_agent_level("read timeout waiting for header"));
        assert!(is_agent_level("channel stalled"));
        assert!(!is_agent_level("permission denied"));
    }
}
