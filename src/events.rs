//! Observable transfer event stream
//!
//! The core pushes strongly typed events to a single subscriber over an
//! unbounded channel; rendering, logging, and exit-code policy all live on
//! the consuming side. Ordering guarantees: `Start` precedes any
//! `FileStart`; every `FileStart` for a local path precedes that path's
//! `FileProgress` events; `FileComplete` follows all of its chunks;
//! `Complete`, when emitted, is the last non-error event.

use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::remote::FileEntry;

#[derive(Debug, Clone)]
pub enum TransferEvent {
    Start {
        total_bytes: u64,
        total_files: usize,
        files: Vec<FileEntry>,
    },
    /// The pool finished connecting; at least one agent answered its ping.
    TunnelReady,
    TunnelStatus(Vec<TunnelStatus>),
    FileStart {
        path: PathBuf,
        remote_path: String,
        /// `Some((index, total))` for range jobs, `None` for whole files.
        chunk: Option<(u32, u32)>,
    },
    FileProgress {
        path: PathBuf,
        chunk_bytes: u64,
        bytes_received: u64,
        total_bytes: u64,
    },
    FileSkip {
        path: PathBuf,
        size: u64,
    },
    FileComplete {
        path: PathBuf,
    },
    Complete {
        bytes_received: u64,
        skipped_bytes: u64,
        files: usize,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub id: usize,
    pub ready: bool,
    pub busy: bool,
    pub unhealthy: bool,
    pub reason: Option<String>,
    pub job: Option<String>,
}

/// Sender half handed to the core. A vanished subscriber must never fail a
/// transfer, so sends are fire-and-forget.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<TransferEvent>);

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn emit(&self, event: TransferEvent) {
        let _ = self.0.send(event);
    }
}
