//! Agent pool: spawning, health, and channel leasing
//!
//! One agent is one `ssh` child whose stdio speaks the frame protocol.
//! Channels carry at most one outstanding request; the pool enforces that
//! by leasing a channel out on acquire and taking it back on release, so
//! pipelining is unrepresentable rather than merely forbidden. Quarantined
//! agents keep their bounded stderr tail around for diagnostics but are
//! never leased again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::timeout;

use crate::agent;
use crate::error::TransferError;
use crate::events::TunnelStatus;
use crate::frame::{self, FrameReader, STATUS_ERR, STATUS_OK};
use crate::remote::{self, StatSyntax};
use crate::ssh::SshConfig;

pub const DEFAULT_AGENTS: usize = 8;

const SPAWN_BATCH: usize = 6;
const BATCH_DELAY: Duration = Duration::from_millis(300);
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const SPAWN_RETRIES: u32 = 3;
const STDERR_TAIL_MAX: usize = 5 * 1024;

type SharedTail = Arc<Mutex<VecDeque<u8>>>;

/// The I/O half of one agent, leased to whoever runs a job on it.
pub struct AgentChannel {
    pub id: usize,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    reader: FrameReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl AgentChannel {
    pub fn new(
        id: usize,
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            id,
            stdin: Box::new(stdin),
            reader: FrameReader::new(Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>, id),
        }
    }

    pub fn with_stall(mut self, stall: Duration) -> Self {
        self.reader = self.reader.with_stall(stall);
        self
    }

    /// Issue one read request and stream the body to `sink`. Returns the
    /// number of body bytes the agent actually sent, which may be less
    /// than `length` when the range runs past EOF.
    pub async fn read_range_streaming(
        &mut self,
        path: &str,
        offset: u64,
        length: u64,
        sink: &mut (dyn FnMut(&[u8]) -> Result<()> + Send),
    ) -> Result<u64> {
        let request = frame::encode_request(path, offset, length)?;
        self.stdin
            .write_all(&request)
            .await
            .with_context(|| format!("Agent {}: request write failed", self.id))?;
        self.stdin
            .flush()
            .await
            .with_context(|| format!("Agent {}: request flush failed", self.id))?;

        let (status, data_len) = self.reader.read_header().await?;
        match status {
            STATUS_OK => {
                // A failing sink must not leave body bytes in the channel,
                // or the next request would read them as a header.
                let mut sink_err: Option<anyhow::Error> = None;
                self.reader
                    .stream_body(data_len, &mut |piece| {
                        if sink_err.is_none() {
                            if let Err(e) = sink(piece) {
                                sink_err = Some(e);
                            }
                        }
                        Ok(())
                    })
                    .await?;
                match sink_err {
                    Some(e) => Err(e),
                    None => Ok(data_len),
                }
            }
            STATUS_ERR => {
                let msg = self.reader.read_error_message(data_len).await?;
                Err(TransferError::RemoteRead(msg).into())
            }
            other => Err(anyhow!("Agent {}: invalid response status {other}", self.id)),
        }
    }

    /// In-band readiness check: a zero-length read of `/dev/null` proves
    /// the SSH channel, the interpreter, and the framing end to end.
    pub async fn ping(&mut self) -> Result<()> {
        let mut noop = |_: &[u8]| Ok(());
        let fut = self.read_range_streaming("/dev/null", 0, 0, &mut noop);
        let n = timeout(PING_TIMEOUT, fut)
            .await
            .map_err(|_| anyhow!("Agent {}: ping timed out after 10s", self.id))??;
        if n != 0 {
            return Err(anyhow!("Agent {}: unexpected ping response of {n} bytes", self.id));
        }
        Ok(())
    }
}

struct Slot {
    id: usize,
    channel: Option<AgentChannel>,
    child: Option<Child>,
    ready: bool,
    busy: bool,
    unhealthy: bool,
    unhealthy_reason: Option<String>,
    job_label: Option<String>,
    stderr_tail: Option<SharedTail>,
}

impl Slot {
    fn vacant(id: usize) -> Self {
        Self {
            id,
            channel: None,
            child: None,
            ready: false,
            busy: false,
            unhealthy: false,
            unhealthy_reason: None,
            job_label: None,
            stderr_tail: None,
        }
    }
}

/// A leased channel. Hand it back via `AgentPool::release`, or let
/// `mark_unhealthy` reclaim the slot if the channel died with the job.
pub struct AgentLease {
    pub id: usize,
    pub channel: AgentChannel,
}

pub struct AgentPool {
    slots: Vec<Slot>,
    stat_syntax: StatSyntax,
}

impl AgentPool {
    /// Verify the remote runtime, probe the stat dialect, then launch
    /// `count` agents in batches. Succeeds as long as at least one agent
    /// answers its ping; stragglers are quarantined with their spawn error.
    pub async fn connect(cfg: &SshConfig, count: usize) -> Result<AgentPool> {
        let runtime = remote::verify_runtime(cfg).await?;
        let stat_syntax = remote::probe_stat_syntax(cfg).await?;

        let mut slots: Vec<Slot> = (0..count.max(1)).map(Slot::vacant).collect();
        let ids: Vec<usize> = slots.iter().map(|s| s.id).collect();

        for (batch_no, batch) in ids.chunks(SPAWN_BATCH).enumerate() {
            if batch_no > 0 {
                tokio::time::sleep(BATCH_DELAY).await;
            }
            let mut handles = Vec::with_capacity(batch.len());
            for &id in batch {
                let cfg = cfg.clone();
                let runtime = runtime.clone();
                handles.push((id, tokio::spawn(spawn_agent_with_retry(cfg, runtime, id))));
            }
            for (id, handle) in handles {
                let slot = &mut slots[id];
                match handle.await {
                    Ok(Ok(spawned)) => {
                        slot.channel = Some(spawned.channel);
                        slot.child = Some(spawned.child);
                        slot.stderr_tail = Some(spawned.stderr_tail);
                        slot.ready = true;
                    }
                    Ok(Err(e)) => {
                        slot.unhealthy = true;
                        slot.unhealthy_reason = Some(format!("{e:#}"));
                    }
                    Err(join_err) => {
                        slot.unhealthy = true;
                        slot.unhealthy_reason = Some(format!("spawn task failed: {join_err}"));
                    }
                }
            }
        }

        let pool = AgentPool { slots, stat_syntax };
        if pool.healthy_count() == 0 {
            let reason = pool
                .slots
                .iter()
                .find_map(|s| s.unhealthy_reason.clone())
                .unwrap_or_else(|| "no agents launched".into());
            return Err(TransferError::AgentSpawn { id: 0, reason }.into());
        }
        Ok(pool)
    }

    /// Build a pool from pre-established channels. Used by the integration
    /// tests, where the channels are in-process fakes.
    pub fn from_channels(channels: Vec<AgentChannel>) -> AgentPool {
        let slots = channels
            .into_iter()
            .enumerate()
            .map(|(id, ch)| Slot {
                channel: Some(ch),
                ready: true,
                ..Slot::vacant(id)
            })
            .collect();
        AgentPool {
            slots,
            stat_syntax: StatSyntax::Gnu,
        }
    }

    pub fn stat_syntax(&self) -> StatSyntax {
        self.stat_syntax
    }

    /// First agent that is ready, idle, and healthy; never blocks.
    pub fn acquire(&mut self) -> Option<AgentLease> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.ready && !s.busy && !s.unhealthy && s.channel.is_some())?;
        slot.busy = true;
        let channel = slot.channel.take().expect("ready slot has channel");
        Some(AgentLease { id: slot.id, channel })
    }

    pub fn release(&mut self, lease: AgentLease) {
        let slot = &mut self.slots[lease.id];
        slot.busy = false;
        slot.job_label = None;
        // A quarantined slot stays quarantined; the returned channel is
        // dropped along with the lease.
        if !slot.unhealthy {
            slot.channel = Some(lease.channel);
        }
    }

    /// Idempotent quarantine. The first reason wins; the child is killed
    /// so a wedged remote read cannot pin the channel open.
    pub fn mark_unhealthy(&mut self, id: usize, reason: &str) {
        let slot = &mut self.slots[id];
        if slot.unhealthy {
            return;
        }
        slot.unhealthy = true;
        slot.ready = false;
        slot.busy = false;
        slot.channel = None;
        slot.job_label = None;
        slot.unhealthy_reason = Some(match slot.stderr_tail.as_ref().map(tail_to_string) {
            Some(tail) if !tail.is_empty() => format!("{reason}; stderr: {tail}"),
            _ => reason.to_string(),
        });
        if let Some(child) = &mut slot.child {
            let _ = child.start_kill();
        }
    }

    /// Agents that could still run a job now or once released. Busy agents
    /// count: a job re-queued after quarantine can wait for one to free up.
    pub fn healthy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.ready && !s.unhealthy).count()
    }

    pub fn set_job_label(&mut self, id: usize, label: &str) {
        self.slots[id].job_label = Some(label.to_string());
    }

    pub fn statuses(&self) -> Vec<TunnelStatus> {
        self.slots
            .iter()
            .map(|s| TunnelStatus {
                id: s.id,
                ready: s.ready,
                busy: s.busy,
                unhealthy: s.unhealthy,
                reason: s.unhealthy_reason.clone(),
                job: s.job_label.clone(),
            })
            .collect()
    }

    /// Close every channel (the agents exit on stdin EOF), then SIGTERM,
    /// a 500 ms grace period, and SIGKILL for survivors.
    pub async fn close(&mut self) {
        for slot in &mut self.slots {
            slot.channel = None;
            slot.ready = false;
        }
        for slot in &self.slots {
            if let Some(child) = &slot.child {
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        for slot in &mut self.slots {
            if let Some(mut child) = slot.child.take() {
                if !matches!(child.try_wait(), Ok(Some(_))) {
                    let _ = child.kill().await;
                }
            }
        }
    }
}

struct SpawnedAgent {
    channel: AgentChannel,
    child: Child,
    stderr_tail: SharedTail,
}

/// Connection-rate rejections and interrupted key exchanges are the two
/// transient startup failures worth retrying; everything else is real.
fn retryable_spawn_error(msg: &str) -> bool {
    msg.contains("Connection reset") || msg.contains("kex_exchange")
}

async fn spawn_agent_with_retry(cfg: SshConfig, runtime: String, id: usize) -> Result<SpawnedAgent> {
    let mut retries = 0u32;
    loop {
        match timeout(SPAWN_TIMEOUT, spawn_agent(&cfg, &runtime, id)).await {
            Ok(Ok(spawned)) => return Ok(spawned),
            Ok(Err(e)) => {
                let msg = format!("{e:#}");
                if retries < SPAWN_RETRIES && retryable_spawn_error(&msg) {
                    retries += 1;
                    // 500/1000/1500 ms linear back-off.
                    tokio::time::sleep(Duration::from_millis(500 * retries as u64)).await;
                    continue;
                }
                return Err(TransferError::AgentSpawn { id, reason: msg }.into());
            }
            Err(_) => {
                return Err(TransferError::AgentSpawn {
                    id,
                    reason: format!("startup timed out after {}s", SPAWN_TIMEOUT.as_secs()),
                }
                .into())
            }
        }
    }
}

async fn spawn_agent(cfg: &SshConfig, runtime: &str, id: usize) -> Result<SpawnedAgent> {
    let verbose = std::env::var_os("SSHGET_AGENT_VERBOSE").is_some_and(|v| v == "1");
    let mut cmd = crate::ssh::agent_command(cfg, &agent::bootstrap_command(runtime, verbose))?;
    let mut child = cmd.spawn().context("spawning ssh")?;

    let stdin = child.stdin.take().context("agent stdin not piped")?;
    let stdout = child.stdout.take().context("agent stdout not piped")?;
    let stderr = child.stderr.take().context("agent stderr not piped")?;

    let stderr_tail: SharedTail = Arc::new(Mutex::new(VecDeque::new()));
    let tail = stderr_tail.clone();
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => push_tail(&tail, &buf[..n]),
            }
        }
    });

    let mut channel = AgentChannel::new(id, stdin, stdout);
    if let Err(e) = channel.ping().await {
        let tail = tail_to_string(&stderr_tail);
        let _ = child.start_kill();
        if tail.is_empty() {
            return Err(e);
        }
        return Err(e.context(format!("agent stderr: {tail}")));
    }

    Ok(SpawnedAgent {
        channel,
        child,
        stderr_tail,
    })
}

fn push_tail(tail: &SharedTail, bytes: &[u8]) {
    let mut t = tail.lock();
    for &b in bytes {
        if t.len() >= STDERR_TAIL_MAX {
            t.pop_front();
        }
        t.push_back(b);
    }
}

fn tail_to_string(tail: &SharedTail) -> String {
    let t = tail.lock();
    String::from_utf8_lossy(&t.iter().copied().collect::<Vec<u8>>())
        .trim()
        .to_string()
}
