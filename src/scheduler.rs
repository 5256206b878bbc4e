//! Transfer scheduler: planning, dispatch, retries, quarantine
//!
//! Planning turns the enumerated file list into jobs: files at or above
//! the parallel threshold are split into one range per tunnel, everything
//! else rides a single whole-file job, and files already present locally
//! at the right size are skipped outright. The dispatch loop is a single
//! task; jobs execute on spawned per-agent tasks and report back over a
//! channel, so pool mutations never race.
//!
//! Failures keep two independent budgets. An agent-level failure (stall,
//! channel EOF, corrupt frame) quarantines the agent and re-queues the job
//! at no cost to the job. A job-level failure (remote read error, local
//! I/O) burns one of the job's three attempts; the third rejects the whole
//! transfer naming the chunk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::download;
use crate::error::is_agent_level;
use crate::events::{EventSender, TransferEvent};
use crate::pool::{AgentLease, AgentPool};
use crate::remote::FileEntry;

pub const PARALLEL_THRESHOLD: u64 = 50 * 1024 * 1024;

const JOB_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone)]
pub enum Job {
    Whole {
        file: FileEntry,
        local_path: PathBuf,
    },
    Range {
        file: FileEntry,
        local_path: PathBuf,
        start: u64,
        /// Inclusive.
        end: u64,
        chunk_index: u32,
        total_chunks: u32,
    },
}

impl Job {
    pub fn file(&self) -> &FileEntry {
        match self {
            Job::Whole { file, .. } | Job::Range { file, .. } => file,
        }
    }

    pub fn local_path(&self) -> &Path {
        match self {
            Job::Whole { local_path, .. } | Job::Range { local_path, .. } => local_path,
        }
    }

    pub fn chunk(&self) -> Option<(u32, u32)> {
        match self {
            Job::Whole { .. } => None,
            Job::Range {
                chunk_index,
                total_chunks,
                ..
            } => Some((*chunk_index, *total_chunks)),
        }
    }

    /// Human label: `<remote> chunk k/n` for ranges, `<remote>` for wholes.
    pub fn label(&self) -> String {
        match self.chunk() {
            Some((i, n)) => format!("{} chunk {}/{}", self.file().full_path, i + 1, n),
            None => self.file().full_path.clone(),
        }
    }

    fn retry_key(&self) -> (PathBuf, Option<u32>) {
        (
            self.local_path().to_path_buf(),
            self.chunk().map(|(i, _)| i),
        )
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub jobs: VecDeque<Job>,
    pub skipped: Vec<(FileEntry, PathBuf)>,
}

impl Plan {
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped.iter().map(|(f, _)| f.size).sum()
    }
}

/// Plan jobs for the file list. `tunnel_count` bounds the number of range
/// jobs per file; a degenerate tail (start past EOF after the ceil split)
/// is dropped and the remaining chunks are re-counted densely.
pub fn plan_jobs(files: &[(FileEntry, PathBuf)], tunnel_count: usize, threshold: u64) -> Plan {
    let mut plan = Plan::default();
    for (file, local_path) in files {
        if let Ok(md) = std::fs::metadata(local_path) {
            if md.is_file() && md.len() == file.size {
                plan.skipped.push((file.clone(), local_path.clone()));
                continue;
            }
        }
        if file.size >= threshold && file.size > 0 && tunnel_count > 1 {
            let chunk_size = file.size.div_ceil(tunnel_count as u64);
            let mut ranges = Vec::with_capacity(tunnel_count);
            for i in 0..tunnel_count as u64 {
                let start = i * chunk_size;
                if start >= file.size {
                    break;
                }
                ranges.push((start, (start + chunk_size - 1).min(file.size - 1)));
            }
            let total_chunks = ranges.len() as u32;
            for (chunk_index, (start, end)) in ranges.into_iter().enumerate() {
                plan.jobs.push_back(Job::Range {
                    file: file.clone(),
                    local_path: local_path.clone(),
                    start,
                    end,
                    chunk_index: chunk_index as u32,
                    total_chunks,
                });
            }
        } else {
            plan.jobs.push_back(Job::Whole {
                file: file.clone(),
                local_path: local_path.clone(),
            });
        }
    }
    plan
}

/// Idempotent cooperative cancellation shared between the scheduler, the
/// orchestrator, and the signal handler.
pub struct Abort {
    flag: AtomicBool,
    notify: Notify,
}

impl Abort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete {
        bytes_received: u64,
        skipped_bytes: u64,
    },
    Aborted,
}

struct JobOutcome {
    agent_id: usize,
    lease: AgentLease,
    result: Result<()>,
}

/// Drive the plan to completion over the pool.
///
/// `active_temps` is shared with the abort path: every pre-allocated or
/// in-flight temp file is registered there and removed only when its
/// rename lands, so whoever aborts knows exactly what to unlink.
pub async fn run(
    pool: &mut AgentPool,
    plan: Plan,
    events: &EventSender,
    abort: &Arc<Abort>,
    active_temps: &Arc<Mutex<HashSet<PathBuf>>>,
    total_bytes: u64,
) -> Result<Outcome> {
    // Guarded together with the progress emit so the bytes_received values
    // observers see never run backwards across interleaved job tasks.
    let bytes_received = Arc::new(Mutex::new(0u64));
    let skipped_bytes = plan.skipped_bytes();

    // Skips count toward bytes_received up front; observers see one spike.
    for (file, local_path) in &plan.skipped {
        *bytes_received.lock() += file.size;
        events.emit(TransferEvent::FileSkip {
            path: local_path.clone(),
            size: file.size,
        });
    }

    // Register every job's temp path up front, whole files included, so an
    // abort at any point hands the complete set back for cleanup. Ranged
    // files are also pre-allocated once so chunk writers land on their
    // offsets; whole files create their temp when the download starts.
    let mut registered: HashSet<PathBuf> = HashSet::new();
    for job in &plan.jobs {
        if registered.insert(job.local_path().to_path_buf()) {
            if let Job::Range {
                file, local_path, ..
            } = job
            {
                download::preallocate(local_path, file.size)?;
            }
            active_temps.lock().insert(download::temp_path(job.local_path()));
        }
    }

    let mut pending = plan.jobs;
    let mut active: HashMap<usize, Job> = HashMap::new();
    let mut completed_chunks: HashMap<PathBuf, HashSet<u32>> = HashMap::new();
    let mut job_retries: HashMap<(PathBuf, Option<u32>), u8> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobOutcome>();

    loop {
        if abort.is_aborted() {
            return Ok(Outcome::Aborted);
        }

        while !pending.is_empty() {
            let Some(lease) = pool.acquire() else { break };
            let job = pending.pop_front().expect("pending checked non-empty");
            pool.set_job_label(lease.id, &job.label());
            events.emit(TransferEvent::FileStart {
                path: job.local_path().to_path_buf(),
                remote_path: job.file().full_path.clone(),
                chunk: job.chunk(),
            });
            events.emit(TransferEvent::TunnelStatus(pool.statuses()));
            active.insert(lease.id, job.clone());
            spawn_job(lease, job, done_tx.clone(), events, &bytes_received, total_bytes);
        }

        if active.is_empty() {
            if pending.is_empty() {
                return Ok(Outcome::Complete {
                    bytes_received: *bytes_received.lock(),
                    skipped_bytes,
                });
            }
            // Jobs remain but nothing can run them and nothing is in
            // flight to free an agent up.
            let first = pending.front().expect("pending checked non-empty");
            return Err(anyhow!(
                "{}: no healthy agents remain ({} jobs left)",
                first.label(),
                pending.len()
            ));
        }

        let outcome = tokio::select! {
            _ = abort.wait() => return Ok(Outcome::Aborted),
            maybe = done_rx.recv() => maybe.expect("scheduler holds a sender"),
        };

        let job = active
            .remove(&outcome.agent_id)
            .expect("outcome from an active agent");

        match outcome.result {
            Ok(()) => {
                pool.release(outcome.lease);
                events.emit(TransferEvent::TunnelStatus(pool.statuses()));
                match &job {
                    Job::Whole { local_path, .. } => {
                        active_temps.lock().remove(&download::temp_path(local_path));
                        events.emit(TransferEvent::FileComplete {
                            path: local_path.clone(),
                        });
                    }
                    Job::Range {
                        file,
                        local_path,
                        chunk_index,
                        total_chunks,
                        ..
                    } => {
                        let acked = completed_chunks.entry(local_path.clone()).or_default();
                        acked.insert(*chunk_index);
                        if acked.len() as u32 == *total_chunks {
                            download::finalize(local_path, file.mode, file.mtime)?;
                            active_temps.lock().remove(&download::temp_path(local_path));
                            events.emit(TransferEvent::FileComplete {
                                path: local_path.clone(),
                            });
                        }
                    }
                }
            }
            Err(err) => {
                let msg = format!("{err:#}");
                if is_agent_level(&msg) {
                    pool.mark_unhealthy(outcome.agent_id, &msg);
                    pool.release(outcome.lease);
                    events.emit(TransferEvent::TunnelStatus(pool.statuses()));
                    if pool.healthy_count() > 0 {
                        // Agent trouble is not the job's fault: re-queue
                        // without touching its retry budget.
                        pending.push_back(job);
                    } else {
                        requeue_or_fail(
                            job,
                            &format!("no healthy agents remain: {msg}"),
                            &mut job_retries,
                            &mut pending,
                        )?;
                    }
                } else {
                    pool.release(outcome.lease);
                    events.emit(TransferEvent::TunnelStatus(pool.statuses()));
                    requeue_or_fail(job, &msg, &mut job_retries, &mut pending)?;
                }
            }
        }
    }
}

fn requeue_or_fail(
    job: Job,
    err_msg: &str,
    job_retries: &mut HashMap<(PathBuf, Option<u32>), u8>,
    pending: &mut VecDeque<Job>,
) -> Result<()> {
    let count = job_retries.entry(job.retry_key()).or_insert(0);
    *count += 1;
    if *count < JOB_ATTEMPTS {
        pending.push_back(job);
        Ok(())
    } else {
        Err(anyhow!("{} failed after {count} attempts: {err_msg}", job.label()))
    }
}

fn spawn_job(
    mut lease: AgentLease,
    job: Job,
    done_tx: mpsc::UnboundedSender<JobOutcome>,
    events: &EventSender,
    bytes_received: &Arc<Mutex<u64>>,
    total_bytes: u64,
) {
    let events = events.clone();
    let bytes_received = bytes_received.clone();
    tokio::spawn(async move {
        let path = job.local_path().to_path_buf();
        let mut on_bytes = |n: u64| {
            let mut received = bytes_received.lock();
            *received += n;
            events.emit(TransferEvent::FileProgress {
                path: path.clone(),
                chunk_bytes: n,
                bytes_received: *received,
                total_bytes,
            });
        };
        let result = match &job {
            Job::Whole { file, local_path } => {
                download::download_whole(
                    &mut lease.channel,
                    &file.full_path,
                    local_path,
                    file.size,
                    file.mode,
                    file.mtime,
                    &mut on_bytes,
                )
                .await
            }
            Job::Range {
                file,
                local_path,
                start,
                end,
                ..
            } => {
                download::download_range(
                    &mut lease.channel,
                    &file.full_path,
                    local_path,
                    *start,
                    *end,
                    &mut on_bytes,
                )
                .await
            }
        };
        let _ = done_tx.send(JobOutcome {
            agent_id: lease.id,
            lease,
            result,
        });
    });
}
