//! Transfer orchestration
//!
//! Owns the pool and the scheduler for one end-to-end run: parse and
//! validate sources, connect, expand wildcards, enumerate, map every
//! remote file to its local target, then hand the plan to the scheduler
//! and translate its outcome into events. Abort is cooperative: the
//! handle flips a shared flag, collects the registered temp paths, and
//! leaves unlinking to the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::events::{EventSender, TransferEvent};
use crate::pool::{AgentPool, DEFAULT_AGENTS};
use crate::remote::{self, FileEntry};
use crate::scheduler::{self, Abort, Outcome, PARALLEL_THRESHOLD};
use crate::source::{self, RemoteSource};
use crate::ssh::SshConfig;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub workers: usize,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub password: Option<String>,
    pub compression: bool,
    pub parallel_threshold: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_AGENTS,
            port: 22,
            identity: None,
            password: None,
            compression: false,
            parallel_threshold: PARALLEL_THRESHOLD,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed {
        bytes_received: u64,
        skipped_bytes: u64,
        files: usize,
    },
    Aborted,
}

/// Cloneable handle for signal handlers and UIs.
#[derive(Clone)]
pub struct AbortHandle {
    abort: Arc<Abort>,
    active_temps: Arc<Mutex<HashSet<PathBuf>>>,
}

impl AbortHandle {
    /// Flip the abort flag (idempotent) and take the current set of temp
    /// files. The caller unlinks them; nothing new is registered after
    /// the flag is up because the scheduler stops dispatching.
    pub fn abort(&self) -> Vec<PathBuf> {
        self.abort.trigger();
        self.active_temps.lock().drain().collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

pub struct Transfer {
    abort: Arc<Abort>,
    active_temps: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transfer {
    pub fn new() -> Self {
        Self {
            abort: Abort::new(),
            active_temps: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            abort: self.abort.clone(),
            active_temps: self.active_temps.clone(),
        }
    }

    /// Run one transfer. Emits `error` for any failure unless the run was
    /// aborted, in which case failures are swallowed and cleanup is
    /// silent.
    pub async fn run(
        &self,
        sources: &[String],
        dest: &str,
        opts: &TransferOptions,
        events: &EventSender,
    ) -> Result<TransferOutcome> {
        match self.run_inner(sources, dest, opts, events).await {
            Ok(outcome) => Ok(outcome),
            Err(_) if self.abort.is_aborted() => {
                self.unlink_temps();
                Ok(TransferOutcome::Aborted)
            }
            Err(err) => {
                events.emit(TransferEvent::Error {
                    message: format!("{err:#}"),
                });
                self.unlink_temps();
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        sources: &[String],
        dest: &str,
        opts: &TransferOptions,
        events: &EventSender,
    ) -> Result<TransferOutcome> {
        if sources.is_empty() {
            bail!("at least one remote source is required");
        }
        if source::looks_remote(dest) {
            bail!(
                "destination '{dest}' looks like a remote path; \
                 only remote-to-local transfers are supported"
            );
        }
        let parsed: Vec<RemoteSource> = sources
            .iter()
            .map(|s| source::parse_source(s))
            .collect::<Result<_>>()?;
        source::ensure_same_endpoint(&parsed)?;

        let cfg = SshConfig {
            user: parsed[0].user.clone(),
            host: parsed[0].host.clone(),
            port: opts.port,
            identity: opts.identity.clone(),
            password: opts.password.clone(),
            compression: opts.compression,
        };

        let mut pool = AgentPool::connect(&cfg, opts.workers).await?;
        events.emit(TransferEvent::TunnelReady);
        events.emit(TransferEvent::TunnelStatus(pool.statuses()));

        let result = self
            .enumerate_and_run(&cfg, &parsed, sources.len(), dest, opts, events, &mut pool)
            .await;
        pool.close().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn enumerate_and_run(
        &self,
        cfg: &SshConfig,
        parsed: &[RemoteSource],
        source_arg_count: usize,
        dest: &str,
        opts: &TransferOptions,
        events: &EventSender,
        pool: &mut AgentPool,
    ) -> Result<TransferOutcome> {
        let syntax = pool.stat_syntax();
        let any_wildcard = parsed.iter().any(|s| s.is_wildcard());

        // Wildcards expand to concrete roots before anything is listed.
        let mut roots: Vec<String> = Vec::new();
        for src in parsed {
            if src.is_wildcard() {
                let matches = remote::expand_wildcard(cfg, &src.path).await?;
                if matches.is_empty() {
                    bail!("wildcard '{}' matched nothing on {}", src.path, src.host);
                }
                roots.extend(matches);
            } else {
                roots.push(src.path.clone());
            }
        }

        let mut files: Vec<FileEntry> = Vec::new();
        for root in &roots {
            let class = remote::classify(cfg, root).await?;
            if !class.exists {
                bail!("remote path '{root}' does not exist");
            }
            let listed = remote::list_files(cfg, syntax, root, class.is_directory)
                .await
                .with_context(|| format!("listing '{root}'"))?;
            files.extend(listed);
        }
        if files.is_empty() {
            bail!("no files to transfer");
        }

        let single_literal = source_arg_count == 1
            && !any_wildcard
            && files.len() == 1
            && !files[0].matched_root_is_dir;
        let targets = plan_local_paths(dest, &files, single_literal);

        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        events.emit(TransferEvent::Start {
            total_bytes,
            total_files: files.len(),
            files: files.clone(),
        });

        let tunnel_count = pool.healthy_count().max(1);
        let plan = scheduler::plan_jobs(&targets, tunnel_count, opts.parallel_threshold);
        let outcome = scheduler::run(
            pool,
            plan,
            events,
            &self.abort,
            &self.active_temps,
            total_bytes,
        )
        .await?;

        match outcome {
            Outcome::Complete {
                bytes_received,
                skipped_bytes,
            } => {
                events.emit(TransferEvent::Complete {
                    bytes_received,
                    skipped_bytes,
                    files: files.len(),
                });
                Ok(TransferOutcome::Completed {
                    bytes_received,
                    skipped_bytes,
                    files: files.len(),
                })
            }
            Outcome::Aborted => Ok(TransferOutcome::Aborted),
        }
    }

    fn unlink_temps(&self) {
        for tmp in self.active_temps.lock().drain() {
            let _ = std::fs::remove_file(&tmp);
        }
    }
}

/// Map each remote file to its local target.
///
/// One non-wildcard source that resolved to one plain file copies to the
/// destination literally, unless the destination is (or is spelled as) a
/// directory. Everything else lands under the destination: directory
/// roots keep their top-level name and their internal layout, loose files
/// (wildcard matches) copy flat.
pub fn plan_local_paths(
    dest: &str,
    files: &[FileEntry],
    single_literal: bool,
) -> Vec<(FileEntry, PathBuf)> {
    let dest_path = Path::new(dest);
    if single_literal {
        let file = &files[0];
        let target = if dest.ends_with('/') || dest_path.is_dir() {
            dest_path.join(remote::basename(&file.relative_path))
        } else {
            dest_path.to_path_buf()
        };
        return vec![(file.clone(), target)];
    }
    files
        .iter()
        .map(|file| {
            let target = if file.matched_root_is_dir {
                dest_path
                    .join(remote::basename(&file.matched_root))
                    .join(&file.relative_path)
            } else {
                dest_path.join(remote::basename(&file.full_path))
            };
            (file.clone(), target)
        })
        .collect()
}
