//! Remote enumeration over one-shot SSH commands
//!
//! Listing and globbing never ride the agent protocol; each operation here
//! is a single `ssh user@host '<shell command>'` round trip. The only
//! remote requirements are a POSIX shell, `find`, `stat`, and `test`.
//! GNU and BSD stat disagree on everything, so the enumerator probes once
//! against `/dev/null` and sticks with whichever syntax answered.

use anyhow::{Context, Result};

use crate::agent;
use crate::error::TransferError;
use crate::ssh::{self, SshConfig};

/// One remote file, as reported by `stat`.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the matched root (empty prefix stripped of any
    /// leading `/`). For a single-file root this is the basename.
    pub relative_path: String,
    pub full_path: String,
    pub size: u64,
    /// POSIX permission bits, as parsed from octal `stat` output.
    pub mode: u32,
    /// Seconds since the epoch.
    pub mtime: i64,
    /// The enumerated source root this entry was found under.
    pub matched_root: String,
    pub matched_root_is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSyntax {
    Gnu,
    Bsd,
}

impl StatSyntax {
    fn format_args(self) -> &'static str {
        match self {
            // size, octal mode, mtime, name
            StatSyntax::Gnu => "-c '%s %a %Y %n'",
            StatSyntax::Bsd => "-f '%z %Lp %m %N'",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub exists: bool,
    pub is_directory: bool,
}

/// Run one remote shell command, returning stdout. Failures carry the
/// remote stderr.
pub async fn exec_remote(cfg: &SshConfig, command: &str, what: &str) -> Result<String> {
    let mut cmd = ssh::oneshot_command(cfg, command)?;
    let out = cmd
        .output()
        .await
        .with_context(|| format!("spawning ssh for {what}"))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        return Err(TransferError::Enumeration {
            path: what.to_string(),
            detail: if stderr.is_empty() {
                format!("remote command exited with {}", out.status)
            } else {
                stderr
            },
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Pick the interpreter for agent channels: `python3`, or `python` when it
/// reports major version >= 3.
pub async fn verify_runtime(cfg: &SshConfig) -> Result<String> {
    for runtime in ["python3", "python"] {
        let probe = agent::runtime_probe_command(runtime);
        if let Ok(out) = exec_remote(cfg, &probe, "runtime probe").await {
            if out.trim().parse::<u32>().map(|v| v >= 3).unwrap_or(false) {
                return Ok(runtime.to_string());
            }
        }
    }
    Err(TransferError::RuntimeUnsupported(format!(
        "no python >= 3 found on {}",
        cfg.host
    ))
    .into())
}

/// Probe which stat dialect the remote speaks, once per transfer.
pub async fn probe_stat_syntax(cfg: &SshConfig) -> Result<StatSyntax> {
    if exec_remote(cfg, "stat -c '%s' /dev/null", "stat probe").await.is_ok() {
        return Ok(StatSyntax::Gnu);
    }
    if exec_remote(cfg, "stat -f '%z' /dev/null", "stat probe").await.is_ok() {
        return Ok(StatSyntax::Bsd);
    }
    Err(TransferError::Enumeration {
        path: "/dev/null".into(),
        detail: "remote stat speaks neither GNU nor BSD syntax".into(),
    }
    .into())
}

pub async fn classify(cfg: &SshConfig, path: &str) -> Result<Classification> {
    let q = ssh::sh_quote(path);
    let cmd = format!("if [ -d {q} ]; then echo dir; elif [ -e {q} ]; then echo file; else echo none; fi");
    let out = exec_remote(cfg, &cmd, path).await?;
    Ok(parse_classify_output(out.trim()))
}

fn parse_classify_output(out: &str) -> Classification {
    match out {
        "dir" => Classification { exists: true, is_directory: true },
        "file" => Classification { exists: true, is_directory: false },
        _ => Classification { exists: false, is_directory: false },
    }
}

/// Enumerate all regular files under `root`. A file root yields exactly one
/// entry; a directory root walks with `find -P` (symlinks are not
/// followed) and batches `stat` via `-exec ... {} +`.
pub async fn list_files(
    cfg: &SshConfig,
    syntax: StatSyntax,
    root: &str,
    root_is_dir: bool,
) -> Result<Vec<FileEntry>> {
    let fmt = syntax.format_args();
    let q = ssh::sh_quote(root);
    let cmd = if root_is_dir {
        format!("find -P {q} -type f -exec stat {fmt} {{}} +")
    } else {
        format!("stat {fmt} {q}")
    };
    let out = exec_remote(cfg, &cmd, root).await?;

    let mut entries = Vec::new();
    for line in out.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (size, mode, mtime, full_path) = parse_stat_line(line)
            .with_context(|| format!("parsing stat output for '{root}': {line}"))?;
        let relative_path = if root_is_dir {
            relative_of(&full_path, root)
        } else {
            basename(&full_path).to_string()
        };
        entries.push(FileEntry {
            relative_path,
            full_path,
            size,
            mode,
            mtime,
            matched_root: root.to_string(),
            matched_root_is_dir: root_is_dir,
        });
    }
    Ok(entries)
}

/// Expand a shell wildcard on the remote side. The pattern is interpolated
/// unquoted so the remote shell's own globbing applies; the `[ -e ]` guard
/// keeps an unmatched pattern from echoing itself back.
pub async fn expand_wildcard(cfg: &SshConfig, pattern: &str) -> Result<Vec<String>> {
    let cmd = format!("for f in {pattern}; do [ -e \"$f\" ] && printf '%s\\n' \"$f\"; done");
    let out = exec_remote(cfg, &cmd, pattern).await?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Parse one `size mode mtime name` stat line. The name is the tail and
/// may itself contain spaces.
pub fn parse_stat_line(line: &str) -> Result<(u64, u32, i64, String)> {
    let mut parts = line.splitn(4, ' ');
    let (Some(size), Some(mode), Some(mtime), Some(name)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        anyhow::bail!("short stat line");
    };
    Ok((
        size.parse::<u64>().context("stat size field")?,
        u32::from_str_radix(mode, 8).context("stat mode field")?,
        mtime.parse::<i64>().context("stat mtime field")?,
        name.to_string(),
    ))
}

fn relative_of(full_path: &str, query_root: &str) -> String {
    full_path
        .strip_prefix(query_root)
        .unwrap_or(full_path)
        .trim_start_matches('/')
        .to_string()
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
