//! Streaming downloader: temp files, positioned writes, atomic finalize
//!
//! Every local target gets a companion `<target>.sshget.tmp`. Range jobs
//! share one pre-allocated sparse temp file and write at their own
//! offsets; whole files stream sequentially into theirs. The rename in
//! `finalize` is the only commit point, so a crash or abort can never
//! leave a half-written file under the final name.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use filetime::FileTime;

use crate::error::TransferError;
use crate::pool::AgentChannel;

pub const TEMP_SUFFIX: &str = ".sshget.tmp";

pub fn temp_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

fn local_io(path: &Path, source: std::io::Error) -> anyhow::Error {
    TransferError::LocalIo {
        path: path.to_path_buf(),
        source,
    }
    .into()
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| local_io(parent, e))?;
        }
    }
    Ok(())
}

/// Create the temp file as a sparse file of the exact final size.
/// Truncate-to-size, never zero-fill; range writers land on their offsets.
pub fn preallocate(local: &Path, size: u64) -> Result<()> {
    let tmp = temp_path(local);
    ensure_parent(&tmp)?;
    let f = File::create(&tmp).map_err(|e| local_io(&tmp, e))?;
    f.set_len(size).map_err(|e| local_io(&tmp, e))?;
    Ok(())
}

/// Stream an entire file into its temp and commit it, metadata included.
pub async fn download_whole(
    channel: &mut AgentChannel,
    remote_path: &str,
    local_path: &Path,
    size: u64,
    mode: u32,
    mtime: i64,
    on_bytes: &mut (dyn FnMut(u64) + Send),
) -> Result<()> {
    let tmp = temp_path(local_path);
    ensure_parent(&tmp)?;
    let mut file = File::create(&tmp).map_err(|e| local_io(&tmp, e))?;

    channel
        .read_range_streaming(remote_path, 0, size, &mut |piece| {
            file.write_all(piece).map_err(|e| local_io(&tmp, e))?;
            on_bytes(piece.len() as u64);
            Ok(())
        })
        .await?;
    file.flush().map_err(|e| local_io(&tmp, e))?;
    drop(file);

    finalize(local_path, mode, mtime)
}

/// Stream one chunk `[start, end]` (inclusive) into the shared temp file.
/// The temp must already exist at full size; see `preallocate`.
pub async fn download_range(
    channel: &mut AgentChannel,
    remote_path: &str,
    local_path: &Path,
    start: u64,
    end: u64,
    on_bytes: &mut (dyn FnMut(u64) + Send),
) -> Result<()> {
    let tmp = temp_path(local_path);
    let mut file = OpenOptions::new()
        .write(true)
        .open(&tmp)
        .map_err(|e| local_io(&tmp, e))?;

    let length = end - start + 1;
    let mut written: u64 = 0;
    channel
        .read_range_streaming(remote_path, start, length, &mut |piece| {
            file.seek(SeekFrom::Start(start + written))
                .map_err(|e| local_io(&tmp, e))?;
            file.write_all(piece).map_err(|e| local_io(&tmp, e))?;
            written += piece.len() as u64;
            on_bytes(piece.len() as u64);
            Ok(())
        })
        .await?;
    file.flush().map_err(|e| local_io(&tmp, e))?;
    Ok(())
}

/// Rename the temp over the final path and apply mode and mtime
/// (atime = mtime). A failed rename fails the transfer; failed metadata
/// only warns.
pub fn finalize(local_path: &Path, mode: u32, mtime: i64) -> Result<()> {
    let tmp = temp_path(local_path);
    std::fs::rename(&tmp, local_path).map_err(|e| local_io(local_path, e))?;

    if let Err(e) =
        std::fs::set_permissions(local_path, std::fs::Permissions::from_mode(mode & 0o7777))
    {
        eprintln!("warning: chmod {} failed: {e}", local_path.display());
    }
    let ft = FileTime::from_unix_time(mtime, 0);
    if let Err(e) = filetime::set_file_times(local_path, ft, ft) {
        eprintln!("warning: utimes {} failed: {e}", local_path.display());
    }
    Ok(())
}

/// Remove a leftover temp file; already-gone is fine.
pub fn cleanup_temp(local_path: &Path) -> Result<()> {
    let tmp = temp_path(local_path);
    match std::fs::remove_file(&tmp) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(local_io(&tmp, e)),
    }
}
