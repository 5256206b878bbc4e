//! End-to-end scheduler runs against in-process agents
//!
//! The agents on the far side of each channel are tokio tasks speaking the
//! real frame protocol over `duplex` pipes, so everything from request
//! encoding down to the atomic rename runs exactly as it does over SSH.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use sshget::download;
use sshget::events::{EventSender, TransferEvent};
use sshget::frame::decode_request;
use sshget::pool::{AgentChannel, AgentPool};
use sshget::remote::FileEntry;
use sshget::scheduler::{self, Abort, Outcome, PARALLEL_THRESHOLD};
use sshget::transfer::plan_local_paths;

type RemoteFs = HashMap<String, Vec<u8>>;

async fn read_request(stream: &mut DuplexStream) -> Option<(String, u64, u64)> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.ok()?;
    let path_len = u16::from_be_bytes(len_buf) as usize;
    let mut rest = vec![0u8; path_len + 16];
    stream.read_exact(&mut rest).await.ok()?;
    let mut req = len_buf.to_vec();
    req.extend_from_slice(&rest);
    decode_request(&req).ok()
}

fn serve(mut stream: DuplexStream, fs: Arc<RemoteFs>) {
    tokio::spawn(async move {
        while let Some((path, offset, length)) = read_request(&mut stream).await {
            let reply = match fs.get(&path) {
                Some(data) => {
                    let start = (offset as usize).min(data.len());
                    let end = (start + length as usize).min(data.len());
                    let body = &data[start..end];
                    let mut r = vec![0u8];
                    r.extend_from_slice(&(body.len() as u64).to_be_bytes());
                    r.extend_from_slice(body);
                    r
                }
                None => {
                    let msg = format!("[Errno 2] No such file or directory: {path}");
                    let mut r = vec![1u8];
                    r.extend_from_slice(&(msg.len() as u64).to_be_bytes());
                    r.extend_from_slice(msg.as_bytes());
                    r
                }
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    });
}

fn pool_over(fs: &Arc<RemoteFs>, agents: usize) -> AgentPool {
    let channels = (0..agents)
        .map(|id| {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            serve(remote, fs.clone());
            let (rd, wr) = tokio::io::split(local);
            AgentChannel::new(id, wr, rd)
        })
        .collect();
    AgentPool::from_channels(channels)
}

fn entry(full_path: &str, size: u64, mode: u32, mtime: i64) -> FileEntry {
    FileEntry {
        relative_path: full_path.rsplit('/').next().unwrap().to_string(),
        full_path: full_path.to_string(),
        size,
        mode,
        mtime,
        matched_root: full_path.to_string(),
        matched_root_is_dir: false,
    }
}

fn dir_entry(full_path: &str, root: &str, size: u64) -> FileEntry {
    FileEntry {
        relative_path: full_path
            .strip_prefix(root)
            .unwrap()
            .trim_start_matches('/')
            .to_string(),
        full_path: full_path.to_string(),
        size,
        mode: 0o644,
        mtime: 1_650_000_000,
        matched_root: root.to_string(),
        matched_root_is_dir: true,
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Run {
    outcome: Outcome,
    events: Vec<TransferEvent>,
    temps: Arc<Mutex<HashSet<PathBuf>>>,
}

async fn run_plan(mut pool: AgentPool, targets: &[(FileEntry, PathBuf)], threshold: u64) -> Run {
    let total_bytes: u64 = targets.iter().map(|(f, _)| f.size).sum();
    let tunnels = pool.healthy_count();
    let plan = scheduler::plan_jobs(targets, tunnels, threshold);

    let (events, mut rx) = EventSender::channel();
    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev);
        }
        seen
    });

    let abort = Abort::new();
    let temps = Arc::new(Mutex::new(HashSet::new()));
    let outcome = scheduler::run(&mut pool, plan, &events, &abort, &temps, total_bytes)
        .await
        .expect("transfer should succeed");
    drop(events);

    Run {
        outcome,
        events: collector.await.unwrap(),
        temps,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_small_file_with_metadata() {
    let body = patterned(128);
    let fs = Arc::new(RemoteFs::from([(
        "/srv/data/readme.txt".to_string(),
        body.clone(),
    )]));
    let out = tempfile::tempdir().unwrap();
    let local = out.path().join("readme.txt");

    let targets = vec![(
        entry("/srv/data/readme.txt", 128, 0o640, 1_600_000_000),
        local.clone(),
    )];
    let run = run_plan(pool_over(&fs, 1), &targets, PARALLEL_THRESHOLD).await;

    assert_eq!(
        run.outcome,
        Outcome::Complete {
            bytes_received: 128,
            skipped_bytes: 0
        }
    );
    assert_eq!(std::fs::read(&local).unwrap(), body);
    assert!(run.temps.lock().is_empty());

    use std::os::unix::fs::PermissionsExt;
    let md = std::fs::metadata(&local).unwrap();
    assert_eq!(md.permissions().mode() & 0o7777, 0o640);
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&md).unix_seconds(),
        1_600_000_000
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_file_reassembles_across_agents() {
    let body = patterned(256 * 1024 + 7);
    let fs = Arc::new(RemoteFs::from([("/srv/big.bin".to_string(), body.clone())]));
    let out = tempfile::tempdir().unwrap();
    let local = out.path().join("big.bin");

    let targets = vec![(
        entry("/srv/big.bin", body.len() as u64, 0o644, 1_650_000_000),
        local.clone(),
    )];
    // 64 KiB threshold forces a 4-way range split.
    let run = run_plan(pool_over(&fs, 4), &targets, 64 * 1024).await;

    assert_eq!(
        run.outcome,
        Outcome::Complete {
            bytes_received: body.len() as u64,
            skipped_bytes: 0
        }
    );
    assert_eq!(std::fs::read(&local).unwrap(), body);
    assert!(run.temps.lock().is_empty());
    assert!(!download::temp_path(&local).exists());

    let chunk_starts = run
        .events
        .iter()
        .filter(|e| matches!(e, TransferEvent::FileStart { chunk: Some(_), .. }))
        .count();
    assert_eq!(chunk_starts, 4);
    let completes = run
        .events
        .iter()
        .filter(|e| matches!(e, TransferEvent::FileComplete { .. }))
        .count();
    assert_eq!(completes, 1, "one finalize for all four chunks");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn directory_tree_lands_under_destination() {
    let c_body = patterned(3 << 20);
    let fs = Arc::new(RemoteFs::from([
        ("/srv/dir/a.txt".to_string(), vec![b'a']),
        ("/srv/dir/sub/b.txt".to_string(), vec![b'b', b'b']),
        ("/srv/dir/sub/c.bin".to_string(), c_body.clone()),
    ]));
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().to_str().unwrap().to_string();

    let files = vec![
        dir_entry("/srv/dir/a.txt", "/srv/dir", 1),
        dir_entry("/srv/dir/sub/b.txt", "/srv/dir", 2),
        dir_entry("/srv/dir/sub/c.bin", "/srv/dir", (3 << 20) as u64),
    ];
    let targets = plan_local_paths(&dest, &files, false);
    let run = run_plan(pool_over(&fs, 3), &targets, PARALLEL_THRESHOLD).await;

    let expected_total = 1 + 2 + (3u64 << 20);
    assert_eq!(
        run.outcome,
        Outcome::Complete {
            bytes_received: expected_total,
            skipped_bytes: 0
        }
    );
    assert_eq!(std::fs::read(out.path().join("dir/a.txt")).unwrap(), b"a");
    assert_eq!(std::fs::read(out.path().join("dir/sub/b.txt")).unwrap(), b"bb");
    assert_eq!(std::fs::read(out.path().join("dir/sub/c.bin")).unwrap(), c_body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_run_skips_and_leaves_file_identical() {
    let body = patterned(4096);
    let fs = Arc::new(RemoteFs::from([("/srv/f".to_string(), body.clone())]));
    let out = tempfile::tempdir().unwrap();
    let local = out.path().join("f");
    let targets = vec![(entry("/srv/f", 4096, 0o644, 1_650_000_000), local.clone())];

    let first = run_plan(pool_over(&fs, 2), &targets, PARALLEL_THRESHOLD).await;
    assert!(matches!(first.outcome, Outcome::Complete { .. }));
    let after_first = std::fs::read(&local).unwrap();

    let second = run_plan(pool_over(&fs, 2), &targets, PARALLEL_THRESHOLD).await;
    assert_eq!(
        second.outcome,
        Outcome::Complete {
            bytes_received: 4096,
            skipped_bytes: 4096
        }
    );
    assert!(second
        .events
        .iter()
        .any(|e| matches!(e, TransferEvent::FileSkip { size: 4096, .. })));
    assert!(!second
        .events
        .iter()
        .any(|e| matches!(e, TransferEvent::FileStart { .. })));
    assert_eq!(std::fs::read(&local).unwrap(), after_first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_byte_file_completes() {
    let fs = Arc::new(RemoteFs::from([("/srv/empty".to_string(), Vec::new())]));
    let out = tempfile::tempdir().unwrap();
    let local = out.path().join("empty");

    let targets = vec![(entry("/srv/empty", 0, 0o644, 1_650_000_000), local.clone())];
    let run = run_plan(pool_over(&fs, 1), &targets, PARALLEL_THRESHOLD).await;

    assert_eq!(
        run.outcome,
        Outcome::Complete {
            bytes_received: 0,
            skipped_bytes: 0
        }
    );
    assert_eq!(std::fs::metadata(&local).unwrap().len(), 0);
    assert!(run
        .events
        .iter()
        .any(|e| matches!(e, TransferEvent::FileComplete { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn event_stream_invariants_hold() {
    let sizes = [100usize, 96 * 1024 + 3, 1, 64 * 1024];
    let mut fs = RemoteFs::new();
    let mut files = Vec::new();
    for (i, size) in sizes.iter().enumerate() {
        let path = format!("/srv/f{i}");
        fs.insert(path.clone(), patterned(*size));
        files.push(entry(&path, *size as u64, 0o644, 1_650_000_000));
    }
    let fs = Arc::new(fs);
    let out = tempfile::tempdir().unwrap();
    // f0 is pre-seeded locally at the right size, so it skips.
    std::fs::write(out.path().join("f0"), patterned(100)).unwrap();

    let targets: Vec<(FileEntry, PathBuf)> = files
        .iter()
        .map(|f| (f.clone(), out.path().join(&f.relative_path)))
        .collect();
    let total: u64 = sizes.iter().map(|s| *s as u64).sum();
    let run = run_plan(pool_over(&fs, 3), &targets, 32 * 1024).await;

    let (bytes_received, skipped_bytes) = match run.outcome {
        Outcome::Complete {
            bytes_received,
            skipped_bytes,
        } => (bytes_received, skipped_bytes),
        Outcome::Aborted => panic!("unexpected abort"),
    };
    assert_eq!(bytes_received, total);
    assert_eq!(skipped_bytes, 100);

    // Progress deltas plus skips account for every byte exactly once.
    let mut progress_sum = 0u64;
    let mut skip_sum = 0u64;
    let mut last_received = 0u64;
    let mut started: HashSet<PathBuf> = HashSet::new();
    let mut completed: HashSet<PathBuf> = HashSet::new();
    for ev in &run.events {
        match ev {
            TransferEvent::FileStart { path, .. } => {
                assert!(!completed.contains(path), "start after complete for {path:?}");
                started.insert(path.clone());
            }
            TransferEvent::FileProgress {
                path,
                chunk_bytes,
                bytes_received,
                ..
            } => {
                assert!(started.contains(path), "progress before start for {path:?}");
                progress_sum += chunk_bytes;
                assert!(
                    *bytes_received >= last_received,
                    "bytes_received ran backwards: {bytes_received} < {last_received}"
                );
                last_received = *bytes_received;
            }
            TransferEvent::FileSkip { size, .. } => skip_sum += size,
            TransferEvent::FileComplete { path } => {
                completed.insert(path.clone());
            }
            _ => {}
        }
    }
    assert_eq!(progress_sum + skip_sum, total);
    assert_eq!(completed.len(), 3, "three downloaded files complete");
}
