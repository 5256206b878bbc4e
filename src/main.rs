//! sshget - parallel SSH downloader
//!
//! Pulls files and directory trees from one remote host over many
//! concurrent SSH channels. The binary is a thin shell: argument parsing,
//! password prompting, signal handling, and rendering of the event stream
//! the transfer core emits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use sshget::events::{EventSender, TransferEvent};
use sshget::logger::{Logger, NoopLogger, TextLogger};
use sshget::progress::ProgressRenderer;
use sshget::{Transfer, TransferOptions, TransferOutcome};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "sshget - download files over many parallel SSH channels"
)]
struct Args {
    /// Remote sources ([user@]host:path, wildcards allowed) followed by a
    /// local destination
    #[arg(required = true, num_args = 2..)]
    paths: Vec<String>,

    /// Number of parallel SSH workers
    #[arg(short = 'n', long, default_value_t = 8)]
    workers: usize,

    /// Remote SSH port
    #[arg(short = 'p', long, default_value_t = 22)]
    port: u16,

    /// Identity file passed through to ssh -i
    #[arg(short = 'i', long)]
    identity: Option<PathBuf>,

    /// Prompt for a password and authenticate via sshpass
    #[arg(long)]
    password: bool,

    /// Enable SSH compression (-C)
    #[arg(short = 'C', long)]
    compression: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    /// Append a transfer log to this file
    #[arg(long)]
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("sshget: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let (sources, dest) = args.paths.split_at(args.paths.len() - 1);
    let dest = dest[0].clone();

    let password = if args.password {
        Some(
            dialoguer::Password::new()
                .with_prompt(format!("password for {}", sources[0]))
                .interact()
                .context("reading password")?,
        )
    } else {
        None
    };

    let opts = TransferOptions {
        workers: args.workers,
        port: args.port,
        identity: args.identity.clone(),
        password,
        compression: args.compression,
        ..TransferOptions::default()
    };

    let logger: Arc<dyn Logger> = match &args.log {
        Some(path) => Arc::new(TextLogger::new(path)?),
        None => Arc::new(NoopLogger),
    };

    let transfer = Transfer::new();

    // Cooperative shutdown: abort the transfer, unlink the temps it hands
    // back, and let the main path exit 0.
    let handle = transfer.abort_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        eprintln!("\nsshget: interrupted, cleaning up");
        for tmp in handle.abort() {
            let _ = std::fs::remove_file(&tmp);
        }
    });

    let (events, rx) = EventSender::channel();
    let renderer = args.progress.then(|| ProgressRenderer::new(args.verbose));
    let consumer = tokio::spawn(consume_events(
        rx,
        renderer,
        logger.clone(),
        args.verbose,
        sources[0].clone(),
    ));

    let started = Instant::now();
    let result = transfer.run(sources, &dest, &opts, &events).await;
    drop(events);
    let _ = consumer.await;

    match result {
        Ok(TransferOutcome::Completed {
            bytes_received,
            files,
            ..
        }) => {
            let seconds = started.elapsed().as_secs_f64();
            logger.done(files as u64, bytes_received, seconds);
            let mb = bytes_received as f64 / 1_048_576.0;
            println!(
                "{} files, {:.2} MB in {:.2}s ({:.2} MB/s)",
                files,
                mb,
                seconds,
                if seconds > 0.0 { mb / seconds } else { 0.0 }
            );
            Ok(())
        }
        Ok(TransferOutcome::Aborted) => {
            if args.verbose {
                eprintln!("sshget: aborted");
            }
            Ok(())
        }
        Err(e) => {
            logger.error(&format!("{e:#}"));
            Err(e)
        }
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

async fn consume_events(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<TransferEvent>,
    renderer: Option<ProgressRenderer>,
    logger: Arc<dyn Logger>,
    verbose: bool,
    endpoint: String,
) {
    let mut reported_down: std::collections::HashSet<usize> = std::collections::HashSet::new();
    while let Some(event) = rx.recv().await {
        if let Some(r) = &renderer {
            r.handle(&event);
        }
        match &event {
            TransferEvent::Start {
                total_bytes,
                total_files,
                ..
            } => {
                logger.start(&endpoint, *total_files as u64, *total_bytes);
                if verbose {
                    eprintln!("fetching {total_files} files ({total_bytes} bytes)");
                }
            }
            TransferEvent::TunnelStatus(statuses) if verbose => {
                for s in statuses.iter().filter(|s| s.unhealthy) {
                    if reported_down.insert(s.id) {
                        if let Some(reason) = &s.reason {
                            eprintln!("tunnel {} down: {reason}", s.id);
                        }
                    }
                }
            }
            TransferEvent::FileSkip { path, size } => {
                logger.skip(path, *size);
            }
            TransferEvent::FileComplete { path } => {
                logger.file_done(path);
                if verbose {
                    eprintln!("done {}", path.display());
                }
            }
            _ => {}
        }
    }
}
