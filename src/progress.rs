//! Terminal progress rendering for the transfer event stream
//!
//! One byte-denominated bar pinned at the bottom; file operations print
//! above it cargo-style. The renderer is a pure event consumer: it never
//! touches transfer state, it just draws what the core reports.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};

use crate::events::{TransferEvent, TunnelStatus};

pub struct ProgressRenderer {
    bar: ProgressBar,
    show_files: bool,
}

impl ProgressRenderer {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        Self {
            bar,
            show_files: verbose,
        }
    }

    fn print_above(&self, operation: &str, detail: &str) {
        if self.show_files {
            self.bar.suspend(|| {
                println!(
                    "  {} {}",
                    operation.with(Color::Green).bold(),
                    detail.with(Color::Cyan)
                );
            });
        }
    }

    pub fn handle(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Start {
                total_bytes,
                total_files,
                ..
            } => {
                self.bar.set_length(*total_bytes);
                self.bar
                    .set_draw_target(indicatif::ProgressDrawTarget::stderr());
                self.print_above("Fetching", &format!("{total_files} files"));
            }
            TransferEvent::TunnelReady => {
                self.print_above("Connected", "agent pool ready");
            }
            TransferEvent::TunnelStatus(statuses) => {
                self.bar.set_message(tunnel_summary(statuses));
            }
            TransferEvent::FileStart { path, chunk, .. } => match chunk {
                Some((i, n)) => {
                    self.print_above("Chunk", &format!("{} [{}/{}]", path.display(), i + 1, n))
                }
                None => self.print_above("File", &path.display().to_string()),
            },
            TransferEvent::FileProgress { bytes_received, .. } => {
                self.bar.set_position(*bytes_received);
            }
            TransferEvent::FileSkip { path, size } => {
                self.bar.inc(*size);
                self.print_above("Skipped", &format!("{} (up to date)", path.display()));
            }
            TransferEvent::FileComplete { path } => {
                self.print_above("Done", &path.display().to_string());
            }
            TransferEvent::Complete {
                bytes_received,
                files,
                ..
            } => {
                self.bar.finish_with_message(format!(
                    "{} {} files ({:.1} MB)",
                    "Completed".with(Color::Green).bold(),
                    files,
                    *bytes_received as f64 / 1_048_576.0
                ));
            }
            TransferEvent::Error { message } => {
                self.bar.abandon_with_message(format!(
                    "{} {}",
                    "Failed".with(Color::Red).bold(),
                    message
                ));
            }
        }
    }
}

fn tunnel_summary(statuses: &[TunnelStatus]) -> String {
    let busy = statuses.iter().filter(|s| s.busy).count();
    let unhealthy = statuses.iter().filter(|s| s.unhealthy).count();
    if unhealthy > 0 {
        format!("{busy}/{} tunnels busy, {unhealthy} down", statuses.len())
    } else {
        format!("{busy}/{} tunnels busy", statuses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(busy: bool, unhealthy: bool) -> TunnelStatus {
        TunnelStatus {
            id: 0,
            ready: !unhealthy,
            busy,
            unhealthy,
            reason: None,
            job: None,
        }
    }

    #[test]
    fn tunnel_summary_counts() {
        let s = vec![status(true, false), status(false, false), status(false, true)];
        assert_eq!(tunnel_summary(&s), "1/3 tunnels busy, 1 down");
        let s = vec![status(true, false), status(true, false)];
        assert_eq!(tunnel_summary(&s), "2/2 tunnels busy");
    }
}
