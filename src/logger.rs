use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub trait Logger: Send + Sync {
    fn start(&self, _endpoint: &str, _files: u64, _bytes: u64) {}
    fn file_done(&self, _path: &Path) {}
    fn skip(&self, _path: &Path, _bytes: u64) {}
    fn error(&self, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, endpoint: &str, files: u64, bytes: u64) {
        self.line(&format!("START endpoint={endpoint} files={files} bytes={bytes}"));
    }
    fn file_done(&self, path: &Path) {
        self.line(&format!("DONE path={}", path.display()));
    }
    fn skip(&self, path: &Path, bytes: u64) {
        self.line(&format!("SKIP path={} bytes={}", path.display(), bytes));
    }
    fn error(&self, msg: &str) {
        self.line(&format!("ERROR msg={msg}"));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("COMPLETE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
