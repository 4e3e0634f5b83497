//! Decoupled logging pipeline for privileged module operations.
//!
//! Routes every `log::` macro call through an unbounded channel to a
//! background disk-writer thread, so logging never blocks or fails inside
//! an elevated command sequence.
//!
//! # Architecture
//!
//! ```text
//! log::info!/warn!/error!
//!     |
//! [LogCollector] (Log trait impl, non-blocking send)
//!     | (crossbeam unbounded channel - guaranteed delivery)
//!     v
//! [disk persister thread]
//!     |
//! logs/kmodctl_<timestamp>.log
//! ```
//!
//! # Key Properties
//!
//! - **Non-Blocking**: senders never wait; the channel is unbounded
//! - **Runtime-Independent**: the persister is an OS thread with a blocking
//!   `recv()`, so logs from any tokio context are received reliably
//! - **Flush Marker**: `wait_for_empty()` round-trips a marker through the
//!   channel, guaranteeing everything sent before it is on disk

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Log, Metadata, Record};

/// Internal log line or special marker
enum LogMessage {
    /// Regular log line
    Line(LogLine),
    /// Flush marker with channel sender to signal completion
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    pub level: String,
    /// Wall-clock timestamp captured at creation
    pub timestamp: String,
}

impl LogLine {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        LogLine {
            message: message.into(),
            level: level.into(),
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }
}

/// Get the global logs path relative to the current working directory: ./logs
pub fn get_global_logs_path() -> Result<PathBuf, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Failed to get current working directory: {}", e))?;
    Ok(cwd.join("logs"))
}

/// Unified logger dispatching to the background disk persister
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_path: PathBuf,
}

impl LogCollector {
    /// Create a new LogCollector writing to a fresh timestamped file under
    /// `log_dir`, and spawn its disk persister thread.
    pub fn new(log_dir: PathBuf) -> Result<Self, String> {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| format!("Failed to create logs directory: {}", e))?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let log_path = log_dir.join(format!("kmodctl_{}.log", timestamp));
        File::create(&log_path).map_err(|e| format!("Failed to create log file: {}", e))?;

        // Unbounded crossbeam channel: thread-safe and usable from any
        // runtime, so no log line is lost inside executor threads.
        let (tx, rx) = unbounded::<LogMessage>();

        let persister_path = log_path.clone();
        // OS thread, not a tokio task: blocking recv() is safe here and
        // keeps the persister alive independent of any runtime.
        std::thread::spawn(move || {
            let mut handle: Option<File> = None;
            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        if handle.is_none() {
                            handle = OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(&persister_path)
                                .ok();
                        }
                        if let Some(file) = handle.as_mut() {
                            let formatted = format!(
                                "[{}] [{}] {}\n",
                                line.timestamp, line.level, line.message
                            );
                            let _ = file.write_all(formatted.as_bytes());
                            let _ = file.flush();
                        }
                    }
                    LogMessage::Flush(done) => {
                        if let Some(file) = handle.as_mut() {
                            let _ = file.flush();
                        }
                        // Signal that everything sent before the marker is
                        // on disk.
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(LogCollector { tx, log_path })
    }

    /// Path of the file this collector writes to.
    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Send a log line (non-blocking, cannot fail)
    pub fn log_line(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Send a simple informational string
    pub fn log_str(&self, message: impl Into<String>) {
        self.log_line(LogLine::new("INFO", message));
    }

    /// Wait for all pending logs to be written to disk.
    ///
    /// Sends a flush marker down the channel and waits for the persister
    /// to acknowledge it. Call before process exit so the final lines of a
    /// lifecycle operation reach disk.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(done_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        done_rx
            .recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))?;
        Ok(())
    }
}

impl Clone for LogCollector {
    fn clone(&self) -> Self {
        LogCollector {
            tx: self.tx.clone(),
            log_path: self.log_path.clone(),
        }
    }
}

/// Wires all log::info!(), log::warn!(), log::error!() calls into the
/// collector pipeline.
impl Log for LogCollector {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_line(LogLine::new(
                record.level().to_string(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {
        // No buffering at this level - the persister flushes per line
    }
}
