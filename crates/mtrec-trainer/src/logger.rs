//! Experiment loggers.
//!
//! Logging is fire-and-forget: the trainer warns about a failing logger and
//! keeps training.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Sender};
use mtrec_types::{internal_error, MtResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tracing::{info, warn};

pub type MetricMap = BTreeMap<String, f64>;

/// Sink for step and epoch metrics.
pub trait ExperimentLogger: Send + Sync {
    fn log(&self, run_id: &str, step: u64, metrics: &MetricMap) -> MtResult<()>;

    /// Block until everything logged so far is persisted.
    fn flush(&self) -> MtResult<()> {
        Ok(())
    }
}

/// One logged line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub run_id: String,
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    pub metrics: MetricMap,
}

/// Emits metrics as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ExperimentLogger for TracingLogger {
    fn log(&self, run_id: &str, step: u64, metrics: &MetricMap) -> MtResult<()> {
        let rendered: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v:.6}")).collect();
        info!(run_id, step, "{}", rendered.join(" "));
        Ok(())
    }
}

enum Message {
    Record(LogRecord),
    Flush(Sender<()>),
}

/// Appends one JSON object per record to a file. Writes happen on a
/// background thread fed through a channel.
pub struct JsonlLogger {
    path: PathBuf,
    tx: Option<Sender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl JsonlLogger {
    pub fn create(path: impl AsRef<Path>) -> MtResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (tx, rx) = unbounded::<Message>();
        let target = path.clone();

        let writer = std::thread::Builder::new()
            .name("mtrec-metrics".to_string())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for message in rx {
                    match message {
                        Message::Record(record) => {
                            let written = serde_json::to_writer(&mut out, &record)
                                .map_err(std::io::Error::from)
                                .and_then(|_| out.write_all(b"\n"));
                            if let Err(e) = written {
                                warn!(path = %target.display(), error = %e, "failed to write metrics");
                            }
                        }
                        Message::Flush(done) => {
                            if let Err(e) = out.flush() {
                                warn!(path = %target.display(), error = %e, "failed to flush metrics");
                            }
                            let _ = done.send(());
                        }
                    }
                }
                if let Err(e) = out.flush() {
                    warn!(path = %target.display(), error = %e, "failed to flush metrics");
                }
            })?;

        Ok(Self {
            path,
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, message: Message) -> MtResult<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| internal_error!("metrics writer already closed"))?
            .send(message)
            .map_err(|_| internal_error!("metrics writer stopped"))
    }
}

impl ExperimentLogger for JsonlLogger {
    fn log(&self, run_id: &str, step: u64, metrics: &MetricMap) -> MtResult<()> {
        self.send(Message::Record(LogRecord {
            run_id: run_id.to_string(),
            step,
            timestamp: Utc::now(),
            metrics: metrics.clone(),
        }))
    }

    fn flush(&self) -> MtResult<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.send(Message::Flush(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| internal_error!("metrics writer stopped before flushing"))
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop.
        self.tx.take();
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                warn!(path = %self.path.display(), "metrics writer panicked");
            }
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ExperimentLogger for MemoryLogger {
    fn log(&self, run_id: &str, step: u64, metrics: &MetricMap) -> MtResult<()> {
        self.records.lock().push(LogRecord {
            run_id: run_id.to_string(),
            step,
            timestamp: Utc::now(),
            metrics: metrics.clone(),
        });
        Ok(())
    }
}
