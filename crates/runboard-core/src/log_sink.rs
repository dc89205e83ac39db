//! Durable mirror of a session's raw output.
//!
//! Every chunk a process emits is appended verbatim to one log file per
//! session. Mirroring is best-effort: a write failure is logged, disables
//! the sink for that session, and never interrupts output handling.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::catalog::ScriptIdentity;

/// Format a timestamp as fixed-width `YYMMDDhhmmss`.
pub fn format_log_timestamp(time: &DateTime<Local>) -> String {
    time.format("%y%m%d%H%M%S").to_string()
}

/// Upper bound on same-second runs of one script before giving up.
const MAX_NAME_SEQUENCE: u32 = 1000;

/// Deterministic log file name for one run of a script.
///
/// Slashes in the identity are replaced so the name stays a single path
/// component; the fixed-width timestamp keeps names chronologically sortable.
/// A non-zero `seq` tells apart runs started within the same second.
pub fn log_file_name(identity: &ScriptIdentity, started_at: &DateTime<Local>, seq: u32) -> String {
    let flat = identity.to_string().replace('/', "-");
    let stamp = format_log_timestamp(started_at);
    if seq == 0 {
        format!("scripts-{flat}-{stamp}.log")
    } else {
        format!("scripts-{flat}-{stamp}-{seq}.log")
    }
}

/// Append-only log file for one session.
pub struct LogSink {
    path: PathBuf,
    file: Option<File>,
}

impl LogSink {
    /// Create a fresh log file for a run in `logs_dir`.
    ///
    /// Never reuses an existing file: if the base name is taken, a sequence
    /// number is appended (`-1`, `-2`, ...).
    pub async fn create(
        logs_dir: &Path,
        identity: &ScriptIdentity,
        started_at: &DateTime<Local>,
    ) -> std::io::Result<Self> {
        for seq in 0..MAX_NAME_SEQUENCE {
            let path = logs_dir.join(log_file_name(identity, started_at, seq));
            match OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!(path = %path.display(), "log sink opened");
                    return Ok(Self {
                        path,
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free log file name for {identity}"),
        ))
    }

    /// A sink that is already closed. Used when the log file could not be opened.
    pub fn disabled(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether chunks are still being mirrored.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Append a chunk. On failure the sink closes itself.
    pub async fn write(&mut self, chunk: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(chunk).await {
            error!(path = %self.path.display(), error = %e, "log write failed, mirroring stopped");
            self.file = None;
        }
    }

    /// Flush and close. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                error!(path = %self.path.display(), error = %e, "log flush failed");
            }
            debug!(path = %self.path.display(), "log sink closed");
        }
    }
}
