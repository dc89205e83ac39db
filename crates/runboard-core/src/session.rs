//! One pseudo-terminal run of a script.
//!
//! A session is `Running` until its process reports an exit, then
//! `Finished` for good. Output handling for a session happens on a single
//! event task (see [`crate::registry`]), so chunks are mirrored to the log,
//! folded into the replay buffer and fanned out strictly in order.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broadcast::{Broadcaster, Subscription};
use crate::catalog::ScriptIdentity;
use crate::error::RunboardResult;
use crate::log_sink::LogSink;
use crate::replay_buffer::ReplayBuffer;
use crate::spawn::PtyControl;

/// Session identifier: the process id reported by the spawn capability.
pub type SessionId = u32;

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was asked to stop; it finishes once its exit arrives.
    Signalled,
    /// Nothing to do, the process had already exited.
    AlreadyFinished,
}

/// Listing entry for a session, running or finished.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub pid: SessionId,
    pub repo_name: String,
    pub script_name: String,
    pub args: Vec<String>,
    pub start_time: DateTime<Local>,
    pub is_running: bool,
    pub buffer_size: usize,
    pub log_file: Option<String>,
    pub exit_code: Option<i32>,
}

/// Point-in-time copy of a session's replay buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    pub buffer: String,
    pub is_running: bool,
    pub log_file: Option<String>,
    pub args: Vec<String>,
}

/// What a consumer gets when it attaches: the history to replay, and a
/// subscription that continues exactly where the history stops.
pub struct Attachment {
    pub history: Vec<u8>,
    pub subscription: Subscription,
    /// The session had already finished when the attachment was taken.
    pub finished: bool,
}

struct SessionState {
    buffer: ReplayBuffer,
    running: bool,
    exit_code: Option<i32>,
}

pub struct Session {
    id: SessionId,
    identity: ScriptIdentity,
    args: Vec<String>,
    started_at: DateTime<Local>,
    log_path: PathBuf,
    state: Mutex<SessionState>,
    broadcaster: Broadcaster,
    control: Box<dyn PtyControl>,
    log: tokio::sync::Mutex<LogSink>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        identity: ScriptIdentity,
        args: Vec<String>,
        started_at: DateTime<Local>,
        log: LogSink,
        control: Box<dyn PtyControl>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            id,
            identity,
            args,
            started_at,
            log_path: log.path().to_path_buf(),
            state: Mutex::new(SessionState {
                buffer: ReplayBuffer::new(buffer_capacity),
                running: true,
                exit_code: None,
            }),
            broadcaster: Broadcaster::new(),
            control,
            log: tokio::sync::Mutex::new(log),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &ScriptIdentity {
        &self.identity
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// File name part of the log path.
    pub fn log_file_name(&self) -> Option<String> {
        self.log_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    /// Current replay buffer contents.
    pub fn buffer(&self) -> Vec<u8> {
        self.state.lock().buffer.contents()
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.state.lock();
        BufferSnapshot {
            buffer: String::from_utf8_lossy(&state.buffer.contents()).into_owned(),
            is_running: state.running,
            log_file: self.log_file_name(),
            args: self.args.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state.lock();
        SessionSummary {
            pid: self.id,
            repo_name: self.identity.group.clone(),
            script_name: self.identity.name.clone(),
            args: self.args.clone(),
            start_time: self.started_at,
            is_running: state.running,
            buffer_size: state.buffer.len(),
            log_file: self.log_file_name(),
            exit_code: state.exit_code,
        }
    }

    /// Number of consumers currently receiving live output.
    pub fn consumer_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    /// Take the replay history and a live subscription atomically with
    /// respect to chunk handling: no chunk is both replayed and delivered,
    /// and none falls between the two.
    pub fn attach(&self, include_history: bool) -> Attachment {
        let state = self.state.lock();
        let history = if include_history {
            state.buffer.contents()
        } else {
            Vec::new()
        };
        Attachment {
            history,
            subscription: self.broadcaster.attach(),
            finished: !state.running,
        }
    }

    /// Forward input to the process. Returns `false` when the input was
    /// dropped because the session has finished.
    pub fn write_input(&self, data: &[u8]) -> bool {
        if !self.is_running() {
            debug!(session_id = self.id, len = data.len(), "input for finished session dropped");
            return false;
        }
        if let Err(e) = self.control.write(data) {
            warn!(session_id = self.id, error = %e, "failed to write process input");
        }
        true
    }

    /// Ask the process to stop. The session stays `Running` until the
    /// exit event arrives. A failed signal is logged, not returned.
    pub fn terminate(&self) -> RunboardResult<StopOutcome> {
        if !self.is_running() {
            return Ok(StopOutcome::AlreadyFinished);
        }
        // The child may already be reaped while its exit event is still in
        // flight; the exit that follows finishes the session either way.
        match self.control.kill() {
            Ok(()) => debug!(session_id = self.id, "stop signal sent"),
            Err(e) => warn!(session_id = self.id, error = %e, "stop signal failed"),
        }
        Ok(StopOutcome::Signalled)
    }

    /// Mirror a chunk to the log, then fold it into the buffer and fan it out.
    pub(crate) async fn handle_chunk(&self, chunk: Vec<u8>) {
        self.log.lock().await.write(&chunk).await;

        let chunk: Arc<[u8]> = Arc::from(chunk);
        let mut state = self.state.lock();
        state.buffer.append(&chunk);
        self.broadcaster.publish(chunk);
    }

    pub(crate) async fn close_log(&self) {
        self.log.lock().await.close().await;
    }

    /// Enter `Finished` and signal end-of-stream to every consumer.
    pub(crate) fn mark_finished(&self, exit_code: Option<i32>) {
        let mut state = self.state.lock();
        state.running = false;
        state.exit_code = exit_code;
        self.broadcaster.finish();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("args", &self.args)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}
