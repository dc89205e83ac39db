//! Session registry: owns every session, running or finished.
//!
//! Sessions are keyed by [`SessionId`] and kept until explicitly destroyed.
//! A second index maps each [`ScriptIdentity`] to its one live session; a new
//! start for the same identity terminates the previous run first.

use chrono::Local;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::catalog::{ScriptCatalog, ScriptIdentity};
use crate::duplex::DuplexChannel;
use crate::error::{RunboardError, RunboardResult};
use crate::log_sink::{log_file_name, LogSink};
use crate::replay_buffer::DEFAULT_REPLAY_CAPACITY;
use crate::session::{BufferSnapshot, Session, SessionId, SessionSummary, StopOutcome};
use crate::spawn::{PtyEvent, PtySpawner, SpawnRequest};
use crate::stream::{OutputStream, StreamOptions};

type LiveIndex = Arc<RwLock<HashMap<ScriptIdentity, SessionId>>>;

/// How scripts are launched.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    /// Interpreter; receives the script path as its first argument.
    pub shell: String,
    pub logs_dir: PathBuf,
    /// Environment every run starts from. Per-start variables override it.
    pub base_env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub buffer_capacity: usize,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            shell: default_shell().to_string(),
            logs_dir: PathBuf::from("logs"),
            base_env: HashMap::new(),
            cols: 80,
            rows: 30,
            buffer_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

/// Platform default interpreter for scripts.
pub fn default_shell() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "bash"
    }
}

pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
    live: LiveIndex,
    catalog: ScriptCatalog,
    spawner: Arc<dyn PtySpawner>,
    settings: LaunchSettings,
}

impl SessionRegistry {
    pub fn new(
        catalog: ScriptCatalog,
        spawner: Arc<dyn PtySpawner>,
        settings: LaunchSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            live: Arc::new(RwLock::new(HashMap::new())),
            catalog,
            spawner,
            settings,
        }
    }

    pub fn catalog(&self) -> &ScriptCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    /// Start a new run of `identity`.
    ///
    /// The script is resolved first; a refused start leaves any live run
    /// untouched. Otherwise the live run (if any) is sent a stop signal and
    /// unmapped, its record kept for inspection, and a fresh session takes
    /// its place in the index.
    pub async fn start(
        &self,
        identity: ScriptIdentity,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> RunboardResult<Arc<Session>> {
        let resolved = self.catalog.resolve(&identity)?;

        // Held for the whole start so concurrent starts of one identity
        // cannot both end up live.
        let mut live = self.live.write().await;

        if let Some(previous) = live.remove(&identity) {
            let old = self.sessions.read().await.get(&previous).cloned();
            if let Some(old) = old {
                info!(session_id = previous, script = %identity, "terminating previous run");
                if let Err(e) = old.terminate() {
                    warn!(session_id = previous, error = %e, "failed to stop previous run");
                }
            }
        }

        let mut full_env = self.settings.base_env.clone();
        full_env.extend(env);
        let mut command_args = Vec::with_capacity(args.len() + 1);
        command_args.push(resolved.script_path.to_string_lossy().into_owned());
        command_args.extend(args.iter().cloned());

        let spawned = self.spawner.spawn(SpawnRequest {
            command: self.settings.shell.clone(),
            args: command_args,
            cwd: resolved.working_dir,
            env: full_env,
            cols: self.settings.cols,
            rows: self.settings.rows,
        })?;

        let started_at = Local::now();
        let sink = match LogSink::create(&self.settings.logs_dir, &identity, &started_at).await {
            Ok(sink) => sink,
            Err(e) => {
                let fallback = self
                    .settings
                    .logs_dir
                    .join(log_file_name(&identity, &started_at, 0));
                error!(path = %fallback.display(), error = %e, "cannot open log file, output will not be mirrored");
                LogSink::disabled(fallback)
            }
        };

        let session = Arc::new(Session::new(
            spawned.pid,
            identity.clone(),
            args,
            started_at,
            sink,
            spawned.control,
            self.settings.buffer_capacity,
        ));

        if let Some(stale) = self
            .sessions
            .write()
            .await
            .insert(spawned.pid, session.clone())
        {
            warn!(session_id = stale.id(), script = %stale.identity(), "process id reused, dropping old record");
        }
        live.insert(identity.clone(), spawned.pid);
        drop(live);

        info!(
            session_id = spawned.pid,
            script = %identity,
            log = %session.log_path().display(),
            "script started"
        );

        tokio::spawn(drive_session(
            session.clone(),
            spawned.events,
            self.live.clone(),
        ));

        Ok(session)
    }

    pub async fn get(&self, id: SessionId) -> RunboardResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RunboardError::SessionNotFound(id))
    }

    /// Summaries of every retained session, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.pid.cmp(&b.pid)));
        summaries
    }

    /// The live session currently associated with `identity`, if any.
    pub async fn live_session(&self, identity: &ScriptIdentity) -> Option<SessionId> {
        self.live.read().await.get(identity).copied()
    }

    /// Send a stop signal. A no-op for finished sessions.
    pub async fn terminate(&self, id: SessionId) -> RunboardResult<StopOutcome> {
        let session = self.get(id).await?;
        let outcome = session.terminate()?;
        info!(session_id = id, outcome = ?outcome, "stop requested");
        Ok(outcome)
    }

    /// Remove a session for good. The log file on disk is left in place.
    pub async fn destroy(&self, id: SessionId) -> RunboardResult<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(RunboardError::SessionNotFound(id))?;

        if let Err(e) = session.terminate() {
            warn!(session_id = id, error = %e, "failed to stop destroyed session");
        }
        session.close_log().await;

        let mut live = self.live.write().await;
        if live.get(session.identity()) == Some(&id) {
            live.remove(session.identity());
        }
        info!(session_id = id, script = %session.identity(), "session destroyed");
        Ok(())
    }

    pub async fn snapshot(&self, id: SessionId) -> RunboardResult<BufferSnapshot> {
        Ok(self.get(id).await?.snapshot())
    }

    /// Open a replay-then-live output stream on a session.
    pub async fn attach_stream(
        &self,
        id: SessionId,
        options: StreamOptions,
    ) -> RunboardResult<OutputStream> {
        let session = self.get(id).await?;
        Ok(OutputStream::open(&session, options))
    }

    /// Open an interactive channel on a session.
    pub async fn attach_duplex(&self, id: SessionId) -> RunboardResult<DuplexChannel> {
        let session = self.get(id).await?;
        Ok(DuplexChannel::open(session))
    }

    /// Send a stop signal to every running session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions.iter().filter(|s| s.is_running()) {
            if let Err(e) = session.terminate() {
                warn!(session_id = session.id(), error = %e, "failed to stop session on shutdown");
            }
        }
    }
}

/// Per-session event loop: the only place chunks and the exit are handled,
/// which keeps them strictly ordered for the session.
async fn drive_session(
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
    live: LiveIndex,
) {
    let mut exit_code = None;
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Data(chunk) => session.handle_chunk(chunk).await,
            PtyEvent::Exit { code } => {
                exit_code = code;
                break;
            }
        }
    }

    session.close_log().await;
    {
        let mut live = live.write().await;
        if live.get(session.identity()) == Some(&session.id()) {
            live.remove(session.identity());
        }
    }
    session.mark_finished(exit_code);
    info!(session_id = session.id(), script = %session.identity(), exit_code = ?exit_code, "script exited");
}
