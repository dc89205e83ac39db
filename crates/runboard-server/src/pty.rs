//! Native spawn capability backed by portable-pty.
//!
//! Each spawned process gets a dedicated reader thread that pumps PTY
//! output into the session's event channel and, once the PTY reaches EOF,
//! reaps the child and reports its exit.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use runboard_core::{
    PtyControl, PtyEvent, PtySpawner, RunboardError, RunboardResult, SpawnRequest, SpawnedPty,
};
use std::io::{Read, Write};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// Spawns real processes in OS pseudo-terminals.
#[derive(Debug, Default)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: SpawnRequest) -> RunboardResult<SpawnedPty> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RunboardError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.command);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RunboardError::Spawn(format!("failed to spawn command: {e}")))?;
        // Only the child keeps the slave open, so reads hit EOF once it exits.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| RunboardError::Spawn("spawned process has no pid".into()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RunboardError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RunboardError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("pty-{pid}"))
            .spawn(move || pump_output(pid, reader, child, tx))
            .map_err(|e| RunboardError::Spawn(format!("failed to start PTY reader: {e}")))?;

        info!(pid, command = %request.command, cols = request.cols, rows = request.rows, "PTY spawned");

        Ok(SpawnedPty {
            pid,
            control: Box::new(NativePtyControl {
                writer: Mutex::new(writer),
                killer: Mutex::new(killer),
                _master: Mutex::new(pair.master),
            }),
            events: rx,
        })
    }
}

/// Input/kill side of a native PTY.
struct NativePtyControl {
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Held so the PTY stays open for as long as the session exists.
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyControl for NativePtyControl {
    fn write(&self, data: &[u8]) -> RunboardResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RunboardError::Other("PTY writer lock poisoned".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn kill(&self) -> RunboardResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| RunboardError::Other("PTY killer lock poisoned".into()))?;
        killer.kill()?;
        Ok(())
    }
}

/// Blocking read loop; runs on the PTY's own thread.
fn pump_output(
    pid: u32,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    tx: mpsc::UnboundedSender<PtyEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the child side closes.
                debug!(pid, error = %e, "PTY read ended");
                break;
            }
        }
    }

    let code = match child.wait() {
        Ok(status) => Some(i32::try_from(status.exit_code()).unwrap_or(-1)),
        Err(e) => {
            warn!(pid, error = %e, "failed to reap PTY child");
            None
        }
    };
    debug!(pid, code = ?code, "PTY child exited");
    let _ = tx.send(PtyEvent::Exit { code });
}
