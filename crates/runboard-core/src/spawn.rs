//! The injected "spawn a pseudo-terminal process" capability.
//!
//! The core never talks to the OS directly. A [`PtySpawner`] turns a
//! [`SpawnRequest`] into a [`SpawnedPty`]: a process id, a control handle
//! for input and termination, and an ordered stream of [`PtyEvent`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::error::RunboardResult;

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events a running process produces, in order.
///
/// `Exit` is the last event. A stream that ends without one is treated as
/// an exit with no known code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit { code: Option<i32> },
}

/// Input and termination side of a spawned process.
pub trait PtyControl: Send + Sync {
    /// Write input bytes to the process.
    fn write(&self, data: &[u8]) -> RunboardResult<()>;

    /// Ask the process to stop. The exit arrives later as [`PtyEvent::Exit`].
    fn kill(&self) -> RunboardResult<()>;
}

/// A freshly spawned process.
pub struct SpawnedPty {
    pub pid: u32,
    pub control: Box<dyn PtyControl>,
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

/// Capability for launching processes inside pseudo-terminals.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> RunboardResult<SpawnedPty>;
}
