//! runboard-core: pseudo-terminal session management and output fan-out.
//!
//! Runs scripts through an injected [`PtySpawner`], keeps a bounded replay
//! buffer and an on-disk log per run, and serves output to any number of
//! consumers through replay-then-live streams ([`OutputStream`]) and
//! interactive channels ([`DuplexChannel`]).

pub mod broadcast;
pub mod catalog;
pub mod duplex;
pub mod error;
pub mod log_sink;
pub mod registry;
pub mod replay_buffer;
pub mod session;
pub mod spawn;
pub mod stream;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use broadcast::{Broadcaster, OutputEvent, Subscription, SUBSCRIBER_QUEUE_CAPACITY};
pub use catalog::{ResolvedScript, ScriptCatalog, ScriptEntry, ScriptIdentity, ROOT_GROUP};
pub use duplex::{DuplexChannel, HISTORY_MARKER};
pub use error::{RunboardError, RunboardResult};
pub use log_sink::{log_file_name, LogSink};
pub use registry::{default_shell, LaunchSettings, SessionRegistry};
pub use replay_buffer::{ReplayBuffer, DEFAULT_REPLAY_CAPACITY};
pub use session::{BufferSnapshot, Session, SessionId, SessionSummary, StopOutcome};
pub use spawn::{PtyControl, PtyEvent, PtySpawner, SpawnRequest, SpawnedPty};
pub use stream::{Framing, LineFramer, OutputStream, StreamFrame, StreamOptions, FINISHED_MARKER};
