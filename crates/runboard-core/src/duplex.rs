//! Interactive channel: live output out, keystrokes in.
//!
//! Attaching replays the whole buffer, then follows live output. When the
//! process exits a marker is sent and the channel turns read-only: it
//! stays open for inspection, and inbound input is accepted but dropped.

use std::sync::Arc;
use tracing::debug;

use crate::session::{Session, SessionId};
use crate::stream::{OutputStream, StreamFrame, StreamOptions, FINISHED_MARKER};

/// Marker sent when attaching to a session that has already finished.
pub const HISTORY_MARKER: &str = "\r\n[process finished, showing history]\r\n";

pub struct DuplexChannel {
    session: Arc<Session>,
    output: OutputStream,
    read_only: bool,
}

impl DuplexChannel {
    pub fn open(session: Arc<Session>) -> Self {
        let output = OutputStream::open(&session, StreamOptions::default());
        let read_only = output.finished_at_attach();
        Self {
            session,
            output,
            read_only,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Whether the process has exited, as far as this channel has seen.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Next bytes for the consumer. The final item is the exit marker;
    /// after it this returns `None` forever.
    pub async fn next_output(&mut self) -> Option<Vec<u8>> {
        match self.output.next_frame().await? {
            StreamFrame::Chunk(chunk) => Some(chunk),
            StreamFrame::Line(line) => Some(line.into_bytes()),
            StreamFrame::End => {
                let marker = if self.read_only {
                    HISTORY_MARKER
                } else {
                    FINISHED_MARKER
                };
                self.read_only = true;
                Some(marker.as_bytes().to_vec())
            }
        }
    }

    /// Forward consumer input to the process. Returns `false` if it was
    /// dropped because the process is gone.
    pub fn send_input(&self, data: &[u8]) -> bool {
        if self.read_only {
            debug!(session_id = self.session.id(), "input on read-only channel ignored");
            return false;
        }
        self.session.write_input(data)
    }

    /// Stop following output. Safe to call repeatedly.
    pub fn detach(&mut self) {
        self.output.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ScriptIdentity;
    use crate::log_sink::LogSink;
    use crate::testing::ScriptedControl;
    use chrono::Local;
    use std::path::PathBuf;

    fn session() -> (Arc<Session>, ScriptedControl) {
        let control = ScriptedControl::detached();
        let session = Session::new(
            9,
            ScriptIdentity::new("g", "tty"),
            vec![],
            Local::now(),
            LogSink::disabled(PathBuf::from("/nonexistent/log")),
            Box::new(control.clone()),
            1024,
        );
        (Arc::new(session), control)
    }

    #[tokio::test]
    async fn live_channel_forwards_both_ways() {
        let (s, control) = session();
        s.handle_chunk(b"$ ".to_vec()).await;
        let mut channel = DuplexChannel::open(s.clone());
        assert!(!channel.is_read_only());
        assert_eq!(channel.next_output().await, Some(b"$ ".to_vec()));

        assert!(channel.send_input(b"ls\r"));
        assert_eq!(control.input(), b"ls\r");

        s.handle_chunk(b"file.txt\r\n".to_vec()).await;
        assert_eq!(channel.next_output().await, Some(b"file.txt\r\n".to_vec()));

        s.mark_finished(Some(0));
        assert_eq!(channel.next_output().await, Some(FINISHED_MARKER.as_bytes().to_vec()));
        assert!(channel.is_read_only());
        assert_eq!(channel.next_output().await, None);
        assert!(!channel.send_input(b"more"));
        assert_eq!(control.input(), b"ls\r");
    }

    #[tokio::test]
    async fn finished_session_is_read_only_history() {
        let (s, control) = session();
        s.handle_chunk(b"build ok\r\n".to_vec()).await;
        s.mark_finished(Some(0));

        let mut channel = DuplexChannel::open(s.clone());
        assert!(channel.is_read_only());
        assert_eq!(channel.next_output().await, Some(b"build ok\r\n".to_vec()));
        assert_eq!(channel.next_output().await, Some(HISTORY_MARKER.as_bytes().to_vec()));
        assert_eq!(channel.next_output().await, None);

        assert!(!channel.send_input(b"ignored"));
        assert!(control.input().is_empty());
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let (s, _) = session();
        let mut channel = DuplexChannel::open(s.clone());
        assert_eq!(s.consumer_count(), 1);
        channel.detach();
        channel.detach();
        assert_eq!(s.consumer_count(), 0);
        s.mark_finished(None);
        channel.detach();
    }
}
