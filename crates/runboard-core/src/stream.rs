//! Replay-then-live output streams for the push and pull transports.
//!
//! Both flavours attach the same way: take the replay history (optional),
//! subscribe for live chunks, and end with [`StreamFrame::End`] once the
//! process exits. They differ only in framing:
//!
//! - [`Framing::Chunked`] forwards bytes exactly as produced; the history is
//!   a single frame.
//! - [`Framing::Lines`] splits on `\n`, strips `\r`, and holds a partial
//!   line back until its newline arrives or the stream ends.

use futures_util::Stream;
use std::collections::VecDeque;
use tracing::debug;

use crate::broadcast::{OutputEvent, Subscription};
use crate::session::Session;

/// Text appended by byte-oriented transports when the process exits.
pub const FINISHED_MARKER: &str = "\r\n[process finished]\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    Chunked,
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub include_history: bool,
    pub framing: Framing,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            include_history: true,
            framing: Framing::Chunked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Chunk(Vec<u8>),
    Line(String),
    /// End of stream; always the last frame.
    End,
}

/// Newline framing with a carry-over for the trailing partial line.
#[derive(Debug, Default)]
pub struct LineFramer {
    carry: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them.
    ///
    /// Empty lines are skipped.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(data);
        let Some(last_newline) = self.carry.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(clean_line)
            .collect()
    }

    /// Whatever partial line is left, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        Some(clean_line(&rest))
    }

    pub fn pending(&self) -> &[u8] {
        &self.carry
    }
}

fn clean_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line).replace('\r', "")
}

/// A consumer's view of one session's output.
///
/// Dropping the stream detaches it from the session.
pub struct OutputStream {
    queued: VecDeque<StreamFrame>,
    subscription: Option<Subscription>,
    framer: Option<LineFramer>,
    finished_at_attach: bool,
}

impl OutputStream {
    pub fn open(session: &Session, options: StreamOptions) -> Self {
        let attachment = session.attach(options.include_history);
        let mut queued = VecDeque::new();
        let framer = match options.framing {
            Framing::Chunked => {
                if !attachment.history.is_empty() {
                    queued.push_back(StreamFrame::Chunk(attachment.history));
                }
                None
            }
            Framing::Lines => {
                let mut framer = LineFramer::new();
                queued.extend(
                    framer
                        .push(&attachment.history)
                        .into_iter()
                        .map(StreamFrame::Line),
                );
                Some(framer)
            }
        };
        Self {
            queued,
            subscription: Some(attachment.subscription),
            framer,
            finished_at_attach: attachment.finished,
        }
    }

    /// Whether the session had already finished when this stream attached.
    pub fn finished_at_attach(&self) -> bool {
        self.finished_at_attach
    }

    /// Next frame, or `None` after [`StreamFrame::End`] has been returned.
    /// A stream cut off for falling behind ends with `None` and no `End`.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            let subscription = self.subscription.as_mut()?;
            match subscription.recv().await {
                Some(OutputEvent::Chunk(chunk)) => match self.framer.as_mut() {
                    Some(framer) => self
                        .queued
                        .extend(framer.push(&chunk).into_iter().map(StreamFrame::Line)),
                    None => self.queued.push_back(StreamFrame::Chunk(chunk.to_vec())),
                },
                Some(OutputEvent::End) => {
                    if let Some(rest) = self.framer.as_mut().and_then(LineFramer::finish) {
                        self.queued.push_back(StreamFrame::Line(rest));
                    }
                    self.queued.push_back(StreamFrame::End);
                    self.subscription = None;
                }
                // Cut off for falling behind: stop without claiming the process ended.
                None => {
                    debug!("output stream cut off before end of output");
                    self.subscription = None;
                    return None;
                }
            }
        }
    }

    /// Stop receiving live output. Queued frames are discarded too.
    pub fn detach(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.detach();
        }
        self.queued.clear();
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamFrame> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next_frame().await.map(|frame| (frame, stream))
        })
    }
}
