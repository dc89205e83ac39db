//! Bounded trailing window of session output.
//!
//! Keeps the most recent `capacity` bytes a process produced so that a
//! consumer attaching late (or after the process finished) can be shown
//! what it missed without the server keeping unbounded history.

/// Default replay capacity in bytes.
pub const DEFAULT_REPLAY_CAPACITY: usize = 300_000;

/// A fixed-capacity circular byte buffer that drops its oldest bytes first.
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Next write position (wraps around).
    write_pos: usize,
    /// Total bytes ever appended.
    total_written: u64,
}

impl ReplayBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append a chunk, truncating from the front once capacity is exceeded.
    pub fn append(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if self.capacity == 0 || data.is_empty() {
            return;
        }

        // Only the trailing `capacity` bytes of the chunk can survive.
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let head = (self.capacity - self.write_pos).min(data.len());
        self.buf[self.write_pos..self.write_pos + head].copy_from_slice(&data[..head]);
        let tail = data.len() - head;
        self.buf[..tail].copy_from_slice(&data[head..]);
        self.write_pos = (self.write_pos + data.len()) % self.capacity;
    }

    /// Copy out the retained bytes, oldest first.
    pub fn contents(&self) -> Vec<u8> {
        let len = self.len();
        let mut out = Vec::with_capacity(len);
        if self.total_written <= self.capacity as u64 {
            out.extend_from_slice(&self.buf[..len]);
        } else {
            out.extend_from_slice(&self.buf[self.write_pos..]);
            out.extend_from_slice(&self.buf[..self.write_pos]);
        }
        out
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        if self.total_written >= self.capacity as u64 {
            self.capacity
        } else {
            self.total_written as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever appended, including those already dropped.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}
