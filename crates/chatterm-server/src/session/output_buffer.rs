//! Bounded output history for session reattach.
//!
//! Keeps the most recent PTY output as a queue of chunks so that a
//! reconnecting client can repaint its terminal without the server keeping
//! unbounded history. Sizes are counted in characters.

use std::collections::VecDeque;

/// Default bound on retained output, in characters.
pub const MAX_BUFFER_SIZE: usize = 100_000;

/// A chunk queue evicting from the front once over its bound.
#[derive(Debug)]
pub struct OutputBuffer {
    /// Chunks in arrival order with their character counts.
    chunks: VecDeque<(String, usize)>,
    size: usize,
    max_size: usize,
}

impl OutputBuffer {
    /// Create an empty buffer bounded at `max_size` characters.
    pub fn new(max_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Append a chunk, then drop the oldest chunks while over the bound.
    ///
    /// The newest chunk is always kept, even if it alone exceeds the bound.
    pub fn push(&mut self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        let len = chunk.chars().count();
        self.chunks.push_back((chunk, len));
        self.size += len;

        while self.size > self.max_size && self.chunks.len() > 1 {
            if let Some((_, evicted)) = self.chunks.pop_front() {
                self.size -= evicted;
            }
        }
    }

    /// All retained output in arrival order.
    pub fn contents(&self) -> String {
        let mut out = String::with_capacity(self.chunks.iter().map(|(c, _)| c.len()).sum());
        for (chunk, _) in &self.chunks {
            out.push_str(chunk);
        }
        out
    }

    /// Retained size in characters.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(MAX_BUFFER_SIZE)
    }
}
