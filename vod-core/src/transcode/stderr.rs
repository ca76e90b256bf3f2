use std::collections::VecDeque;

/// Keeps the most recent `capacity` bytes written by a child process.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    buffer: VecDeque<u8>,
    capacity: usize,
    discarded: u64,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            discarded: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            self.discarded += chunk.len() as u64;
            return;
        }
        let chunk = if chunk.len() > self.capacity {
            let skip = chunk.len() - self.capacity;
            self.discarded += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };
        let overflow = (self.buffer.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buffer.drain(..overflow);
            self.discarded += overflow as u64;
        }
        self.buffer.extend(chunk.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn to_string_lossy(&self) -> String {
        let (front, back) = self.buffer.as_slices();
        let mut bytes = Vec::with_capacity(self.buffer.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
