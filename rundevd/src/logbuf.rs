//! Bounded ring buffer for the user process's stdout/stderr.
//!
//! Written by the nanny's stdio tee tasks, read by `/rundevd/procz` and by
//! procError responses. Old output is dropped from the front once the
//! capacity is reached.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Default capacity: enough to hold a build failure's tail end.
pub const DEFAULT_LOG_CAPACITY: usize = 256 * 1024;

#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    buf: Mutex<VecDeque<u8>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends one output line, trimming the oldest bytes past capacity.
    pub fn append_line(&self, line: &str) {
        let mut buf = self.buf.lock().unwrap();
        buf.extend(line.as_bytes().iter().copied());
        buf.push_back(b'\n');
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    /// A copy of the buffered output.
    pub fn snapshot(&self) -> Vec<u8> {
        let buf = self.buf.lock().unwrap();
        buf.iter().copied().collect()
    }

    /// The buffered output as lossy UTF-8, for procError bodies.
    pub fn snapshot_string(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    /// Drops all buffered output. Called when the process is killed.
    pub fn reset(&self) {
        self.buf.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
