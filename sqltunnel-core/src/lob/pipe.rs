//! Queue-backed byte stream bridging async uploads to blocking readers.
//!
//! The upload task pushes blocks as they arrive; a statement bound to the
//! stream reads through [`PipeReader`], blocking until more bytes arrive or the
//! writer finishes or fails.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct PipeState {
    chunks: VecDeque<Vec<u8>>,
    finished: bool,
    error: Option<String>,
    reader_taken: bool,
}

#[derive(Default)]
struct PipeShared {
    state: Mutex<PipeState>,
    readable: Condvar,
}

/// Writer side of the pipe. Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct LobPipe {
    shared: Arc<PipeShared>,
}

impl LobPipe {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PipeState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state();
        if state.finished || state.error.is_some() {
            return;
        }
        state.chunks.push_back(data);
        self.shared.readable.notify_all();
    }

    /// No more data will arrive; readers drain what is queued and see EOF.
    pub fn finish(&self) {
        let mut state = self.state();
        state.finished = true;
        self.shared.readable.notify_all();
    }

    /// Any blocked or future read fails with `message`.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.state();
        if state.error.is_none() {
            state.error = Some(message.into());
        }
        self.shared.readable.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    /// The single reader of this pipe; `None` once it has been handed out.
    pub fn take_reader(&self) -> Option<PipeReader> {
        let mut state = self.state();
        if state.reader_taken {
            return None;
        }
        state.reader_taken = true;
        Some(PipeReader {
            shared: self.shared.clone(),
            current: Vec::new(),
            offset: 0,
        })
    }
}

pub struct PipeReader {
    shared: Arc<PipeShared>,
    current: Vec<u8>,
    offset: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.offset >= self.current.len() {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            loop {
                if let Some(message) = state.error.as_ref() {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, message.clone()));
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    self.current = chunk;
                    self.offset = 0;
                    break;
                }
                if state.finished {
                    return Ok(0);
                }
                state = self
                    .shared
                    .readable
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        let available = &self.current[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}
