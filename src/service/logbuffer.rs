//! # Bounded in-memory capture of service output.
//!
//! A [`LogBuffer`] is attached to a child's stdout/stderr pipes and filled by
//! reader tasks until EOF (which the reader observes once the child exits and
//! the parent has dropped its own pipe ends). The buffer is bounded: once
//! full, further input is read and discarded so the child never blocks on a
//! full pipe.
//!
//! The control `catlog` command takes a snapshot, optionally clearing the
//! buffer.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_BUF_MAX: usize = 8192;

const RESTART_MARKER: &str = "(slinit: note: service restarted)\n";

/// Thread-safe bounded output buffer.
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

struct Inner {
    buf: Vec<u8>,
    buf_max: usize,
}

impl LogBuffer {
    /// Creates a buffer with the given maximum size (0 means the default).
    pub fn new(max_size: usize) -> Arc<Self> {
        let buf_max = if max_size == 0 {
            DEFAULT_BUF_MAX
        } else {
            max_size
        };
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                buf_max,
            }),
        })
    }

    /// Appends data, discarding anything beyond the size bound.
    pub fn append(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let remaining = inner.buf_max.saturating_sub(inner.buf.len());
        if remaining > 0 {
            let take = data.len().min(remaining);
            inner.buf.extend_from_slice(&data[..take]);
        }
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().buf.clone()
    }

    /// Returns the current contents and clears the buffer.
    pub fn snapshot_and_clear(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().buf)
    }

    /// Appends a marker noting that the service restarted.
    ///
    /// Skipped when the buffer is empty or the marker would not fit.
    pub fn append_restart_marker(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.buf.is_empty() {
            return;
        }
        let mut msg = String::new();
        if *inner.buf.last().unwrap() != b'\n' {
            msg.push('\n');
        }
        msg.push_str(RESTART_MARKER);
        let remaining = inner.buf_max.saturating_sub(inner.buf.len());
        if remaining < msg.len() {
            return;
        }
        inner.buf.extend_from_slice(msg.as_bytes());
    }

    /// Spawns a task reading `stream` into this buffer until EOF.
    pub fn spawn_reader<R>(self: &Arc<Self>, mut stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::clone(self);
        tokio::spawn(async move {
            let mut tmp = [0u8; 4096];
            loop {
                match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.append(&tmp[..n]),
                }
            }
        });
    }
}
