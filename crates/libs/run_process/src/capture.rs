use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::OUTPUT_CAP_BYTES;

const TRUNCATION_MARKER: &str = "[earlier output dropped]\n";

/// A byte buffer that keeps at most the newest `cap` bytes.
#[derive(Debug, Default)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            // A single chunk bigger than the cap: keep only its tail.
            self.bytes.clear();
            self.bytes.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            self.truncated = true;
            return;
        }
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
            self.truncated = true;
        }
    }

    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Consumes the buffer into a lossily-decoded string, prefixed with a
    /// marker when older content was dropped.
    #[must_use]
    pub fn into_string(self) -> String {
        let body = String::from_utf8_lossy(&self.bytes);
        if self.truncated {
            format!("{TRUNCATION_MARKER}{body}")
        } else {
            body.into_owned()
        }
    }
}

/// Spawns a task that drains a child stream into a capped buffer.
pub fn drain<R>(stream: Option<R>) -> JoinHandle<CappedBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = CappedBuffer::new(OUTPUT_CAP_BYTES);
        let Some(mut stream) = stream else {
            return buffer;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&chunk[..n]),
            }
        }
        buffer
    })
}
