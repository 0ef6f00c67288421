use std::io::ErrorKind;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8_192;

/// Accumulates output up to a byte ceiling; everything past it is dropped and
/// remembered as truncation.
#[derive(Debug)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.data.len());
        if chunk.len() > remaining {
            self.truncated = true;
        }
        let take = chunk.len().min(remaining);
        self.data.extend_from_slice(chunk.get(..take).unwrap_or_default());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Copy of what was captured so far, plus the truncation flag.
    pub fn snapshot(&self) -> (Vec<u8>, bool) {
        (self.data.clone(), self.truncated)
    }
}

pub type SharedCapture = Arc<Mutex<CaptureBuffer>>;

pub fn shared_capture(limit: usize) -> SharedCapture {
    Arc::new(Mutex::new(CaptureBuffer::new(limit)))
}

/// Read `reader` to EOF into `capture`.
///
/// Reading continues past the ceiling so the child never blocks on a full
/// pipe. I/O errors end the drain quietly; the bytes captured so far stay.
pub async fn drain_into<R>(mut reader: R, capture: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => capture.lock().push(buf.get(..n).unwrap_or_default()),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(error = %err, "output stream closed with error");
                break;
            }
        }
    }
}
