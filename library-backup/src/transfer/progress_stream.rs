//! Byte-counting reader wrapper for download progress.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Reader wrapper that counts bytes passing through and reports them
/// through a throttled callback (plus once at end of stream).
pub struct ProgressReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
    last_update: Instant,
    update_interval: Duration,
    callback: Option<ProgressCallback>,
}

impl<R: AsyncRead + Unpin> ProgressReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            counter: Arc::new(AtomicU64::new(0)),
            last_update: Instant::now(),
            update_interval: Duration::from_secs(5),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Shared handle to the byte count, readable after the reader is consumed
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counter)
    }

    fn report(&mut self, force: bool) {
        let Some(callback) = &self.callback else {
            return;
        };
        let now = Instant::now();
        if force || now.duration_since(self.last_update) >= self.update_interval {
            callback(self.counter.load(Ordering::Relaxed));
            self.last_update = now;
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();

        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                if read == 0 {
                    self.report(true);
                } else {
                    self.counter.fetch_add(read as u64, Ordering::Relaxed);
                    self.report(false);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
