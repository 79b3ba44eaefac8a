//! Byte-rate token bucket and the writer wrappers the dispatcher installs
//! on a throttled link.

use crate::engine::StatCounter;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;

#[derive(Debug)]
struct BucketState {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

/// Token bucket in bytes/second with burst equal to the rate.
///
/// Safe for concurrent use by every connection of one user; writers block
/// for at most one bucket fill.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: u64) -> Arc<Self> {
        let rate = rate.max(1) as f64;
        Arc::new(Self {
            state: Mutex::new(BucketState {
                rate,
                burst: rate,
                tokens: rate,
                last: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate as u64
    }

    /// Adjust rate and burst in place; live connections pick the new rate up
    /// on their next write.
    pub fn set_rate(&self, rate: u64) {
        let rate = rate.max(1) as f64;
        let mut state = self.state.lock();
        state.rate = rate;
        state.burst = rate;
        state.tokens = state.tokens.min(rate);
    }

    /// Take `n` tokens, or learn how long to wait for them. Requests larger
    /// than one burst are charged a full burst so oversized buffers still
    /// drain at the configured rate.
    pub fn try_consume(&self, n: usize) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(state.burst);
        state.last = now;

        let need = (n as f64).min(state.burst);
        if state.tokens >= need {
            state.tokens -= need;
            return Ok(());
        }
        let deficit = need - state.tokens;
        Err(Duration::from_secs_f64(deficit / state.rate))
    }

    /// Suspend until `n` tokens are available, then take them.
    pub async fn consume(&self, n: usize) {
        loop {
            match self.try_consume(n) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// AsyncWrite wrapper that withholds each chunk until the bucket admits it.
pub struct RateLimitedWriter<W> {
    inner: W,
    bucket: Arc<TokenBucket>,
    delay: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<W> RateLimitedWriter<W> {
    pub fn new(inner: W, bucket: Arc<TokenBucket>) -> Self {
        Self {
            inner,
            bucket,
            delay: None,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RateLimitedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(delay) = this.delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Ready(()) => this.delay = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            match this.bucket.try_consume(buf.len()) {
                Ok(()) => return Pin::new(&mut this.inner).poll_write(cx, buf),
                Err(wait) => {
                    this.delay = Some(Box::pin(tokio::time::sleep(wait)));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// AsyncWrite wrapper feeding an engine stats counter.
pub struct CountingWriter<W> {
    inner: W,
    counter: Arc<StatCounter>,
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W, counter: Arc<StatCounter>) -> Self {
        Self { inner, counter }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.counter.add(n as i64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
