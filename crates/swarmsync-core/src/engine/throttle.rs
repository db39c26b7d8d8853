//! Stream throttles - rate-limited wrappers governed by a BandwidthGovernor

use super::governor::BandwidthGovernor;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use swarmsync_types::TrafficClass;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Largest single grant a stream wrapper asks for
const MAX_GRANT: u64 = 64 * 1024;

/// Handle on one traffic class of a governor
#[derive(Clone)]
pub struct Throttle {
    governor: BandwidthGovernor,
    class: TrafficClass,
    cancel: Option<CancellationToken>,
}

impl Throttle {
    pub fn new(governor: BandwidthGovernor, class: TrafficClass) -> Self {
        Self {
            governor,
            class,
            cancel: None,
        }
    }

    /// Release any pending wait once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn class(&self) -> TrafficClass {
        self.class
    }

    /// Wait for between 1 and `want` tokens. A cancelled throttle returns
    /// `want` at once so the caller can observe cancellation and stop.
    pub async fn acquire(&self, want: u64) -> u64 {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => want,
                    granted = self.governor.request_tokens(self.class, want) => granted,
                }
            }
            None => self.governor.request_tokens(self.class, want).await,
        }
    }

    /// Wait until `amount` bytes worth of tokens have been granted
    pub async fn consume(&self, amount: u64) {
        let mut remaining = amount;
        while remaining > 0 {
            let granted = self.acquire(remaining).await;
            remaining = remaining.saturating_sub(granted);
        }
    }

    fn acquire_owned(&self, want: u64) -> BoxFuture<'static, u64> {
        let this = self.clone();
        async move { this.acquire(want).await }.boxed()
    }
}

/// Tracks tokens granted to a stream but not yet spent
struct Allowance {
    throttle: Throttle,
    tokens: u64,
    pending: Option<BoxFuture<'static, u64>>,
}

impl Allowance {
    fn new(throttle: Throttle) -> Self {
        Self {
            throttle,
            tokens: 0,
            pending: None,
        }
    }

    /// Resolve to the number of bytes the stream may move right now
    fn poll_allowance(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        if self.tokens == 0 {
            let want = (want as u64).clamp(1, MAX_GRANT);
            let throttle = &self.throttle;
            let pending = self
                .pending
                .get_or_insert_with(|| throttle.acquire_owned(want));
            let granted = ready!(pending.as_mut().poll(cx));
            self.pending = None;
            self.tokens = granted;
        }
        Poll::Ready(self.tokens.min(want as u64) as usize)
    }

    fn spend(&mut self, n: usize) {
        self.tokens = self.tokens.saturating_sub(n as u64);
    }
}

/// AsyncRead wrapper that only yields bytes the governor has granted
pub struct ThrottledReader<R> {
    inner: R,
    allowance: Allowance,
    scratch: Vec<u8>,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, throttle: Throttle) -> Self {
        Self {
            inner,
            allowance: Allowance::new(throttle),
            scratch: Vec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let allowed = ready!(this.allowance.poll_allowance(cx, buf.remaining()));
        if this.scratch.len() < allowed {
            this.scratch.resize(allowed, 0);
        }
        let mut limited = ReadBuf::new(&mut this.scratch[..allowed]);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        buf.put_slice(limited.filled());
        this.allowance.spend(n);
        Poll::Ready(Ok(()))
    }
}

/// AsyncWrite wrapper that only accepts bytes the governor has granted
pub struct ThrottledWriter<W> {
    inner: W,
    allowance: Allowance,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, throttle: Throttle) -> Self {
        Self {
            inner,
            allowance: Allowance::new(throttle),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let allowed = ready!(this.allowance.poll_allowance(cx, buf.len()));
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]))?;
        this.allowance.spend(written);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
