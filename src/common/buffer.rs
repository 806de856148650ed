//! Growable byte buffers and the bidirectional relay engine.
//!
//! The relay engine is greedy and non-timer based for data movement: each
//! direction drains its write side before reading more, so backpressure from
//! a slow peer stops the fast peer from being read. A single idle watchdog
//! covers both directions.

use crate::{Error, Result};
use std::cmp;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

const INIT_CAP: usize = 8 * 1024;
const MAX_CAP: usize = 64 * 1024;

/// Pump rounds per poll before yielding back to the scheduler.
const MAX_ROUNDS_PER_POLL: usize = 16;

/// Growable byte region with a read cursor for partial sends.
///
/// Invariant: `idx <= len <= capacity`. Bytes in `idx..len` are pending;
/// bytes past `len` are writable scratch. The buffer grows but never shrinks.
pub struct Buffer {
    data: Box<[u8]>,
    idx: usize,
    len: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Buffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            idx: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.idx == self.len
    }

    /// Pending bytes not yet consumed.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.idx..self.len]
    }

    #[inline]
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.len
    }

    /// Scratch space for the next read. Caller commits what it filled.
    #[inline]
    pub fn writable_slice(&mut self, n: usize) -> &mut [u8] {
        &mut self.data[self.len..self.len + n]
    }

    #[inline]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.data.len());
        self.len += n;
    }

    /// Advance the read cursor. Rewinds to the start once drained so the
    /// whole capacity is writable again.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.idx + n <= self.len);
        self.idx += n;
        if self.idx == self.len {
            self.idx = 0;
            self.len = 0;
        }
    }

    /// Grow to at least `min_cap`, preserving pending bytes. Never shrinks.
    pub fn reserve(&mut self, min_cap: usize) {
        if min_cap <= self.data.len() {
            return;
        }
        let mut grown = vec![0u8; min_cap].into_boxed_slice();
        grown[..self.len].copy_from_slice(&self.data[..self.len]);
        self.data = grown;
    }

    /// Insert `src` in front of the pending bytes, shifting them right.
    pub fn prepend(&mut self, src: &[u8]) {
        let pending = self.len - self.idx;
        self.reserve(pending + src.len());
        // Compact to the front, then shift right by src.len.
        self.data.copy_within(self.idx..self.len, src.len());
        self.data[..src.len()].copy_from_slice(src);
        self.idx = 0;
        self.len = pending + src.len();
    }
}

/// One direction of a relayed connection.
struct DirState {
    buf: Buffer,
    eof: bool,
    shutdown: bool,
    bytes: u64,
}

impl DirState {
    fn new() -> Self {
        DirState {
            buf: Buffer::with_capacity(INIT_CAP),
            eof: false,
            shutdown: false,
            bytes: 0,
        }
    }

    #[inline]
    fn done(&self) -> bool {
        self.eof && self.buf.is_empty() && self.shutdown
    }
}

fn fill<R: AsyncRead + Unpin>(
    mut src: Pin<&mut R>,
    cx: &mut Context<'_>,
    dir: &mut DirState,
) -> Result<bool> {
    let mut made_progress = false;

    while !dir.eof {
        let want = dir.buf.writable_len();
        if want == 0 {
            if dir.buf.capacity() < MAX_CAP {
                let cap = cmp::min(dir.buf.capacity() * 2, MAX_CAP);
                dir.buf.reserve(cap);
                continue;
            }
            break;
        }

        let mut read_buf = ReadBuf::new(dir.buf.writable_slice(want));
        match src.as_mut().poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                made_progress = true;
                if n == 0 {
                    dir.eof = true;
                    break;
                }
                dir.buf.commit(n);
            }
            Poll::Ready(Err(e)) => return Err(e.into()),
            Poll::Pending => break,
        }
    }

    Ok(made_progress)
}

fn flush<W: AsyncWrite + Unpin>(
    mut dst: Pin<&mut W>,
    cx: &mut Context<'_>,
    dir: &mut DirState,
) -> Result<bool> {
    let mut made_progress = false;

    while !dir.buf.is_empty() {
        match dst.as_mut().poll_write(cx, dir.buf.readable()) {
            Poll::Ready(Ok(0)) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero").into());
            }
            Poll::Ready(Ok(n)) => {
                dir.buf.consume(n);
                dir.bytes = dir.bytes.saturating_add(n as u64);
                made_progress = true;
            }
            Poll::Ready(Err(e)) => return Err(e.into()),
            Poll::Pending => break,
        }
    }

    Ok(made_progress)
}

/// Move bytes one step in one direction: drain pending writes, propagate
/// half-close on EOF, then read more only once the buffer is empty.
fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    cx: &mut Context<'_>,
    dir: &mut DirState,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut made_progress = flush(Pin::new(&mut *dst), cx, dir)?;

    if !dir.buf.is_empty() {
        // Writer is the bottleneck; the reader stays parked.
        return Ok(made_progress);
    }

    if dir.eof {
        if !dir.shutdown {
            match Pin::new(&mut *dst).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {
                    dir.shutdown = true;
                    made_progress = true;
                }
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Pending => {}
            }
        }
        return Ok(made_progress);
    }

    if fill(Pin::new(&mut *src), cx, dir)? {
        made_progress = true;
        flush(Pin::new(&mut *dst), cx, dir)?;
        if dir.eof && dir.buf.is_empty() && !dir.shutdown {
            if let Poll::Ready(res) = Pin::new(&mut *dst).poll_shutdown(cx) {
                res.map_err(Error::from)?;
                dir.shutdown = true;
            }
        }
    }

    Ok(made_progress)
}

struct RelayFut<'a, A, B> {
    a: &'a mut A,
    b: &'a mut B,
    a2b: DirState,
    b2a: DirState,
    idle: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl<'a, A, B> Future for RelayFut<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = Result<(u64, u64)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut made_progress = false;

        for _ in 0..MAX_ROUNDS_PER_POLL {
            if this.a2b.done() && this.b2a.done() {
                return Poll::Ready(Ok((this.a2b.bytes, this.b2a.bytes)));
            }

            let fwd = pump(this.a, this.b, cx, &mut this.a2b)?;
            let rev = pump(this.b, this.a, cx, &mut this.b2a)?;
            if !fwd && !rev {
                break;
            }
            made_progress = true;
        }

        if this.a2b.done() && this.b2a.done() {
            return Poll::Ready(Ok((this.a2b.bytes, this.b2a.bytes)));
        }

        if made_progress {
            this.idle
                .as_mut()
                .reset(Instant::now() + this.timeout);
            // Still progressing after a full set of rounds; yield but come
            // straight back.
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        if this.idle.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(Error::timeout(format!(
                "no activity for {}s",
                this.timeout.as_secs()
            ))));
        }

        Poll::Pending
    }
}

/// Relay bytes between `a` (client side) and `b` (remote side) until both
/// directions reach EOF, an error occurs, or the pair is idle for `timeout`.
///
/// `initial_a` is carried-over client payload (bytes consumed during the
/// handshake/sniff stage); it is queued in front of the client-to-remote
/// direction so ordering and backpressure are preserved.
///
/// Returns (client-to-remote bytes, remote-to-client bytes).
pub async fn relay_with_timeout<A, B>(
    a: &mut A,
    b: &mut B,
    initial_a: &[u8],
    timeout: Duration,
) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut a2b = DirState::new();
    if !initial_a.is_empty() {
        a2b.buf.prepend(initial_a);
    }

    RelayFut {
        a,
        b,
        a2b,
        b2a: DirState::new(),
        idle: Box::pin(sleep(timeout)),
        timeout,
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_buffer_cursor() {
        let mut buf = Buffer::with_capacity(8);
        buf.writable_slice(4).copy_from_slice(b"abcd");
        buf.commit(4);
        assert_eq!(buf.readable(), b"abcd");

        buf.consume(2);
        assert_eq!(buf.readable(), b"cd");

        // Draining rewinds the cursor.
        buf.consume(2);
        assert!(buf.is_empty());
        assert_eq!(buf.writable_len(), 8);
    }

    #[test]
    fn test_buffer_reserve_preserves() {
        let mut buf = Buffer::with_capacity(4);
        buf.writable_slice(4).copy_from_slice(b"wxyz");
        buf.commit(4);

        buf.reserve(16);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable(), b"wxyz");

        // Never shrinks.
        buf.reserve(2);
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_buffer_prepend() {
        let mut buf = Buffer::with_capacity(4);
        buf.writable_slice(3).copy_from_slice(b"def");
        buf.commit(3);
        buf.consume(1);

        buf.prepend(b"abc");
        assert_eq!(buf.readable(), b"abcef");
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, mut client_far) = duplex(1024);
        let (mut remote, mut remote_far) = duplex(1024);

        let relay = tokio::spawn(async move {
            relay_with_timeout(&mut client_far, &mut remote_far, b"", Duration::from_secs(5))
                .await
        });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = [0u8; 4];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        remote.write_all(b"pong!").await.unwrap();
        remote.shutdown().await.unwrap();

        let mut back = Vec::new();
        client.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"pong!");

        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 5);
    }

    #[tokio::test]
    async fn test_relay_initial_bytes_first() {
        let (mut client, mut client_far) = duplex(1024);
        let (mut remote, mut remote_far) = duplex(1024);

        let relay = tokio::spawn(async move {
            relay_with_timeout(
                &mut client_far,
                &mut remote_far,
                b"HEAD ",
                Duration::from_secs(5),
            )
            .await
        });

        client.write_all(b"/ HTTP/1.0").await.unwrap();
        client.shutdown().await.unwrap();
        drop(remote.write_all(b"").await);
        remote.shutdown().await.unwrap();

        let mut got = Vec::new();
        remote.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"HEAD / HTTP/1.0");

        let (up, _) = relay.await.unwrap().unwrap();
        assert_eq!(up, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout() {
        let (_client, mut client_far) = duplex(64);
        let (_remote, mut remote_far) = duplex(64);

        let err = relay_with_timeout(
            &mut client_far,
            &mut remote_far,
            b"",
            Duration::from_secs(3),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_relay_slow_writer_no_loss() {
        // Remote accepts tiny chunks; every byte of a large upload must
        // still arrive, in order.
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (mut client, mut client_far) = duplex(64 * 1024);
        let (mut remote, mut remote_far) = duplex(512);

        let relay = tokio::spawn(async move {
            relay_with_timeout(&mut client_far, &mut remote_far, b"", Duration::from_secs(10))
                .await
        });

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut got = Vec::with_capacity(expected.len());
        let mut chunk = [0u8; 512];
        loop {
            let n = remote.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&chunk[..n]);
        }

        writer.await.unwrap();
        let (up, _) = relay.await.unwrap().unwrap();
        assert_eq!(got, expected);
        assert_eq!(up, expected.len() as u64);
    }
}
