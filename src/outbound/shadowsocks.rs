//! Shadowsocks outbound: upstream selection and the encrypted stream.

use crate::common::net::{connect_remote, Address, ConnectOpts};
use crate::crypto::{CipherKind, Decryptor, Encryptor, ReplayCache};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

/// Shared upstream state: cipher, master key, relay addresses and the
/// process-wide replay window.
#[derive(Debug)]
pub struct ShadowsocksOutbound {
    kind: CipherKind,
    master_key: Vec<u8>,
    servers: Vec<SocketAddr>,
    opts: ConnectOpts,
    replay: Arc<ReplayCache>,
}

impl ShadowsocksOutbound {
    pub fn new(
        kind: CipherKind,
        master_key: Vec<u8>,
        servers: Vec<SocketAddr>,
        opts: ConnectOpts,
        replay: Arc<ReplayCache>,
    ) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::config("No upstream servers"));
        }
        Ok(ShadowsocksOutbound {
            kind,
            master_key,
            servers,
            opts,
            replay,
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    pub fn replay(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    /// Upstream selection policy: uniform random per session.
    pub fn pick_server(&self) -> SocketAddr {
        let idx = rand::thread_rng().gen_range(0..self.servers.len());
        self.servers[idx]
    }

    /// Open a tunneled connection to `target:port`. The encrypted address
    /// header (and any carried-over client payload) goes out in the first
    /// write, so a Fast Open connect can piggyback it on the SYN path.
    pub async fn dial(
        &self,
        target: &Address,
        port: u16,
        initial: &[u8],
    ) -> Result<ShadowsocksConnection> {
        let server = self.pick_server();
        debug!(
            "tunnel {} via {}",
            target.to_string_with_port(port),
            server
        );
        let stream = connect_remote(server, &self.opts).await?;
        ShadowsocksConnection::establish(
            stream,
            self.kind,
            &self.master_key,
            self.replay.clone(),
            target,
            port,
            initial,
        )
        .await
    }
}

/// One encrypted upstream stream. Reads decrypt, writes encrypt; both
/// directions keep their own cipher context.
pub struct ShadowsocksConnection {
    inner: TcpStream,
    enc: Encryptor,
    dec: Decryptor,
    /// Decrypted bytes not yet handed to the caller.
    pending: BytesMut,
    /// Ciphertext accepted but not yet written through.
    write_buf: BytesMut,
}

impl ShadowsocksConnection {
    async fn establish(
        mut stream: TcpStream,
        kind: CipherKind,
        master_key: &[u8],
        replay: Arc<ReplayCache>,
        target: &Address,
        port: u16,
        initial: &[u8],
    ) -> Result<Self> {
        let mut enc = Encryptor::new(kind, master_key)?;

        // salt || enc(address header) || enc-framed initial payload
        let header = target.to_wire(port)?;
        let mut first = enc.encrypt(&header)?;
        if !initial.is_empty() {
            let framed = enc.encrypt(initial)?;
            first.extend_from_slice(&framed);
        }
        stream.write_all(&first).await?;

        Ok(ShadowsocksConnection {
            inner: stream,
            enc,
            dec: Decryptor::new(kind, master_key, replay),
            pending: BytesMut::new(),
            write_buf: BytesMut::new(),
        })
    }

    /// Push buffered ciphertext into the socket.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write zero",
                )));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ShadowsocksConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = std::cmp::min(buf.remaining(), this.pending.len());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        // Upstream EOF.
                        return Poll::Ready(Ok(()));
                    }
                    let plaintext = this
                        .dec
                        .decrypt(filled)
                        .map_err(io::Error::from)?;
                    this.pending.extend_from_slice(&plaintext);
                    // Partial record: loop and read more ciphertext.
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ShadowsocksConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Finish the previous ciphertext before accepting more plaintext.
        ready!(this.poll_drain(cx))?;

        let sealed = this.enc.encrypt(buf).map_err(io::Error::from)?;
        this.write_buf = sealed;

        // Best effort; leftovers drain on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    #[test]
    fn test_pick_server_in_range() {
        let outbound = ShadowsocksOutbound::new(
            CipherKind::Aes256Gcm,
            derive_key("pw", 32),
            vec![
                "198.51.100.1:8388".parse().unwrap(),
                "198.51.100.2:8388".parse().unwrap(),
                "198.51.100.3:8388".parse().unwrap(),
            ],
            ConnectOpts::default(),
            Arc::new(ReplayCache::default()),
        )
        .unwrap();

        for _ in 0..64 {
            let picked = outbound.pick_server();
            assert!(outbound.servers.contains(&picked));
        }
    }

    #[test]
    fn test_no_servers_rejected() {
        let result = ShadowsocksOutbound::new(
            CipherKind::Aes256Gcm,
            derive_key("pw", 32),
            Vec::new(),
            ConnectOpts::default(),
            Arc::new(ReplayCache::default()),
        );
        assert!(result.is_err());
    }
}
