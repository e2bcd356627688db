//! Per-connection proxy loop
//!
//! Each accepted client is paired with an upstream lease and the two
//! directions run concurrently. A direction without middleware is a plain
//! byte copy; otherwise every read goes through the direction's pipeline
//! and the result is written with a deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::error::{LantasError, Result};
use crate::middleware::{Direction, HandlerContext, Pipeline};
use crate::pool::BufferPool;
use crate::upstream::Upstream;

/// Deadline for writing one transformed read to its destination
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a connection task needs, shared by all connections of a server
pub struct Proxy {
    upstream: Arc<Upstream>,
    prewrite: Pipeline,
    postread: Pipeline,
    buffers: Arc<BufferPool>,
    write_timeout: Duration,
}

impl Proxy {
    pub fn new(
        upstream: Arc<Upstream>,
        prewrite: Pipeline,
        postread: Pipeline,
        buffers: Arc<BufferPool>,
    ) -> Self {
        Self {
            upstream,
            prewrite,
            postread,
            buffers,
            write_timeout: WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }

    pub fn pipeline(&self, direction: Direction) -> &Pipeline {
        match direction {
            Direction::ClientToUpstream => &self.prewrite,
            Direction::UpstreamToClient => &self.postread,
        }
    }

    /// Serve one accepted connection, terminating TLS first when configured
    #[instrument(skip_all, fields(peer = %peer, upstream = %self.upstream.name()))]
    pub async fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
        token: CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let result = match tls {
            Some(acceptor) => {
                let handshake = tokio::select! {
                    accepted = acceptor.accept(stream) => accepted,
                    _ = token.cancelled() => return,
                };
                match handshake {
                    Ok(stream) => self.proxy(stream, token).await,
                    Err(e) => Err(LantasError::Tls(format!("handshake failed: {}", e))),
                }
            }
            None => self.proxy(stream, token).await,
        };

        if let Err(e) = result {
            error!(error = %e, "Connection failed");
        }
    }

    /// Proxy `client` to a leased upstream connection until both directions end.
    ///
    /// The client stream is shut down and the upstream connection closed
    /// once both directions have finished, however they finished.
    pub async fn proxy<S>(&self, mut client: S, token: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut upstream = self.upstream.dial().await?;

        let (sent, received) = {
            let (client_read, client_write) = tokio::io::split(&mut client);
            let (upstream_read, upstream_write) = upstream.stream_mut().split();
            tokio::join!(
                self.forward(Direction::ClientToUpstream, client_read, upstream_write, &token),
                self.forward(Direction::UpstreamToClient, upstream_read, client_write, &token),
            )
        };
        debug!(bytes_sent = sent, bytes_received = received, "Connection closed");

        if let Err(e) = client.shutdown().await {
            debug!(error = %e, "Client shutdown failed");
        }
        if let Err(e) = upstream.close().await {
            debug!(error = %e, "Upstream close failed");
        }
        Ok(())
    }

    /// Move bytes one way until the source ends, a write fails, or `token` fires.
    ///
    /// Returns the number of bytes written to `writer`.
    pub async fn forward<R, W>(
        &self,
        direction: Direction,
        reader: R,
        writer: W,
        token: &CancellationToken,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let pipeline = self.pipeline(direction);
        if pipeline.is_empty() {
            self.copy_raw(direction, reader, writer, token).await
        } else {
            self.transform(direction, pipeline, reader, writer, token)
                .await
        }
    }

    /// Copy `reader` into `writer` untouched, half-closing `writer` on EOF.
    ///
    /// Returns the bytes written so far however the copy ends.
    async fn copy_raw<R, W>(
        &self,
        direction: Direction,
        mut reader: R,
        mut writer: W,
        token: &CancellationToken,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = self.buffers.get_read_buf();
        let mut copied = 0u64;

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf[..]) => match read {
                    Ok(0) => {
                        debug!(
                            %direction,
                            bytes = copied,
                            "Source closed, half-closing destination"
                        );
                        if let Err(e) = writer.shutdown().await {
                            debug!(%direction, error = %e, "Destination shutdown failed");
                        }
                        return copied;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%direction, error = %e, bytes = copied, "Read failed");
                        return copied;
                    }
                },
                _ = token.cancelled() => {
                    debug!(%direction, bytes = copied, "Direction cancelled");
                    return copied;
                }
            };

            tokio::select! {
                write = writer.write_all(&buf[..n]) => match write {
                    Ok(()) => copied += n as u64,
                    Err(e) => {
                        debug!(%direction, error = %e, bytes = copied, "Write failed");
                        return copied;
                    }
                },
                _ = token.cancelled() => {
                    debug!(%direction, bytes = copied, "Direction cancelled");
                    return copied;
                }
            }
        }
    }

    async fn transform<R, W>(
        &self,
        direction: Direction,
        pipeline: &Pipeline,
        mut reader: R,
        mut writer: W,
        token: &CancellationToken,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut ctx = HandlerContext::from_pool(direction, &self.buffers, pipeline.chain_len());
        let mut written = 0u64;

        loop {
            let n = tokio::select! {
                read = reader.read(ctx.read_buf_mut()) => match read {
                    Ok(0) => {
                        debug!(%direction, "Source closed, half-closing destination");
                        if let Err(e) = writer.shutdown().await {
                            debug!(%direction, error = %e, "Destination shutdown failed");
                        }
                        return written;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%direction, error = %e, "Read failed");
                        return written;
                    }
                },
                _ = token.cancelled() => {
                    debug!(%direction, "Direction cancelled");
                    return written;
                }
            };
            ctx.set_read_n(n);

            if let Err(e) = pipeline.run(&mut ctx) {
                error!(%direction, error = %e, "Middleware pipeline failed, dropping connection");
                token.cancel();
                return written;
            }

            let output = ctx.output();
            let write = async {
                writer.write_all(output).await?;
                writer.flush().await
            };
            match timeout(self.write_timeout, write).await {
                Ok(Ok(())) => written += output.len() as u64,
                Ok(Err(e)) => {
                    error!(%direction, error = %e, "Write failed, dropping connection");
                    return written;
                }
                Err(_) => {
                    error!(
                        %direction,
                        error = %LantasError::WriteTimeout(self.write_timeout),
                        "Write timed out, dropping connection"
                    );
                    return written;
                }
            }

            ctx.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodecStep, MiddlewareChainConfig, MiddlewareStep, UpstreamConfig};
    use crate::middleware::MiddlewareChain;
    use crate::upstream::ConnTrack;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;
    use tokio::io::duplex;

    fn upstream() -> Arc<Upstream> {
        let config = UpstreamConfig {
            servers: vec!["127.0.0.1:9".into()],
            keepalive: 0,
            tls: false,
        };
        Arc::new(Upstream::new("unused", &config, ConnTrack::new()).unwrap())
    }

    fn codec_pipeline(compress: bool) -> Pipeline {
        let codec = CodecStep {
            algorithm: "gzip".into(),
            ..Default::default()
        };
        let step = if compress {
            MiddlewareStep {
                compression: Some(codec),
                decompression: None,
            }
        } else {
            MiddlewareStep {
                compression: None,
                decompression: Some(codec),
            }
        };
        let chain = MiddlewareChain::from_config(
            "codec",
            &MiddlewareChainConfig { steps: vec![step] },
        )
        .unwrap();
        let mut pipeline = Pipeline::default();
        pipeline.push("codec", &chain).unwrap();
        pipeline
    }

    fn proxy(prewrite: Pipeline, postread: Pipeline) -> Proxy {
        Proxy::new(upstream(), prewrite, postread, BufferPool::new(0, 1024))
    }

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        MultiGzDecoder::new(bytes).read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_raw_forward_copies_and_half_closes() {
        let proxy = proxy(Pipeline::default(), Pipeline::default());
        let token = CancellationToken::new();
        let (mut source, src) = duplex(64);
        let (dst, mut dest) = duplex(64);

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            source.write_all(&payload).await.unwrap();
            // dropping the source signals EOF
        });

        let (written, received) = tokio::join!(
            proxy.forward(Direction::ClientToUpstream, src, dst, &token),
            async {
                let mut received = Vec::new();
                dest.read_to_end(&mut received).await.unwrap();
                received
            }
        );
        writer.await.unwrap();

        assert_eq!(written, expected.len() as u64);
        assert_eq!(received, expected);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_raw_forward_preserves_read_boundaries() {
        let proxy = proxy(Pipeline::default(), Pipeline::default());
        let token = CancellationToken::new();
        let reader = tokio_test::io::Builder::new()
            .read(b"GET / HTTP/1.1\r\n")
            .read(b"\r\n")
            .build();
        let writer = tokio_test::io::Builder::new()
            .write(b"GET / HTTP/1.1\r\n")
            .write(b"\r\n")
            .build();

        let written = proxy
            .forward(Direction::ClientToUpstream, reader, writer, &token)
            .await;
        assert_eq!(written, 18);
    }

    #[tokio::test]
    async fn test_raw_forward_counts_bytes_copied_before_cancel() {
        let proxy = proxy(Pipeline::default(), Pipeline::default());
        let token = CancellationToken::new();
        let (mut source, src) = duplex(256);
        let (dst, mut dest) = duplex(256);

        // the source stays open, so only the token ends the copy
        source.write_all(&[7u8; 100]).await.unwrap();

        let canceller = token.clone();
        let (written, _dest) = tokio::join!(
            proxy.forward(Direction::ClientToUpstream, src, dst, &token),
            async move {
                let mut got = [0u8; 100];
                dest.read_exact(&mut got).await.unwrap();
                canceller.cancel();
                dest
            }
        );

        assert_eq!(written, 100);
        drop(source);
    }

    #[tokio::test]
    async fn test_pipeline_forward_compresses_each_read() {
        let proxy = proxy(codec_pipeline(true), Pipeline::default());
        let token = CancellationToken::new();
        let (mut source, src) = duplex(4096);
        let (dst, mut dest) = duplex(4096);

        tokio::spawn(async move {
            for chunk in [&b"first chunk "[..], b"second chunk ", b"third"] {
                source.write_all(chunk).await.unwrap();
            }
        });

        let (_, received) = tokio::join!(
            proxy.forward(Direction::ClientToUpstream, src, dst, &token),
            async {
                let mut received = Vec::new();
                dest.read_to_end(&mut received).await.unwrap();
                received
            }
        );

        assert_eq!(&received[..2], &[0x1f, 0x8b]);
        assert_eq!(gunzip(&received), b"first chunk second chunk third");
    }

    #[tokio::test]
    async fn test_pipeline_error_cancels_connection() {
        let proxy = proxy(Pipeline::default(), codec_pipeline(false));
        let token = CancellationToken::new();
        let (mut source, src) = duplex(64);
        let (dst, _dest) = duplex(64);

        source.write_all(b"not gzip at all").await.unwrap();

        let written = timeout(
            Duration::from_secs(5),
            proxy.forward(Direction::UpstreamToClient, src, dst, &token),
        )
        .await
        .unwrap();

        assert_eq!(written, 0);
        assert!(token.is_cancelled());
        drop(source);
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_directions() {
        let proxy = proxy(Pipeline::default(), codec_pipeline(false));
        let token = CancellationToken::new();
        let (_client, src_a) = duplex(64);
        let (dst_a, _upstream) = duplex(64);
        let (_upstream2, src_b) = duplex(64);
        let (dst_b, _client2) = duplex(64);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        // neither source ever produces data; only the token ends them
        let finished = timeout(Duration::from_secs(5), async {
            tokio::join!(
                proxy.forward(Direction::ClientToUpstream, src_a, dst_a, &token),
                proxy.forward(Direction::UpstreamToClient, src_b, dst_b, &token),
            )
        })
        .await;
        assert_eq!(finished.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_write_timeout_ends_only_that_direction() {
        let proxy = proxy(codec_pipeline(true), Pipeline::default())
            .with_write_timeout(Duration::from_millis(50));
        let token = CancellationToken::new();
        let (mut source, src) = duplex(64);
        // destination peer never reads, and the pipe is smaller than one gzip member
        let (dst, _stalled) = duplex(8);

        source.write_all(b"some bytes").await.unwrap();

        let written = timeout(
            Duration::from_secs(5),
            proxy.forward(Direction::ClientToUpstream, src, dst, &token),
        )
        .await
        .unwrap();

        assert_eq!(written, 0);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_default_write_timeout() {
        let proxy = proxy(Pipeline::default(), Pipeline::default());
        assert_eq!(proxy.write_timeout, Duration::from_secs(30));
        assert!(proxy.pipeline(Direction::ClientToUpstream).is_empty());
    }
}
