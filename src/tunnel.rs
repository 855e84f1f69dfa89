// Copyright the Cluster Gateway Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tunnelled egress to clusters without a routable endpoint.
//!
//! One mutually-authenticated HTTP/2 connection to the configured egress
//! proxy is shared by all requests; each request opens a CONNECT stream
//! addressed to the target cluster name and owns only that stream. The
//! connection is established lazily and replaced after failure.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::{Method, Request, Uri};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::config::ClusterProxyConfig;
use crate::tls;

/// Keepalive interval on the tunnel control channel.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(20);

const WINDOW_SIZE: u32 = 4 * 1024 * 1024;
const CONNECTION_WINDOW_SIZE: u32 = 16 * 1024 * 1024;
const FRAME_SIZE: u32 = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tunnel io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tunnel tls: {0}")]
    Tls(#[from] tls::Error),
    #[error("tunnel protocol: {0}")]
    H2(#[from] h2::Error),
    #[error("egress proxy refused stream to {cluster}: status {status}")]
    Refused {
        cluster: String,
        status: http::StatusCode,
    },
    #[error("invalid tunnel authority for cluster {0:?}")]
    Authority(String),
}

/// Shared handle to the egress tunnel. Cheap to clone; all clones
/// multiplex over the same control connection.
#[derive(Clone)]
pub struct TunnelDialer {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: ClusterProxyConfig,
    sender: Mutex<Option<SendRequest<Bytes>>>,
}

impl TunnelDialer {
    pub fn new(cfg: ClusterProxyConfig) -> Self {
        TunnelDialer {
            inner: Arc::new(Inner {
                cfg,
                sender: Mutex::new(None),
            }),
        }
    }

    /// Open a stream to the named cluster. The returned stream is plain
    /// bytes; the caller layers TLS on top of it with a server name equal
    /// to the cluster name.
    pub async fn dial(&self, cluster: &str) -> Result<TunnelStream, Error> {
        let mut sender = self.checkout().await?;
        send_connect(&mut sender, cluster).await
    }

    /// Hand out the shared sender, establishing or replacing the control
    /// connection as needed. The lock covers only the checkout, never the
    /// stream open.
    async fn checkout(&self) -> Result<SendRequest<Bytes>, Error> {
        let mut guard = self.inner.sender.lock().await;
        if let Some(sender) = guard.as_mut() {
            if ready_to_use(sender) {
                return Ok(sender.clone());
            }
            debug!("tunnel connection no longer usable, reconnecting");
        }
        let sender = self.establish().await?;
        *guard = Some(sender.clone());
        Ok(sender)
    }

    async fn establish(&self) -> Result<SendRequest<Bytes>, Error> {
        let cfg = &self.inner.cfg;
        let ca = tokio::fs::read(&cfg.ca_file).await?;
        let cert = tokio::fs::read(&cfg.cert_file).await?;
        let key = tokio::fs::read(&cfg.key_file).await?;
        let tls_config = tls::client_config_h2(
            &tls::ServerVerification::CaBundle(ca),
            Some((&cert, &key)),
        )?;
        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port)).await?;
        tcp.set_nodelay(true)?;
        let tls_stream = TlsConnector::from(Arc::new(tls_config))
            .connect(tls::server_name(&cfg.host)?, tcp)
            .await?;

        let (sender, mut connection) = h2::client::Builder::new()
            .initial_window_size(WINDOW_SIZE)
            .initial_connection_window_size(CONNECTION_WINDOW_SIZE)
            .max_frame_size(FRAME_SIZE)
            .enable_push(false)
            .handshake(tls_stream)
            .await?;

        let ping_pong = connection
            .ping_pong()
            .expect("ping_pong is available before the connection is driven");
        let (ping_dead_tx, ping_dead_rx) = oneshot::channel();
        tokio::spawn(do_ping_pong(ping_pong, ping_dead_tx));
        tokio::spawn(async move {
            tokio::pin!(connection);
            tokio::select! {
                res = &mut connection => {
                    if let Err(e) = res {
                        warn!("tunnel connection terminated: {e}");
                    }
                }
                _ = ping_dead_rx => {
                    warn!("tunnel keepalive timed out, dropping connection");
                }
            }
        });
        debug!(host = %cfg.host, port = cfg.port, "established egress tunnel");
        Ok(sender)
    }
}

fn ready_to_use(sender: &mut SendRequest<Bytes>) -> bool {
    let cx = &mut Context::from_waker(futures_util::task::noop_waker_ref());
    match sender.poll_ready(cx) {
        Poll::Ready(Ok(())) => true,
        // GOAWAY, broken connection, ...
        Poll::Ready(Err(_)) => false,
        // Flow-control pressure; err on the side of a fresh connection.
        Poll::Pending => false,
    }
}

async fn do_ping_pong(mut ping_pong: h2::PingPong, dead: oneshot::Sender<()>) {
    // No need to race the first request.
    tokio::time::sleep(KEEPALIVE_INTERVAL).await;
    loop {
        let ping = ping_pong.ping(h2::Ping::opaque());
        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Err(_) => {
                let _ = dead.send(());
                return;
            }
            Ok(Err(_)) => {
                // Connection already torn down; the driver logs it.
                return;
            }
            Ok(Ok(_)) => {
                trace!("tunnel pong received");
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            }
        }
    }
}

/// Open one CONNECT stream on an established control connection.
async fn send_connect(
    sender: &mut SendRequest<Bytes>,
    cluster: &str,
) -> Result<TunnelStream, Error> {
    let authority: Uri = Uri::builder()
        .authority(format!("{cluster}:443"))
        .build()
        .map_err(|_| Error::Authority(cluster.to_string()))?;
    let request = Request::builder()
        .method(Method::CONNECT)
        .uri(authority)
        .body(())
        .map_err(|_| Error::Authority(cluster.to_string()))?;

    futures_util::future::poll_fn(|cx| sender.poll_ready(cx)).await?;
    let (response, send) = sender.send_request(request, false)?;
    let response = response.await?;
    if response.status() != http::StatusCode::OK {
        return Err(Error::Refused {
            cluster: cluster.to_string(),
            status: response.status(),
        });
    }
    Ok(TunnelStream {
        send,
        recv: response.into_body(),
        read_buf: Bytes::new(),
    })
}

/// One CONNECT stream, exposed as an ordinary byte stream.
pub struct TunnelStream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    read_buf: Bytes,
}

fn h2_io_error(e: h2::Error) -> std::io::Error {
    if e.is_io() {
        e.into_io().expect("checked is_io")
    } else {
        std::io::Error::other(e)
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_buf.is_empty() {
            match ready!(self.recv.poll_data(cx)) {
                Some(Ok(bytes)) => {
                    let _ = self.recv.flow_control().release_capacity(bytes.len());
                    self.read_buf = bytes;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_io_error(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = usize::min(buf.remaining(), self.read_buf.len());
        buf.put_slice(&self.read_buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            self.send.reserve_capacity(buf.len());
            match ready!(self.send.poll_capacity(cx)) {
                Some(Ok(0)) => continue,
                Some(Ok(n)) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    self.send
                        .send_data(chunk, false)
                        .map_err(h2_io_error)?;
                    return Poll::Ready(Ok(n));
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_io_error(e))),
                None => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "tunnel stream closed",
                    )))
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // h2 frames are handed to the connection driver on send_data.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.send
            .send_data(Bytes::new(), true)
            .map_err(h2_io_error)?;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// An in-process egress proxy: accepts CONNECT streams and echoes
    /// their bytes back.
    async fn echo_proxy(io: tokio::io::DuplexStream) {
        let mut connection = h2::server::handshake(io).await.expect("server handshake");
        while let Some(accepted) = connection.accept().await {
            let (request, mut respond) = accepted.expect("accept stream");
            assert_eq!(request.method(), Method::CONNECT);
            assert!(request.uri().authority().is_some());
            tokio::spawn(async move {
                let mut body = request.into_body();
                let response = http::Response::builder().status(200).body(()).unwrap();
                let mut send = respond.send_response(response, false).unwrap();
                loop {
                    let chunk =
                        std::future::poll_fn(|cx| body.poll_data(cx)).await;
                    match chunk {
                        Some(Ok(bytes)) => {
                            let _ = body.flow_control().release_capacity(bytes.len());
                            if send.send_data(bytes, false).is_err() {
                                return;
                            }
                        }
                        _ => {
                            let _ = send.send_data(Bytes::new(), true);
                            return;
                        }
                    }
                }
            });
        }
    }

    async fn connect_pair() -> SendRequest<Bytes> {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        tokio::spawn(echo_proxy(server_io));
        let (sender, connection) = h2::client::handshake(client_io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = connection.await;
        });
        sender
    }

    #[tokio::test]
    async fn connect_stream_carries_bytes_both_ways() {
        let mut sender = connect_pair().await;
        let mut stream = send_connect(&mut sender, "my-cluster").await.unwrap();
        stream.write_all(b"ping over the tunnel").await.unwrap();
        let mut read = vec![0u8; 20];
        stream.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"ping over the tunnel");
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let mut sender = connect_pair().await;
        let mut a = send_connect(&mut sender, "cluster-a").await.unwrap();
        let mut b = send_connect(&mut sender, "cluster-b").await.unwrap();
        a.write_all(b"aaaa").await.unwrap();
        b.write_all(b"bbbb").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bbbb");
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"aaaa");
    }

    #[tokio::test]
    async fn shutdown_ends_the_stream() {
        let mut sender = connect_pair().await;
        let mut stream = send_connect(&mut sender, "my-cluster").await.unwrap();
        stream.write_all(b"bye").await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
