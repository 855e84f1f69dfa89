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

//! Turning a [`ClusterAccess`] into a ready upstream transport.
//!
//! The build step materialises credentials (running the exec issuer through
//! the cache for `Dynamic` records) and resolves the endpoint into a
//! concrete dial plan; `connect` then executes that plan: TCP (optionally
//! through an intermediate HTTP CONNECT or SOCKS5 proxy) or a tunnel
//! stream, TLS on top, and an HTTP/1.1 handshake with upgrades enabled.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::access::{ClusterAccess, ClusterEndpoint, Credential};
use crate::config::UPSTREAM_TIMEOUT;
use crate::credential::{CredentialCache, IssueError};
use crate::identity::Impersonation;
use crate::tls;
use crate::tunnel::TunnelDialer;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("cluster {0} requires the egress tunnel but no cluster proxy is configured")]
    TunnelNotConfigured(String),
    #[error("materialising credential: {0}")]
    Credential(#[from] IssueError),
    #[error("tls: {0}")]
    Tls(#[from] tls::Error),
    #[error("invalid endpoint url {0:?}")]
    InvalidEndpoint(String),
    #[error("invalid proxy url {0:?}: {1}")]
    InvalidProxy(String, String),
    #[error("tunnel: {0}")]
    Tunnel(#[from] crate::tunnel::Error),
    #[error("dialing upstream: {0}")]
    Io(#[from] std::io::Error),
    #[error("intermediate proxy refused CONNECT: {0}")]
    ProxyConnect(String),
    #[error("upstream handshake: {0}")]
    Handshake(#[from] hyper::Error),
}

/// The resolved transport for one request: endpoint, verification mode,
/// materialised credential and dial plan.
#[derive(Clone)]
pub struct TransportConfig {
    /// Endpoint address for `Const`, bare cluster name for `Tunnel`.
    pub host: String,
    /// TLS server name: the endpoint hostname without its port, or the
    /// cluster name for tunnelled egress.
    pub server_name: String,
    pub ca_data: Option<Vec<u8>>,
    pub insecure: bool,
    pub bearer_token: Option<String>,
    pub cert_data: Option<Vec<u8>>,
    pub key_data: Option<Vec<u8>>,
    pub proxy_url: Option<String>,
    pub tunnel: Option<TunnelDialer>,
    pub impersonation: Option<Impersonation>,
    pub timeout: Duration,
}

impl TransportConfig {
    /// The URI scheme requests are issued under.
    pub fn scheme(&self) -> &'static str {
        if self.tunnel.is_some() {
            return "https";
        }
        if self.host.starts_with("http://") {
            "http"
        } else {
            "https"
        }
    }

    /// Host header value: the endpoint host without its port.
    pub fn host_header(&self) -> &str {
        &self.server_name
    }

    fn target(&self) -> Result<(String, u16), TransportError> {
        if self.tunnel.is_some() {
            return Ok((self.host.clone(), 443));
        }
        let uri: Uri = self
            .host
            .parse()
            .map_err(|_| TransportError::InvalidEndpoint(self.host.clone()))?;
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidEndpoint(self.host.clone()))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if self.scheme() == "http" { 80 } else { 443 });
        Ok((host, port))
    }

    /// Base path carried by the endpoint URL, prepended to every proxied
    /// request path.
    pub fn base_path(&self) -> String {
        if self.tunnel.is_some() {
            return String::new();
        }
        match self.host.parse::<Uri>() {
            Ok(uri) => uri.path().trim_end_matches('/').to_string(),
            Err(_) => String::new(),
        }
    }

    /// Establish a connection and perform the HTTP/1.1 handshake. The
    /// driver task is spawned with upgrades enabled; dropping the returned
    /// sender tears the connection down.
    pub async fn connect<B>(&self) -> Result<http1::SendRequest<B>, TransportError>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let io = self.dial().await?;
        let (sender, connection) = http1::Builder::new()
            .preserve_header_case(true)
            .handshake(TokioIo::new(io))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!("upstream connection ended: {e}");
            }
        });
        Ok(sender)
    }

    async fn dial(&self) -> Result<BoxedIo, TransportError> {
        let (host, port) = self.target()?;
        let raw: BoxedIo = match &self.tunnel {
            Some(dialer) => BoxedIo::new(dialer.dial(&self.host).await?),
            None => match &self.proxy_url {
                Some(proxy) => dial_via_proxy(proxy, &host, port).await?,
                None => {
                    let tcp = TcpStream::connect((host.as_str(), port)).await?;
                    tcp.set_nodelay(true)?;
                    BoxedIo::new(tcp)
                }
            },
        };
        if self.scheme() == "http" {
            return Ok(raw);
        }
        let verification = if self.insecure {
            tls::ServerVerification::Insecure
        } else {
            let ca = self
                .ca_data
                .clone()
                .ok_or_else(|| TransportError::InvalidEndpoint(self.host.clone()))?;
            tls::ServerVerification::CaBundle(ca)
        };
        let client_pair = match (&self.cert_data, &self.key_data) {
            (Some(cert), Some(key)) => Some((cert.as_slice(), key.as_slice())),
            _ => None,
        };
        let config = tls::client_config(&verification, client_pair)?;
        let stream = TlsConnector::from(Arc::new(config))
            .connect(tls::server_name(&self.server_name)?, raw)
            .await?;
        Ok(BoxedIo::new(stream))
    }
}

/// Type-erased byte stream: TCP, a tunnel stream, or a TLS session over
/// either.
pub struct BoxedIo(Pin<Box<dyn Io + Send>>);

trait Io: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> Io for T {}

impl BoxedIo {
    fn new<T: AsyncRead + AsyncWrite + Send + 'static>(io: T) -> Self {
        BoxedIo(Box::pin(io))
    }
}

impl AsyncRead for BoxedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_shutdown(cx)
    }
}

/// Builds transports for access records. Holds the process-wide credential
/// cache and the shared tunnel handle.
pub struct TransportBuilder {
    credentials: Arc<CredentialCache>,
    tunnel: Option<TunnelDialer>,
}

impl TransportBuilder {
    pub fn new(credentials: Arc<CredentialCache>, tunnel: Option<TunnelDialer>) -> Self {
        TransportBuilder {
            credentials,
            tunnel,
        }
    }

    pub async fn build(&self, access: &ClusterAccess) -> Result<TransportConfig, TransportError> {
        let mut config = match &access.endpoint {
            ClusterEndpoint::Const(endpoint) => {
                let uri: Uri = endpoint
                    .address
                    .parse()
                    .map_err(|_| TransportError::InvalidEndpoint(endpoint.address.clone()))?;
                let server_name = uri
                    .host()
                    .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.address.clone()))?
                    .to_string();
                TransportConfig {
                    host: endpoint.address.clone(),
                    server_name,
                    ca_data: endpoint.ca_bundle.clone(),
                    insecure: endpoint.insecure,
                    bearer_token: None,
                    cert_data: None,
                    key_data: None,
                    proxy_url: endpoint.proxy_url.clone(),
                    tunnel: None,
                    impersonation: None,
                    timeout: UPSTREAM_TIMEOUT,
                }
            }
            ClusterEndpoint::Tunnel => {
                let dialer = self
                    .tunnel
                    .clone()
                    .ok_or_else(|| TransportError::TunnelNotConfigured(access.name.clone()))?;
                TransportConfig {
                    host: access.name.clone(),
                    server_name: access.name.clone(),
                    ca_data: None,
                    insecure: true,
                    bearer_token: None,
                    cert_data: None,
                    key_data: None,
                    proxy_url: None,
                    tunnel: Some(dialer),
                    impersonation: None,
                    timeout: UPSTREAM_TIMEOUT,
                }
            }
        };

        match &access.credential {
            Credential::Token(token) => config.bearer_token = Some(token.clone()),
            Credential::X509 { cert, key } => {
                config.cert_data = Some(cert.clone());
                config.key_data = Some(key.clone());
            }
            Credential::Dynamic(spec) => {
                let issued = self.credentials.get(&access.name, spec).await?;
                if let Some(token) = issued.token {
                    config.bearer_token = Some(token);
                }
                if let (Some(cert), Some(key)) = (issued.client_cert, issued.client_key) {
                    config.cert_data = Some(cert);
                    config.key_data = Some(key);
                }
            }
        }
        Ok(config)
    }
}

async fn dial_via_proxy(
    proxy: &str,
    target_host: &str,
    target_port: u16,
) -> Result<BoxedIo, TransportError> {
    let uri: Uri = proxy
        .parse()
        .map_err(|e: http::uri::InvalidUri| TransportError::InvalidProxy(proxy.into(), e.to_string()))?;
    let scheme = uri.scheme_str().unwrap_or("http");
    let proxy_host = uri
        .host()
        .ok_or_else(|| TransportError::InvalidProxy(proxy.into(), "no host".into()))?;
    let proxy_port = uri.port_u16().unwrap_or(match scheme {
        "socks5" => 1080,
        _ => 80,
    });
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
    stream.set_nodelay(true)?;
    match scheme {
        "http" => {
            http_connect(&mut stream, target_host, target_port).await?;
            Ok(BoxedIo::new(stream))
        }
        "socks5" => {
            socks5_connect(&mut stream, target_host, target_port).await?;
            Ok(BoxedIo::new(stream))
        }
        other => Err(TransportError::InvalidProxy(
            proxy.into(),
            format!("unsupported scheme {other:?}"),
        )),
    }
}

/// Minimal HTTP CONNECT handshake against an intermediate proxy.
async fn http_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), TransportError> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8 * 1024 {
            return Err(TransportError::ProxyConnect("oversized response".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::ProxyConnect("connection closed".into()));
        }
        response.push(byte[0]);
    }
    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(|l| String::from_utf8_lossy(l).to_string())
        .unwrap_or_default();
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .map(|code| code == "200")
        .unwrap_or(false);
    if !ok {
        return Err(TransportError::ProxyConnect(status_line));
    }
    Ok(())
}

/// Minimal no-auth SOCKS5 CONNECT with a domain-name target.
async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), TransportError> {
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x00] {
        return Err(TransportError::ProxyConnect(
            "socks5 proxy requires authentication".into(),
        ));
    }
    if host.len() > 255 {
        return Err(TransportError::ProxyConnect("hostname too long".into()));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(TransportError::ProxyConnect(format!(
            "socks5 reply code {}",
            reply[1]
        )));
    }
    // Drain the bound address the proxy reports.
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(TransportError::ProxyConnect(format!(
                "socks5 address type {other}"
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}
