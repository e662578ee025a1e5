//! Byte-stream transports.
//!
//! The engine only needs a readable and a writable half of some stream. A
//! [`Connector`] produces a fresh pair each time the client (re)connects, so
//! the same client can run over TCP, TCP through a SOCKS5 proxy, or
//! in-memory pipes (tests). [`TlsConnector`](super::TlsConnector) layers
//! TLS over the same TCP path.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::{RpcError, RpcResult};

/// Readable half of a transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established byte stream.
pub struct TransportStreams {
    /// Inbound bytes
    pub reader: BoxedReader,
    /// Outbound bytes
    pub writer: BoxedWriter,
    /// Address of the directly connected peer, if known
    pub peer: Option<SocketAddr>,
}

impl TransportStreams {
    /// Split any bidirectional stream into boxed halves.
    pub fn from_stream<S>(stream: S, peer: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        }
    }
}

impl std::fmt::Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Establishes byte streams to one server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new stream. Called once per (re)connect.
    async fn connect(&self) -> RpcResult<TransportStreams>;

    /// Human-readable destination, for logs.
    fn describe(&self) -> String;
}

/// Plain TCP connector, optionally through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    proxy: Option<String>,
}

impl TcpConnector {
    /// Connect directly to `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            proxy: None,
        }
    }

    /// Route through a SOCKS5 proxy (`host:port`). The destination hostname
    /// is resolved by the proxy, which is what Tor needs for onion hosts.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Destination host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Configured proxy, if any.
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Open the raw TCP stream, tunnelling through the proxy if set.
    pub(crate) async fn open(&self) -> RpcResult<TcpStream> {
        let stream = match &self.proxy {
            Some(proxy) => {
                debug!(
                    proxy = %proxy,
                    host = %self.host,
                    port = self.port,
                    "Connecting via SOCKS5"
                );
                let mut stream = TcpStream::connect(proxy.as_str())
                    .await
                    .map_err(|e| RpcError::ConnectFailed(format!("proxy {}: {}", proxy, e)))?;
                socks5_handshake(&mut stream, &self.host, self.port).await?;
                stream
            }
            None => {
                debug!(host = %self.host, port = self.port, "Connecting");
                TcpStream::connect((self.host.as_str(), self.port))
                    .await
                    .map_err(|e| RpcError::ConnectFailed(e.to_string()))?
            }
        };

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> RpcResult<TransportStreams> {
        let stream = self.open().await?;
        let peer = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        Ok(TransportStreams {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        })
    }

    fn describe(&self) -> String {
        match &self.proxy {
            Some(proxy) => format!("{}:{} via {}", self.host, self.port, proxy),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

/// Negotiate a SOCKS5 CONNECT (RFC 1928) with no authentication and
/// proxy-side name resolution.
pub(crate) async fn socks5_handshake<S>(stream: &mut S, host: &str, port: u16) -> RpcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_len = u8::try_from(host.len())
        .map_err(|_| RpcError::Proxy(format!("hostname too long: {} bytes", host.len())))?;

    // Greeting: one method offered, "no authentication"
    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        return Err(RpcError::Proxy(format!(
            "proxy refused no-auth method: {:02x?}",
            choice
        )));
    }

    // CONNECT request with a domain-name destination
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[
        SOCKS_VERSION,
        SOCKS_CMD_CONNECT,
        0x00,
        SOCKS_ATYP_DOMAIN,
        host_len,
    ]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(RpcError::Proxy(format!("bad reply version {:#04x}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(RpcError::Proxy(socks5_reply_reason(reply[1]).to_string()));
    }

    // Skip the bound address; we have no use for it
    let addr_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(RpcError::Proxy(format!("bad address type {:#04x}", other)));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    debug!(host, port, "SOCKS5 tunnel established");
    Ok(())
}

fn socks5_reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS error",
    }
}
