//! Server descriptors.
//!
//! Electrum servers advertise their listeners as a space-separated port
//! string: one token per protocol, a letter code optionally followed
//! by a port number (`"t s50002"`). A bare letter means the protocol's
//! default port.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rpc::{Connector, RpcError, RpcResult, TcpConnector, TlsConnector, TransportStreams};

/// Plain TCP protocol code.
pub const PROTOCOL_TCP: char = 't';

/// TLS protocol code.
pub const PROTOCOL_TLS: char = 's';

/// WebSocket protocol code.
pub const PROTOCOL_WEBSOCKET: char = 'g';

/// Default port when the port string says just `t`.
pub const DEFAULT_TCP_PORT: u16 = 50001;

/// Default port when the port string says just `s`.
pub const DEFAULT_TLS_PORT: u16 = 50002;

/// SOCKS proxy used for onion hosts when none is configured.
pub const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";

/// Default port for a protocol code, if it has one.
pub fn default_port(protocol: char) -> Option<u16> {
    match protocol {
        PROTOCOL_TCP => Some(DEFAULT_TCP_PORT),
        PROTOCOL_TLS => Some(DEFAULT_TLS_PORT),
        _ => None,
    }
}

/// One Electrum server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Display name
    pub nickname: String,

    /// DNS name or onion address
    pub hostname: String,

    /// Port string, e.g. `"t s50002"`
    pub ports: String,

    /// Advertised server software version
    #[serde(default)]
    pub version: Option<String>,

    /// Advertised pruning limit (0 = full history)
    #[serde(default)]
    pub pruning_limit: u32,
}

impl ServerInfo {
    /// Describe a server from its port string.
    pub fn new(
        nickname: impl Into<String>,
        hostname: impl Into<String>,
        ports: impl Into<String>,
    ) -> Self {
        Self {
            nickname: nickname.into(),
            hostname: hostname.into(),
            ports: ports.into(),
            version: None,
            pruning_limit: 0,
        }
    }

    /// Describe a server reachable over plain TCP on `port`.
    pub fn tcp(hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        Self::new(hostname.clone(), hostname, format!("{}{}", PROTOCOL_TCP, port))
    }

    /// Protocol codes this server offers.
    pub fn protocols(&self) -> BTreeSet<char> {
        self.ports
            .split_whitespace()
            .filter_map(|token| token.chars().next())
            .collect()
    }

    /// `(hostname, port)` for a protocol code.
    ///
    /// Assumes one port per protocol; the first matching token wins.
    pub fn get_port(&self, protocol: char) -> Option<(&str, u16)> {
        let token = self
            .ports
            .split_whitespace()
            .find(|token| token.starts_with(protocol))?;

        let digits = &token[protocol.len_utf8()..];
        let port = if digits.is_empty() {
            default_port(protocol)?
        } else {
            digits.parse().ok()?
        };

        Some((self.hostname.as_str(), port))
    }

    /// True for Tor hidden services.
    pub fn is_onion(&self) -> bool {
        self.hostname.to_ascii_lowercase().ends_with(".onion")
    }

    /// Build a connector for one of this server's protocols.
    ///
    /// TCP and TLS are built in; WebSocket needs a connector from the
    /// application. Onion hosts go through [`DEFAULT_TOR_PROXY`] unless
    /// `proxy` says otherwise, and never have their certificates checked.
    pub fn connector(
        &self,
        protocol: char,
        proxy: Option<&str>,
        verify_certificates: bool,
    ) -> RpcResult<ServerConnector> {
        if protocol != PROTOCOL_TCP && protocol != PROTOCOL_TLS {
            return Err(RpcError::UnsupportedProtocol(protocol));
        }

        let (host, port) = self.get_port(protocol).ok_or_else(|| {
            RpcError::InvalidServer(format!("{} does not offer protocol {:?}", self, protocol))
        })?;

        let tcp = TcpConnector::new(host, port);
        let proxy = match proxy {
            Some(proxy) => Some(proxy),
            None if self.is_onion() => Some(DEFAULT_TOR_PROXY),
            None => None,
        };
        let tcp = match proxy {
            Some(proxy) => tcp.with_proxy(proxy),
            None => tcp,
        };

        if protocol == PROTOCOL_TCP {
            return Ok(ServerConnector::Tcp(tcp));
        }

        let verify = verify_certificates && !self.is_onion();
        if verify != verify_certificates {
            debug!(host, "Certificate checks off for onion host");
        }
        Ok(ServerConnector::Tls(TlsConnector::new(tcp, verify)?))
    }
}

/// Connector chosen by [`ServerInfo::connector`].
#[derive(Debug, Clone)]
pub enum ServerConnector {
    /// Plain TCP (`t`)
    Tcp(TcpConnector),
    /// TLS (`s`)
    Tls(TlsConnector),
}

impl ServerConnector {
    /// TCP leg, direct or proxied.
    pub fn tcp(&self) -> &TcpConnector {
        match self {
            ServerConnector::Tcp(tcp) => tcp,
            ServerConnector::Tls(tls) => tls.tcp(),
        }
    }

    /// True when the stream is wrapped in TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, ServerConnector::Tls(_))
    }
}

#[async_trait]
impl Connector for ServerConnector {
    async fn connect(&self) -> RpcResult<TransportStreams> {
        match self {
            ServerConnector::Tcp(tcp) => tcp.connect().await,
            ServerConnector::Tls(tls) => tls.connect().await,
        }
    }

    fn describe(&self) -> String {
        match self {
            ServerConnector::Tcp(tcp) => tcp.describe(),
            ServerConnector::Tls(tls) => tls.describe(),
        }
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.hostname, self.ports)
    }
}
