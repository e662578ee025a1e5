//! Electrum Stratum JSON-RPC client engine.
//!
//! Electrum servers speak newline-delimited JSON-RPC over a single long-lived
//! stream. One connection carries three kinds of traffic at once:
//!
//! - **Calls**: `{"id", "method", "params"}` answered by `{"id", "result"}` or
//!   `{"id", "error"}`, in whatever order the server likes
//! - **Batches**: an array of calls answered by an array of replies
//! - **Subscriptions**: a call whose reply is followed by any number of
//!   notifications `{"method", "params"}` with no id
//!
//! # Architecture
//!
//! [`StratumClient`] is the façade. A call validates the method name,
//! registers a [`PendingResult`] in the correlation table, and hands the
//! encoded line to the connection's writer task, connecting on demand. The
//! reader task frames inbound bytes with [`LineFramer`] and routes each
//! message to the correlation table (replies) or the subscription registry
//! (notifications). When the connection dies everything still outstanding
//! fails with [`RpcError::ConnectionLost`] and every [`Subscription`] ends;
//! nothing is resent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_rpc::rpc::{ClientConfig, StratumClient, TcpConnector, TlsConnector};
//!
//! let tcp = TcpConnector::new("electrum.example.org", 50002);
//! let client = StratumClient::new(TlsConnector::new(tcp, true)?, ClientConfig::default());
//!
//! let fee = client.call("blockchain.estimatefee", vec![json!(6)])?.await?;
//!
//! let (tip, mut headers) = client.subscribe("blockchain.headers.subscribe", vec![])?;
//! println!("tip: {}", tip.await?);
//! while let Some(header) = headers.recv().await {
//!     println!("new header: {}", header);
//! }
//! ```

mod client;
mod connection;
mod correlation;
mod error;
mod framer;
mod lifecycle;
mod messages;
mod method;
mod pending;
mod subscriptions;
mod tls;
mod transport;

pub use client::{ClientConfig, ClientStats, ServerVersion, StratumClient};
pub use correlation::{CorrelationTable, SettleOutcome};
pub use error::{FramingError, RpcError, RpcResult, ServerError};
pub use framer::{DEFAULT_MAX_LINE_LENGTH, Decoded, LineFramer};
pub use lifecycle::ConnectionState;
pub use messages::{ClientEvent, Inbound, Notification, Request, Response, ShapeError};
pub use method::{MethodPath, is_subscription, validate_method};
pub use pending::PendingResult;
pub use subscriptions::{ListenerId, Subscription, SubscriptionRegistry};
pub use tls::TlsConnector;
pub use transport::{BoxedReader, BoxedWriter, Connector, TcpConnector, TransportStreams};
