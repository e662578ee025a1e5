//! Method names.
//!
//! Electrum methods are dotted identifiers (`server.version`,
//! `blockchain.headers.subscribe`). [`MethodPath`] builds one segment at a
//! time and issues it against a client.

use serde_json::Value;

use super::client::StratumClient;
use super::error::{RpcError, RpcResult};
use super::pending::PendingResult;
use super::subscriptions::Subscription;

/// Check that `method` is a dotted identifier with at least two segments.
pub fn validate_method(method: &str) -> RpcResult<()> {
    let valid_segment = |segment: &str| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };

    if method.contains('.') && method.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err(RpcError::InvalidMethod(method.to_string()))
    }
}

/// True for methods that open a notification stream.
pub fn is_subscription(method: &str) -> bool {
    method.ends_with("subscribe") && !method.ends_with("unsubscribe")
}

/// Dotted method name under construction.
///
/// ```no_run
/// # async fn demo(client: stratum_rpc::rpc::StratumClient) -> stratum_rpc::rpc::RpcResult<()> {
/// let tip = client
///     .method("blockchain")
///     .push("headers")
///     .push("subscribe")
///     .subscribe(vec![])?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
#[must_use]
pub struct MethodPath<'a> {
    client: &'a StratumClient,
    path: String,
}

impl<'a> MethodPath<'a> {
    pub(crate) fn new(client: &'a StratumClient, segment: &str) -> Self {
        Self {
            client,
            path: segment.to_string(),
        }
    }

    /// Append one segment.
    pub fn push(mut self, segment: &str) -> Self {
        self.path.push('.');
        self.path.push_str(segment);
        self
    }

    /// Method name built so far.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Issue the method as an ordinary call.
    pub fn call(self, params: Vec<Value>) -> RpcResult<PendingResult<Value>> {
        self.client.call(&self.path, params)
    }

    /// Issue the method as a subscription.
    pub fn subscribe(self, params: Vec<Value>) -> RpcResult<(PendingResult<Value>, Subscription)> {
        self.client.subscribe(&self.path, params)
    }
}

impl std::fmt::Debug for MethodPath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MethodPath").field(&self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("server.version" ; "two segments")]
    #[test_case("blockchain.scripthash.get_history" ; "underscore")]
    #[test_case("blockchain.headers.subscribe" ; "subscription")]
    #[test_case("mempool.get_fee_histogram" ; "mempool")]
    fn test_valid_method(method: &str) {
        assert!(validate_method(method).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("ping" ; "no dot")]
    #[test_case("server." ; "trailing dot")]
    #[test_case(".version" ; "leading dot")]
    #[test_case("server..version" ; "empty segment")]
    #[test_case("server.ver sion" ; "whitespace")]
    fn test_invalid_method(method: &str) {
        assert!(matches!(validate_method(method), Err(RpcError::InvalidMethod(m)) if m == method));
    }

    #[test_case("server.peers.subscribe", true)]
    #[test_case("blockchain.scripthash.subscribe", true)]
    #[test_case("blockchain.scripthash.unsubscribe", false)]
    #[test_case("server.version", false)]
    fn test_is_subscription(method: &str, expected: bool) {
        assert_eq!(is_subscription(method), expected);
    }
}
