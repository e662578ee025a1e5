//! Single-settlement result slots.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::error::{RpcError, RpcResult};

/// Producer half of a pending result; consumed on settlement.
pub(crate) type Settler<T> = oneshot::Sender<RpcResult<T>>;

/// Placeholder for a reply that has not arrived yet.
///
/// Resolves exactly once, with the server's result or an [`RpcError`]. If
/// the engine drops the producer without settling (e.g., the client itself
/// was dropped), the result resolves to [`RpcError::ConnectionLost`].
#[derive(Debug)]
#[must_use = "a PendingResult does nothing unless awaited"]
pub struct PendingResult<T> {
    id: u64,
    rx: oneshot::Receiver<RpcResult<T>>,
}

impl<T> PendingResult<T> {
    pub(crate) fn channel(id: u64) -> (Settler<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    /// Id of the request (or first request of a batch) this awaits.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for PendingResult<T> {
    type Output = RpcResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(RpcError::ConnectionLost)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_resolves_with_sent_value() {
        let (tx, pending) = PendingResult::<Value>::channel(9);
        assert_eq!(pending.id(), 9);
        tx.send(Ok(json!("done"))).unwrap();
        assert_eq!(pending.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_dropped_settler_reads_as_connection_lost() {
        let (tx, pending) = PendingResult::<Value>::channel(3);
        drop(tx);
        assert!(pending.await.unwrap_err().is_connection_lost());
    }
}
