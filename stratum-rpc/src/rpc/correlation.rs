//! Correlation of responses with outstanding requests.
//!
//! Every request the client sends is registered here under its id before it
//! goes out. A batch is registered once, under the id of its first request,
//! and carries the full ordered request list so replies can be matched back
//! no matter how the server orders or trims them.
//!
//! A subscribe request also records its listener. If the request fails, the
//! listener is dropped from the registry so the caller's stream ends rather
//! than waiting on a subscription the server never accepted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::error::{RpcError, RpcResult, ServerError};
use super::messages::{Request, Response};
use super::pending::{PendingResult, Settler};
use super::subscriptions::{ListenerId, SubscriptionRegistry};

/// Outcome of routing one inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Pending result fulfilled
    Fulfilled,
    /// Pending result rejected with a server error
    Rejected,
    /// Slot existed but its caller had stopped waiting
    CallerGone,
    /// No outstanding request with this id
    UnknownId(u64),
}

enum Slot {
    Call {
        request: Request,
        tx: Settler<Value>,
        listener: Option<ListenerId>,
    },
    Batch {
        requests: Vec<Request>,
        tx: Settler<Vec<Value>>,
    },
}

#[derive(Default)]
struct Entries {
    slots: HashMap<u64, Slot>,

    /// Batch member id (other than the first) -> batch key
    aliases: HashMap<u64, u64>,
}

impl Entries {
    fn resolve(&self, id: u64) -> Option<u64> {
        if self.slots.contains_key(&id) {
            Some(id)
        } else {
            self.aliases.get(&id).copied()
        }
    }

    fn take(&mut self, key: u64) -> Option<Slot> {
        let slot = self.slots.remove(&key)?;
        if let Slot::Batch { requests, .. } = &slot {
            for request in requests.iter().skip(1) {
                self.aliases.remove(&request.id);
            }
        }
        Some(slot)
    }
}

/// Outstanding requests keyed by id.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<Entries>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl CorrelationTable {
    /// Create an empty table with a registry of its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table that releases listeners from `subscriptions`.
    pub fn with_registry(subscriptions: Arc<SubscriptionRegistry>) -> Self {
        Self {
            entries: Mutex::default(),
            subscriptions,
        }
    }

    /// Register a single request.
    pub fn register_call(&self, request: Request) -> RpcResult<PendingResult<Value>> {
        self.register_single(request, None)
    }

    /// Register a subscribe request whose failure should drop `listener`.
    pub fn register_subscription(
        &self,
        request: Request,
        listener: ListenerId,
    ) -> RpcResult<PendingResult<Value>> {
        self.register_single(request, Some(listener))
    }

    fn register_single(
        &self,
        request: Request,
        listener: Option<ListenerId>,
    ) -> RpcResult<PendingResult<Value>> {
        let id = request.id;
        let mut entries = self.entries.lock();
        if entries.resolve(id).is_some() {
            return Err(RpcError::DuplicateId(id));
        }

        let (tx, pending) = PendingResult::channel(id);
        entries.slots.insert(
            id,
            Slot::Call {
                request,
                tx,
                listener,
            },
        );
        Ok(pending)
    }

    /// Register a batch under the id of its first request.
    ///
    /// Every member id is indexed, so a reply that leaves out the first
    /// request still finds the batch.
    pub fn register_batch(&self, requests: Vec<Request>) -> RpcResult<PendingResult<Vec<Value>>> {
        let key = requests.first().map(|r| r.id).ok_or(RpcError::EmptyBatch)?;

        let mut entries = self.entries.lock();
        let mut seen = HashSet::with_capacity(requests.len());
        for request in &requests {
            if entries.resolve(request.id).is_some() || !seen.insert(request.id) {
                return Err(RpcError::DuplicateId(request.id));
            }
        }

        for request in requests.iter().skip(1) {
            entries.aliases.insert(request.id, key);
        }
        let (tx, pending) = PendingResult::channel(key);
        entries.slots.insert(key, Slot::Batch { requests, tx });
        Ok(pending)
    }

    /// Route a single response object.
    pub fn settle(&self, response: Response) -> SettleOutcome {
        let slot = {
            let mut entries = self.entries.lock();
            entries.resolve(response.id).and_then(|key| entries.take(key))
        };

        match slot {
            Some(Slot::Call {
                request,
                tx,
                listener,
            }) => {
                if response.error.is_some() {
                    self.release_listener(&request, listener);
                }
                complete_call(request, tx, response)
            }
            // A lone object for a batch member; the rest count as missing
            Some(Slot::Batch { requests, tx }) => complete_batch(requests, tx, vec![response]),
            None => {
                warn!(msg_id = response.id, "Response for unknown request id");
                SettleOutcome::UnknownId(response.id)
            }
        }
    }

    /// Route an array of responses.
    ///
    /// The first response whose id belongs to an outstanding entry selects
    /// it; the rest of the array is matched against that entry's requests.
    pub fn settle_batch(&self, mut responses: Vec<Response>) -> SettleOutcome {
        let found = {
            let mut entries = self.entries.lock();
            responses
                .iter()
                .enumerate()
                .find_map(|(idx, r)| entries.resolve(r.id).map(|key| (idx, key)))
                .and_then(|(idx, key)| entries.take(key).map(|slot| (idx, slot)))
        };

        match found {
            Some((_, Slot::Batch { requests, tx })) => complete_batch(requests, tx, responses),
            Some((
                idx,
                Slot::Call {
                    request,
                    tx,
                    listener,
                },
            )) => {
                debug!(msg_id = request.id, "Batch-shaped reply for a single request");
                let response = responses.swap_remove(idx);
                if response.error.is_some() {
                    self.release_listener(&request, listener);
                }
                complete_call(request, tx, response)
            }
            None => {
                let id = responses.first().map_or(0, |r| r.id);
                warn!(msg_id = id, "Batch reply with no known request id");
                SettleOutcome::UnknownId(id)
            }
        }
    }

    /// Reject one outstanding request with a connection-lost error.
    ///
    /// Returns false if the id was not outstanding.
    pub fn abandon(&self, id: u64) -> bool {
        self.reject(id, RpcError::ConnectionLost)
    }

    /// Reject one outstanding entry with `error`.
    ///
    /// Used when the request never made it onto the wire, e.g. the connect
    /// attempt it was waiting on failed.
    pub fn reject(&self, id: u64, error: RpcError) -> bool {
        let slot = {
            let mut entries = self.entries.lock();
            entries.resolve(id).and_then(|key| entries.take(key))
        };
        match slot {
            Some(slot) => {
                self.reject_slot(slot, error);
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request with a connection-lost error.
    ///
    /// Returns the number of entries abandoned.
    pub fn abandon_all(&self) -> usize {
        self.abandon_through(u64::MAX)
    }

    /// Reject, with a connection-lost error, every entry whose key is at
    /// most `last_id`. Ids only grow, so entries registered after `last_id`
    /// was handed out are left alone.
    pub fn abandon_through(&self, last_id: u64) -> usize {
        let drained: Vec<Slot> = {
            let mut entries = self.entries.lock();
            let keys: Vec<u64> = entries
                .slots
                .keys()
                .copied()
                .filter(|key| *key <= last_id)
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.take(key))
                .collect()
        };
        let count = drained.len();
        for slot in drained {
            self.reject_slot(slot, RpcError::ConnectionLost);
        }
        if count > 0 {
            debug!(count, "Abandoned in-flight requests");
        }
        count
    }

    /// Number of outstanding entries (a batch counts once).
    pub fn len(&self) -> usize {
        self.entries.lock().slots.len()
    }

    /// True if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().slots.is_empty()
    }

    /// True if `id` belongs to an outstanding entry.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().resolve(id).is_some()
    }

    fn reject_slot(&self, slot: Slot, error: RpcError) {
        // Receivers that were dropped simply miss the notice
        match slot {
            Slot::Call {
                request,
                tx,
                listener,
            } => {
                self.release_listener(&request, listener);
                let _ = tx.send(Err(error));
            }
            Slot::Batch { tx, .. } => {
                let _ = tx.send(Err(error));
            }
        }
    }

    /// Drop the listener of a subscribe request that failed.
    fn release_listener(&self, request: &Request, listener: Option<ListenerId>) {
        if let Some(id) = listener {
            if self.subscriptions.unsubscribe(&request.method, id) {
                debug!(method = %request.method, "Dropped listener of failed subscription");
            }
        }
    }
}

fn delivered<T>(sent: Result<(), T>, ok: SettleOutcome) -> SettleOutcome {
    match sent {
        Ok(()) => ok,
        Err(_) => SettleOutcome::CallerGone,
    }
}

fn complete_call(request: Request, tx: Settler<Value>, response: Response) -> SettleOutcome {
    trace!(msg_id = request.id, method = %request.method, "Settling call");

    match response.error {
        Some(error) => {
            debug!(method = %request.method, error = %error, "Error response");
            let err = RpcError::Server {
                error: ServerError(error),
                request: Box::new(request),
            };
            delivered(tx.send(Err(err)), SettleOutcome::Rejected)
        }
        None => {
            let result = response.result.unwrap_or(Value::Null);
            delivered(tx.send(Ok(result)), SettleOutcome::Fulfilled)
        }
    }
}

fn complete_batch(
    requests: Vec<Request>,
    tx: Settler<Vec<Value>>,
    responses: Vec<Response>,
) -> SettleOutcome {
    let mut by_id: HashMap<u64, Response> = responses.into_iter().map(|r| (r.id, r)).collect();
    let mut results = Vec::with_capacity(requests.len());

    for request in requests {
        match by_id.remove(&request.id) {
            Some(Response {
                error: Some(error), ..
            }) => {
                // All-or-nothing: the first failing item rejects the batch
                debug!(method = %request.method, error = %error, "Error response in batch");
                let err = RpcError::Server {
                    error: ServerError(error),
                    request: Box::new(request),
                };
                return delivered(tx.send(Err(err)), SettleOutcome::Rejected);
            }
            Some(response) => results.push(response.result.unwrap_or(Value::Null)),
            None => {
                warn!(msg_id = request.id, "Batch reply missing request id");
                results.push(Value::Null);
            }
        }
    }

    if !by_id.is_empty() {
        warn!(extra = by_id.len(), "Batch reply carried ids outside the batch");
    }

    delivered(tx.send(Ok(results)), SettleOutcome::Fulfilled)
}
