//! Connection lifecycle bookkeeping.
//!
//! Holds the one live [`ConnectionHandle`] (if any) and the state machine
//! around it:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Disconnected
//!       ^             |             |
//!       +-------------+-------------+   (failure / peer loss)
//! ```
//!
//! Ordinary traffic is only accepted in `Connected`. While `Connecting` the
//! handle may already exist so the version handshake can go out first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::connection::ConnectionHandle;
use super::error::RpcError;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; the next call connects
    Disconnected,
    /// Connect attempt (or handshake) underway
    Connecting,
    /// Ready for traffic
    Connected,
    /// Explicit close in progress
    Closing,
}

/// Result of trying to queue a line on the live connection.
#[derive(Debug)]
pub(crate) enum SendOutcome {
    /// Handed to the writer task
    Queued,
    /// Nothing ready to send on; line handed back
    NotConnected(Bytes),
    /// Handle exists but its writer has exited
    WriterGone,
}

struct Link {
    state: ConnectionState,
    handle: Option<ConnectionHandle>,
}

/// Summary of a failed connect attempt, replayed to callers that waited on it.
#[derive(Debug, Clone)]
enum Failure {
    Timeout,
    Refused(String),
}

impl Failure {
    fn from_error(error: &RpcError) -> Self {
        match error {
            RpcError::Timeout => Failure::Timeout,
            RpcError::ConnectFailed(reason) => Failure::Refused(reason.clone()),
            other => Failure::Refused(other.to_string()),
        }
    }

    fn to_error(&self) -> RpcError {
        match self {
            Failure::Timeout => RpcError::Timeout,
            Failure::Refused(reason) => RpcError::ConnectFailed(reason.clone()),
        }
    }
}

pub(crate) struct Lifecycle {
    link: Mutex<Link>,

    /// Serializes connect attempts
    connect_lock: tokio::sync::Mutex<()>,

    /// Generation of the most recent connection
    generation: AtomicU64,

    /// Bumped by every explicit close
    close_epoch: AtomicU64,

    /// Completed connect attempts, successful or not
    attempts_finished: AtomicU64,

    last_failure: Mutex<Option<Failure>>,

    last_send: Mutex<Instant>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                handle: None,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            close_epoch: AtomicU64::new(0),
            attempts_finished: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            last_send: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.link.lock().state = state;
    }

    pub fn connect_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.connect_lock
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn close_epoch(&self) -> u64 {
        self.close_epoch.load(Ordering::SeqCst)
    }

    pub fn attempts_finished(&self) -> u64 {
        self.attempts_finished.load(Ordering::SeqCst)
    }

    /// Record the end of a connect attempt. `None` means there is nothing
    /// for waiting callers to replay.
    pub fn finish_attempt(&self, error: Option<&RpcError>) {
        *self.last_failure.lock() = error.map(Failure::from_error);
        self.attempts_finished.fetch_add(1, Ordering::SeqCst);
    }

    /// Error of the last finished attempt, if it failed.
    pub fn last_failure(&self) -> Option<RpcError> {
        self.last_failure.lock().as_ref().map(Failure::to_error)
    }

    /// Queue a line for ordinary traffic.
    pub fn send_ready(&self, line: Bytes) -> SendOutcome {
        let link = self.link.lock();
        match (&link.handle, link.state) {
            (Some(handle), ConnectionState::Connected) => {
                if handle.send(line) {
                    self.touch();
                    SendOutcome::Queued
                } else {
                    SendOutcome::WriterGone
                }
            }
            _ => SendOutcome::NotConnected(line),
        }
    }

    /// Queue a line on whatever handle exists, ready or not.
    pub fn send_any(&self, line: Bytes) -> bool {
        let link = self.link.lock();
        match &link.handle {
            Some(handle) if handle.send(line) => {
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Adopt a freshly spawned connection. State stays `Connecting`.
    pub fn install(&self, handle: ConnectionHandle) {
        let mut link = self.link.lock();
        link.handle = Some(handle);
        link.state = ConnectionState::Connecting;
        self.touch();
    }

    /// Open connection `generation` to ordinary traffic.
    ///
    /// Fails if that connection has already gone away.
    pub fn mark_connected(&self, generation: u64) -> bool {
        let mut link = self.link.lock();
        if link.handle.as_ref().map(ConnectionHandle::generation) != Some(generation) {
            return false;
        }
        link.state = ConnectionState::Connected;
        true
    }

    /// Detach connection `generation` if it is still the current one.
    pub fn take_if_current(&self, generation: u64) -> Option<ConnectionHandle> {
        let mut link = self.link.lock();
        if link.handle.as_ref().map(ConnectionHandle::generation) != Some(generation) {
            return None;
        }
        link.state = ConnectionState::Disconnected;
        link.handle.take()
    }

    /// Begin an explicit close: bump the epoch so an in-flight connect
    /// attempt discards its result, and detach the current connection.
    pub fn begin_close(&self) -> Option<ConnectionHandle> {
        self.close_epoch.fetch_add(1, Ordering::SeqCst);
        let mut link = self.link.lock();
        link.state = ConnectionState::Closing;
        link.handle.take()
    }

    pub fn finish_close(&self) {
        let mut link = self.link.lock();
        if link.state == ConnectionState::Closing {
            link.state = ConnectionState::Disconnected;
        }
    }

    /// Note outbound traffic for keepalive purposes.
    pub fn touch(&self) {
        *self.last_send.lock() = Instant::now();
    }

    /// Time since the last outbound line.
    pub fn idle_for(&self) -> Duration {
        self.last_send.lock().elapsed()
    }
}
