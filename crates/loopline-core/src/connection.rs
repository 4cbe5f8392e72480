//! Connection manager.
//!
//! Owns the table of live connections: their resolved peer identity,
//! timestamps, per-connection counters, and lifecycle state. The server
//! registers each authenticated connection here and holds the returned
//! [`ConnectionGuard`] for as long as the connection task runs; dropping the
//! guard removes the entry, so a connection is never left in the table after
//! its task ends, however it ends.

use crate::error::{IpcError, Result};
use crate::peer::PeerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

pub type ConnectionId = u64;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    /// Shutdown has begun; no further requests are read.
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }
}

/// Live state of one connection. Counters are atomics so request tasks can
/// update them without taking the table lock.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    peer: PeerIdentity,
    created_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    state: AtomicU8,
    requests_total: AtomicU64,
    requests_rejected: AtomicU64,
    in_flight: AtomicU64,
}

impl ConnectionRecord {
    fn new(id: ConnectionId, peer: PeerIdentity) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer,
            created_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            requests_total: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn begin_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let last_activity_ms = self.last_activity_ms.load(Ordering::Relaxed);
        ConnectionSnapshot {
            id: self.id,
            peer: self.peer.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_activity: DateTime::from_timestamp_millis(last_activity_ms)
                .unwrap_or(self.created_at),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

/// Point-in-time view of a connection, safe to hand to route handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer: PeerIdentity,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub requests_total: u64,
    pub requests_rejected: u64,
    pub in_flight: u64,
}

/// Table of live connections plus the shutdown signal they observe.
#[derive(Debug)]
pub struct ConnectionManager {
    max_connections: usize,
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    shutdown_tx: watch::Sender<bool>,
    emptied: Notify,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            max_connections,
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            shutdown_tx,
            emptied: Notify::new(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Add a connection to the table.
    ///
    /// Fails with `SERVICE_UNAVAILABLE` when the table is full or shutdown
    /// has begun.
    pub fn register(self: &Arc<Self>, peer: PeerIdentity) -> Result<ConnectionGuard> {
        if self.is_shutting_down() {
            return Err(IpcError::Unavailable {
                message: "Server is shutting down".to_string(),
            });
        }

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.len() >= self.max_connections {
            return Err(IpcError::Unavailable {
                message: format!("Connection limit of {} reached", self.max_connections),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ConnectionRecord::new(id, peer));
        connections.insert(id, record.clone());
        debug!(
            "Registered connection {} (pid {}), {} active",
            id,
            record.peer.pid,
            connections.len()
        );

        Ok(ConnectionGuard {
            manager: self.clone(),
            record,
        })
    }

    fn unregister(&self, id: ConnectionId) {
        let remaining = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.remove(&id);
            connections.len()
        };
        debug!("Unregistered connection {}, {} active", id, remaining);
        if remaining == 0 {
            self.emptied.notify_waiters();
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|record| record.snapshot())
    }

    /// Snapshots of all live connections, ordered by id.
    pub fn list(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<_> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|record| record.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn active_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn in_flight_total(&self) -> u64 {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|record| record.in_flight())
            .sum()
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Mark every connection closing and tell their tasks to stop reading.
    pub fn begin_shutdown(&self) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for record in connections.values() {
            record.set_state(ConnectionState::Closing);
        }
        info!(
            "Closing {} connection(s), {} request(s) in flight",
            connections.len(),
            connections.values().map(|r| r.in_flight()).sum::<u64>()
        );
        drop(connections);
        self.shutdown_tx.send_replace(true);
    }

    /// Wait until the table is empty or `timeout` elapses.
    ///
    /// Returns `true` if every connection closed in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.emptied.notified();
                tokio::pin!(notified);
                // Register interest before checking, so an unregister between
                // the check and the await is not missed.
                notified.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Registration handle held by a connection task.
#[derive(Debug)]
pub struct ConnectionGuard {
    manager: Arc<ConnectionManager>,
    record: Arc<ConnectionRecord>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.record.id
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.record.set_state(ConnectionState::Closed);
        self.manager.unregister(self.record.id);
    }
}
