//! Live mapping bookkeeping for each forwarding rule.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;
use tokio::sync::{oneshot, Notify, RwLock};

use crate::config::ForwardingRule;
use crate::error::ForwardingError;

/// Stable identifier of a mapping within its forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(pub u64);

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Byte counters shared between a mapping's copy tasks and the live set.
#[derive(Debug, Default)]
pub struct MappingCounters {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl MappingCounters {
    pub fn add_up(&self, n: usize) {
        self.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: usize) {
        self.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

struct MappingEntry {
    peer: SocketAddr,
    opened_at: SystemTime,
    established: bool,
    counters: Arc<MappingCounters>,
    /// Taken when the mapping is asked to close
    close_tx: Option<oneshot::Sender<()>>,
}

/// Snapshot of one live mapping.
#[derive(Debug, Clone)]
pub struct MappingInfo {
    pub id: MappingId,
    pub peer: SocketAddr,
    pub opened_at: SystemTime,
    pub established: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Handed to a mapping when it enters the live set.
pub struct Registration {
    pub id: MappingId,
    pub close_rx: oneshot::Receiver<()>,
    pub counters: Arc<MappingCounters>,
}

/// Listener address and live mappings of one forwarding rule.
pub struct ForwardingState {
    pub label: String,
    pub local_addr: String,
    pub server_addr: String,
    pub remote_addr: String,
    listener_addr: RwLock<Option<SocketAddr>>,
    next_id: AtomicU64,
    mappings: RwLock<BTreeMap<MappingId, MappingEntry>>,
    /// Signalled whenever the live set becomes empty
    idle: Notify,
}

impl ForwardingState {
    pub fn new(rule: &ForwardingRule, server_addr: String) -> Self {
        Self {
            label: rule.label.clone(),
            local_addr: rule.local_addr(),
            server_addr,
            remote_addr: rule.remote_addr(),
            listener_addr: RwLock::new(None),
            next_id: AtomicU64::new(1),
            mappings: RwLock::new(BTreeMap::new()),
            idle: Notify::new(),
        }
    }

    /// Address the listener is actually bound to, while it is open.
    pub async fn listener_addr(&self) -> Option<SocketAddr> {
        *self.listener_addr.read().await
    }

    pub(crate) async fn set_listener_addr(&self, addr: Option<SocketAddr>) {
        *self.listener_addr.write().await = addr;
    }

    /// Add a mapping for a freshly accepted peer.
    pub async fn register(&self, peer: SocketAddr) -> Registration {
        let id = MappingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (close_tx, close_rx) = oneshot::channel();
        let counters = Arc::new(MappingCounters::default());

        let mut mappings = self.mappings.write().await;
        mappings.insert(
            id,
            MappingEntry {
                peer,
                opened_at: SystemTime::now(),
                established: false,
                counters: counters.clone(),
                close_tx: Some(close_tx),
            },
        );
        debug!("[{}] Mapping {} registered for {}", self.label, id, peer);

        Registration {
            id,
            close_rx,
            counters,
        }
    }

    pub async fn mark_established(&self, id: MappingId) {
        if let Some(entry) = self.mappings.write().await.get_mut(&id) {
            entry.established = true;
        }
    }

    /// Remove a mapping, running `release` while the live set is locked.
    ///
    /// `release` is where the mapping drops its streams, so no observer of
    /// the live set ever sees an entry without open sockets or open sockets
    /// without an entry. It must not wait on I/O: `register` is blocked
    /// until it finishes.
    pub(crate) async fn remove_with<F>(&self, id: MappingId, release: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let mut mappings = self.mappings.write().await;
        release.await;
        let removed = mappings.remove(&id).is_some();
        let now_empty = mappings.is_empty();
        drop(mappings);

        if removed {
            debug!("[{}] Mapping {} removed", self.label, id);
        }
        if now_empty {
            self.idle.notify_waiters();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.mappings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mappings.read().await.is_empty()
    }

    pub async fn contains(&self, id: MappingId) -> bool {
        self.mappings.read().await.contains_key(&id)
    }

    /// Live mappings ordered by id.
    pub async fn list(&self) -> Vec<MappingInfo> {
        let mappings = self.mappings.read().await;
        mappings
            .iter()
            .map(|(id, entry)| MappingInfo {
                id: *id,
                peer: entry.peer,
                opened_at: entry.opened_at,
                established: entry.established,
                bytes_up: entry.counters.bytes_up(),
                bytes_down: entry.counters.bytes_down(),
            })
            .collect()
    }

    /// Ask one mapping to close.
    pub async fn kick(&self, id: MappingId) -> Result<(), ForwardingError> {
        let mut mappings = self.mappings.write().await;
        let entry = mappings
            .get_mut(&id)
            .ok_or_else(|| ForwardingError::MappingNotFound {
                label: self.label.clone(),
                id: id.0,
            })?;
        if let Some(close_tx) = entry.close_tx.take() {
            let _ = close_tx.send(());
        }
        Ok(())
    }

    /// Ask every live mapping to close. Returns how many were signalled.
    pub async fn close_all(&self) -> usize {
        let mut mappings = self.mappings.write().await;
        let mut signalled = 0;
        for close_tx in mappings.values_mut().filter_map(|entry| entry.close_tx.take()) {
            let _ = close_tx.send(());
            signalled += 1;
        }
        signalled
    }

    /// Wait until the live set is empty.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }
}

/// Every running forwarding rule, looked up by label.
#[derive(Default, Clone)]
pub struct ForwardingRegistry {
    states: Vec<Arc<ForwardingState>>,
}

impl ForwardingRegistry {
    pub fn new(states: Vec<Arc<ForwardingState>>) -> Self {
        Self { states }
    }

    pub fn find(&self, label: &str) -> Option<Arc<ForwardingState>> {
        self.states.iter().find(|s| s.label == label).cloned()
    }

    pub fn states(&self) -> &[Arc<ForwardingState>] {
        &self.states
    }
}
