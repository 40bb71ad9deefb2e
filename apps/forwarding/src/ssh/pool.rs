//! Per-server SSH connection pool.
//!
//! All forwarding rules of one server share a single live session. Every
//! mapping holds a [`ConnectionLease`] on the session it dialed through; a
//! session is closed once its last lease is released. A reconnect installs a
//! fresh session as the current one while leases on the replaced session
//! keep it alive until they are released.
//!
//! The pool lock is never held across a connect. Callers that need a fresh
//! session while one is being established wait on that same attempt instead
//! of queueing behind each other.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{Mutex, OnceCell};

use crate::config::SshServerSpec;
use crate::error::ForwardingError;

use super::session::{RemoteStream, SshConnector, SshSession};

struct PooledConnection {
    session: Arc<dyn SshSession>,
    leases: usize,
}

/// One in-flight connect, resolved to the generation it installed.
#[derive(Default)]
struct ConnectAttempt {
    generation: OnceCell<Result<u64, ForwardingError>>,
}

#[derive(Default)]
struct PoolInner {
    /// Generation handed out by `acquire`
    current: Option<u64>,
    next_generation: u64,
    connections: HashMap<u64, PooledConnection>,
    pending: Option<Arc<ConnectAttempt>>,
}

impl PoolInner {
    /// The current generation, unless its session has already gone away.
    fn usable_current(&self) -> Option<u64> {
        let generation = self.current?;
        let connection = self.connections.get(&generation)?;
        (!connection.session.is_closed()).then_some(generation)
    }

    fn pending_attempt(&mut self) -> Arc<ConnectAttempt> {
        self.pending.get_or_insert_with(Default::default).clone()
    }
}

pub struct SshPool {
    server: Arc<SshServerSpec>,
    connector: Arc<dyn SshConnector>,
    inner: Mutex<PoolInner>,
}

impl SshPool {
    pub fn new(server: Arc<SshServerSpec>, connector: Arc<dyn SshConnector>) -> Arc<Self> {
        Arc::new(Self {
            server,
            connector,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    /// Lease the current session, connecting first if there is none.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConnectionLease, ForwardingError> {
        let attempt = {
            let mut inner = self.inner.lock().await;
            if let Some(lease) = inner
                .usable_current()
                .and_then(|generation| self.lease(&mut inner, generation))
            {
                return Ok(lease);
            }
            inner.pending_attempt()
        };
        self.connect_shared(attempt).await
    }

    /// Replace the `stale` session with a fresh one and lease it.
    ///
    /// When another caller already replaced `stale`, its session is reused
    /// instead of connecting again.
    pub async fn reconnect(
        self: &Arc<Self>,
        stale: Option<u64>,
    ) -> Result<ConnectionLease, ForwardingError> {
        let attempt = {
            let mut inner = self.inner.lock().await;
            let current = inner.usable_current();
            if current.is_some() && current != stale {
                if let Some(lease) =
                    current.and_then(|generation| self.lease(&mut inner, generation))
                {
                    debug!(
                        "Reusing session to [{}] replaced by a concurrent reconnect",
                        self.server.addr()
                    );
                    return Ok(lease);
                }
            }
            inner.pending_attempt()
        };
        info!("Reconnecting to ssh server [{}]", self.server.addr());
        self.connect_shared(attempt).await
    }

    /// Connect once and close immediately, to check the server is usable.
    pub async fn check_reachable(&self) -> Result<(), ForwardingError> {
        let session = self
            .connector
            .connect(&self.server, self.server.connect_timeout())
            .await?;
        session.close().await;
        Ok(())
    }

    /// Number of sessions still open, current or replaced.
    pub async fn live_connections(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Generation of the session new leases are handed out on.
    pub async fn current_generation(&self) -> Option<u64> {
        self.inner.lock().await.current
    }

    fn lease(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        generation: u64,
    ) -> Option<ConnectionLease> {
        let connection = inner.connections.get_mut(&generation)?;
        connection.leases += 1;
        Some(ConnectionLease::new(
            self.clone(),
            generation,
            connection.session.clone(),
        ))
    }

    /// Wait for `attempt` (running it if nobody else is) and lease its session.
    async fn connect_shared(
        self: &Arc<Self>,
        attempt: Arc<ConnectAttempt>,
    ) -> Result<ConnectionLease, ForwardingError> {
        let generation = attempt
            .generation
            .get_or_init(|| self.connect_new(&attempt))
            .await
            .clone()?;

        let mut inner = self.inner.lock().await;
        if let Some(lease) = self.lease(&mut inner, generation) {
            return Ok(lease);
        }
        // Replaced and closed before this caller got to it
        inner
            .usable_current()
            .and_then(|current| self.lease(&mut inner, current))
            .ok_or_else(|| ForwardingError::SshConnect {
                addr: self.server.addr(),
                reason: "session closed before use".to_string(),
            })
    }

    async fn connect_new(&self, attempt: &Arc<ConnectAttempt>) -> Result<u64, ForwardingError> {
        let connected = self
            .connector
            .connect(&self.server, self.server.connect_timeout())
            .await;

        let (result, replaced) = {
            let mut inner = self.inner.lock().await;
            if inner
                .pending
                .as_ref()
                .is_some_and(|pending| Arc::ptr_eq(pending, attempt))
            {
                inner.pending = None;
            }

            match connected {
                Err(e) => (Err(e), None),
                Ok(session) => {
                    let generation = inner.next_generation;
                    inner.next_generation += 1;
                    inner.connections.insert(
                        generation,
                        PooledConnection {
                            session,
                            leases: 0,
                        },
                    );
                    let replaced = inner.current.replace(generation).and_then(|old| {
                        let idle = inner
                            .connections
                            .get(&old)
                            .is_some_and(|connection| connection.leases == 0);
                        if idle {
                            inner.connections.remove(&old)
                        } else {
                            None
                        }
                    });
                    (Ok(generation), replaced)
                }
            }
        };

        if let Some(connection) = replaced {
            connection.session.close().await;
        }
        result
    }

    async fn release(&self, generation: u64) {
        let retired = {
            let mut inner = self.inner.lock().await;
            let Some(connection) = inner.connections.get_mut(&generation) else {
                warn!(
                    "Released unknown session generation {} of [{}]",
                    generation,
                    self.server.addr()
                );
                return;
            };
            connection.leases = connection.leases.saturating_sub(1);
            if connection.leases > 0 {
                None
            } else {
                if inner.current == Some(generation) {
                    inner.current = None;
                }
                inner.connections.remove(&generation)
            }
        };

        if let Some(connection) = retired {
            debug!(
                "Closing idle session {} to [{}]",
                generation,
                self.server.addr()
            );
            connection.session.close().await;
        }
    }
}

/// A counted reference to one pooled session.
pub struct ConnectionLease {
    pool: Arc<SshPool>,
    generation: u64,
    session: Arc<dyn SshSession>,
    released: bool,
}

impl ConnectionLease {
    fn new(pool: Arc<SshPool>, generation: u64, session: Arc<dyn SshSession>) -> Self {
        Self {
            pool,
            generation,
            session,
            released: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteStream, ForwardingError> {
        self.session.open_channel(host, port, originator).await
    }

    pub async fn release(mut self) {
        self.released = true;
        self.pool.release(self.generation).await;
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("server", &self.pool.server.addr())
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Drop can't be async; hand the release to the runtime if one is still up
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            let generation = self.generation;
            runtime.spawn(async move {
                pool.release(generation).await;
            });
        }
    }
}
