//! The per-rule tunnel engine: accept loop, remote dial with a single
//! reconnect, bridging and cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::net::TcpListener;

use crate::config::ForwardingRule;
use crate::error::ForwardingError;
use crate::events::{ColumnWidths, ForwardingEvent, Route};
use crate::mapping::Mapping;
use crate::signal::{shutdown_requested, ShutdownReceiver};
use crate::ssh::{ConnectionLease, RemoteStream, SshPool};
use crate::state::ForwardingState;

/// How long live mappings get to wind down after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TunnelEngine {
    rule: ForwardingRule,
    pool: Arc<SshPool>,
    state: Arc<ForwardingState>,
    widths: Arc<ColumnWidths>,
}

impl TunnelEngine {
    pub fn new(
        rule: ForwardingRule,
        pool: Arc<SshPool>,
        state: Arc<ForwardingState>,
        widths: Arc<ColumnWidths>,
    ) -> Self {
        Self {
            rule,
            pool,
            state,
            widths,
        }
    }

    pub fn label(&self) -> &str {
        &self.rule.label
    }

    /// Listen and serve until shutdown or a listener failure.
    ///
    /// Bind and accept failures end this rule only and are returned. Every
    /// accepted connection is registered before the next accept and then
    /// served on its own task.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: ShutdownReceiver,
    ) -> Result<(), ForwardingError> {
        let listener = match TcpListener::bind(self.state.local_addr.as_str()).await {
            Ok(listener) => listener,
            Err(source) => {
                let error = ForwardingError::Bind {
                    addr: self.state.local_addr.clone(),
                    source,
                };
                ForwardingEvent::ListenFailed {
                    label: &self.rule.label,
                    local_addr: &self.state.local_addr,
                    error: &error,
                }
                .emit(&self.widths);
                return Err(error);
            }
        };
        self.state.set_listener_addr(listener.local_addr().ok()).await;
        ForwardingEvent::ListenSuccess {
            label: &self.rule.label,
            local_addr: &self.state.local_addr,
        }
        .emit(&self.widths);

        let result = loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
            };

            match accepted {
                Ok((stream, peer)) => {
                    let mapping = Mapping::register(&self.state, stream, peer).await;
                    let engine = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        engine.serve(mapping, shutdown).await;
                    });
                }
                Err(source) => {
                    let error = ForwardingError::Accept(source);
                    ForwardingEvent::AcceptFailed {
                        label: &self.rule.label,
                        local_addr: &self.state.local_addr,
                        error: &error,
                    }
                    .emit(&self.widths);
                    break Err(error);
                }
            }
        };

        drop(listener);
        self.state.set_listener_addr(None).await;

        if result.is_ok() {
            self.drain().await;
        }
        result
    }

    /// Force-close the live mappings and wait for them to leave the live set.
    async fn drain(&self) {
        let signalled = self.state.close_all().await;
        debug!("[{}] Closing {} live mappings", self.rule.label, signalled);
        if tokio::time::timeout(DRAIN_TIMEOUT, self.state.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "[{}] {} mappings still open after {:?}",
                self.rule.label,
                self.state.len().await,
                DRAIN_TIMEOUT
            );
        }
    }

    async fn serve(self: Arc<Self>, mut mapping: Mapping, mut shutdown: ShutdownReceiver) {
        let peer = mapping.peer();

        let dialed = tokio::select! {
            dialed = self.open_remote(peer) => dialed,
            reason = mapping.wait_close(&mut shutdown) => {
                debug!(
                    "[{}] Mapping {} abandoned while dialing: {}",
                    self.rule.label,
                    mapping.id(),
                    reason
                );
                mapping.close().await;
                return;
            }
        };

        match dialed {
            Ok((lease, remote)) => {
                mapping.attach(lease, remote).await;
                ForwardingEvent::MappingEstablished {
                    label: &self.rule.label,
                    route: self.route(peer),
                }
                .emit(&self.widths);

                let reason = mapping.bridge(&mut shutdown).await;
                let (bytes_up, bytes_down) = mapping.close().await;
                ForwardingEvent::MappingClosed {
                    label: &self.rule.label,
                    route: self.route(peer),
                    reason: &reason,
                    bytes_up,
                    bytes_down,
                }
                .emit(&self.widths);
            }
            Err(error) => {
                ForwardingEvent::DialFailed {
                    label: &self.rule.label,
                    route: self.route(peer),
                    error: &error,
                }
                .emit(&self.widths);
                mapping.close().await;
            }
        }
    }

    /// Open a channel to the remote target, reconnecting at most once.
    async fn open_remote(
        &self,
        originator: SocketAddr,
    ) -> Result<(ConnectionLease, RemoteStream), ForwardingError> {
        let host = self.rule.remote_host.as_str();
        let port = self.rule.remote_port;

        let stale = match self.pool.acquire().await {
            Ok(lease) => match lease.open_channel(host, port, originator).await {
                Ok(remote) => return Ok((lease, remote)),
                Err(e) => {
                    warn!("[{}] {}, reconnecting", self.rule.label, e);
                    let generation = lease.generation();
                    lease.release().await;
                    Some(generation)
                }
            },
            Err(e) => {
                warn!("[{}] {}, retrying once", self.rule.label, e);
                None
            }
        };

        let lease = self.pool.reconnect(stale).await?;
        match lease.open_channel(host, port, originator).await {
            Ok(remote) => Ok((lease, remote)),
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    fn route(&self, peer: SocketAddr) -> Route<'_> {
        Route {
            peer,
            local_addr: &self.state.local_addr,
            server_addr: &self.state.server_addr,
            remote_addr: &self.state.remote_addr,
        }
    }
}
