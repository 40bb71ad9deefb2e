//! One bridged local <-> remote connection and its teardown.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::error::ForwardingError;
use crate::signal::{shutdown_requested, ShutdownReceiver};
use crate::ssh::{ConnectionLease, RemoteStream};
use crate::state::{ForwardingState, MappingCounters, MappingId};

/// Size of the buffer used by each copy direction
const COPY_BUFFER_SIZE: usize = 8192;

/// Why a mapping ended.
#[derive(Debug)]
pub enum CloseReason {
    /// No remote channel could be opened
    DialFailed,
    /// The local peer finished sending
    LocalEof,
    /// The remote side finished sending
    RemoteEof,
    /// A copy direction hit an I/O error
    Failed(ForwardingError),
    /// Closed through the management API
    Killed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::DialFailed => write!(f, "dial failed"),
            CloseReason::LocalEof => write!(f, "local closed"),
            CloseReason::RemoteEof => write!(f, "remote closed"),
            CloseReason::Failed(e) => write!(f, "{}", e),
            CloseReason::Killed => write!(f, "closed by request"),
            CloseReason::Shutdown => write!(f, "shutting down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// local -> remote
    Upstream,
    /// remote -> local
    Downstream,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }

    fn record(self, counters: &MappingCounters, n: usize) {
        match self {
            Direction::Upstream => counters.add_up(n),
            Direction::Downstream => counters.add_down(n),
        }
    }

    fn finished(self, result: io::Result<()>) -> CloseReason {
        match (self, result) {
            (Direction::Upstream, Ok(())) => CloseReason::LocalEof,
            (Direction::Downstream, Ok(())) => CloseReason::RemoteEof,
            (direction, Err(source)) => CloseReason::Failed(ForwardingError::Copy {
                direction: direction.name(),
                source,
            }),
        }
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    counters: Arc<MappingCounters>,
) -> (Direction, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        if let Err(e) = writer.flush().await {
            break Err(e);
        }
        direction.record(&counters, n);
    };
    // Pass the EOF on; the peer may already be gone
    let _ = writer.shutdown().await;
    (direction, result)
}

type CopyTasks = JoinSet<(Direction, io::Result<()>)>;

/// A live mapping. Registered in its [`ForwardingState`] from creation until
/// [`Mapping::close`] (or drop) removes it.
pub struct Mapping {
    id: MappingId,
    peer: SocketAddr,
    state: Arc<ForwardingState>,
    local: Option<TcpStream>,
    remote: Option<RemoteStream>,
    lease: Option<ConnectionLease>,
    copies: Option<CopyTasks>,
    counters: Arc<MappingCounters>,
    close_rx: oneshot::Receiver<()>,
    closed: bool,
}

impl Mapping {
    /// Enter a freshly accepted connection into the live set.
    pub async fn register(
        state: &Arc<ForwardingState>,
        local: TcpStream,
        peer: SocketAddr,
    ) -> Self {
        let registration = state.register(peer).await;
        Self {
            id: registration.id,
            peer,
            state: state.clone(),
            local: Some(local),
            remote: None,
            lease: None,
            copies: None,
            counters: registration.counters,
            close_rx: registration.close_rx,
            closed: false,
        }
    }

    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Store the dialed remote stream and the lease of the session carrying it.
    pub async fn attach(&mut self, lease: ConnectionLease, remote: RemoteStream) {
        self.lease = Some(lease);
        self.remote = Some(remote);
        self.state.mark_established(self.id).await;
    }

    /// Resolve when the mapping is asked to close before it is bridged.
    pub async fn wait_close(&mut self, shutdown: &mut ShutdownReceiver) -> CloseReason {
        tokio::select! {
            Ok(()) = &mut self.close_rx => CloseReason::Killed,
            _ = shutdown_requested(shutdown) => CloseReason::Shutdown,
        }
    }

    /// Copy in both directions until the first one finishes, the mapping is
    /// kicked, or shutdown is requested.
    pub async fn bridge(&mut self, shutdown: &mut ShutdownReceiver) -> CloseReason {
        let (Some(local), Some(remote)) = (self.local.take(), self.remote.take()) else {
            return CloseReason::DialFailed;
        };

        let (local_read, local_write) = local.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);

        let mut copies = JoinSet::new();
        copies.spawn(pump(
            local_read,
            remote_write,
            Direction::Upstream,
            self.counters.clone(),
        ));
        copies.spawn(pump(
            remote_read,
            local_write,
            Direction::Downstream,
            self.counters.clone(),
        ));

        let reason = tokio::select! {
            finished = copies.join_next() => match finished {
                Some(Ok((direction, result))) => direction.finished(result),
                Some(Err(e)) => CloseReason::Failed(ForwardingError::Copy {
                    direction: "copy",
                    source: io::Error::other(e),
                }),
                None => CloseReason::LocalEof,
            },
            Ok(()) = &mut self.close_rx => CloseReason::Killed,
            _ = shutdown_requested(shutdown) => CloseReason::Shutdown,
        };

        debug!("[{}] Mapping {} ending: {}", self.state.label, self.id, reason);
        self.copies = Some(copies);
        reason
    }

    /// Stop copying, close both streams, leave the live set and release the
    /// SSH lease. Returns the bytes copied up and down. Safe to call twice.
    pub async fn close(&mut self) -> (u64, u64) {
        if !self.closed {
            self.teardown().await;
        }
        (self.counters.bytes_up(), self.counters.bytes_down())
    }

    fn teardown(&mut self) -> impl Future<Output = ()> + Send + 'static {
        self.closed = true;
        let state = self.state.clone();
        let id = self.id;
        let mut copies = self.copies.take();
        let local = self.local.take();
        let remote = self.remote.take();
        let lease = self.lease.take();

        // Cancel before the live-set lock is taken; joining below only
        // collects the already aborted halves
        if let Some(copies) = copies.as_mut() {
            copies.abort_all();
        }

        async move {
            state
                .remove_with(id, async move {
                    if let Some(mut copies) = copies {
                        while copies.join_next().await.is_some() {}
                    }
                    drop(local);
                    drop(remote);
                })
                .await;
            if let Some(lease) = lease {
                lease.release().await;
            }
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(self.teardown());
        }
    }
}
