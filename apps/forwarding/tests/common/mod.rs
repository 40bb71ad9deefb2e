//! Shared test doubles and helpers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use ssh_forwarding::ssh::RemoteStream;
use ssh_forwarding::{
    ForwardingError, ForwardingRule, ForwardingState, SshConnector, SshServerSpec, SshSession,
};

/// Upper bound for anything the tests wait on
pub const WAIT: Duration = Duration::from_secs(5);

/// The far end of a channel opened through a [`MockSession`].
pub struct RemoteEnd {
    pub host: String,
    pub port: u16,
    pub originator: SocketAddr,
    pub stream: DuplexStream,
}

/// In-memory stand-in for an SSH server.
pub struct MockConnector {
    connects: AtomicUsize,
    fail_first: usize,
    /// Delay for one connect call, by index
    slow_call: Option<(usize, Duration)>,
    /// Delay for every connect call
    connect_delay: Option<Duration>,
    /// Channel opens still to fail, shared by every session
    failing_channels: Arc<AtomicUsize>,
    sessions: std::sync::Mutex<Vec<Arc<MockSession>>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let connector = Self {
            connects: AtomicUsize::new(0),
            fail_first: 0,
            slow_call: None,
            connect_delay: None,
            failing_channels: Arc::new(AtomicUsize::new(0)),
            sessions: std::sync::Mutex::new(Vec::new()),
            remotes,
        };
        (connector, rx)
    }

    /// Fail the first `n` connect calls.
    pub fn fail_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Delay only connect call number `call` (0-based) by `delay`.
    pub fn slow_connect(mut self, call: usize, delay: Duration) -> Self {
        self.slow_call = Some((call, delay));
        self
    }

    /// Delay every connect call by `delay`.
    pub fn slow_connects(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Fail the next `n` channel opens on any session.
    pub fn fail_channels(self, n: usize) -> Self {
        self.fail_next_channels(n);
        self
    }

    /// Like [`MockConnector::fail_channels`], once the connector is shared.
    pub fn fail_next_channels(&self, n: usize) {
        self.failing_channels.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Close every session from the server side.
    pub fn disconnect_all(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            session.closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn closed_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_closed())
            .count()
    }
}

#[async_trait]
impl SshConnector for MockConnector {
    async fn connect(
        &self,
        server: &SshServerSpec,
        _timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ForwardingError> {
        let call = self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((slow, delay)) = self.slow_call {
            if slow == call {
                tokio::time::sleep(delay).await;
            }
        }
        if call < self.fail_first {
            return Err(ForwardingError::SshConnect {
                addr: server.addr(),
                reason: "connection refused".to_string(),
            });
        }

        let session = Arc::new(MockSession {
            closed: AtomicBool::new(false),
            failing_channels: self.failing_channels.clone(),
            remotes: self.remotes.clone(),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub struct MockSession {
    closed: AtomicBool,
    failing_channels: Arc<AtomicUsize>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

#[async_trait]
impl SshSession for MockSession {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteStream, ForwardingError> {
        let target = format!("{}:{}", host, port);
        if self.is_closed() {
            return Err(ForwardingError::ChannelOpen {
                target,
                reason: "session closed".to_string(),
            });
        }
        let failing = self
            .failing_channels
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ForwardingError::ChannelOpen {
                target,
                reason: "administratively prohibited".to_string(),
            });
        }

        let (near, far) = tokio::io::duplex(64 * 1024);
        let _ = self.remotes.send(RemoteEnd {
            host: host.to_string(),
            port,
            originator,
            stream: far,
        });
        Ok(Box::new(near))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn server() -> SshServerSpec {
    SshServerSpec {
        host: "bastion.test".to_string(),
        port: 22,
        username: "ops".to_string(),
        password: "secret".to_string(),
        host_key_fingerprint: None,
        connect_timeout_secs: 5,
        forwardings: Vec::new(),
    }
}

/// A loopback rule on an OS-assigned port.
pub fn rule(label: &str) -> ForwardingRule {
    ForwardingRule {
        label: label.to_string(),
        local_host: "127.0.0.1".to_string(),
        local_port: 0,
        remote_host: "db.internal".to_string(),
        remote_port: 5432,
    }
}

/// Poll `check` until it returns true or [`WAIT`] runs out.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait until the live set of `state` holds exactly `len` mappings.
pub async fn wait_for_len(state: &ForwardingState, len: usize) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if state.len().await == len {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait for the rule's listener and return its bound address.
pub async fn wait_listening(state: &ForwardingState) -> SocketAddr {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(addr) = state.listener_addr().await {
            return addr;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "listener of [{}] never came up",
            state.label
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
