//! The SSH capability: authenticated sessions able to open direct-tcpip
//! channels, and the russh client implementation of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use russh::client;
use russh::keys::PublicKey;
use russh::Disconnect;
use russh_keys::HashAlg;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::config::SshServerSpec;
use crate::error::ForwardingError;

/// Interval between keepalive requests on idle sessions
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A bidirectional byte stream reaching the remote target.
pub trait RemoteIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> RemoteIo for T {}

pub type RemoteStream = Box<dyn RemoteIo>;

/// One authenticated session to an SSH server.
///
/// Channel opens are multiplexed by the SSH layer, so `open_channel` may be
/// called concurrently from many mappings.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open a channel to `host:port` on the far side of the session.
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteStream, ForwardingError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Establishes authenticated sessions.
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Connect and authenticate; exceeding `timeout` is a failure.
    async fn connect(
        &self,
        server: &SshServerSpec,
        timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ForwardingError>;
}

// ============================================================================
// russh implementation
// ============================================================================

/// Client handler checking the server host key.
pub struct ClientHandler {
    addr: String,
    expected_fingerprint: Option<String>,
    /// Fingerprint of a rejected host key, read back after the handshake fails
    rejected: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    fn new(server: &SshServerSpec) -> Self {
        Self {
            addr: server.addr(),
            expected_fingerprint: server
                .host_key_fingerprint
                .as_ref()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
            rejected: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        match &self.expected_fingerprint {
            None => {
                debug!("Host key of {} accepted: {}", self.addr, fingerprint);
                Ok(true)
            }
            Some(expected) if *expected == fingerprint => {
                debug!("Host key of {} matches pinned fingerprint", self.addr);
                Ok(true)
            }
            Some(expected) => {
                error!(
                    "Host key of {} does not match: expected {}, got {}",
                    self.addr, expected, fingerprint
                );
                *self.rejected.lock().await = Some(fingerprint);
                Ok(false)
            }
        }
    }
}

/// Connects with russh using password authentication.
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        let config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(
        &self,
        server: &SshServerSpec,
        timeout: Duration,
    ) -> Result<Arc<dyn SshSession>, ForwardingError> {
        let addr = server.addr();
        let handler = ClientHandler::new(server);
        let rejected = handler.rejected.clone();

        let handshake = async {
            let mut handle =
                client::connect(self.config.clone(), (server.host.as_str(), server.port), handler)
                    .await?;
            let authenticated = handle
                .authenticate_password(server.username.clone(), server.password.clone())
                .await?;
            Ok::<_, russh::Error>((handle, authenticated))
        };

        let (handle, authenticated) = match tokio::time::timeout(timeout, handshake).await {
            Err(_) => return Err(ForwardingError::SshConnectTimeout { addr, timeout }),
            Ok(Err(russh::Error::UnknownKey)) => {
                let fingerprint = rejected.lock().await.take().unwrap_or_default();
                return Err(ForwardingError::HostKeyRejected { addr, fingerprint });
            }
            Ok(Err(e)) => {
                return Err(ForwardingError::SshConnect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(connected)) => connected,
        };

        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(ForwardingError::AuthRejected {
                user: server.username.clone(),
                addr,
            });
        }

        info!("Connect to ssh server [{}] success", addr);
        Ok(Arc::new(RusshSession { handle, addr }))
    }
}

/// A live russh client session.
pub struct RusshSession {
    handle: client::Handle<ClientHandler>,
    addr: String,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<RemoteStream, ForwardingError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| ForwardingError::ChannelOpen {
                target: format!("{}:{}", host, port),
                reason: e.to_string(),
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Disconnect from {} failed: {:?}", self.addr, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
