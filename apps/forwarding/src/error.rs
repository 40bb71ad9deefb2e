//! Error types for the forwarder.

use std::io;
use std::time::Duration;

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Ends the engine of one forwarding rule.
    Rule,
    /// Abandons a single accepted connection.
    Connection,
    /// Ends an established mapping. Expected, only logged.
    Mapping,
}

/// Errors raised while forwarding traffic through SSH.
#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    #[error("Listen on {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Accept connection failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("Connect to ssh server {addr} failed: {reason}")]
    SshConnect { addr: String, reason: String },

    #[error("Connect to ssh server {addr} timed out after {timeout:?}")]
    SshConnectTimeout { addr: String, timeout: Duration },

    #[error("Authentication as '{user}' rejected by {addr}")]
    AuthRejected { user: String, addr: String },

    #[error("Host key of {addr} rejected: fingerprint {fingerprint}")]
    HostKeyRejected { addr: String, fingerprint: String },

    #[error("Open channel to {target} failed: {reason}")]
    ChannelOpen { target: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Copy {direction} failed: {source}")]
    Copy {
        direction: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Mapping {id} not found in forwarding [{label}]")]
    MappingNotFound { label: String, id: u64 },
}

impl ForwardingError {
    /// Classify the error by the scope it is allowed to terminate.
    pub fn scope(&self) -> ErrorScope {
        match self {
            ForwardingError::Bind { .. }
            | ForwardingError::Accept(_)
            | ForwardingError::Config(_) => ErrorScope::Rule,
            ForwardingError::SshConnect { .. }
            | ForwardingError::SshConnectTimeout { .. }
            | ForwardingError::AuthRejected { .. }
            | ForwardingError::HostKeyRejected { .. }
            | ForwardingError::ChannelOpen { .. } => ErrorScope::Connection,
            ForwardingError::Copy { .. } | ForwardingError::MappingNotFound { .. } => {
                ErrorScope::Mapping
            }
        }
    }
}

/// I/O errors are copied by kind and message, which is all the forwarder
/// ever reports of them.
impl Clone for ForwardingError {
    fn clone(&self) -> Self {
        match self {
            ForwardingError::Bind { addr, source } => ForwardingError::Bind {
                addr: addr.clone(),
                source: copy_io_error(source),
            },
            ForwardingError::Accept(source) => ForwardingError::Accept(copy_io_error(source)),
            ForwardingError::SshConnect { addr, reason } => ForwardingError::SshConnect {
                addr: addr.clone(),
                reason: reason.clone(),
            },
            ForwardingError::SshConnectTimeout { addr, timeout } => {
                ForwardingError::SshConnectTimeout {
                    addr: addr.clone(),
                    timeout: *timeout,
                }
            }
            ForwardingError::AuthRejected { user, addr } => ForwardingError::AuthRejected {
                user: user.clone(),
                addr: addr.clone(),
            },
            ForwardingError::HostKeyRejected { addr, fingerprint } => {
                ForwardingError::HostKeyRejected {
                    addr: addr.clone(),
                    fingerprint: fingerprint.clone(),
                }
            }
            ForwardingError::ChannelOpen { target, reason } => ForwardingError::ChannelOpen {
                target: target.clone(),
                reason: reason.clone(),
            },
            ForwardingError::Config(message) => ForwardingError::Config(message.clone()),
            ForwardingError::Copy { direction, source } => ForwardingError::Copy {
                direction: *direction,
                source: copy_io_error(source),
            },
            ForwardingError::MappingNotFound { label, id } => ForwardingError::MappingNotFound {
                label: label.clone(),
                id: *id,
            },
        }
    }
}

fn copy_io_error(source: &io::Error) -> io::Error {
    io::Error::new(source.kind(), source.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_error_display() {
        let err = ForwardingError::AuthRejected {
            user: "root".to_string(),
            addr: "10.0.0.1:22".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Authentication as 'root' rejected by 10.0.0.1:22"
        );

        let err = ForwardingError::ChannelOpen {
            target: "127.0.0.1:3306".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Open channel to 127.0.0.1:3306 failed: refused"
        );

        let err = ForwardingError::SshConnectTimeout {
            addr: "host:22".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            format!("{}", err),
            "Connect to ssh server host:22 timed out after 5s"
        );
    }

    #[test]
    fn test_forwarding_error_scope() {
        let bind = ForwardingError::Bind {
            addr: "0.0.0.0:80".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.scope(), ErrorScope::Rule);

        let accept = ForwardingError::Accept(std::io::Error::from(std::io::ErrorKind::Other));
        assert_eq!(accept.scope(), ErrorScope::Rule);

        let dial = ForwardingError::SshConnect {
            addr: "host:22".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(dial.scope(), ErrorScope::Connection);

        let copy = ForwardingError::Copy {
            direction: "upstream",
            source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        };
        assert_eq!(copy.scope(), ErrorScope::Mapping);

        let missing = ForwardingError::MappingNotFound {
            label: "db".to_string(),
            id: 7,
        };
        assert_eq!(missing.scope(), ErrorScope::Mapping);
        assert_eq!(missing.to_string(), "Mapping 7 not found in forwarding [db]");
    }

    #[test]
    fn test_forwarding_error_clone_keeps_variant_and_message() {
        let timeout = ForwardingError::SshConnectTimeout {
            addr: "host:22".to_string(),
            timeout: Duration::from_secs(3),
        };
        let copied = timeout.clone();
        assert!(matches!(copied, ForwardingError::SshConnectTimeout { .. }));
        assert_eq!(copied.to_string(), timeout.to_string());

        let bind = ForwardingError::Bind {
            addr: "0.0.0.0:80".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        match bind.clone() {
            ForwardingError::Bind { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse)
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        assert_eq!(bind.clone().to_string(), bind.to_string());
    }

    #[test]
    fn test_forwarding_error_debug() {
        let err = ForwardingError::Config("no servers".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("Config"));
    }
}
