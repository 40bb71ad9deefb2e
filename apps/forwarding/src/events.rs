//! Structured forwarding events and their column-aligned rendering.
//!
//! Uses the `console` crate for padding so labels with wide characters still
//! line up.

use std::borrow::Cow;
use std::net::SocketAddr;

use console::{pad_str, Alignment};
use log::Level;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::error::ForwardingError;
use crate::mapping::CloseReason;

/// Log target shared by every event
pub const EVENT_TARGET: &str = "forwarding";

/// Width of "255.255.255.255:65535"
const PEER_WIDTH: usize = 21;

/// Column widths computed once from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnWidths {
    pub label: usize,
    pub local_addr: usize,
    pub server_addr: usize,
    pub remote_addr: usize,
}

impl ColumnWidths {
    pub fn from_config(config: &Config) -> Self {
        let mut widths = Self::default();
        for (server, rule) in config.forwardings() {
            widths.label = widths.label.max(rule.label.width());
            widths.local_addr = widths.local_addr.max(rule.local_addr().width());
            widths.server_addr = widths.server_addr.max(server.addr().width());
            widths.remote_addr = widths.remote_addr.max(rule.remote_addr().width());
        }
        widths
    }
}

fn pad(text: &str, width: usize) -> Cow<'_, str> {
    pad_str(text, width, Alignment::Left, None)
}

/// The path one mapping takes: peer -> local listener -> ssh server -> remote.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub peer: SocketAddr,
    pub local_addr: &'a str,
    pub server_addr: &'a str,
    pub remote_addr: &'a str,
}

impl Route<'_> {
    fn render(&self, widths: &ColumnWidths) -> String {
        let peer = self.peer.to_string();
        format!(
            "[{}] <=> [{}] <=> [{}] <=> [{}]",
            pad(&peer, PEER_WIDTH),
            pad(self.local_addr, widths.local_addr),
            pad(self.server_addr, widths.server_addr),
            pad(self.remote_addr, widths.remote_addr),
        )
    }
}

/// Events emitted by the tunnel engine.
#[derive(Debug)]
pub enum ForwardingEvent<'a> {
    ListenSuccess {
        label: &'a str,
        local_addr: &'a str,
    },
    ListenFailed {
        label: &'a str,
        local_addr: &'a str,
        error: &'a ForwardingError,
    },
    AcceptFailed {
        label: &'a str,
        local_addr: &'a str,
        error: &'a ForwardingError,
    },
    DialFailed {
        label: &'a str,
        route: Route<'a>,
        error: &'a ForwardingError,
    },
    MappingEstablished {
        label: &'a str,
        route: Route<'a>,
    },
    MappingClosed {
        label: &'a str,
        route: Route<'a>,
        reason: &'a CloseReason,
        bytes_up: u64,
        bytes_down: u64,
    },
}

impl ForwardingEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            ForwardingEvent::ListenSuccess { .. } => "listen_success",
            ForwardingEvent::ListenFailed { .. } => "listen_failed",
            ForwardingEvent::AcceptFailed { .. } => "accept_failed",
            ForwardingEvent::DialFailed { .. } => "dial_failed",
            ForwardingEvent::MappingEstablished { .. } => "mapping_established",
            ForwardingEvent::MappingClosed { .. } => "mapping_closed",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            ForwardingEvent::ListenSuccess { .. } | ForwardingEvent::MappingEstablished { .. } => {
                Level::Info
            }
            ForwardingEvent::MappingClosed { .. } => Level::Warn,
            ForwardingEvent::ListenFailed { .. }
            | ForwardingEvent::AcceptFailed { .. }
            | ForwardingEvent::DialFailed { .. } => Level::Error,
        }
    }

    fn label(&self) -> &str {
        match self {
            ForwardingEvent::ListenSuccess { label, .. }
            | ForwardingEvent::ListenFailed { label, .. }
            | ForwardingEvent::AcceptFailed { label, .. }
            | ForwardingEvent::DialFailed { label, .. }
            | ForwardingEvent::MappingEstablished { label, .. }
            | ForwardingEvent::MappingClosed { label, .. } => label,
        }
    }

    pub fn render(&self, widths: &ColumnWidths) -> String {
        let label = pad(self.label(), widths.label);
        match self {
            ForwardingEvent::ListenSuccess { local_addr, .. } => {
                format!("[{}] Listen local address [{}] success", label, local_addr)
            }
            ForwardingEvent::ListenFailed {
                local_addr, error, ..
            } => format!(
                "[{}] Listen local address [{}] failed, err = {}",
                label, local_addr, error
            ),
            ForwardingEvent::AcceptFailed {
                local_addr, error, ..
            } => format!(
                "[{}] Accept on [{}] failed, listener closed, err = {}",
                label, local_addr, error
            ),
            ForwardingEvent::DialFailed { route, error, .. } => format!(
                "[{}] Mapping failed => {}, err = {}",
                label,
                route.render(widths),
                error
            ),
            ForwardingEvent::MappingEstablished { route, .. } => {
                format!("[{}] Mapping established => {}", label, route.render(widths))
            }
            ForwardingEvent::MappingClosed {
                route,
                reason,
                bytes_up,
                bytes_down,
                ..
            } => format!(
                "[{}] Mapping closed => {} ({}, {} bytes up, {} bytes down)",
                label,
                route.render(widths),
                reason,
                bytes_up,
                bytes_down
            ),
        }
    }

    /// Log the event under [`EVENT_TARGET`] at its fixed level.
    pub fn emit(&self, widths: &ColumnWidths) {
        log::log!(
            target: EVENT_TARGET,
            self.level(),
            "event={} {}",
            self.name(),
            self.render(widths)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widths() -> ColumnWidths {
        ColumnWidths {
            label: 8,
            local_addr: 13,
            server_addr: 14,
            remote_addr: 14,
        }
    }

    fn route() -> Route<'static> {
        Route {
            peer: "127.0.0.1:50000".parse().unwrap(),
            local_addr: "0.0.0.0:13306",
            server_addr: "10.0.0.1:22",
            remote_addr: "127.0.0.1:3306",
        }
    }

    #[test]
    fn test_column_widths_from_config() {
        let config = Config::from_yaml_str(
            r#"
ssh_servers:
  - host: 10.0.0.1
    username: root
    forwardings:
      - { label: db, local_port: 13306, remote_host: 127.0.0.1, remote_port: 3306 }
      - { label: "缓存", local_port: 16379, remote_host: cache, remote_port: 6379 }
"#,
        )
        .unwrap();
        let widths = ColumnWidths::from_config(&config);
        // two wide characters take four columns
        assert_eq!(widths.label, 4);
        assert_eq!(widths.local_addr, "0.0.0.0:13306".len());
        assert_eq!(widths.server_addr, "10.0.0.1:22".len());
        assert_eq!(widths.remote_addr, "127.0.0.1:3306".len());
    }

    #[test]
    fn test_event_names_and_levels() {
        let err = ForwardingError::Config("x".to_string());
        let listen = ForwardingEvent::ListenSuccess {
            label: "db",
            local_addr: "0.0.0.0:1",
        };
        assert_eq!(listen.name(), "listen_success");
        assert_eq!(listen.level(), Level::Info);

        let failed = ForwardingEvent::ListenFailed {
            label: "db",
            local_addr: "0.0.0.0:1",
            error: &err,
        };
        assert_eq!(failed.name(), "listen_failed");
        assert_eq!(failed.level(), Level::Error);

        let dial = ForwardingEvent::DialFailed {
            label: "db",
            route: route(),
            error: &err,
        };
        assert_eq!(dial.name(), "dial_failed");
        assert_eq!(dial.level(), Level::Error);

        let closed = ForwardingEvent::MappingClosed {
            label: "db",
            route: route(),
            reason: &CloseReason::LocalEof,
            bytes_up: 1,
            bytes_down: 2,
        };
        assert_eq!(closed.name(), "mapping_closed");
        assert_eq!(closed.level(), Level::Warn);
    }

    #[test]
    fn test_render_pads_columns() {
        let established = ForwardingEvent::MappingEstablished {
            label: "db",
            route: route(),
        };
        assert_eq!(
            established.render(&widths()),
            "[db      ] Mapping established => [127.0.0.1:50000      ] <=> [0.0.0.0:13306] <=> [10.0.0.1:22   ] <=> [127.0.0.1:3306]"
        );
    }

    #[test]
    fn test_render_mapping_closed_includes_counters() {
        let closed = ForwardingEvent::MappingClosed {
            label: "db",
            route: route(),
            reason: &CloseReason::RemoteEof,
            bytes_up: 4,
            bytes_down: 8,
        };
        let line = closed.render(&ColumnWidths::default());
        assert!(line.starts_with("[db] Mapping closed => [127.0.0.1:50000"));
        assert!(line.ends_with("(remote closed, 4 bytes up, 8 bytes down)"));
    }
}
