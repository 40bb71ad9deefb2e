mod common;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{wait_listening, MockConnector, WAIT};
use ssh_forwarding::{shutdown_channel, Config, ForwardingError, SshConnector, Supervisor};

/// A port nothing listens on right now.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config(busy_port: u16, free_port: u16) -> Config {
    Config::from_yaml_str(&format!(
        r#"
ssh_servers:
  - host: first.test
    username: ops
    forwardings:
      - {{ label: busy, local_host: 127.0.0.1, local_port: {busy_port}, remote_host: a, remote_port: 1 }}
  - host: second.test
    username: ops
    forwardings:
      - {{ label: ok, local_host: 127.0.0.1, local_port: {free_port}, remote_host: b, remote_port: 2 }}
"#
    ))
    .unwrap()
}

#[tokio::test]
async fn test_bind_failure_does_not_stop_other_rules() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = config(taken.local_addr().unwrap().port(), free_port());

    let (connector, mut remotes) = MockConnector::new();
    let connector: Arc<dyn SshConnector> = Arc::new(connector);
    let supervisor = Supervisor::prepare(&config, connector, false).await;
    assert_eq!(supervisor.len(), 2);
    let registry = supervisor.registry();

    let (shutdown, rx) = shutdown_channel();
    let run = tokio::spawn(supervisor.run(rx));

    let ok = registry.find("ok").unwrap();
    let addr = wait_listening(&ok).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut remote = tokio::time::timeout(WAIT, remotes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.host, "b");

    client.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    remote.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    assert!(registry.find("busy").unwrap().listener_addr().await.is_none());

    shutdown.send(true).unwrap();
    let outcomes = tokio::time::timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(outcomes.len(), 2);

    let busy = outcomes.iter().find(|o| o.label == "busy").unwrap();
    assert!(matches!(busy.result, Err(ForwardingError::Bind { .. })));
    let ok = outcomes.iter().find(|o| o.label == "ok").unwrap();
    assert!(ok.result.is_ok());
}

#[tokio::test]
async fn test_startup_check_skips_unreachable_servers() {
    let config = config(free_port(), free_port());

    // the first server fails its startup check, the second one passes
    let (connector, _remotes) = MockConnector::new();
    let connector = Arc::new(connector.fail_first(1));
    let supervisor = Supervisor::prepare(&config, connector.clone(), true).await;

    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.closed_sessions(), 1);
    assert_eq!(supervisor.len(), 1);
    let registry = supervisor.registry();
    assert!(registry.find("busy").is_none());
    assert!(registry.find("ok").is_some());
}

#[tokio::test]
async fn test_nothing_to_run_when_every_server_is_unreachable() {
    let config = config(free_port(), free_port());
    let (connector, _remotes) = MockConnector::new();
    let supervisor =
        Supervisor::prepare(&config, Arc::new(connector.fail_first(usize::MAX)), true).await;
    assert!(supervisor.is_empty());

    let (_shutdown, rx) = shutdown_channel();
    assert!(supervisor.run(rx).await.is_empty());
}
