// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! End-to-end scenarios for the mode server core: lifecycle, port
//! collision reporting, UDP demultiplexing and transparent-mode
//! destination recovery.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};

use snoproxy::common::context::{TargetAddr, Transport};
use snoproxy::common::hooks::{HookKind, LifecycleEvent};
use snoproxy::common::options::Options;
use snoproxy::common::platform::{self, OriginalAddrLookup};
use snoproxy::server::registry;
use snoproxy::server::{
  ConnectionId, LocalServerManager, ServerError, ServerInstance, ServerManager,
};

fn init() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .try_init();
  registry::register_default_modes();
}

fn local_manager(options: Options) -> (Arc<LocalServerManager>, Arc<dyn ServerManager>) {
  let manager = Arc::new(LocalServerManager::new(options));
  let as_manager: Arc<dyn ServerManager> = manager.clone();
  (manager, as_manager)
}

async fn wait_until<F>(what: &str, predicate: F)
where
  F: Fn() -> bool,
{
  for _ in 0..250 {
    if predicate() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn regular_lifecycle_reports_addresses() {
  init();
  let (_manager, manager) = local_manager(Options::default());
  let server = registry::make("regular@127.0.0.1:0", manager).unwrap();

  assert!(!server.is_running());
  assert!(server.listen_addrs().is_empty());

  server.start().await.unwrap();
  assert!(server.is_running());
  assert!(server.last_exception().is_none());
  let addrs = server.listen_addrs();
  assert_eq!(addrs.len(), 1);
  assert!(addrs[0].port() > 0);
  assert!(addrs[0].ip().is_loopback());

  match server.start().await {
    Err(ServerError::AlreadyRunning(spec)) => assert_eq!(spec, "regular@127.0.0.1:0"),
    other => panic!("double start must be rejected, got {:?}", other),
  }

  server.stop().await.unwrap();
  assert!(!server.is_running());
  assert!(server.listen_addrs().is_empty());

  assert!(matches!(
    server.stop().await,
    Err(ServerError::NotRunning(_))
  ));

  // The instance stays restartable after a clean stop.
  server.start().await.unwrap();
  server.stop().await.unwrap();
}

#[tokio::test]
async fn port_collision_suggests_the_next_port() {
  init();
  let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let port = blocker.local_addr().unwrap().port();

  let (_manager, manager) = local_manager(Options {
    listen_host: "127.0.0.1".to_string(),
    listen_port: Some(port),
  });
  let server = registry::make("regular", manager).unwrap();

  match server.start().await {
    Err(ServerError::AddressInUse { message }) => {
      assert!(
        message.contains(&format!("@{}", port + 1)),
        "expected next-port suggestion in: {}",
        message
      );
      assert!(message.contains("HTTP(S) proxy failed to listen on"));
    }
    other => panic!("expected an address collision, got {:?}", other),
  }
  assert!(!server.is_running());
  assert!(server.last_exception().is_some());

  // A start after a failed start is permitted once the port frees up.
  drop(blocker);
  server.start().await.unwrap();
  assert!(server.last_exception().is_none());
  server.stop().await.unwrap();
}

#[tokio::test]
async fn dns_demultiplexes_on_transaction_ids() {
  init();
  let (local, manager) = local_manager(Options::default());
  let server = registry::make("dns@127.0.0.1:0", manager).unwrap();
  server.start().await.unwrap();
  let bound = server.listen_addrs()[0];

  let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  let client_addr = client.local_addr().unwrap();

  let mut query = vec![0u8; 12];
  query[0] = 0x12;
  query[1] = 0x34;
  client.send_to(&query, bound).await.unwrap();

  wait_until("the first dns flow", || {
    local.connections().read().unwrap().len() == 1
  })
  .await;
  {
    let connections = local.connections().read().unwrap();
    let (id, handle) = connections.iter().next().unwrap();
    assert_eq!(
      *id,
      ConnectionId::Udp {
        peer: client_addr,
        local: bound,
        discriminator: Some(0x1234),
      }
    );
    assert_eq!(handle.transport, Transport::Udp);
    assert_eq!(handle.top_layer, "DnsLayer");
  }

  // A distinct transaction id opens a second flow...
  query[0] = 0x56;
  query[1] = 0x78;
  client.send_to(&query, bound).await.unwrap();
  wait_until("the second dns flow", || {
    local.connections().read().unwrap().len() == 2
  })
  .await;

  // ...while a repeated id lands in the existing one.
  client.send_to(&query, bound).await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(local.connections().read().unwrap().len(), 2);

  server.stop().await.unwrap();
}

#[tokio::test]
async fn short_dns_datagrams_are_dropped_with_a_log() {
  init();
  let (local, manager) = local_manager(Options::default());
  let mut events = local.subscribe();
  let server = registry::make("dns@127.0.0.1:0", manager).unwrap();
  server.start().await.unwrap();
  let bound = server.listen_addrs()[0];

  let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  client.send_to(&[0u8], bound).await.unwrap();

  let record = loop {
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .expect("expected a log record for the dropped datagram")
      .unwrap();
    if let LifecycleEvent::Log(record) = event {
      break record;
    }
  };
  assert!(record.message.contains("Invalid DNS datagram received from"));
  assert_eq!(record.level, tracing::Level::INFO);
  assert!(local.connections().read().unwrap().is_empty());

  server.stop().await.unwrap();
}

#[tokio::test]
async fn wrapped_udp_installs_the_inner_top_layer() {
  init();
  let (local, manager) = local_manager(Options::default());
  let server = registry::make("udp:reverse:tcp://127.0.0.1:9@127.0.0.1:0", manager).unwrap();
  assert_eq!(server.log_desc(), "Reverse proxy to tcp://127.0.0.1:9 (UDP)");
  server.start().await.unwrap();
  let bound = server.listen_addrs()[0];

  let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  client.send_to(b"payload", bound).await.unwrap();

  wait_until("the udp flow", || {
    local.connections().read().unwrap().len() == 1
  })
  .await;
  {
    let connections = local.connections().read().unwrap();
    let (id, handle) = connections.iter().next().unwrap();
    match id {
      ConnectionId::Udp { discriminator, .. } => assert_eq!(*discriminator, None),
      other => panic!("unexpected id: {:?}", other),
    }
    assert_eq!(handle.top_layer, "ReverseProxy");
  }

  server.stop().await.unwrap();
}

struct FixedOriginalAddr(SocketAddr);

impl OriginalAddrLookup for FixedOriginalAddr {
  fn original_addr(&self, _socket: &TcpStream) -> anyhow::Result<SocketAddr> {
    Ok(self.0)
  }
}

#[tokio::test]
async fn transparent_mode_recovers_the_original_destination() {
  init();
  let original: SocketAddr = "203.0.113.7:443".parse().unwrap();
  platform::set_original_addr_lookup(Arc::new(FixedOriginalAddr(original)));

  let (local, manager) = local_manager(Options::default());
  let mut events = local.subscribe();
  let server = registry::make("transparent@127.0.0.1:0", manager).unwrap();
  server.start().await.unwrap();
  let bound = server.listen_addrs()[0];

  let client = TcpStream::connect(bound).await.unwrap();
  let client_addr = client.local_addr().unwrap();

  let hook = loop {
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .expect("expected a client_connected hook")
      .unwrap();
    if let LifecycleEvent::Hook(hook) = event {
      break hook;
    }
  };
  assert_eq!(hook.kind, HookKind::ClientConnected);
  assert_eq!(hook.context.client.peername, Some(client_addr));
  assert_eq!(
    hook.context.server.address,
    Some(TargetAddr::Socket(original))
  );

  drop(client);
  wait_until("the flow to deregister", || {
    local.connections().read().unwrap().is_empty()
  })
  .await;
  server.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_does_not_cancel_inflight_flows() {
  init();
  let (local, manager) = local_manager(Options::default());
  let server = registry::make("regular@127.0.0.1:0", manager).unwrap();
  server.start().await.unwrap();
  let bound = server.listen_addrs()[0];

  let client = TcpStream::connect(bound).await.unwrap();
  wait_until("the tcp flow", || {
    local.connections().read().unwrap().len() == 1
  })
  .await;

  server.stop().await.unwrap();
  // The accept loop is gone, but the accepted flow is still registered.
  assert_eq!(local.connections().read().unwrap().len(), 1);

  drop(client);
  wait_until("the flow to deregister", || {
    local.connections().read().unwrap().is_empty()
  })
  .await;
}
