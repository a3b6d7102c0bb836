// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Datagram-mode listeners.
//!
//! Datagrams arrive without framing, so the listener demultiplexes them
//! into virtual connections itself: a mode-specific classifier derives
//! the flow id, a map miss builds a queue-backed handler, and a map hit
//! feeds the existing flow's queue. The handle is inserted into the map
//! *before* the connection task is spawned; a second datagram racing the
//! task start then becomes an ordinary enqueue instead of a second flow.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::context::{Context, TargetAddr, Transport};
use crate::common::hooks::{LifecycleEvent, LogRecord};
use crate::common::layer::{DnsLayer, Layer};
use crate::common::mode::{DnsResolveMode, ModeKind, ModeSpec};
use crate::server::handler::{ConnectionHandler, TransportReader, TransportWriter};
use crate::server::instance::{
  format_addrs, listen_error, resolve_listen_addrs, stop_instance, InstanceState, ServerError,
  ServerInstance,
};
use crate::server::tcp::TcpInstance;
use crate::server::{registry, ConnectionHandle, ConnectionId, ServerManager};
use crate::util::datagram::{self, DatagramSender, DatagramWriter};

/// Datagram flows are short-lived; idle ones expire well before the
/// stream default.
const UDP_CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

const MAX_DATAGRAM_SIZE: usize = 65536;

pub struct UdpInstance {
  shared: Arc<UdpShared>,
  state: InstanceState,
}

struct UdpShared {
  mode: ModeSpec,
  manager: Arc<dyn ServerManager>,
  flavor: UdpFlavor,
}

enum UdpFlavor {
  Dns,
  /// Wraps a stream listener solely for its top-layer factory and
  /// transparency flag; the inner instance is never started.
  Wrapped(Box<TcpInstance>),
}

impl UdpInstance {
  pub fn dns_factory(
    mode: ModeSpec,
    manager: Arc<dyn ServerManager>,
  ) -> Result<Box<dyn ServerInstance>, ServerError> {
    Ok(Box::new(UdpInstance {
      shared: Arc::new(UdpShared {
        mode,
        manager,
        flavor: UdpFlavor::Dns,
      }),
      state: InstanceState::new(),
    }))
  }

  pub fn udp_factory(
    mode: ModeSpec,
    manager: Arc<dyn ServerManager>,
  ) -> Result<Box<dyn ServerInstance>, ServerError> {
    let inner_mode = match mode.kind() {
      ModeKind::Udp { inner } => (**inner).clone(),
      other => unreachable!("udp listener constructed for mode {:?}", other),
    };
    let inner = registry::from_spec(inner_mode, Arc::clone(&manager))?;
    let inner = inner.downcast::<TcpInstance>().map_err(|_| {
      ServerError::Application(anyhow::anyhow!(
        "udp inner mode did not resolve to a stream listener"
      ))
    })?;
    Ok(Box::new(UdpInstance {
      shared: Arc::new(UdpShared {
        mode,
        manager,
        flavor: UdpFlavor::Wrapped(inner),
      }),
      state: InstanceState::new(),
    }))
  }
}

impl UdpShared {
  fn log_desc(&self) -> String {
    match &self.flavor {
      UdpFlavor::Dns => "DNS server".to_string(),
      UdpFlavor::Wrapped(inner) => format!("{} (UDP)", inner.log_desc()),
    }
  }

  fn is_transparent(&self) -> bool {
    match &self.flavor {
      UdpFlavor::Dns => matches!(
        self.mode.kind(),
        ModeKind::Dns {
          resolve: DnsResolveMode::Transparent
        }
      ),
      UdpFlavor::Wrapped(inner) => inner.is_transparent(),
    }
  }

  fn make_top_layer(&self, context: &mut Context) -> Box<dyn Layer> {
    match &self.flavor {
      UdpFlavor::Dns => {
        let resolve = match self.mode.kind() {
          ModeKind::Dns { resolve } => resolve,
          other => unreachable!("dns listener constructed for mode {:?}", other),
        };
        context.server.address = Some(resolve.upstream_addr());
        Box::new(DnsLayer)
      }
      UdpFlavor::Wrapped(inner) => inner.make_top_layer(context),
    }
  }

  /// Classify a datagram into its flow id, or drop it.
  fn make_connection_id(
    &self,
    data: &[u8],
    peer: SocketAddr,
    local: SocketAddr,
  ) -> Option<ConnectionId> {
    match &self.flavor {
      UdpFlavor::Dns => {
        if data.len() < 2 {
          let message = format!("Invalid DNS datagram received from {}.", peer);
          tracing::info!("{}", message);
          let manager = Arc::clone(&self.manager);
          tokio::spawn(async move {
            manager
              .handle_lifecycle(LifecycleEvent::Log(LogRecord {
                level: tracing::Level::INFO,
                message,
              }))
              .await;
          });
          return None;
        }
        let dns_id = u16::from_be_bytes([data[0], data[1]]);
        Some(ConnectionId::Udp {
          peer,
          local,
          discriminator: Some(dns_id),
        })
      }
      UdpFlavor::Wrapped(_) => Some(ConnectionId::Udp {
        peer,
        local,
        discriminator: None,
      }),
    }
  }

  fn handle_udp_datagram(
    self: &Arc<Self>,
    socket: &Arc<UdpSocket>,
    data: &[u8],
    peer: SocketAddr,
    local: SocketAddr,
  ) {
    let connection_id = match self.make_connection_id(data, peer, local) {
      Some(connection_id) => connection_id,
      None => return,
    };

    let existing = {
      let connections = self
        .manager
        .connections()
        .read()
        .expect("connection map lock poisoned");
      connections
        .get(&connection_id)
        .and_then(|handle| handle.feed.clone())
    };
    let feed = match existing {
      Some(feed) => feed,
      None => self.spawn_udp_connection(socket, connection_id, peer, local),
    };
    feed.feed(data.to_vec(), peer);
  }

  fn spawn_udp_connection(
    self: &Arc<Self>,
    socket: &Arc<UdpSocket>,
    connection_id: ConnectionId,
    peer: SocketAddr,
    local: SocketAddr,
  ) -> DatagramSender {
    let (feed, reader) = datagram::channel();
    let writer = DatagramWriter::new(Arc::clone(socket), peer);

    let mut context = Context::new(Transport::Udp);
    context.client.peername = Some(peer);
    context.client.sockname = Some(local);
    if self.is_transparent() {
      context.server.address = Some(TargetAddr::Socket(local));
    }
    context.server.transport_protocol = Transport::Udp;
    let layer = self.make_top_layer(&mut context);
    let top_layer = layer.name();

    let mut handler = ConnectionHandler::new(
      Arc::clone(&self.manager),
      TransportReader::Datagram(reader),
      TransportWriter::Datagram(writer),
      self.manager.options(),
      self.mode.clone(),
      context,
    );
    handler.watchdog.set_timeout(UDP_CONNECTION_TIMEOUT);
    handler.layer = Some(layer);

    let handle = ConnectionHandle {
      transport: Transport::Udp,
      peer,
      top_layer,
      feed: Some(feed.clone()),
    };
    // Pre-register: further datagrams may arrive before the task runs.
    self
      .manager
      .connections()
      .write()
      .expect("connection map lock poisoned")
      .insert(connection_id.clone(), handle.clone());
    let manager = Arc::clone(&self.manager);
    tokio::spawn(async move {
      let _registration = manager.register_connection(connection_id, handle);
      handler.handle_client().await;
    });
    feed
  }
}

impl ServerInstance for UdpInstance {
  fn mode(&self) -> &ModeSpec {
    &self.shared.mode
  }

  fn log_desc(&self) -> String {
    self.shared.log_desc()
  }

  fn is_running(&self) -> bool {
    self.state.is_running()
  }

  fn listen_addrs(&self) -> Vec<SocketAddr> {
    self.state.listen_addrs()
  }

  fn last_exception(&self) -> Option<String> {
    self.state.last_exception()
  }

  fn start(&self) -> BoxFuture<'_, Result<(), ServerError>> {
    async move {
      self.state.begin_start(&self.shared.mode)?;
      let options = self.shared.manager.options();
      let host = self.shared.mode.listen_host(&options.listen_host);
      let port = self.shared.mode.listen_port(options.listen_port);

      let socket = match bind_udp_socket(&host, port).await {
        Ok(socket) => socket,
        Err(error) => {
          return Err(self.state.fail_start(listen_error(
            &self.shared.mode,
            &self.log_desc(),
            &host,
            port,
            error,
          )));
        }
      };
      let local = match socket.local_addr() {
        Ok(local) => local,
        Err(error) => {
          return Err(self.state.fail_start(listen_error(
            &self.shared.mode,
            &self.log_desc(),
            &host,
            port,
            error,
          )));
        }
      };

      let shutdown = CancellationToken::new();
      let driver = spawn_recv_pipeline(
        Arc::clone(&self.shared),
        Arc::new(socket),
        local,
        shutdown.clone(),
      );
      self
        .state
        .complete_start(vec![local], shutdown, driver);
      tracing::info!("{} listening at {}", self.log_desc(), format_addrs(&[local]));
      Ok(())
    }
    .boxed()
  }

  fn stop(&self) -> BoxFuture<'_, Result<(), ServerError>> {
    async move { stop_instance(&self.state, &self.shared.mode, self.log_desc()).await }.boxed()
  }
}

/// Bind the first candidate address that accepts the socket.
async fn bind_udp_socket(host: &str, port: u16) -> io::Result<UdpSocket> {
  let addrs = resolve_listen_addrs(host, port).await?;
  let mut last_error = None;
  for addr in addrs {
    match UdpSocket::bind(addr).await {
      Ok(socket) => return Ok(socket),
      Err(error) => last_error = Some(error),
    }
  }
  Err(last_error.unwrap_or_else(|| {
    io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
  }))
}

fn spawn_recv_pipeline(
  shared: Arc<UdpShared>,
  socket: Arc<UdpSocket>,
  local: SocketAddr,
  shutdown: CancellationToken,
) -> JoinHandle<()> {
  let span = tracing::span!(
    tracing::Level::INFO,
    "udp_server",
    mode = shared.mode.full_spec()
  );
  tokio::spawn(
    async move {
      let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          received = socket.recv_from(&mut buffer) => match received {
            Ok((length, peer)) => {
              shared.handle_udp_datagram(&socket, &buffer[..length], peer, local);
            }
            Err(ref error) if is_connection_error(error) => continue,
            Err(error) => {
              tracing::error!(err = %error, "udp receive loop failed");
              break;
            }
          },
        }
      }
    }
    .instrument(span),
  )
}

/// Spurious per-peer errors surfaced by the shared socket; receiving
/// must carry on past them.
fn is_connection_error(error: &io::Error) -> bool {
  error.kind() == io::ErrorKind::ConnectionRefused
    || error.kind() == io::ErrorKind::ConnectionAborted
    || error.kind() == io::ErrorKind::ConnectionReset
}
