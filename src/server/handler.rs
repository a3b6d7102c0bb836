// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The per-flow connection handler bridging listeners to the protocol
//! engine: it owns the transport halves and the idle watchdog, drives
//! the top layer, and delivers lifecycle hooks through the manager.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Instant;

use crate::common::context::Context;
use crate::common::flow::Flow;
use crate::common::hooks::{ConnectionHook, HookKind, LifecycleEvent, LogRecord};
use crate::common::layer::{Layer, LayerCommand, LayerEvent};
use crate::common::mode::ModeSpec;
use crate::common::options::Options;
use crate::server::ServerManager;
use crate::util::datagram::{DatagramReader, DatagramWriter};

/// Idle timeout for stream flows; UDP listeners shorten this per flow.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Read half of a flow's transport.
pub enum TransportReader {
  Tcp(OwnedReadHalf),
  Datagram(DatagramReader),
}

impl TransportReader {
  /// The next unit of client data: a read chunk for streams, a whole
  /// datagram for datagram flows. `None` once the client side is done.
  pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
    match self {
      TransportReader::Tcp(read_half) => {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let read = read_half.read(&mut buffer).await?;
        if read == 0 {
          Ok(None)
        } else {
          buffer.truncate(read);
          Ok(Some(buffer))
        }
      }
      TransportReader::Datagram(reader) => Ok(reader.recv().await.map(|datagram| datagram.data)),
    }
  }
}

/// Write half of a flow's transport.
pub enum TransportWriter {
  Tcp(OwnedWriteHalf),
  Datagram(DatagramWriter),
}

impl TransportWriter {
  pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
    match self {
      TransportWriter::Tcp(write_half) => write_half.write_all(data).await,
      TransportWriter::Datagram(writer) => writer.send(data).await.map(|_| ()),
    }
  }

  pub async fn drain(&mut self) -> io::Result<()> {
    match self {
      TransportWriter::Tcp(write_half) => {
        write_half.flush().await?;
        write_half.shutdown().await
      }
      TransportWriter::Datagram(_) => Ok(()),
    }
  }
}

/// Idle timer bounding a flow's lifetime.
///
/// The watchdog is disarmed while a hook dispatch is in flight so that
/// slow operator scripts do not count against the flow's idle budget.
pub struct TimeoutWatchdog {
  timeout: Duration,
  last_activity: Mutex<Instant>,
  disarm_count: AtomicUsize,
}

impl TimeoutWatchdog {
  pub fn new(timeout: Duration) -> Self {
    Self {
      timeout,
      last_activity: Mutex::new(Instant::now()),
      disarm_count: AtomicUsize::new(0),
    }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn set_timeout(&mut self, timeout: Duration) {
    self.timeout = timeout;
  }

  pub fn register_activity(&self) {
    *self
      .last_activity
      .lock()
      .expect("watchdog activity lock poisoned") = Instant::now();
  }

  /// Suspend expiry for the lifetime of the guard; dropping it re-arms
  /// the watchdog with a fresh idle budget.
  pub fn disarm(&self) -> DisarmGuard<'_> {
    self.disarm_count.fetch_add(1, Ordering::SeqCst);
    DisarmGuard { watchdog: self }
  }

  /// Resolves once the flow has been idle for the full timeout while
  /// armed. Pending forever while disarmed.
  pub async fn expired(&self) {
    loop {
      let deadline = *self
        .last_activity
        .lock()
        .expect("watchdog activity lock poisoned")
        + self.timeout;
      if Instant::now() >= deadline {
        if self.disarm_count.load(Ordering::SeqCst) == 0 {
          return;
        }
        // A disarmed dispatch window counts as activity.
        self.register_activity();
        continue;
      }
      tokio::time::sleep_until(deadline).await;
    }
  }
}

pub struct DisarmGuard<'a> {
  watchdog: &'a TimeoutWatchdog,
}

impl Drop for DisarmGuard<'_> {
  fn drop(&mut self) {
    self.watchdog.disarm_count.fetch_sub(1, Ordering::SeqCst);
    self.watchdog.register_activity();
  }
}

enum ReadOutcome {
  Idle,
  Data(Vec<u8>),
  Eof,
  Failed(io::Error),
}

pub struct ConnectionHandler {
  manager: Arc<dyn ServerManager>,
  mode: ModeSpec,
  options: Options,
  pub context: Context,
  /// Top layer installed by the listener before the handler is driven.
  pub layer: Option<Box<dyn Layer>>,
  pub watchdog: TimeoutWatchdog,
  reader: TransportReader,
  writer: TransportWriter,
  log_prefix: String,
}

impl ConnectionHandler {
  pub fn new(
    manager: Arc<dyn ServerManager>,
    reader: TransportReader,
    writer: TransportWriter,
    options: Options,
    mode: ModeSpec,
    context: Context,
  ) -> Self {
    let log_prefix = match context.client.peername {
      Some(peer) => format!("{}: ", peer),
      None => "client: ".to_string(),
    };
    Self {
      manager,
      mode,
      options,
      context,
      layer: None,
      watchdog: TimeoutWatchdog::new(CONNECTION_TIMEOUT),
      reader,
      writer,
      log_prefix,
    }
  }

  pub fn mode(&self) -> &ModeSpec {
    &self.mode
  }

  /// The options snapshot captured when the flow arrived.
  pub fn options(&self) -> &Options {
    &self.options
  }

  /// Drive the flow to completion. Per-connection failures are
  /// contained here and surface only as log records.
  pub async fn handle_client(&mut self) {
    self
      .dispatch_hook(HookKind::ClientConnected, None)
      .await;

    let mut layer = match self.layer.take() {
      Some(layer) => layer,
      None => {
        self.log(tracing::Level::ERROR, "no top layer installed");
        return;
      }
    };

    let commands = layer.handle_event(LayerEvent::Start);
    let mut closed = self.run_commands(commands).await;

    while !closed {
      let outcome = {
        let reader = &mut self.reader;
        let watchdog = &self.watchdog;
        tokio::select! {
          _ = watchdog.expired() => ReadOutcome::Idle,
          chunk = reader.next_chunk() => match chunk {
            Ok(Some(data)) => ReadOutcome::Data(data),
            Ok(None) => ReadOutcome::Eof,
            Err(error) => ReadOutcome::Failed(error),
          },
        }
      };
      match outcome {
        ReadOutcome::Idle => {
          self.log(
            tracing::Level::INFO,
            "closing connection due to inactivity",
          );
          break;
        }
        ReadOutcome::Data(data) => {
          self.watchdog.register_activity();
          let commands = layer.handle_event(LayerEvent::DataReceived(&data));
          closed = self.run_commands(commands).await;
        }
        ReadOutcome::Eof => {
          let commands = layer.handle_event(LayerEvent::ConnectionClosed);
          self.run_commands(commands).await;
          break;
        }
        ReadOutcome::Failed(error) => {
          self.log(
            tracing::Level::WARN,
            &format!("client read failed: {}", error),
          );
          break;
        }
      }
    }

    self.layer = Some(layer);
    if let Err(error) = self.writer.drain().await {
      self.log(
        tracing::Level::DEBUG,
        &format!("failed to drain client transport: {}", error),
      );
    }
    self
      .dispatch_hook(HookKind::ClientDisconnected, None)
      .await;
  }

  /// Deliver a hook through the manager's lifecycle bus. The watchdog
  /// stays disarmed for the whole dispatch, and an intercepted flow
  /// payload parks the handler until the operator resumes it.
  pub async fn handle_hook(&self, hook: ConnectionHook) {
    let _disarmed = self.watchdog.disarm();
    let flow = hook.flow.clone();
    self
      .manager
      .handle_lifecycle(LifecycleEvent::Hook(hook))
      .await;
    if let Some(flow) = flow {
      flow.wait_for_resume().await;
    }
  }

  pub fn log(&self, level: tracing::Level, message: &str) {
    let message = format!("{}{}", self.log_prefix, message);
    if level == tracing::Level::ERROR {
      tracing::error!("{}", message);
    } else if level == tracing::Level::WARN {
      tracing::warn!("{}", message);
    } else if level == tracing::Level::INFO {
      tracing::info!("{}", message);
    } else if level == tracing::Level::DEBUG {
      tracing::debug!("{}", message);
    } else {
      tracing::trace!("{}", message);
    }
    let manager = Arc::clone(&self.manager);
    let record = LogRecord { level, message };
    tokio::spawn(async move {
      manager.handle_lifecycle(LifecycleEvent::Log(record)).await;
    });
  }

  async fn dispatch_hook(&self, kind: HookKind, flow: Option<Arc<Flow>>) {
    let hook = ConnectionHook {
      kind,
      context: self.context.clone(),
      flow,
    };
    self.handle_hook(hook).await;
  }

  async fn run_commands(&mut self, commands: Vec<LayerCommand>) -> bool {
    for command in commands {
      match command {
        LayerCommand::SendData(data) => {
          if let Err(error) = self.writer.send(&data).await {
            self.log(
              tracing::Level::WARN,
              &format!("client write failed: {}", error),
            );
            return true;
          }
          self.watchdog.register_activity();
        }
        LayerCommand::CloseConnection => return true,
        LayerCommand::RequestHook(kind) => self.dispatch_hook(kind, None).await,
      }
    }
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::SocketAddr;
  use std::time::Duration;

  use tokio::net::UdpSocket;

  use crate::common::context::Transport;
  use crate::server::LocalServerManager;
  use crate::util::datagram;

  #[tokio::test]
  async fn watchdog_expires_after_idle_timeout() {
    let watchdog = TimeoutWatchdog::new(Duration::from_millis(50));
    tokio::time::timeout(Duration::from_secs(1), watchdog.expired())
      .await
      .expect("armed watchdog must expire");
  }

  #[tokio::test]
  async fn disarmed_watchdog_does_not_expire() {
    let watchdog = TimeoutWatchdog::new(Duration::from_millis(50));
    let guard = watchdog.disarm();
    assert!(
      tokio::time::timeout(Duration::from_millis(200), watchdog.expired())
        .await
        .is_err()
    );
    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), watchdog.expired())
      .await
      .expect("re-armed watchdog must expire");
  }

  struct EchoOnce;

  impl Layer for EchoOnce {
    fn name(&self) -> &'static str {
      "EchoOnce"
    }

    fn handle_event(&mut self, event: LayerEvent<'_>) -> Vec<LayerCommand> {
      match event {
        LayerEvent::DataReceived(data) => vec![
          LayerCommand::SendData(data.to_vec()),
          LayerCommand::CloseConnection,
        ],
        _ => Vec::new(),
      }
    }
  }

  async fn datagram_handler(
    manager: Arc<LocalServerManager>,
    peer_socket: &UdpSocket,
  ) -> (ConnectionHandler, datagram::DatagramSender) {
    let peer = peer_socket.local_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (feed, reader) = datagram::channel();
    let writer = DatagramWriter::new(Arc::new(socket), peer);
    let mut context = Context::new(Transport::Udp);
    context.client.peername = Some(peer);
    let handler = ConnectionHandler::new(
      manager,
      TransportReader::Datagram(reader),
      TransportWriter::Datagram(writer),
      Options::default(),
      ModeSpec::parse("udp:regular").unwrap(),
      context,
    );
    (handler, feed)
  }

  #[tokio::test]
  async fn handle_client_runs_layer_commands_and_hooks() {
    let manager = Arc::new(LocalServerManager::new(Options::default()));
    let mut events = manager.subscribe();
    let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (mut handler, feed) = datagram_handler(Arc::clone(&manager), &peer_socket).await;
    handler.layer = Some(Box::new(EchoOnce));

    let peer = peer_socket.local_addr().unwrap();
    assert!(feed.feed(b"ping".to_vec(), peer));
    tokio::time::timeout(Duration::from_secs(2), handler.handle_client())
      .await
      .expect("close command must finish the handler");

    let mut buf = [0u8; 16];
    let (len, _) = peer_socket.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"ping");

    let first = events.recv().await.unwrap();
    match first {
      LifecycleEvent::Hook(hook) => {
        assert_eq!(hook.kind, HookKind::ClientConnected);
        assert_eq!(hook.context.client.peername, Some(peer));
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn handle_hook_waits_for_intercepted_flows() {
    let manager = Arc::new(LocalServerManager::new(Options::default()));
    let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (handler, _feed) = datagram_handler(Arc::clone(&manager), &peer_socket).await;

    let flow = Arc::new(Flow::new());
    flow.intercept();
    let hook = ConnectionHook {
      kind: HookKind::ClientConnected,
      context: handler.context.clone(),
      flow: Some(Arc::clone(&flow)),
    };

    let resumer = {
      let flow = Arc::clone(&flow);
      tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        flow.resume();
      })
    };
    tokio::time::timeout(Duration::from_secs(2), handler.handle_hook(hook))
      .await
      .expect("hook dispatch must resume with the flow");
    resumer.await.unwrap();
  }

  #[tokio::test]
  async fn log_records_reach_the_lifecycle_bus() {
    let manager = Arc::new(LocalServerManager::new(Options::default()));
    let mut events = manager.subscribe();
    let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (handler, _feed) = datagram_handler(Arc::clone(&manager), &peer_socket).await;
    let peer: SocketAddr = peer_socket.local_addr().unwrap();

    handler.log(tracing::Level::INFO, "checking in");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
      .await
      .unwrap()
      .unwrap();
    match event {
      LifecycleEvent::Log(record) => {
        assert_eq!(record.message, format!("{}: checking in", peer));
        assert_eq!(record.level, tracing::Level::INFO);
      }
      other => panic!("unexpected event: {:?}", other),
    }
  }
}
