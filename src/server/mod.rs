// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The mode server core: listener instances, the mode registry and the
//! manager contract tying per-flow handlers to operator tooling.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast::{channel as event_channel, Receiver, Sender as Broadcaster};

use crate::common::context::Transport;
use crate::common::hooks::LifecycleEvent;
use crate::common::options::Options;
use crate::util::datagram::DatagramSender;

pub mod handler;
pub mod instance;
pub mod registry;
pub mod tcp;
pub mod udp;

pub use self::handler::ConnectionHandler;
pub use self::instance::{ServerError, ServerInstance};

/// Demultiplexing key for a flow.
///
/// TCP flows are unique per accepted stream. UDP flows are virtual:
/// plain UDP keys on the address pair alone, DNS additionally keys on
/// the query's 16-bit transaction id so interleaved lookups from one
/// client socket become separate flows.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionId {
  Tcp {
    peer: SocketAddr,
    local: SocketAddr,
  },
  Udp {
    peer: SocketAddr,
    local: SocketAddr,
    discriminator: Option<u16>,
  },
}

/// The manager-visible face of a running connection handler.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
  pub transport: Transport,
  pub peer: SocketAddr,
  /// Name of the top layer installed by the listener.
  pub top_layer: &'static str,
  /// Feed half of the flow's datagram queue; `None` for stream flows.
  pub feed: Option<DatagramSender>,
}

/// The single source of truth for "who is handling this flow?".
pub type ConnectionMap = Arc<RwLock<BTreeMap<ConnectionId, ConnectionHandle>>>;

/// Contract between listener instances and the surrounding application.
///
/// The manager owns the connection mapping, the options snapshot handed
/// to new handlers, and the lifecycle bus that carries hooks and log
/// records to operator tooling.
pub trait ServerManager: Send + Sync + 'static {
  fn connections(&self) -> &ConnectionMap;

  fn options(&self) -> Options;

  fn handle_lifecycle(&self, event: LifecycleEvent) -> BoxFuture<'_, ()>;

  /// Insert the handle under `connection_id` for the lifetime of the
  /// returned guard. Release removes the entry on every exit path,
  /// including panics.
  fn register_connection(
    &self,
    connection_id: ConnectionId,
    handle: ConnectionHandle,
  ) -> ConnectionGuard {
    let connections = Arc::clone(self.connections());
    connections
      .write()
      .expect("connection map lock poisoned")
      .insert(connection_id.clone(), handle);
    ConnectionGuard {
      connections,
      connection_id,
    }
  }
}

/// Scoped registration of a connection handler; see
/// [`ServerManager::register_connection`].
pub struct ConnectionGuard {
  connections: ConnectionMap,
  connection_id: ConnectionId,
}

impl Drop for ConnectionGuard {
  fn drop(&mut self) {
    // Deregistration must also happen while unwinding, so recover the
    // map instead of propagating a poisoned lock.
    let mut connections = match self.connections.write() {
      Ok(connections) => connections,
      Err(poisoned) => poisoned.into_inner(),
    };
    connections.remove(&self.connection_id);
  }
}

/// A self-contained manager for embedders and tests: an options
/// snapshot, the connection map, and a broadcast lifecycle bus.
pub struct LocalServerManager {
  options: Options,
  connections: ConnectionMap,

  // New receivers can be made with Sender::subscribe at any time.
  pub events: Broadcaster<LifecycleEvent>,
}

impl LocalServerManager {
  pub fn new(options: Options) -> Self {
    Self {
      options,
      connections: Arc::new(RwLock::new(BTreeMap::new())),
      events: event_channel(32).0,
    }
  }

  pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
    self.events.subscribe()
  }
}

impl ServerManager for LocalServerManager {
  fn connections(&self) -> &ConnectionMap {
    &self.connections
  }

  fn options(&self) -> Options {
    self.options.clone()
  }

  fn handle_lifecycle(&self, event: LifecycleEvent) -> BoxFuture<'_, ()> {
    // Ignore the send error; it only occurs when no receivers exist.
    let _ = self.events.send(event);
    futures::future::ready(()).boxed()
  }
}
