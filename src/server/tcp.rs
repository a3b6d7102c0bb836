// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stream-mode listeners: regular, upstream, transparent, reverse and
//! SOCKS v5 servers differ only in their top-layer factory and log
//! description; the accept pipeline is shared.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::context::{Context, TargetAddr, Transport};
use crate::common::layer::{
  HttpProxy, HttpUpstreamProxy, Layer, ReverseProxy, Socks5Proxy, TransparentProxy,
};
use crate::common::mode::{ModeKind, ModeSpec};
use crate::common::platform;
use crate::server::handler::{ConnectionHandler, TransportReader, TransportWriter};
use crate::server::instance::{
  format_addrs, listen_error, resolve_listen_addrs, stop_instance, InstanceState, ServerError,
  ServerInstance,
};
use crate::server::{ConnectionHandle, ConnectionId, ServerManager};

pub struct TcpInstance {
  shared: Arc<TcpShared>,
  state: InstanceState,
}

struct TcpShared {
  mode: ModeSpec,
  manager: Arc<dyn ServerManager>,
}

impl TcpInstance {
  pub const MODE_TYPES: &'static [&'static str] =
    &["regular", "upstream", "transparent", "reverse", "socks5"];

  pub fn factory(
    mode: ModeSpec,
    manager: Arc<dyn ServerManager>,
  ) -> Result<Box<dyn ServerInstance>, ServerError> {
    Ok(Box::new(TcpInstance {
      shared: Arc::new(TcpShared { mode, manager }),
      state: InstanceState::new(),
    }))
  }

  pub(crate) fn is_transparent(&self) -> bool {
    self.shared.is_transparent()
  }

  pub(crate) fn make_top_layer(&self, context: &mut Context) -> Box<dyn Layer> {
    self.shared.make_top_layer(context)
  }
}

impl TcpShared {
  fn log_desc(&self) -> String {
    match self.mode.kind() {
      ModeKind::Regular => "HTTP(S) proxy".to_string(),
      ModeKind::Upstream { .. } => "HTTP(S) proxy (upstream mode)".to_string(),
      ModeKind::Transparent => "Transparent proxy".to_string(),
      ModeKind::Reverse { target } => format!("Reverse proxy to {}", target),
      ModeKind::Socks5 => "SOCKS v5 proxy".to_string(),
      other => unreachable!("stream listener constructed for mode {:?}", other),
    }
  }

  fn is_transparent(&self) -> bool {
    matches!(self.mode.kind(), ModeKind::Transparent)
  }

  fn make_top_layer(&self, context: &mut Context) -> Box<dyn Layer> {
    match self.mode.kind() {
      ModeKind::Regular => Box::new(HttpProxy),
      ModeKind::Upstream { .. } => Box::new(HttpUpstreamProxy),
      ModeKind::Transparent => Box::new(TransparentProxy),
      ModeKind::Reverse { target } => {
        context.server.address = Some(target.target_addr());
        Box::new(ReverseProxy)
      }
      ModeKind::Socks5 => Box::new(Socks5Proxy),
      other => unreachable!("stream listener constructed for mode {:?}", other),
    }
  }

  async fn handle_tcp_connection(self: Arc<Self>, stream: TcpStream) {
    let (peer, local) = match (stream.peer_addr(), stream.local_addr()) {
      (Ok(peer), Ok(local)) => (peer, local),
      (Err(error), _) | (_, Err(error)) => {
        tracing::warn!(err = %error, "failed to resolve accepted socket addresses");
        return;
      }
    };
    let connection_id = ConnectionId::Tcp { peer, local };

    let mut context = Context::new(Transport::Tcp);
    context.client.peername = Some(peer);
    context.client.sockname = Some(local);
    if self.is_transparent() {
      match platform::original_addr(&stream) {
        Ok(address) => context.server.address = Some(TargetAddr::Socket(address)),
        Err(error) => tracing::error!("Transparent mode failure: {:?}", error),
      }
    }
    let layer = self.make_top_layer(&mut context);
    let top_layer = layer.name();

    let (read_half, write_half) = stream.into_split();
    let mut handler = ConnectionHandler::new(
      Arc::clone(&self.manager),
      TransportReader::Tcp(read_half),
      TransportWriter::Tcp(write_half),
      self.manager.options(),
      self.mode.clone(),
      context,
    );
    handler.layer = Some(layer);

    let handle = ConnectionHandle {
      transport: Transport::Tcp,
      peer,
      top_layer,
      feed: None,
    };
    let _registration = self.manager.register_connection(connection_id, handle);
    handler.handle_client().await;
  }
}

impl ServerInstance for TcpInstance {
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

      let listeners = match bind_stream_listeners(&host, port).await {
        Ok(listeners) => listeners,
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
      let addrs = match listeners
        .iter()
        .map(TcpListener::local_addr)
        .collect::<io::Result<Vec<_>>>()
      {
        Ok(addrs) => addrs,
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
      let driver = spawn_accept_pipeline(Arc::clone(&self.shared), listeners, shutdown.clone());
      self.state.complete_start(addrs.clone(), shutdown, driver);
      tracing::info!("{} listening at {}", self.log_desc(), format_addrs(&addrs));
      Ok(())
    }
    .boxed()
  }

  fn stop(&self) -> BoxFuture<'_, Result<(), ServerError>> {
    async move { stop_instance(&self.state, &self.shared.mode, self.log_desc()).await }.boxed()
  }
}

/// Bind one listener per candidate address. For an explicit host every
/// resolved address must bind; the unspecified-host expansion tolerates
/// a missing address family as long as one socket comes up.
async fn bind_stream_listeners(host: &str, port: u16) -> io::Result<Vec<TcpListener>> {
  let addrs = resolve_listen_addrs(host, port).await?;
  if host.is_empty() {
    let mut listeners = Vec::new();
    let mut errors = Vec::new();
    for addr in addrs {
      match TcpListener::bind(addr).await {
        Ok(listener) => listeners.push(listener),
        Err(error) => errors.push(error),
      }
    }
    if listeners.is_empty() {
      let preferred = errors
        .iter()
        .position(|error| error.kind() == io::ErrorKind::AddrInUse)
        .unwrap_or(0);
      return Err(errors.swap_remove(preferred));
    }
    Ok(listeners)
  } else {
    let mut listeners = Vec::new();
    for addr in addrs {
      listeners.push(TcpListener::bind(addr).await?);
    }
    Ok(listeners)
  }
}

fn spawn_accept_pipeline(
  shared: Arc<TcpShared>,
  listeners: Vec<TcpListener>,
  shutdown: CancellationToken,
) -> JoinHandle<()> {
  let span = tracing::span!(
    tracing::Level::INFO,
    "tcp_server",
    mode = shared.mode.full_spec()
  );
  let incoming = stream::select_all(listeners.into_iter().map(TcpListenerStream::new));
  tokio::spawn(
    async move {
      incoming
        .take_until({
          let shutdown = shutdown.clone();
          async move { shutdown.cancelled().await }
        })
        .for_each(move |accepted| {
          let shared = Arc::clone(&shared);
          async move {
            match accepted {
              Ok(stream) => {
                // One task per connection; stop() only cancels the
                // accept loop, never in-flight flows.
                tokio::spawn(shared.handle_tcp_connection(stream));
              }
              Err(error) => {
                tracing::warn!(err = %error, "failed to accept incoming connection");
              }
            }
          }
        })
        .await;
    }
    .instrument(span),
  )
}
