// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The listener instance contract and its shared lifecycle machinery.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;

use downcast_rs::{impl_downcast, Downcast};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::mode::{ModeError, ModeSpec};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
  /// The requested port is taken; the message carries the next-port
  /// suggestion when the operator did not pin a port themselves.
  #[error("{message}")]
  AddressInUse { message: String },
  #[error("{log_desc} failed to listen on {addr} with {source}")]
  BindFailed {
    log_desc: String,
    addr: String,
    #[source]
    source: io::Error,
  },
  #[error("server for mode `{0}` is already running")]
  AlreadyRunning(String),
  #[error("server for mode `{0}` is not running")]
  NotRunning(String),
  #[error("failed to drain listener for mode `{mode}`: {message}")]
  DrainFailed { mode: String, message: String },
  #[error("no server mode is registered as `{0}`")]
  UnknownMode(String),
  #[error(transparent)]
  Mode(#[from] ModeError),
  #[error(transparent)]
  Application(#[from] anyhow::Error),
}

/// A per-mode server: bind on start, demultiplex arrivals into handler
/// tasks, release the sockets on stop.
///
/// `start` and `stop` may be called repeatedly; a failed start leaves
/// the instance restartable.
pub trait ServerInstance: Downcast + Send + Sync {
  fn mode(&self) -> &ModeSpec;

  fn log_desc(&self) -> String;

  fn is_running(&self) -> bool;

  /// The concrete bound addresses; empty unless running.
  fn listen_addrs(&self) -> Vec<SocketAddr>;

  /// The most recent start/stop failure, cleared by the next successful
  /// transition.
  fn last_exception(&self) -> Option<String>;

  fn start(&self) -> BoxFuture<'_, Result<(), ServerError>>;

  fn stop(&self) -> BoxFuture<'_, Result<(), ServerError>>;
}
impl_downcast!(ServerInstance);

pub(crate) enum Lifecycle {
  Stopped,
  Starting,
  Running {
    addrs: Vec<SocketAddr>,
    shutdown: CancellationToken,
    driver: JoinHandle<()>,
  },
  Stopping,
  Failed,
}

/// Lifecycle state shared by every listener family. Transitions hold
/// the lock only briefly; binding and draining happen outside it.
pub(crate) struct InstanceState {
  lifecycle: Mutex<Lifecycle>,
  last_exception: Mutex<Option<String>>,
}

impl InstanceState {
  pub fn new() -> Self {
    Self {
      lifecycle: Mutex::new(Lifecycle::Stopped),
      last_exception: Mutex::new(None),
    }
  }

  pub fn begin_start(&self, mode: &ModeSpec) -> Result<(), ServerError> {
    let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
    match *lifecycle {
      Lifecycle::Stopped | Lifecycle::Failed => {
        *lifecycle = Lifecycle::Starting;
        Ok(())
      }
      _ => Err(ServerError::AlreadyRunning(mode.full_spec().to_string())),
    }
  }

  pub fn complete_start(
    &self,
    addrs: Vec<SocketAddr>,
    shutdown: CancellationToken,
    driver: JoinHandle<()>,
  ) {
    *self.lifecycle.lock().expect("lifecycle lock poisoned") = Lifecycle::Running {
      addrs,
      shutdown,
      driver,
    };
    self.clear_failure();
  }

  /// Record the failure, park the instance in `Failed`, and hand the
  /// error back for the caller to raise.
  pub fn fail_start(&self, error: ServerError) -> ServerError {
    self.record_failure(error.to_string());
    *self.lifecycle.lock().expect("lifecycle lock poisoned") = Lifecycle::Failed;
    error
  }

  pub fn begin_stop(
    &self,
    mode: &ModeSpec,
  ) -> Result<(Vec<SocketAddr>, CancellationToken, JoinHandle<()>), ServerError> {
    let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
    match std::mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
      Lifecycle::Running {
        addrs,
        shutdown,
        driver,
      } => Ok((addrs, shutdown, driver)),
      other => {
        *lifecycle = other;
        Err(ServerError::NotRunning(mode.full_spec().to_string()))
      }
    }
  }

  pub fn mark_stopped(&self) {
    *self.lifecycle.lock().expect("lifecycle lock poisoned") = Lifecycle::Stopped;
  }

  pub fn record_failure(&self, message: String) {
    *self
      .last_exception
      .lock()
      .expect("last exception lock poisoned") = Some(message);
  }

  pub fn clear_failure(&self) {
    *self
      .last_exception
      .lock()
      .expect("last exception lock poisoned") = None;
  }

  pub fn is_running(&self) -> bool {
    matches!(
      *self.lifecycle.lock().expect("lifecycle lock poisoned"),
      Lifecycle::Running { .. }
    )
  }

  pub fn listen_addrs(&self) -> Vec<SocketAddr> {
    match &*self.lifecycle.lock().expect("lifecycle lock poisoned") {
      Lifecycle::Running { addrs, .. } => addrs.clone(),
      _ => Vec::new(),
    }
  }

  pub fn last_exception(&self) -> Option<String> {
    self
      .last_exception
      .lock()
      .expect("last exception lock poisoned")
      .clone()
  }
}

/// Shared stop sequence: capture and clear the running state, request
/// socket close, then await the accept/receive drain. The state is
/// cleared before the drain so a re-`start()` is always possible, even
/// when draining fails.
pub(crate) async fn stop_instance(
  state: &InstanceState,
  mode: &ModeSpec,
  log_desc: String,
) -> Result<(), ServerError> {
  let (addrs, shutdown, driver) = state.begin_stop(mode)?;
  shutdown.cancel();
  state.mark_stopped();
  match driver.await {
    Ok(()) => {
      state.clear_failure();
      tracing::info!("Stopped {} at {}", log_desc, format_addrs(&addrs));
      Ok(())
    }
    Err(join_error) => {
      let error = ServerError::DrainFailed {
        mode: mode.full_spec().to_string(),
        message: join_error.to_string(),
      };
      state.record_failure(error.to_string());
      Err(error)
    }
  }
}

/// Candidate socket addresses for a listen host. An empty host expands
/// to the unspecified address of both families so dual-stack hosts are
/// covered regardless of the ipv6only sysctl.
pub(crate) async fn resolve_listen_addrs(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
  if host.is_empty() {
    return Ok(vec![
      SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
      SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    ]);
  }
  let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
  if addrs.is_empty() {
    return Err(io::Error::new(
      io::ErrorKind::AddrNotAvailable,
      format!("listen host `{}` resolved to no addresses", host),
    ));
  }
  Ok(addrs)
}

/// Map a bind failure to the operator-facing error. Port collisions
/// earn a next-port suggestion, but only when the operator left the
/// port to us; a pinned port is respected verbatim.
pub(crate) fn listen_error(
  mode: &ModeSpec,
  log_desc: &str,
  host: &str,
  port: u16,
  error: io::Error,
) -> ServerError {
  let shown_host = if host.is_empty() { "*" } else { host };
  if error.kind() == io::ErrorKind::AddrInUse && mode.custom_listen_port().is_none() {
    let message = format!(
      "{} failed to listen on {}:{} with {}. Try specifying a different port by using `--mode {}@{}`.",
      log_desc,
      shown_host,
      port,
      error,
      mode.full_spec(),
      port.wrapping_add(1),
    );
    ServerError::AddressInUse { message }
  } else {
    ServerError::BindFailed {
      log_desc: log_desc.to_string(),
      addr: format!("{}:{}", shown_host, port),
      source: error,
    }
  }
}

pub(crate) fn format_addrs(addrs: &[SocketAddr]) -> String {
  addrs
    .iter()
    .map(|addr| addr.to_string())
    .collect::<Vec<_>>()
    .join(", ")
}
