// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Platform redirection lookup for transparent modes.
//!
//! Transparent deployments redirect clients here at the network layer;
//! recovering the destination the client was actually trying to reach
//! requires a platform-specific query against the redirector state.
//! That query lives behind [`OriginalAddrLookup`] and is installed once
//! at startup by the embedding application.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::TcpStream;

pub trait OriginalAddrLookup: Send + Sync {
  /// The pre-redirection destination of the given client socket.
  fn original_addr(&self, socket: &TcpStream) -> anyhow::Result<SocketAddr>;
}

lazy_static::lazy_static! {
  static ref ORIGINAL_ADDR_LOOKUP: RwLock<Option<Arc<dyn OriginalAddrLookup>>> =
    RwLock::new(None);
}

pub fn set_original_addr_lookup(lookup: Arc<dyn OriginalAddrLookup>) {
  *ORIGINAL_ADDR_LOOKUP
    .write()
    .expect("platform lookup lock poisoned") = Some(lookup);
}

pub fn clear_original_addr_lookup() {
  *ORIGINAL_ADDR_LOOKUP
    .write()
    .expect("platform lookup lock poisoned") = None;
}

pub fn original_addr(socket: &TcpStream) -> anyhow::Result<SocketAddr> {
  let lookup = ORIGINAL_ADDR_LOOKUP
    .read()
    .expect("platform lookup lock poisoned")
    .clone();
  match lookup {
    Some(lookup) => lookup.original_addr(socket),
    None => Err(anyhow::anyhow!(
      "no platform redirection lookup is installed"
    )),
  }
}
