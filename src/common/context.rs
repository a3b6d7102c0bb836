// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-flow context records shared between listeners, handlers and layers.

use std::fmt::{self, Display};
use std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
  Tcp,
  Udp,
}

impl Display for Transport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Transport::Tcp => f.write_str("tcp"),
      Transport::Udp => f.write_str("udp"),
    }
  }
}

/// A connection target that may or may not be resolved yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
  Socket(SocketAddr),
  Named { host: String, port: u16 },
}

impl Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetAddr::Socket(addr) => Display::fmt(addr, f),
      TargetAddr::Named { host, port } => write!(f, "{}:{}", host, port),
    }
  }
}

/// The client half of a flow: who connected to us, and on which socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientEndpoint {
  pub peername: Option<SocketAddr>,
  pub sockname: Option<SocketAddr>,
  pub transport_protocol: Transport,
}

/// The server half of a flow: where traffic is ultimately headed.
///
/// Listeners seed the address for modes that know it up front (reverse
/// targets, transparent original destinations, DNS upstreams); other
/// modes leave it for the protocol engine to discover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEndpoint {
  pub address: Option<TargetAddr>,
  pub transport_protocol: Transport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
  pub client: ClientEndpoint,
  pub server: ServerEndpoint,
}

impl Context {
  pub fn new(transport: Transport) -> Self {
    Self {
      client: ClientEndpoint {
        peername: None,
        sockname: None,
        transport_protocol: transport,
      },
      server: ServerEndpoint {
        address: None,
        transport_protocol: Transport::Tcp,
      },
    }
  }
}
