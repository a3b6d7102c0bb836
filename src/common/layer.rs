// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The top-of-stack protocol layer seam.
//!
//! Listeners install one top layer per flow; the protocol engine that
//! stacks further layers beneath it is a separate concern. A layer is a
//! state machine fed transport events and answering with commands for
//! the connection handler to execute.

use downcast_rs::{impl_downcast, Downcast};

use crate::common::hooks::HookKind;

#[derive(Debug)]
pub enum LayerEvent<'a> {
  /// The flow is registered and about to be driven.
  Start,
  DataReceived(&'a [u8]),
  ConnectionClosed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LayerCommand {
  /// Write the given bytes back to the client.
  SendData(Vec<u8>),
  CloseConnection,
  RequestHook(HookKind),
}

pub trait Layer: Downcast + Send + Sync {
  fn name(&self) -> &'static str;

  fn handle_event(&mut self, event: LayerEvent<'_>) -> Vec<LayerCommand>;
}
impl_downcast!(Layer);

// The mode layers below are entry-point markers: they determine which
// protocol stack the engine assembles for the flow and issue no commands
// of their own.

/// Explicit HTTP(S) proxying; clients address the proxy directly.
#[derive(Debug, Default)]
pub struct HttpProxy;

impl Layer for HttpProxy {
  fn name(&self) -> &'static str {
    "HttpProxy"
  }

  fn handle_event(&mut self, _event: LayerEvent<'_>) -> Vec<LayerCommand> {
    Vec::new()
  }
}

/// HTTP(S) proxying chained through a second, upstream proxy.
#[derive(Debug, Default)]
pub struct HttpUpstreamProxy;

impl Layer for HttpUpstreamProxy {
  fn name(&self) -> &'static str {
    "HttpUpstreamProxy"
  }

  fn handle_event(&mut self, _event: LayerEvent<'_>) -> Vec<LayerCommand> {
    Vec::new()
  }
}

/// Proxying for clients redirected here by the network without knowing.
#[derive(Debug, Default)]
pub struct TransparentProxy;

impl Layer for TransparentProxy {
  fn name(&self) -> &'static str {
    "TransparentProxy"
  }

  fn handle_event(&mut self, _event: LayerEvent<'_>) -> Vec<LayerCommand> {
    Vec::new()
  }
}

/// Proxying toward a fixed target configured in the mode spec.
#[derive(Debug, Default)]
pub struct ReverseProxy;

impl Layer for ReverseProxy {
  fn name(&self) -> &'static str {
    "ReverseProxy"
  }

  fn handle_event(&mut self, _event: LayerEvent<'_>) -> Vec<LayerCommand> {
    Vec::new()
  }
}

#[derive(Debug, Default)]
pub struct Socks5Proxy;

impl Layer for Socks5Proxy {
  fn name(&self) -> &'static str {
    "Socks5Proxy"
  }

  fn handle_event(&mut self, _event: LayerEvent<'_>) -> Vec<LayerCommand> {
    Vec::new()
  }
}

#[derive(Debug, Default)]
pub struct DnsLayer;

impl Layer for DnsLayer {
  fn name(&self) -> &'static str {
    "DnsLayer"
  }

  fn handle_event(&mut self, _event: LayerEvent<'_>) -> Vec<LayerCommand> {
    Vec::new()
  }
}
