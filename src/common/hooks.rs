// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Events delivered through the server manager's lifecycle bus.

use std::sync::Arc;

use crate::common::context::Context;
use crate::common::flow::Flow;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookKind {
  ClientConnected,
  ClientDisconnected,
}

/// A lifecycle hook raised by a connection handler.
///
/// The context is a snapshot taken at dispatch time. When the payload
/// carries a [`Flow`], the dispatching handler awaits its resume signal
/// before continuing; this is how operator pauses are implemented.
#[derive(Clone, Debug)]
pub struct ConnectionHook {
  pub kind: HookKind,
  pub context: Context,
  pub flow: Option<Arc<Flow>>,
}

/// A log record forwarded to operator tooling alongside hooks.
#[derive(Clone, Debug)]
pub struct LogRecord {
  pub level: tracing::Level,
  pub message: String,
}

#[derive(Clone, Debug)]
pub enum LifecycleEvent {
  Hook(ConnectionHook),
  Log(LogRecord),
}
