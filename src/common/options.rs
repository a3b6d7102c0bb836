// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use serde::{Deserialize, Serialize};

/// Process-wide listener options.
///
/// Handlers capture a snapshot at construction time and treat it as
/// immutable for the lifetime of the flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
  /// Host to listen on when the mode spec does not pin one; empty means
  /// every interface.
  pub listen_host: String,
  /// Port to listen on when the mode spec does not pin one; `None` falls
  /// back to the mode's well-known port.
  pub listen_port: Option<u16>,
}
