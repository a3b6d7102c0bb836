// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::fmt;

use tokio::sync::watch;

/// The resume gate of an intercepted flow.
///
/// Operator tooling may pause a flow while it inspects or rewrites it;
/// hook dispatch blocks on [`Flow::wait_for_resume`] until the operator
/// releases the flow again.
pub struct Flow {
  state: watch::Sender<bool>,
  resumed: watch::Receiver<bool>,
}

impl Flow {
  pub fn new() -> Self {
    let (state, resumed) = watch::channel(true);
    Self { state, resumed }
  }

  pub fn intercept(&self) {
    let _ = self.state.send(false);
  }

  pub fn resume(&self) {
    let _ = self.state.send(true);
  }

  pub fn is_intercepted(&self) -> bool {
    !*self.resumed.borrow()
  }

  /// Completes immediately unless the flow is intercepted.
  pub async fn wait_for_resume(&self) {
    let mut resumed = self.resumed.clone();
    while !*resumed.borrow() {
      if resumed.changed().await.is_err() {
        return;
      }
    }
  }
}

impl Default for Flow {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Flow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Flow")
      .field("intercepted", &self.is_intercepted())
      .finish()
  }
}
