// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Process-wide mapping from mode tags to listener factories.
//!
//! Registration is explicit and happens once at startup: each concrete
//! listener declares the mode tags it handles and
//! [`register_default_modes`] wires them up, idempotently. Third-party
//! listeners can claim additional tags with [`register`] as long as the
//! tag is free.

use std::collections::BTreeMap;
use std::sync::{Arc, Once, RwLock};

use crate::common::mode::ModeSpec;
use crate::server::instance::{ServerError, ServerInstance};
use crate::server::tcp::TcpInstance;
use crate::server::udp::UdpInstance;
use crate::server::ServerManager;

pub type ListenerFactory =
  fn(ModeSpec, Arc<dyn ServerManager>) -> Result<Box<dyn ServerInstance>, ServerError>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
  #[error("server mode `{0}` is already registered")]
  ModeOccupied(String),
}

lazy_static::lazy_static! {
  static ref MODE_REGISTRY: RwLock<BTreeMap<String, ListenerFactory>> =
    RwLock::new(BTreeMap::new());
}

/// Claim a mode tag. Duplicate tags are a startup-time invariant
/// violation and are rejected.
pub fn register(mode_type: &str, factory: ListenerFactory) -> Result<(), RegistryError> {
  let mut modes = MODE_REGISTRY.write().expect("mode registry lock poisoned");
  if modes.contains_key(mode_type) {
    return Err(RegistryError::ModeOccupied(mode_type.to_string()));
  }
  modes.insert(mode_type.to_string(), factory);
  Ok(())
}

/// Register every built-in listener family; safe to call repeatedly.
pub fn register_default_modes() {
  static DEFAULTS: Once = Once::new();
  DEFAULTS.call_once(|| {
    for mode_type in TcpInstance::MODE_TYPES {
      register(mode_type, TcpInstance::factory).expect("default mode registration clashed");
    }
    register("dns", UdpInstance::dns_factory).expect("default mode registration clashed");
    register("udp", UdpInstance::udp_factory).expect("default mode registration clashed");
  });
}

/// Parse a mode string and construct the listener handling it.
pub fn make(
  spec: &str,
  manager: Arc<dyn ServerManager>,
) -> Result<Box<dyn ServerInstance>, ServerError> {
  let mode = ModeSpec::parse(spec)?;
  from_spec(mode, manager)
}

pub fn from_spec(
  mode: ModeSpec,
  manager: Arc<dyn ServerManager>,
) -> Result<Box<dyn ServerInstance>, ServerError> {
  let factory = {
    let modes = MODE_REGISTRY.read().expect("mode registry lock poisoned");
    modes.get(mode.mode_type()).copied()
  };
  match factory {
    Some(factory) => factory(mode, manager),
    None => Err(ServerError::UnknownMode(mode.mode_type().to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::options::Options;
  use crate::server::LocalServerManager;

  fn test_manager() -> Arc<dyn ServerManager> {
    Arc::new(LocalServerManager::new(Options::default()))
  }

  fn failing_factory(
    _mode: ModeSpec,
    _manager: Arc<dyn ServerManager>,
  ) -> Result<Box<dyn ServerInstance>, ServerError> {
    Err(ServerError::UnknownMode("test".to_string()))
  }

  #[test]
  fn rejects_duplicate_tags() {
    register_default_modes();
    assert!(matches!(
      register("regular", failing_factory),
      Err(RegistryError::ModeOccupied(_))
    ));
  }

  #[test]
  fn every_default_mode_constructs() {
    register_default_modes();
    let specs = [
      "regular",
      "upstream:https://proxy.example.com",
      "transparent",
      "reverse:tcp://127.0.0.1:9000",
      "socks5",
      "dns",
      "udp:reverse:udp://127.0.0.1:9000",
    ];
    for spec in &specs {
      let instance = make(spec, test_manager())
        .unwrap_or_else(|error| panic!("mode `{}` failed to construct: {}", spec, error));
      assert_eq!(instance.mode().full_spec(), *spec);
      assert!(!instance.is_running());
    }
  }

  #[test]
  fn unknown_modes_are_rejected() {
    register_default_modes();
    assert!(matches!(
      make("magic", test_manager()),
      Err(ServerError::Mode(_))
    ));
  }
}
