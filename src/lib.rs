// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Mode-driven server core for an intercepting proxy.
//!
//! This crate parses operator-supplied *mode specifications*, binds the
//! matching TCP or UDP listeners, and demultiplexes incoming connections or
//! datagram flows into per-flow connection handlers which install the
//! mode-specific top protocol layer.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use snoproxy::common::options::Options;
//! use snoproxy::server::registry;
//! use snoproxy::server::{LocalServerManager, ServerInstance, ServerManager};
//!
//! # async fn demo() -> Result<(), snoproxy::server::instance::ServerError> {
//! registry::register_default_modes();
//! let manager: Arc<dyn ServerManager> = Arc::new(LocalServerManager::new(Options::default()));
//! let server = registry::make("reverse:https://example.com", manager)?;
//! server.start().await?;
//! // TCP server is running now.
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod server;
pub mod util;
