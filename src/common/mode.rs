// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Operator-visible proxy mode specifications.
//!
//! A mode string has the shape `KIND[:DATA][@[HOST:]PORT]`; the listen
//! suffix is split off at the last `@`, the kind tag at the first `:`.
//! `udp` wraps a stream-capable inner mode whose DATA is itself a mode
//! string, e.g. `udp:reverse:tcp://localhost:8080`.

use std::fmt::{self, Display};
use std::net::IpAddr;
use std::str::FromStr;

use crate::common::context::TargetAddr;

const DEFAULT_PROXY_PORT: u16 = 8080;
const DEFAULT_DNS_PORT: u16 = 53;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModeError {
  #[error("invalid proxy mode specification: {0}")]
  MalformedMode(String),
  #[error("invalid address: {0}")]
  InvalidAddress(String),
  #[error("invalid port: {0}")]
  InvalidPort(String),
}

/// An upstream or reverse target of the form `scheme://host[:port]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSpec {
  pub scheme: String,
  pub host: String,
  pub port: u16,
}

impl ServerSpec {
  /// The target as an address record; IP literals resolve to socket
  /// addresses, everything else stays a named target.
  pub fn target_addr(&self) -> TargetAddr {
    match self.host.parse::<IpAddr>() {
      Ok(ip) => TargetAddr::Socket((ip, self.port).into()),
      Err(_) => TargetAddr::Named {
        host: self.host.clone(),
        port: self.port,
      },
    }
  }
}

impl Display for ServerSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
    } else {
      write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
  }
}

/// How a DNS server instance resolves the queries it intercepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DnsResolveMode {
  /// Answer queries with the host's own resolver.
  ResolveLocal,
  /// Forward to the destination the client originally addressed.
  Transparent,
  /// Forward every query to an explicit upstream host.
  Forward(String),
}

impl DnsResolveMode {
  /// The pseudo-address seeded into the server-side context record.
  pub fn upstream_addr(&self) -> TargetAddr {
    let host = match self {
      DnsResolveMode::ResolveLocal => "resolve-local".to_string(),
      DnsResolveMode::Transparent => "transparent".to_string(),
      DnsResolveMode::Forward(host) => host.clone(),
    };
    TargetAddr::Named {
      host,
      port: DEFAULT_DNS_PORT,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeKind {
  Regular,
  Upstream { server: ServerSpec },
  Transparent,
  Reverse { target: ServerSpec },
  Socks5,
  Dns { resolve: DnsResolveMode },
  Udp { inner: Box<ModeSpec> },
}

/// A parsed and validated proxy mode, retaining the operator's original
/// spelling for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeSpec {
  kind: ModeKind,
  custom_listen_host: Option<String>,
  custom_listen_port: Option<u16>,
  full_spec: String,
}

impl ModeSpec {
  pub fn parse(spec: &str) -> Result<ModeSpec, ModeError> {
    let full_spec = spec.trim();
    if full_spec.is_empty() {
      return Err(ModeError::MalformedMode(
        "empty mode specification".to_string(),
      ));
    }

    let (head, listen) = match full_spec.rfind('@') {
      Some(index) => (&full_spec[..index], Some(&full_spec[index + 1..])),
      None => (full_spec, None),
    };
    let (custom_listen_host, custom_listen_port) = match listen {
      Some(listen) => parse_listen(listen)?,
      None => (None, None),
    };

    let (tag, data) = match head.find(':') {
      Some(index) => (&head[..index], Some(&head[index + 1..])),
      None => (head, None),
    };

    let kind = match tag {
      "regular" => {
        reject_data(tag, data)?;
        ModeKind::Regular
      }
      "transparent" => {
        reject_data(tag, data)?;
        ModeKind::Transparent
      }
      "socks5" => {
        reject_data(tag, data)?;
        ModeKind::Socks5
      }
      "upstream" => ModeKind::Upstream {
        server: parse_server_spec(require_data(tag, data)?, &["http", "https"])?,
      },
      "reverse" => ModeKind::Reverse {
        target: parse_server_spec(
          require_data(tag, data)?,
          &["http", "https", "tcp", "udp", "tls", "dns"],
        )?,
      },
      "dns" => ModeKind::Dns {
        resolve: match data {
          None | Some("resolve-local") => DnsResolveMode::ResolveLocal,
          Some("transparent") => DnsResolveMode::Transparent,
          Some(host) => DnsResolveMode::Forward(validate_host(host)?),
        },
      },
      "udp" => {
        let inner = ModeSpec::parse(require_data(tag, data)?)?;
        match inner.kind {
          ModeKind::Udp { .. } => {
            return Err(ModeError::MalformedMode(
              "udp modes may not nest".to_string(),
            ));
          }
          ModeKind::Dns { .. } => {
            return Err(ModeError::MalformedMode(
              "udp requires a stream-capable inner mode".to_string(),
            ));
          }
          _ => {}
        }
        ModeKind::Udp {
          inner: Box::new(inner),
        }
      }
      unknown => {
        return Err(ModeError::MalformedMode(format!(
          "unknown mode `{}`",
          unknown
        )));
      }
    };

    Ok(ModeSpec {
      kind,
      custom_listen_host,
      custom_listen_port,
      full_spec: full_spec.to_string(),
    })
  }

  pub fn kind(&self) -> &ModeKind {
    &self.kind
  }

  /// The registry tag this mode dispatches on.
  pub fn mode_type(&self) -> &'static str {
    match self.kind {
      ModeKind::Regular => "regular",
      ModeKind::Upstream { .. } => "upstream",
      ModeKind::Transparent => "transparent",
      ModeKind::Reverse { .. } => "reverse",
      ModeKind::Socks5 => "socks5",
      ModeKind::Dns { .. } => "dns",
      ModeKind::Udp { .. } => "udp",
    }
  }

  pub fn full_spec(&self) -> &str {
    &self.full_spec
  }

  pub fn custom_listen_host(&self) -> Option<&str> {
    self.custom_listen_host.as_deref()
  }

  pub fn custom_listen_port(&self) -> Option<u16> {
    self.custom_listen_port
  }

  /// The host to listen on, falling back to the process-wide default.
  /// An empty host means every interface.
  pub fn listen_host(&self, default: &str) -> String {
    match &self.custom_listen_host {
      Some(host) => host.clone(),
      None => default.to_string(),
    }
  }

  /// The port to listen on: the spec's own, then the process-wide
  /// default, then the mode's well-known port.
  pub fn listen_port(&self, default: Option<u16>) -> u16 {
    self
      .custom_listen_port
      .or(default)
      .unwrap_or_else(|| self.default_port())
  }

  pub fn default_port(&self) -> u16 {
    match &self.kind {
      ModeKind::Dns { .. } => DEFAULT_DNS_PORT,
      ModeKind::Udp { inner } => inner.default_port(),
      _ => DEFAULT_PROXY_PORT,
    }
  }
}

impl FromStr for ModeSpec {
  type Err = ModeError;

  fn from_str(spec: &str) -> Result<Self, Self::Err> {
    ModeSpec::parse(spec)
  }
}

impl Display for ModeSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.full_spec)
  }
}

impl serde::Serialize for ModeSpec {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&self.full_spec)
  }
}

impl<'de> serde::Deserialize<'de> for ModeSpec {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let spec: String = serde::Deserialize::deserialize(deserializer)?;
    spec.parse().map_err(serde::de::Error::custom)
  }
}

fn reject_data(tag: &str, data: Option<&str>) -> Result<(), ModeError> {
  match data {
    None => Ok(()),
    Some(_) => Err(ModeError::MalformedMode(format!(
      "mode `{}` takes no data",
      tag
    ))),
  }
}

fn require_data<'a>(tag: &str, data: Option<&'a str>) -> Result<&'a str, ModeError> {
  match data {
    Some(data) if !data.is_empty() => Ok(data),
    _ => Err(ModeError::MalformedMode(format!(
      "mode `{}` requires data",
      tag
    ))),
  }
}

fn parse_listen(listen: &str) -> Result<(Option<String>, Option<u16>), ModeError> {
  match listen.rfind(':') {
    None => Ok((None, Some(parse_port(listen)?))),
    Some(index) => {
      let port = parse_port(&listen[index + 1..])?;
      let host = validate_host(&listen[..index])?;
      Ok((Some(host), Some(port)))
    }
  }
}

fn parse_port(port: &str) -> Result<u16, ModeError> {
  port
    .parse::<u16>()
    .map_err(|_| ModeError::InvalidPort(port.to_string()))
}

/// Accepts IP literals (optionally bracketed) and plain hostnames.
fn validate_host(host: &str) -> Result<String, ModeError> {
  let host = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host);
  if host.is_empty() || host.len() > 255 {
    return Err(ModeError::InvalidAddress(host.to_string()));
  }
  if host.parse::<IpAddr>().is_ok() {
    return Ok(host.to_string());
  }
  let valid_hostname = host
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
  if valid_hostname {
    Ok(host.to_string())
  } else {
    Err(ModeError::InvalidAddress(host.to_string()))
  }
}

fn parse_server_spec(data: &str, schemes: &[&str]) -> Result<ServerSpec, ModeError> {
  let scheme_end = data.find("://").ok_or_else(|| {
    ModeError::MalformedMode(format!("invalid server specification `{}`", data))
  })?;
  let scheme = &data[..scheme_end];
  if !schemes.contains(&scheme) {
    return Err(ModeError::MalformedMode(format!(
      "unsupported scheme `{}`",
      scheme
    )));
  }
  let rest = &data[scheme_end + 3..];
  if rest.is_empty() || rest.contains('/') {
    return Err(ModeError::MalformedMode(format!(
      "invalid server specification `{}`",
      data
    )));
  }
  let (host, port) = split_host_port(rest)?;
  let host = validate_host(host)?;
  let port = match port {
    Some(port) => parse_port(port)?,
    None => match scheme {
      "http" => 80,
      "https" => 443,
      "dns" => 53,
      _ => {
        return Err(ModeError::MalformedMode(format!(
          "port specification missing in `{}`",
          data
        )));
      }
    },
  };
  Ok(ServerSpec {
    scheme: scheme.to_string(),
    host,
    port,
  })
}

fn split_host_port(spec: &str) -> Result<(&str, Option<&str>), ModeError> {
  if spec.starts_with('[') {
    // Bracketed IPv6 literal, optionally followed by `:port`.
    let close = spec
      .find(']')
      .ok_or_else(|| ModeError::InvalidAddress(spec.to_string()))?;
    let rest = &spec[close + 1..];
    return match rest.strip_prefix(':') {
      Some(port) => Ok((&spec[..=close], Some(port))),
      None if rest.is_empty() => Ok((&spec[..=close], None)),
      None => Err(ModeError::InvalidAddress(spec.to_string())),
    };
  }
  match spec.rfind(':') {
    None => Ok((spec, None)),
    // A second colon means an unbracketed IPv6 literal without a port.
    Some(index) if spec[..index].contains(':') => Ok((spec, None)),
    Some(index) => Ok((&spec[..index], Some(&spec[index + 1..]))),
  }
}
