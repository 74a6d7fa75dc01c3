//! VLESS proxy provisioning: URI parsing, local port allocation and
//! supervision of the external xray process.

pub mod ports;
pub mod vless;
pub mod xray;

pub use ports::find_free_port;
pub use vless::VlessUri;
pub use xray::XrayProxy;

use thiserror::Error;

/// Proxy-related errors
#[derive(Error, Debug)]
pub enum ProxyError {
  #[error("Malformed VLESS URI: {0}")]
  MalformedUri(String),
  #[error("No free local port after probing {window} ports from {start}")]
  NoFreePort { start: u16, window: u16 },
  #[error("{0}")]
  BinaryNotFound(String),
  #[error("Config serialization error: {0}")]
  ConfigSerialize(#[from] serde_json::Error),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}
