//! VLESS connection-string parsing.
//!
//! A VLESS URI has the shape `vless://uuid@host:port?params#name`. Parsing
//! validates the pieces the proxy supervisor depends on and keeps the rest as
//! an opaque parameter map.

use std::collections::HashMap;

use super::ProxyError;

/// A parsed, validated VLESS URI. Immutable; construct via [`VlessUri::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessUri {
  raw: String,
  uuid: String,
  host: String,
  port: u16,
  params: HashMap<String, String>,
  name: String,
}

/// Minimum length of the user-id segment. Real VLESS ids are UUIDs (36 chars);
/// anything shorter than this is a paste error.
const MIN_UUID_LEN: usize = 20;

impl VlessUri {
  pub fn parse(raw: &str) -> Result<Self, ProxyError> {
    let s = raw.trim();
    if s.is_empty() {
      return Err(ProxyError::MalformedUri(
        "VLESS string is empty".to_string(),
      ));
    }

    let url = url::Url::parse(s)
      .map_err(|e| ProxyError::MalformedUri(format!("not a valid URI: {e}")))?;

    if !url.scheme().eq_ignore_ascii_case("vless") {
      return Err(ProxyError::MalformedUri(format!(
        "expected vless:// scheme, got {}://",
        url.scheme()
      )));
    }

    let uuid = url.username().to_string();
    if uuid.is_empty() {
      return Err(ProxyError::MalformedUri(
        "expected uuid@host:port in the authority".to_string(),
      ));
    }
    if uuid.len() < MIN_UUID_LEN {
      return Err(ProxyError::MalformedUri(format!(
        "user id is too short ({} chars, expected at least {MIN_UUID_LEN})",
        uuid.len()
      )));
    }

    let host = url
      .host_str()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| ProxyError::MalformedUri("missing host".to_string()))?
      .to_string();

    let port = url
      .port()
      .ok_or_else(|| ProxyError::MalformedUri("missing port".to_string()))?;

    // First value wins for repeated keys.
    let mut params = HashMap::new();
    for (key, value) in url.query_pairs() {
      params
        .entry(key.into_owned())
        .or_insert_with(|| value.into_owned());
    }

    let name = match url.fragment() {
      Some(fragment) => urlencoding::decode(fragment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| fragment.to_string()),
      None => String::new(),
    };

    Ok(Self {
      raw: s.to_string(),
      uuid,
      host,
      port,
      params,
      name,
    })
  }

  pub fn raw(&self) -> &str {
    &self.raw
  }

  pub fn uuid(&self) -> &str {
    &self.uuid
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// The percent-decoded fragment; empty when the URI carried none.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Query parameter lookup with a default, for the transport/security keys
  /// (`security`, `type`, `flow`, `sni`, `fp`, `pbk`, `sid`, `path`, `host`).
  pub fn param(&self, key: &str, default: &str) -> String {
    self
      .params
      .get(key)
      .cloned()
      .unwrap_or_else(|| default.to_string())
  }
}
