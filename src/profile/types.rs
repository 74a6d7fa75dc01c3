use serde::{Deserialize, Serialize};
use std::fmt;

/// Current schema version of the profile document. Bump when the on-disk
/// shape changes and teach [`migrate`](crate::profile::migrate) the upgrade.
pub const PROFILE_SCHEMA_VERSION: u32 = 1;

/// Accept-Language / locale pair applied when a profile carries no explicit
/// locale setting.
pub const DEFAULT_LOCALE: &str = "ru-BY,ru-RU";

/// A local or upstream proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyAddress {
  pub host: String,
  pub port: u16,
}

impl ProxyAddress {
  pub fn new(host: impl Into<String>, port: u16) -> Self {
    Self {
      host: host.into(),
      port,
    }
  }

  /// Loopback address, the shape every supervised proxy listens on.
  pub fn local(port: u16) -> Self {
    Self::new("127.0.0.1", port)
  }

  /// The proxy argument handed to the browser.
  pub fn socks_url(&self) -> String {
    format!("socks5://{}:{}", self.host, self.port)
  }
}

impl fmt::Display for ProxyAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

/// One cookie in the browser's storage-state shape. The store treats the
/// sequence as an opaque blob; only the cookie layer interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CookieRecord {
  pub name: String,
  pub value: String,
  pub domain: String,
  pub path: String,
  /// Unix seconds; -1 marks a session cookie.
  pub expires: i64,
  pub http_only: bool,
  pub secure: bool,
  pub same_site: Option<String>,
}

impl Default for CookieRecord {
  fn default() -> Self {
    Self {
      name: String::new(),
      value: String::new(),
      domain: String::new(),
      path: "/".to_string(),
      expires: -1,
      http_only: false,
      secure: false,
      same_site: None,
    }
  }
}

/// Launch settings for a Camoufox instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CamoufoxSettings {
  pub headless: bool,
  pub humanize: bool,
  pub exclude_ublock: bool,
  /// Fixed window size (width, height) when set.
  pub window: Option<(u32, u32)>,
  pub enable_cache: bool,
  pub locale: String,
}

impl Default for CamoufoxSettings {
  fn default() -> Self {
    Self {
      headless: false,
      humanize: true,
      exclude_ublock: true,
      window: None,
      enable_cache: true,
      locale: DEFAULT_LOCALE.to_string(),
    }
  }
}

/// The persistent unit of identity: cookies, proxy reference and browser
/// settings under a stable id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
  #[serde(default = "default_version")]
  pub version: u32,
  #[serde(default)]
  pub id: String,
  #[serde(default = "default_name")]
  pub name: String,
  #[serde(default)]
  pub cookies: Vec<CookieRecord>,
  #[serde(default)]
  pub proxy: Option<ProxyAddress>,
  #[serde(default)]
  pub vless_raw: Option<String>,
  #[serde(default)]
  pub camoufox: Option<CamoufoxSettings>,
}

fn default_version() -> u32 {
  PROFILE_SCHEMA_VERSION
}

fn default_name() -> String {
  "Unnamed".to_string()
}

impl Profile {
  /// A blank profile with no id yet; the store assigns one on create.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      version: PROFILE_SCHEMA_VERSION,
      id: String::new(),
      name: name.into(),
      cookies: Vec::new(),
      proxy: None,
      vless_raw: None,
      camoufox: None,
    }
  }

  /// Launch settings, falling back to the defaults when none are stored.
  pub fn settings(&self) -> CamoufoxSettings {
    self.camoufox.clone().unwrap_or_default()
  }

  /// The VLESS string takes priority over an explicit proxy address, but only
  /// when present and non-empty.
  pub fn effective_vless(&self) -> Option<&str> {
    self
      .vless_raw
      .as_deref()
      .map(str::trim)
      .filter(|s| !s.is_empty())
  }
}

/// Normalize a raw store element into the current schema, keyed on its
/// `version` field. Unversioned documents predate the version stamp and get
/// the blank-name default applied; documents from a newer schema are read
/// best-effort.
pub fn migrate(doc: serde_json::Value) -> Result<Profile, serde_json::Error> {
  let version = doc.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

  let mut profile: Profile = serde_json::from_value(doc)?;

  if version > PROFILE_SCHEMA_VERSION {
    log::warn!(
      "profile {} has schema version {version}, newer than supported {PROFILE_SCHEMA_VERSION}; reading best-effort",
      profile.id
    );
  }

  if profile.name.trim().is_empty() {
    profile.name = default_name();
  }
  profile.version = PROFILE_SCHEMA_VERSION;

  Ok(profile)
}
