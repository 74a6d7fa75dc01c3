//! foxden: profile, proxy and session lifecycle manager for Camoufox
//! automation.
//!
//! The crate covers the plumbing underneath a browser-automation desktop
//! tool: durable profiles (cookies + proxy reference + browser settings),
//! VLESS proxy provisioning through a supervised xray process, and the
//! launch/observe/stop lifecycle of browser sessions bound to both.

pub mod app_dirs;
pub mod browser;
pub mod cookies;
pub mod profile;
pub mod proxy;
pub mod session;

pub use browser::{BrowserEngine, BrowserError, BrowserSession, CamoufoxEngine, LaunchSpec};
pub use profile::{
  CamoufoxSettings, CookieRecord, Profile, ProfileStore, ProxyAddress, StoreError,
};
pub use proxy::{ProxyError, VlessUri, XrayProxy};
pub use session::{
  LaunchError, RunningSession, SessionLauncher, SessionRegistry, SessionState,
};
