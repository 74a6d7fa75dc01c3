//! Persistent profiles: cookies, proxy reference and browser settings under a
//! stable id, stored in a single JSON document.

pub mod store;
pub mod types;

pub use store::{ProfileStore, StoreError};
pub use types::{
  migrate, CamoufoxSettings, CookieRecord, Profile, ProxyAddress, DEFAULT_LOCALE,
  PROFILE_SCHEMA_VERSION,
};
