use directories::BaseDirs;
use std::path::PathBuf;
use std::sync::OnceLock;

static BASE_DIRS: OnceLock<BaseDirs> = OnceLock::new();

fn base_dirs() -> &'static BaseDirs {
  BASE_DIRS.get_or_init(|| BaseDirs::new().expect("Failed to get base directories"))
}

pub fn app_name() -> &'static str {
  if cfg!(debug_assertions) {
    "FoxdenDev"
  } else {
    "Foxden"
  }
}

/// Root data directory. `FOXDEN_DATA_DIR` overrides the platform default so
/// tests and the CLI can point at a scratch location.
pub fn data_dir() -> PathBuf {
  if let Ok(dir) = std::env::var("FOXDEN_DATA_DIR") {
    return PathBuf::from(dir);
  }

  base_dirs().data_local_dir().join(app_name())
}

/// Per-profile browser user-data directories live here, keyed by profile id.
pub fn sessions_dir() -> PathBuf {
  data_dir().join("sessions")
}

/// Default location of the profile store document.
pub fn profiles_file() -> PathBuf {
  data_dir().join("profiles.json")
}
