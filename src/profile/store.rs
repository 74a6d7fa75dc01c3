//! Durable profile storage: one JSON array document, rewritten in full on
//! every mutation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use super::types::{migrate, Profile};

/// Profile-store errors
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Profile not found: {0}")]
  ProfileNotFound(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("Serialization error: {0}")]
  Serde(#[from] serde_json::Error),
}

/// CRUD over profile records in a flat JSON document.
///
/// Single-process, single-writer: every call holds an internal lock around
/// the whole read-modify-write, so concurrent callers inside one process
/// cannot lose each other's updates. Concurrent external writers are not
/// defended against.
pub struct ProfileStore {
  path: PathBuf,
  lock: Mutex<()>,
}

impl ProfileStore {
  /// Open (or initialize) the store at `path`. Parent directories are created
  /// and a missing file starts as an empty array.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    if !path.exists() {
      fs::write(&path, "[]")?;
    }
    Ok(Self {
      path,
      lock: Mutex::new(()),
    })
  }

  /// Open the store at the platform default location.
  pub fn open_default() -> Result<Self, StoreError> {
    Self::open(crate::app_dirs::profiles_file())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Raw document elements. A corrupt or unreadable file is treated as empty:
  /// this is a local single-user cache, and refusing to start over a damaged
  /// document would be worse than starting fresh.
  fn load(&self) -> Vec<serde_json::Value> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) => {
        log::warn!(
          "cannot read profile store {}: {e}; treating as empty",
          self.path.display()
        );
        return Vec::new();
      }
    };

    match serde_json::from_str(&content) {
      Ok(serde_json::Value::Array(items)) => items,
      Ok(_) => {
        log::warn!(
          "profile store {} is not a JSON array; treating as empty",
          self.path.display()
        );
        Vec::new()
      }
      Err(e) => {
        log::warn!(
          "profile store {} is corrupt: {e}; treating as empty",
          self.path.display()
        );
        Vec::new()
      }
    }
  }

  fn save(&self, items: &[serde_json::Value]) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(&items)?;
    fs::write(&self.path, json)?;
    Ok(())
  }

  pub fn list_all(&self) -> Vec<Profile> {
    let _guard = self.lock.lock().unwrap();
    self
      .load()
      .into_iter()
      .filter_map(|doc| match migrate(doc) {
        Ok(profile) => Some(profile),
        Err(e) => {
          log::warn!("skipping unreadable profile record: {e}");
          None
        }
      })
      .collect()
  }

  pub fn get(&self, id: &str) -> Option<Profile> {
    self.list_all().into_iter().find(|p| p.id == id)
  }

  /// Append a profile. A blank id gets a fresh UUID; a blank name gets the
  /// default. Returns the stored value.
  pub fn create(&self, mut profile: Profile) -> Result<Profile, StoreError> {
    if profile.id.trim().is_empty() {
      profile.id = uuid::Uuid::new_v4().to_string();
    }
    if profile.name.trim().is_empty() {
      profile.name = "Unnamed".to_string();
    }

    let _guard = self.lock.lock().unwrap();
    let mut items = self.load();
    items.push(serde_json::to_value(&profile)?);
    self.save(&items)?;

    log::info!("created profile '{}' ({})", profile.name, profile.id);
    Ok(profile)
  }

  /// Replace the record with the same id.
  pub fn update(&self, profile: &Profile) -> Result<Profile, StoreError> {
    let _guard = self.lock.lock().unwrap();
    let mut items = self.load();
    for item in items.iter_mut() {
      if item.get("id").and_then(|v| v.as_str()) == Some(profile.id.as_str()) {
        *item = serde_json::to_value(profile)?;
        self.save(&items)?;
        return Ok(profile.clone());
      }
    }
    Err(StoreError::ProfileNotFound(profile.id.clone()))
  }

  /// Remove a record. Returns whether one was removed.
  pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
    let _guard = self.lock.lock().unwrap();
    let items = self.load();
    let before = items.len();
    let remaining: Vec<_> = items
      .into_iter()
      .filter(|item| item.get("id").and_then(|v| v.as_str()) != Some(id))
      .collect();

    let removed = remaining.len() != before;
    if removed {
      self.save(&remaining)?;
      log::info!("deleted profile {id}");
    }
    Ok(removed)
  }

  /// Duplicate a profile under a new identity. Everything but the id is
  /// carried over; the default name is the source name suffixed " (copy)".
  pub fn copy(&self, id: &str, new_name: Option<&str>) -> Result<Profile, StoreError> {
    let source = self
      .get(id)
      .ok_or_else(|| StoreError::ProfileNotFound(id.to_string()))?;

    let mut duplicate = source;
    duplicate.id = String::new();
    duplicate.name = match new_name {
      Some(name) => name.to_string(),
      None => format!("{} (copy)", duplicate.name),
    };
    self.create(duplicate)
  }

  /// The raw document element for a profile, for sharing between machines.
  pub fn export_profile(&self, id: &str) -> Result<serde_json::Value, StoreError> {
    let profile = self
      .get(id)
      .ok_or_else(|| StoreError::ProfileNotFound(id.to_string()))?;
    Ok(serde_json::to_value(&profile)?)
  }

  /// Import a previously exported record. The incoming id is discarded so an
  /// import can never collide with an existing profile.
  pub fn import_profile(&self, raw: serde_json::Value) -> Result<Profile, StoreError> {
    let mut profile = migrate(raw)?;
    profile.id = String::new();
    self.create(profile)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::profile::{CamoufoxSettings, CookieRecord, ProxyAddress};
  use tempfile::TempDir;

  fn test_store() -> (TempDir, ProfileStore) {
    let dir = TempDir::new().unwrap();
    let store = ProfileStore::open(dir.path().join("profiles.json")).unwrap();
    (dir, store)
  }

  fn sample_profile(name: &str) -> Profile {
    let mut profile = Profile::new(name);
    profile.cookies = vec![CookieRecord {
      name: "sessionid".to_string(),
      value: "abc123".to_string(),
      domain: ".example.com".to_string(),
      ..Default::default()
    }];
    profile.proxy = Some(ProxyAddress::local(10808));
    profile.vless_raw = Some("vless://12345678901234567890@h.example.com:443".to_string());
    profile.camoufox = Some(CamoufoxSettings {
      headless: true,
      ..Default::default()
    });
    profile
  }

  #[test]
  fn test_fresh_store_is_empty() {
    let (_dir, store) = test_store();
    assert!(store.list_all().is_empty());
    assert!(store.path().exists());
  }

  #[test]
  fn test_create_assigns_id_and_round_trips() {
    let (_dir, store) = test_store();
    let created = store.create(sample_profile("Work")).unwrap();

    assert!(!created.id.is_empty());
    assert_eq!(created.name, "Work");

    let fetched = store.get(&created.id).unwrap();
    assert_eq!(fetched, created);
  }

  #[test]
  fn test_create_keeps_explicit_id() {
    let (_dir, store) = test_store();
    let mut profile = sample_profile("Pinned");
    profile.id = "fixed-id".to_string();
    let created = store.create(profile).unwrap();
    assert_eq!(created.id, "fixed-id");
  }

  #[test]
  fn test_create_defaults_blank_name() {
    let (_dir, store) = test_store();
    let created = store.create(Profile::new("   ")).unwrap();
    assert_eq!(created.name, "Unnamed");
  }

  #[test]
  fn test_update_reflects_changes() {
    let (_dir, store) = test_store();
    let mut profile = store.create(sample_profile("Before")).unwrap();

    profile.name = "After".to_string();
    profile.cookies.clear();
    store.update(&profile).unwrap();

    let fetched = store.get(&profile.id).unwrap();
    assert_eq!(fetched.name, "After");
    assert!(fetched.cookies.is_empty());
  }

  #[test]
  fn test_update_unknown_id_fails() {
    let (_dir, store) = test_store();
    let mut profile = sample_profile("Ghost");
    profile.id = "no-such-id".to_string();
    assert!(matches!(
      store.update(&profile),
      Err(StoreError::ProfileNotFound(_))
    ));
  }

  #[test]
  fn test_delete() {
    let (_dir, store) = test_store();
    let created = store.create(sample_profile("Doomed")).unwrap();

    assert!(store.delete(&created.id).unwrap());
    assert!(store.get(&created.id).is_none());
    assert!(!store.delete(&created.id).unwrap());
  }

  #[test]
  fn test_copy_gets_new_identity_same_payload() {
    let (_dir, store) = test_store();
    let source = store.create(sample_profile("Original")).unwrap();

    let copy = store.copy(&source.id, None).unwrap();
    assert_ne!(copy.id, source.id);
    assert_eq!(copy.name, "Original (copy)");
    assert_eq!(copy.cookies, source.cookies);
    assert_eq!(copy.proxy, source.proxy);
    assert_eq!(copy.vless_raw, source.vless_raw);
    assert_eq!(copy.camoufox, source.camoufox);

    let named = store.copy(&source.id, Some("Renamed")).unwrap();
    assert_eq!(named.name, "Renamed");
  }

  #[test]
  fn test_corrupt_file_treated_as_empty() {
    let (_dir, store) = test_store();
    store.create(sample_profile("Lost")).unwrap();

    fs::write(store.path(), "{not json").unwrap();
    assert!(store.list_all().is_empty());

    // The store keeps working after the damage.
    let created = store.create(sample_profile("Recovered")).unwrap();
    assert_eq!(store.list_all().len(), 1);
    assert!(store.get(&created.id).is_some());
  }

  #[test]
  fn test_import_strips_id() {
    let (_dir, store) = test_store();
    let exported = {
      let source = store.create(sample_profile("Shared")).unwrap();
      store.export_profile(&source.id).unwrap()
    };

    let imported = store.import_profile(exported.clone()).unwrap();
    assert_ne!(
      imported.id,
      exported.get("id").unwrap().as_str().unwrap(),
      "import must re-identify the record"
    );
    assert_eq!(imported.name, "Shared");
    assert_eq!(store.list_all().len(), 2);
  }

  #[test]
  fn test_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("profiles.json");

    let created = {
      let store = ProfileStore::open(&path).unwrap();
      store.create(sample_profile("Durable")).unwrap()
    };

    let store = ProfileStore::open(&path).unwrap();
    assert_eq!(store.get(&created.id).unwrap(), created);
  }
}
