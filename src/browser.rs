//! Browser engine seam.
//!
//! The session launcher consumes browsers through the [`BrowserEngine`] /
//! [`BrowserSession`] traits. The engine itself is an external collaborator;
//! the implementation here supervises a Camoufox executable directly and
//! exchanges state with it through the profile directory (preferences in,
//! cookie jar out).

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cookies;
use crate::profile::{CamoufoxSettings, CookieRecord, ProxyAddress};

/// Browser-side errors
#[derive(Error, Debug)]
pub enum BrowserError {
  #[error("{0}")]
  ExecutableNotFound(String),
  #[error("Browser launch failed: {0}")]
  Launch(String),
  #[error("Cookie database error: {0}")]
  Cookies(#[from] rusqlite::Error),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Everything an engine needs to open one session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
  pub profile_id: String,
  /// Shown on the window (instance name) so concurrent sessions can be told
  /// apart.
  pub profile_name: String,
  pub user_data_dir: PathBuf,
  /// Local forwarding address; `None` launches without a proxy.
  pub proxy: Option<ProxyAddress>,
  pub settings: CamoufoxSettings,
  /// Seeded into the profile's cookie jar before launch.
  pub cookies: Vec<CookieRecord>,
  pub start_url: String,
}

impl LaunchSpec {
  pub fn new(profile_id: impl Into<String>, user_data_dir: PathBuf) -> Self {
    Self {
      profile_id: profile_id.into(),
      profile_name: String::new(),
      user_data_dir,
      proxy: None,
      settings: CamoufoxSettings::default(),
      cookies: Vec::new(),
      start_url: "about:blank".to_string(),
    }
  }
}

/// A live browser instance.
#[async_trait]
pub trait BrowserSession: Send + Sync {
  /// Single source of truth for "is the window still open"; covers manual
  /// closure by the user.
  fn is_connected(&self) -> bool;

  /// Current cookies + storage snapshot of the session.
  async fn storage_state(&self) -> Result<Vec<CookieRecord>, BrowserError>;

  /// Shut the browser down. Graceful first, forceful after a bounded wait.
  async fn close(&self) -> Result<(), BrowserError>;
}

/// Opens browser sessions. One engine serves any number of sessions.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
  async fn open_session(&self, spec: &LaunchSpec) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// How long `close` waits for the browser to exit before force-killing.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Engine that launches a Camoufox executable as a supervised child process
/// with a persistent profile directory.
pub struct CamoufoxEngine {
  executable: Option<PathBuf>,
}

impl Default for CamoufoxEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl CamoufoxEngine {
  /// Engine that resolves the executable from the platform search path.
  pub fn new() -> Self {
    Self { executable: None }
  }

  /// Engine pinned to a specific executable.
  pub fn with_executable(path: impl Into<PathBuf>) -> Self {
    Self {
      executable: Some(path.into()),
    }
  }

  fn resolve_executable(&self) -> Result<PathBuf, BrowserError> {
    if let Some(path) = &self.executable {
      if path.exists() {
        return Ok(path.clone());
      }
      return Err(BrowserError::ExecutableNotFound(format!(
        "Camoufox executable not found at: {}",
        path.display()
      )));
    }

    let locations = [
      "/usr/local/bin/camoufox",
      "/opt/camoufox/camoufox",
      "C:\\Program Files\\Camoufox\\camoufox.exe",
    ];
    for loc in &locations {
      let path = PathBuf::from(loc);
      if path.exists() {
        return Ok(path);
      }
    }

    #[cfg(unix)]
    {
      if let Ok(output) = Command::new("which").arg("camoufox").output() {
        if output.status.success() {
          let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
          if !path.is_empty() {
            return Ok(PathBuf::from(path));
          }
        }
      }
    }

    #[cfg(windows)]
    {
      if let Ok(output) = Command::new("where").arg("camoufox").output() {
        if output.status.success() {
          let path = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
          if !path.is_empty() {
            return Ok(PathBuf::from(path));
          }
        }
      }
    }

    Err(BrowserError::ExecutableNotFound(
      "Camoufox executable not found. Install Camoufox (https://camoufox.com) and make sure `camoufox` is on PATH, or pass an explicit path.".to_string(),
    ))
  }
}

/// Write the launch preferences into the profile's `user.js`. Firefox rereads
/// the file on every start, so the proxy can change between launches of the
/// same profile.
pub fn write_profile_prefs(user_data_dir: &Path, spec: &LaunchSpec) -> std::io::Result<()> {
  let mut prefs = Vec::new();

  prefs.push(r#"user_pref("browser.shell.checkDefaultBrowser", false);"#.to_string());
  prefs.push(r#"user_pref("browser.sessionstore.resume_from_crash", false);"#.to_string());
  prefs.push(r#"user_pref("toolkit.telemetry.enabled", false);"#.to_string());
  prefs.push(r#"user_pref("datareporting.healthreport.uploadEnabled", false);"#.to_string());

  match &spec.proxy {
    Some(proxy) => {
      prefs.push(r#"user_pref("network.proxy.type", 1);"#.to_string());
      prefs.push(format!(
        r#"user_pref("network.proxy.socks", {:?});"#,
        proxy.host
      ));
      prefs.push(format!(
        r#"user_pref("network.proxy.socks_port", {});"#,
        proxy.port
      ));
      prefs.push(r#"user_pref("network.proxy.socks_version", 5);"#.to_string());
      prefs.push(r#"user_pref("network.proxy.socks_remote_dns", true);"#.to_string());
    }
    None => {
      prefs.push(r#"user_pref("network.proxy.type", 0);"#.to_string());
    }
  }

  prefs.push(format!(
    r#"user_pref("intl.accept_languages", {:?});"#,
    spec.settings.locale
  ));

  if !spec.settings.enable_cache {
    prefs.push(r#"user_pref("browser.cache.disk.enable", false);"#.to_string());
    prefs.push(r#"user_pref("browser.cache.memory.enable", false);"#.to_string());
  }

  // Firefox caches the previous values in prefs.js; remove it so user.js wins.
  let prefs_js = user_data_dir.join("prefs.js");
  if prefs_js.exists() {
    let _ = std::fs::remove_file(&prefs_js);
  }

  std::fs::write(user_data_dir.join("user.js"), prefs.join("\n") + "\n")
}

/// Fingerprint-side configuration Camoufox reads from the `CAMOU_CONFIG`
/// environment variable.
fn camoufox_env_config(spec: &LaunchSpec) -> String {
  let mut config = serde_json::Map::new();
  config.insert("humanize".to_string(), spec.settings.humanize.into());
  if let Some((width, height)) = spec.settings.window {
    config.insert("window.outerWidth".to_string(), width.into());
    config.insert("window.outerHeight".to_string(), height.into());
  }
  serde_json::Value::Object(config).to_string()
}

#[async_trait]
impl BrowserEngine for CamoufoxEngine {
  async fn open_session(&self, spec: &LaunchSpec) -> Result<Box<dyn BrowserSession>, BrowserError> {
    let executable = self.resolve_executable()?;

    std::fs::create_dir_all(&spec.user_data_dir)?;
    write_profile_prefs(&spec.user_data_dir, spec)?;

    let (inserted, replaced) = cookies::seed_profile_cookies(&spec.user_data_dir, &spec.cookies)?;
    if inserted + replaced > 0 {
      log::debug!(
        "seeded {inserted} new and {replaced} existing cookies into {}",
        spec.user_data_dir.display()
      );
    }

    let mut cmd = Command::new(&executable);
    cmd
      .arg("-profile")
      .arg(&spec.user_data_dir)
      .arg("-no-remote")
      .arg("-new-instance");

    if !spec.profile_name.is_empty() {
      // Instance name doubles as the visual identifier when several
      // profiles run at once.
      cmd.arg("--name").arg(&spec.profile_name);
    }
    if spec.settings.headless {
      cmd.arg("--headless");
    }
    cmd.arg(&spec.start_url);

    // A raw launch carries no bundled uBlock, so exclude_ublock has nothing
    // to disable here; it matters for engines that manage addons.
    cmd.env("CAMOU_CONFIG", camoufox_env_config(spec));
    cmd.env("MOZ_CRASHREPORTER_DISABLE", "1");
    cmd
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null());

    let mut child = cmd
      .spawn()
      .map_err(|e| BrowserError::Launch(format!("failed to start {}: {e}", executable.display())))?;
    let pid = child.id();

    // Catch immediate exits (bad profile dir, broken install) here instead of
    // handing the caller a dead session.
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Ok(Some(status)) = child.try_wait() {
      return Err(BrowserError::Launch(format!(
        "camoufox exited during startup: {status}"
      )));
    }

    log::info!(
      "launched camoufox (pid {pid}) for profile '{}' with profile dir {}",
      spec.profile_name,
      spec.user_data_dir.display()
    );

    Ok(Box::new(CamoufoxSession {
      pid,
      child: Mutex::new(Some(child)),
      user_data_dir: spec.user_data_dir.clone(),
    }))
  }
}

/// A supervised Camoufox process.
pub struct CamoufoxSession {
  pid: u32,
  child: Mutex<Option<Child>>,
  user_data_dir: PathBuf,
}

fn is_process_alive(pid: u32) -> bool {
  use sysinfo::{Pid, ProcessStatus, System};
  let system = System::new_all();
  system
    .process(Pid::from(pid as usize))
    .map(|p| p.status() != ProcessStatus::Zombie)
    .unwrap_or(false)
}

#[async_trait]
impl BrowserSession for CamoufoxSession {
  fn is_connected(&self) -> bool {
    if let Ok(mut guard) = self.child.try_lock() {
      return match guard.as_mut() {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => false,
      };
    }
    // A concurrent close holds the lock; fall back to a pid probe.
    is_process_alive(self.pid)
  }

  async fn storage_state(&self) -> Result<Vec<CookieRecord>, BrowserError> {
    Ok(cookies::read_profile_cookies(&self.user_data_dir)?)
  }

  async fn close(&self) -> Result<(), BrowserError> {
    let mut guard = self.child.lock().await;
    let Some(mut child) = guard.take() else {
      return Ok(());
    };
    let pid = child.id();

    #[cfg(unix)]
    {
      use nix::sys::signal::{kill, Signal};
      use nix::unistd::Pid;

      if let Ok(raw) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
      }
    }

    let deadline = tokio::time::Instant::now() + CLOSE_GRACE;
    loop {
      match child.try_wait() {
        Ok(Some(status)) => {
          log::info!("camoufox (pid {pid}) exited: {status}");
          break;
        }
        Ok(None) => {
          if tokio::time::Instant::now() >= deadline {
            log::warn!("camoufox (pid {pid}) did not exit within {CLOSE_GRACE:?}, killing");
            let _ = child.kill();
            let _ = child.wait();
            break;
          }
          tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(e) => {
          log::warn!("failed to poll camoufox (pid {pid}): {e}; killing");
          let _ = child.kill();
          let _ = child.wait();
          break;
        }
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn spec_with_proxy() -> (TempDir, LaunchSpec) {
    let dir = TempDir::new().unwrap();
    let mut spec = LaunchSpec::new("profile-1", dir.path().to_path_buf());
    spec.profile_name = "Work".to_string();
    spec.proxy = Some(ProxyAddress::local(10808));
    (dir, spec)
  }

  #[test]
  fn test_prefs_with_proxy() {
    let (dir, spec) = spec_with_proxy();
    write_profile_prefs(dir.path(), &spec).unwrap();

    let prefs = std::fs::read_to_string(dir.path().join("user.js")).unwrap();
    assert!(prefs.contains(r#"user_pref("network.proxy.type", 1);"#));
    assert!(prefs.contains(r#"user_pref("network.proxy.socks", "127.0.0.1");"#));
    assert!(prefs.contains(r#"user_pref("network.proxy.socks_port", 10808);"#));
    assert!(prefs.contains(r#"user_pref("network.proxy.socks_remote_dns", true);"#));
    assert!(prefs.contains(r#"user_pref("intl.accept_languages", "ru-BY,ru-RU");"#));
  }

  #[test]
  fn test_prefs_without_proxy() {
    let dir = TempDir::new().unwrap();
    let spec = LaunchSpec::new("profile-1", dir.path().to_path_buf());
    write_profile_prefs(dir.path(), &spec).unwrap();

    let prefs = std::fs::read_to_string(dir.path().join("user.js")).unwrap();
    assert!(prefs.contains(r#"user_pref("network.proxy.type", 0);"#));
    assert!(!prefs.contains("socks_port"));
  }

  #[test]
  fn test_prefs_cache_disabled() {
    let dir = TempDir::new().unwrap();
    let mut spec = LaunchSpec::new("profile-1", dir.path().to_path_buf());
    spec.settings.enable_cache = false;
    write_profile_prefs(dir.path(), &spec).unwrap();

    let prefs = std::fs::read_to_string(dir.path().join("user.js")).unwrap();
    assert!(prefs.contains(r#"user_pref("browser.cache.disk.enable", false);"#));
  }

  #[test]
  fn test_prefs_replace_stale_prefs_js() {
    let (dir, spec) = spec_with_proxy();
    std::fs::write(dir.path().join("prefs.js"), "stale").unwrap();
    write_profile_prefs(dir.path(), &spec).unwrap();
    assert!(!dir.path().join("prefs.js").exists());
  }

  #[test]
  fn test_camoufox_env_config() {
    let (_dir, mut spec) = spec_with_proxy();
    spec.settings.window = Some((1280, 720));

    let config: serde_json::Value = serde_json::from_str(&camoufox_env_config(&spec)).unwrap();
    assert_eq!(config["humanize"], true);
    assert_eq!(config["window.outerWidth"], 1280);
    assert_eq!(config["window.outerHeight"], 720);
  }

  #[test]
  fn test_explicit_executable_must_exist() {
    let engine = CamoufoxEngine::with_executable("/definitely/not/here/camoufox");
    let err = engine.resolve_executable().unwrap_err();
    assert!(matches!(err, BrowserError::ExecutableNotFound(_)));
    assert!(err.to_string().contains("/definitely/not/here/camoufox"));
  }

  #[test]
  fn test_path_discovery_error_mentions_install_hint() {
    // May or may not find camoufox depending on the system.
    match CamoufoxEngine::new().resolve_executable() {
      Ok(path) => assert!(!path.as_os_str().is_empty()),
      Err(e) => assert!(e.to_string().contains("not found")),
    }
  }
}
