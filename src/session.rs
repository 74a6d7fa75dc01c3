//! Session lifecycle: resolve a profile's proxy, open the browser bound to
//! it, observe liveness, extract cookies, and tear everything down in order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::browser::{BrowserEngine, BrowserError, BrowserSession, LaunchSpec};
use crate::profile::{CookieRecord, Profile, ProfileStore, ProxyAddress, StoreError};
use crate::proxy::xray::DEFAULT_LOCAL_PORT;
use crate::proxy::{ProxyError, VlessUri, XrayProxy};

/// Launch-time errors
#[derive(Error, Debug)]
pub enum LaunchError {
  #[error("Proxy error: {0}")]
  Proxy(#[from] ProxyError),
  #[error("Store error: {0}")]
  Store(#[from] StoreError),
  #[error("Browser error: {0}")]
  Browser(#[from] BrowserError),
}

/// Lifecycle states of one profile's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
  #[default]
  Idle,
  Starting,
  Running,
  Stopping,
  Failed,
}

impl SessionState {
  pub fn as_str(&self) -> &'static str {
    match self {
      SessionState::Idle => "idle",
      SessionState::Starting => "starting",
      SessionState::Running => "running",
      SessionState::Stopping => "stopping",
      SessionState::Failed => "failed",
    }
  }
}

/// One live profile instance: the browser session plus the proxy started for
/// it, if any. In-memory only; destroyed on stop or process exit.
pub struct RunningSession {
  pub profile_id: String,
  pub profile_name: String,
  browser: Box<dyn BrowserSession>,
  proxy: Option<XrayProxy>,
  pub proxy_addr: Option<ProxyAddress>,
  pub started_at: DateTime<Utc>,
  pub last_polled: Option<DateTime<Utc>>,
  // Keeps an ephemeral user-data directory alive for the session's lifetime.
  _scratch_dir: Option<tempfile::TempDir>,
}

impl RunningSession {
  /// Delegates to the browser's connected check, the single source of truth
  /// for "has the user closed the window manually".
  pub fn is_running(&mut self) -> bool {
    self.last_polled = Some(Utc::now());
    self.browser.is_connected()
  }

  /// Current storage state of the live session. Empty (never an error) when
  /// the session is gone.
  pub async fn cookies(&self) -> Vec<CookieRecord> {
    if !self.browser.is_connected() {
      return Vec::new();
    }
    match self.browser.storage_state().await {
      Ok(cookies) => cookies,
      Err(e) => {
        log::warn!(
          "failed to read storage state for profile '{}': {e}",
          self.profile_name
        );
        Vec::new()
      }
    }
  }

  /// Tear the instance down: browser first, then the proxy it depends on, so
  /// the browser never sees its proxy vanish mid-request. Both are released
  /// regardless of either failing.
  pub async fn stop(mut self) {
    if let Err(e) = self.browser.close().await {
      log::warn!(
        "browser close failed for profile '{}': {e}",
        self.profile_name
      );
    }
    if let Some(mut proxy) = self.proxy.take() {
      proxy.stop().await;
    }
    log::info!("session for profile '{}' stopped", self.profile_name);
  }
}

/// Starts sessions: proxy resolution, browser launch, cleanup on failure.
pub struct SessionLauncher {
  engine: Arc<dyn BrowserEngine>,
  sessions_dir: PathBuf,
  ephemeral: bool,
}

impl SessionLauncher {
  pub fn new(engine: Arc<dyn BrowserEngine>) -> Self {
    Self {
      engine,
      sessions_dir: crate::app_dirs::sessions_dir(),
      ephemeral: false,
    }
  }

  /// Override where persistent user-data directories are created.
  pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.sessions_dir = dir.into();
    self
  }

  /// Use a throwaway user-data directory per session instead of the
  /// persistent per-profile one. Cookies are still seeded from the profile;
  /// nothing survives the session.
  pub fn ephemeral(mut self) -> Self {
    self.ephemeral = true;
    self
  }

  /// Start a session for `profile`. Proxy resolution order: an explicitly
  /// supplied address wins, else a non-empty `vless_raw` is parsed and
  /// supervised (port search seeded by `profile.proxy.port`), else no proxy.
  ///
  /// Runs to completion or failure; there is no mid-launch cancellation. On
  /// failure any proxy started for this attempt is torn down before the
  /// error propagates, so a failed start holds no resources.
  pub async fn start(
    &self,
    profile: &Profile,
    proxy_override: Option<ProxyAddress>,
  ) -> Result<RunningSession, LaunchError> {
    log::info!("starting session for profile '{}'", profile.name);

    let mut proxy: Option<XrayProxy> = None;
    let proxy_addr = if let Some(addr) = proxy_override {
      Some(addr)
    } else if let Some(raw) = profile.effective_vless() {
      let vless = VlessUri::parse(raw)?;
      let preferred = profile
        .proxy
        .as_ref()
        .map(|p| p.port)
        .unwrap_or(DEFAULT_LOCAL_PORT);
      let mut xray = XrayProxy::new(vless).with_preferred_port(preferred);
      let addr = xray.start()?;
      log::debug!("profile '{}' proxied through {}", profile.name, addr.socks_url());
      proxy = Some(xray);
      Some(addr)
    } else {
      None
    };

    let (user_data_dir, scratch_dir) = if self.ephemeral {
      let dir = tempfile::TempDir::new().map_err(ProxyError::Io)?;
      (dir.path().to_path_buf(), Some(dir))
    } else {
      (self.sessions_dir.join(&profile.id), None)
    };

    let spec = LaunchSpec {
      profile_id: profile.id.clone(),
      profile_name: profile.name.clone(),
      user_data_dir,
      proxy: proxy_addr.clone(),
      settings: profile.settings(),
      cookies: profile.cookies.clone(),
      start_url: "about:blank".to_string(),
    };

    let browser = match self.engine.open_session(&spec).await {
      Ok(browser) => browser,
      Err(e) => {
        // The proxy belongs to this attempt; never leak it past the failure.
        if let Some(mut xray) = proxy.take() {
          xray.stop().await;
        }
        return Err(e.into());
      }
    };

    Ok(RunningSession {
      profile_id: profile.id.clone(),
      profile_name: profile.name.clone(),
      browser,
      proxy,
      proxy_addr,
      started_at: Utc::now(),
      last_polled: None,
      _scratch_dir: scratch_dir,
    })
  }
}

#[derive(Default)]
struct RegistryInner {
  sessions: HashMap<String, RunningSession>,
  states: HashMap<String, SessionState>,
}

/// Tracks live sessions per profile id and enforces at most one per profile.
/// Launching an already-running profile is a no-op.
pub struct SessionRegistry {
  store: Arc<ProfileStore>,
  launcher: SessionLauncher,
  inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
  pub fn new(store: Arc<ProfileStore>, launcher: SessionLauncher) -> Self {
    Self {
      store,
      launcher,
      inner: Mutex::new(RegistryInner::default()),
    }
  }

  /// Launch a profile by id. Returns whether a new session was started:
  /// `false` means the profile was already running (or mid-start) and nothing
  /// was spawned.
  pub async fn launch(
    &self,
    profile_id: &str,
    proxy_override: Option<ProxyAddress>,
  ) -> Result<bool, LaunchError> {
    let profile = self
      .store
      .get(profile_id)
      .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()))?;

    // Claim the slot before the (slow) start so a concurrent launch of the
    // same profile backs off instead of double-spawning.
    let stale = {
      let mut inner = self.inner.lock().await;

      if inner.states.get(profile_id) == Some(&SessionState::Starting) {
        return Ok(false);
      }
      if let Some(existing) = inner.sessions.get_mut(profile_id) {
        if existing.is_running() {
          log::info!("profile '{}' is already running", profile.name);
          return Ok(false);
        }
      }
      let stale = inner.sessions.remove(profile_id);
      inner
        .states
        .insert(profile_id.to_string(), SessionState::Starting);
      stale
    };

    // The previous instance's window was closed manually; release whatever
    // it still holds (its proxy, usually) outside the lock.
    if let Some(stale) = stale {
      stale.stop().await;
    }

    let result = self.launcher.start(&profile, proxy_override).await;

    let mut inner = self.inner.lock().await;
    match result {
      Ok(session) => {
        inner.sessions.insert(profile_id.to_string(), session);
        inner
          .states
          .insert(profile_id.to_string(), SessionState::Running);
        Ok(true)
      }
      Err(e) => {
        inner
          .states
          .insert(profile_id.to_string(), SessionState::Failed);
        Err(e)
      }
    }
  }

  /// Stop a profile's session. No-op when it is not running; safe to call
  /// repeatedly.
  pub async fn stop(&self, profile_id: &str) {
    let session = {
      let mut inner = self.inner.lock().await;
      let session = inner.sessions.remove(profile_id);
      if session.is_some() {
        inner
          .states
          .insert(profile_id.to_string(), SessionState::Stopping);
      }
      session
    };

    if let Some(session) = session {
      session.stop().await;
    }

    let mut inner = self.inner.lock().await;
    inner
      .states
      .insert(profile_id.to_string(), SessionState::Idle);
  }

  pub async fn stop_all(&self) {
    let ids: Vec<String> = {
      let inner = self.inner.lock().await;
      inner.sessions.keys().cloned().collect()
    };
    for id in ids {
      self.stop(&id).await;
    }
  }

  pub async fn is_running(&self, profile_id: &str) -> bool {
    let mut inner = self.inner.lock().await;
    match inner.sessions.get_mut(profile_id) {
      Some(session) => session.is_running(),
      None => false,
    }
  }

  pub async fn state(&self, profile_id: &str) -> SessionState {
    let inner = self.inner.lock().await;
    inner
      .states
      .get(profile_id)
      .copied()
      .unwrap_or(SessionState::Idle)
  }

  /// Storage state of a live session; empty when the profile is not running.
  pub async fn cookies(&self, profile_id: &str) -> Vec<CookieRecord> {
    let inner = self.inner.lock().await;
    match inner.sessions.get(profile_id) {
      Some(session) => session.cookies().await,
      None => Vec::new(),
    }
  }

  /// Write the live session's cookies back into the profile store. Returns
  /// whether a snapshot was taken (false when the profile is not running or
  /// its jar is currently empty-by-absence).
  pub async fn snapshot_cookies(&self, profile_id: &str) -> Result<bool, LaunchError> {
    let cookies = {
      let inner = self.inner.lock().await;
      match inner.sessions.get(profile_id) {
        Some(session) => session.cookies().await,
        None => return Ok(false),
      }
    };

    if cookies.is_empty() {
      return Ok(false);
    }

    let mut profile = self
      .store
      .get(profile_id)
      .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()))?;
    profile.cookies = cookies;
    self.store.update(&profile)?;
    log::debug!("snapshotted cookies for profile {profile_id}");
    Ok(true)
  }

  /// (profile id, state) for every profile the registry has touched.
  pub async fn states(&self) -> Vec<(String, SessionState)> {
    let inner = self.inner.lock().await;
    inner
      .states
      .iter()
      .map(|(id, state)| (id.clone(), *state))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  struct MockSession {
    connected: Arc<AtomicBool>,
    cookies: Vec<CookieRecord>,
  }

  #[async_trait]
  impl BrowserSession for MockSession {
    fn is_connected(&self) -> bool {
      self.connected.load(Ordering::SeqCst)
    }

    async fn storage_state(&self) -> Result<Vec<CookieRecord>, BrowserError> {
      Ok(self.cookies.clone())
    }

    async fn close(&self) -> Result<(), BrowserError> {
      self.connected.store(false, Ordering::SeqCst);
      Ok(())
    }
  }

  #[derive(Default)]
  struct MockEngine {
    opens: AtomicUsize,
    fail: bool,
    cookies: Vec<CookieRecord>,
    last_connected: std::sync::Mutex<Option<Arc<AtomicBool>>>,
  }

  impl MockEngine {
    fn failing() -> Self {
      Self {
        fail: true,
        ..Default::default()
      }
    }

    fn open_count(&self) -> usize {
      self.opens.load(Ordering::SeqCst)
    }

    /// Flip the most recently opened session to disconnected, as if the user
    /// closed the window.
    fn disconnect_last(&self) {
      if let Some(flag) = self.last_connected.lock().unwrap().as_ref() {
        flag.store(false, Ordering::SeqCst);
      }
    }
  }

  #[async_trait]
  impl BrowserEngine for MockEngine {
    async fn open_session(
      &self,
      _spec: &LaunchSpec,
    ) -> Result<Box<dyn BrowserSession>, BrowserError> {
      self.opens.fetch_add(1, Ordering::SeqCst);
      if self.fail {
        return Err(BrowserError::Launch("mock refuses to start".to_string()));
      }
      let connected = Arc::new(AtomicBool::new(true));
      *self.last_connected.lock().unwrap() = Some(connected.clone());
      Ok(Box::new(MockSession {
        connected,
        cookies: self.cookies.clone(),
      }))
    }
  }

  fn test_registry(engine: Arc<MockEngine>) -> (tempfile::TempDir, Arc<ProfileStore>, SessionRegistry) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(ProfileStore::open(dir.path().join("profiles.json")).unwrap());
    let launcher =
      SessionLauncher::new(engine).with_sessions_dir(dir.path().join("sessions"));
    let registry = SessionRegistry::new(store.clone(), launcher);
    (dir, store, registry)
  }

  #[tokio::test]
  async fn test_launch_and_stop_cycle() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine.clone());
    let profile = store.create(Profile::new("Work")).unwrap();

    assert!(registry.launch(&profile.id, None).await.unwrap());
    assert!(registry.is_running(&profile.id).await);
    assert_eq!(registry.state(&profile.id).await, SessionState::Running);

    registry.stop(&profile.id).await;
    assert!(!registry.is_running(&profile.id).await);
    assert_eq!(registry.state(&profile.id).await, SessionState::Idle);
  }

  #[tokio::test]
  async fn test_launch_is_idempotent_per_profile() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine.clone());
    let profile = store.create(Profile::new("Work")).unwrap();

    assert!(registry.launch(&profile.id, None).await.unwrap());
    assert!(!registry.launch(&profile.id, None).await.unwrap());
    assert!(!registry.launch(&profile.id, None).await.unwrap());
    assert_eq!(engine.open_count(), 1);
  }

  #[tokio::test]
  async fn test_relaunch_after_manual_close() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine.clone());
    let profile = store.create(Profile::new("Work")).unwrap();

    registry.launch(&profile.id, None).await.unwrap();
    engine.disconnect_last();
    assert!(!registry.is_running(&profile.id).await);

    // The dead instance is cleared and a fresh one started.
    assert!(registry.launch(&profile.id, None).await.unwrap());
    assert_eq!(engine.open_count(), 2);
    assert!(registry.is_running(&profile.id).await);
  }

  #[tokio::test]
  async fn test_stop_never_started_is_noop() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine);
    let profile = store.create(Profile::new("Idle")).unwrap();

    registry.stop(&profile.id).await;
    registry.stop(&profile.id).await;
    assert_eq!(registry.state(&profile.id).await, SessionState::Idle);
  }

  #[tokio::test]
  async fn test_launch_unknown_profile_fails() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, _store, registry) = test_registry(engine);

    let err = registry.launch("no-such-id", None).await.unwrap_err();
    assert!(matches!(
      err,
      LaunchError::Store(StoreError::ProfileNotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_failed_start_reports_failed_state() {
    let engine = Arc::new(MockEngine::failing());
    let (_dir, store, registry) = test_registry(engine.clone());
    let profile = store.create(Profile::new("Broken")).unwrap();

    assert!(registry.launch(&profile.id, None).await.is_err());
    assert_eq!(registry.state(&profile.id).await, SessionState::Failed);
    assert!(!registry.is_running(&profile.id).await);

    // A later launch may try again.
    assert!(registry.launch(&profile.id, None).await.is_err());
    assert_eq!(engine.open_count(), 2);
  }

  #[tokio::test]
  async fn test_malformed_vless_fails_before_browser() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine.clone());

    let mut profile = Profile::new("BadProxy");
    profile.vless_raw = Some("vless://short@host:1".to_string());
    let profile = store.create(profile).unwrap();

    let err = registry.launch(&profile.id, None).await.unwrap_err();
    assert!(matches!(err, LaunchError::Proxy(ProxyError::MalformedUri(_))));
    assert_eq!(engine.open_count(), 0);
    assert_eq!(registry.state(&profile.id).await, SessionState::Failed);
  }

  #[tokio::test]
  async fn test_cookies_empty_when_not_running() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine);
    let profile = store.create(Profile::new("Quiet")).unwrap();

    assert!(registry.cookies(&profile.id).await.is_empty());
    assert!(!registry.snapshot_cookies(&profile.id).await.unwrap());
  }

  #[tokio::test]
  async fn test_snapshot_cookies_round_trips_into_store() {
    let cookie = CookieRecord {
      name: "sessionid".to_string(),
      value: "live-value".to_string(),
      domain: ".example.com".to_string(),
      ..Default::default()
    };
    let engine = Arc::new(MockEngine {
      cookies: vec![cookie.clone()],
      ..Default::default()
    });
    let (_dir, store, registry) = test_registry(engine);
    let profile = store.create(Profile::new("Logged-in")).unwrap();

    registry.launch(&profile.id, None).await.unwrap();
    assert!(registry.snapshot_cookies(&profile.id).await.unwrap());

    let stored = store.get(&profile.id).unwrap();
    assert_eq!(stored.cookies, vec![cookie]);
  }

  #[tokio::test]
  async fn test_states_reporting() {
    let engine = Arc::new(MockEngine::default());
    let (_dir, store, registry) = test_registry(engine);
    let a = store.create(Profile::new("A")).unwrap();
    let b = store.create(Profile::new("B")).unwrap();

    registry.launch(&a.id, None).await.unwrap();
    registry.launch(&b.id, None).await.unwrap();
    registry.stop(&b.id).await;

    let states: HashMap<_, _> = registry.states().await.into_iter().collect();
    assert_eq!(states[&a.id], SessionState::Running);
    assert_eq!(states[&b.id], SessionState::Idle);
  }

  #[test]
  fn test_session_state_as_str() {
    assert_eq!(SessionState::Idle.as_str(), "idle");
    assert_eq!(SessionState::Starting.as_str(), "starting");
    assert_eq!(SessionState::Running.as_str(), "running");
    assert_eq!(SessionState::Stopping.as_str(), "stopping");
    assert_eq!(SessionState::Failed.as_str(), "failed");
  }
}
