//! xray-core process supervision.
//!
//! Builds an xray config from a parsed VLESS URI (local SOCKS5 + HTTP
//! inbounds, VLESS outbound) and supervises the external `xray` binary
//! running it.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::json;
use tempfile::NamedTempFile;

use super::{ports, ProxyError, VlessUri};
use crate::profile::ProxyAddress;

/// Default first candidate for the local SOCKS5 inbound port.
pub const DEFAULT_LOCAL_PORT: u16 = 10808;

/// How long `stop` waits for xray to exit after SIGTERM before force-killing.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Locate the xray binary on the platform search path, plus the usual install
/// locations the search path tends to miss.
fn find_xray_binary() -> Result<PathBuf, ProxyError> {
  let locations = [
    "/usr/local/bin/xray",
    "/usr/bin/xray",
    "/opt/homebrew/bin/xray",
    "C:\\Program Files\\Xray\\xray.exe",
  ];

  for loc in &locations {
    let path = PathBuf::from(loc);
    if path.exists() {
      return Ok(path);
    }
  }

  #[cfg(unix)]
  {
    if let Ok(output) = Command::new("which").arg("xray").output() {
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
    if let Ok(output) = Command::new("where").arg("xray").output() {
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

  Err(ProxyError::BinaryNotFound(
    "xray binary not found. Install Xray-core (https://github.com/XTLS/Xray-core) and make sure `xray` is on PATH.".to_string(),
  ))
}

/// Deterministically map a VLESS URI onto an xray config: SOCKS5 inbound on
/// `local_port` (UDP on, HTTP/TLS sniffing on), HTTP inbound on
/// `local_port + 1`, and a single VLESS outbound.
pub fn build_config(vless: &VlessUri, local_port: u16) -> serde_json::Value {
  let security = vless.param("security", "reality");
  let network = vless.param("type", "tcp");
  let flow = vless.param("flow", "");
  let sni = vless.param("sni", vless.host());
  let fingerprint = vless.param("fp", "random");
  let public_key = vless.param("pbk", "");
  let short_id = vless.param("sid", "");
  let path = vless.param("path", "");
  let host_header = {
    let h = vless.param("host", &sni);
    if h.is_empty() {
      sni.clone()
    } else {
      h
    }
  };

  let mut user = json!({
    "id": vless.uuid(),
    "encryption": "none",
  });
  if !flow.is_empty() {
    user["flow"] = json!(flow);
  }

  let mut stream_settings = json!({
    "network": network,
    "security": security,
  });

  if security == "reality" {
    if public_key.is_empty() {
      // Observed upstream behavior: the block is omitted and the engine is
      // left to its defaults, which rarely negotiate. Surface it in the log.
      log::warn!(
        "VLESS URI requests reality security but carries no pbk; realitySettings omitted"
      );
    } else {
      stream_settings["realitySettings"] = json!({
        "serverName": sni,
        "fingerprint": fingerprint,
        "publicKey": public_key,
        "shortId": short_id,
        "show": false,
      });
    }
  }

  match network.as_str() {
    "tcp" => {
      if !host_header.is_empty() {
        stream_settings["tcpSettings"] = json!({
          "header": { "type": "none" },
        });
      }
    }
    "ws" => {
      stream_settings["wsSettings"] = json!({
        "path": if path.is_empty() { "/" } else { path.as_str() },
        "headers": { "Host": host_header },
      });
    }
    "grpc" => {
      stream_settings["grpcSettings"] = json!({
        "serviceName": if path.is_empty() { "grpc" } else { path.as_str() },
      });
    }
    _ => {}
  }

  json!({
    "log": { "loglevel": "warning" },
    "inbounds": [
      {
        "port": local_port,
        "listen": "127.0.0.1",
        "protocol": "socks",
        "settings": { "udp": true },
        "sniffing": { "enabled": true, "destOverride": ["http", "tls"] },
      },
      {
        "port": local_port as u32 + 1,
        "listen": "127.0.0.1",
        "protocol": "http",
        "settings": {},
      },
    ],
    "outbounds": [
      {
        "protocol": "vless",
        "settings": {
          "vnext": [
            {
              "address": vless.host(),
              "port": vless.port(),
              "users": [user],
            }
          ],
        },
        "streamSettings": stream_settings,
      }
    ],
  })
}

/// A supervised xray process forwarding a local SOCKS5 inbound to a VLESS
/// outbound. Owned by exactly one session at a time; `stop` (or `Drop`, as a
/// last resort) terminates the process and removes the config file.
pub struct XrayProxy {
  vless: VlessUri,
  preferred_port: u16,
  process: Option<Child>,
  config_file: Option<NamedTempFile>,
  local_addr: Option<ProxyAddress>,
}

impl XrayProxy {
  pub fn new(vless: VlessUri) -> Self {
    Self {
      vless,
      preferred_port: DEFAULT_LOCAL_PORT,
      process: None,
      config_file: None,
      local_addr: None,
    }
  }

  /// First candidate for the port search. Values below the default are
  /// clamped up so an explicit low port never walks privileged ranges.
  pub fn with_preferred_port(mut self, port: u16) -> Self {
    self.preferred_port = port;
    self
  }

  /// Spawn xray and return the local SOCKS5 address. Idempotent while the
  /// process is alive. The address is usable shortly after return, not
  /// necessarily at return: the spawn is not awaited for readiness.
  pub fn start(&mut self) -> Result<ProxyAddress, ProxyError> {
    if self.is_running() {
      if let Some(addr) = &self.local_addr {
        return Ok(addr.clone());
      }
    }

    // Locate the binary before anything else so this failure path never
    // leaves a config file behind.
    let binary = find_xray_binary()?;

    let port = ports::find_free_port(self.preferred_port.max(DEFAULT_LOCAL_PORT))?;
    let config = build_config(&self.vless, port);

    let config_file = tempfile::Builder::new()
      .prefix("foxden-xray-")
      .suffix(".json")
      .tempfile()?;
    std::fs::write(config_file.path(), serde_json::to_vec_pretty(&config)?)?;

    let child = Command::new(&binary)
      .arg("run")
      .arg("-c")
      .arg(config_file.path())
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()?;

    log::info!(
      "started xray (pid {}) for {}:{}, socks5 inbound on 127.0.0.1:{port}",
      child.id(),
      self.vless.host(),
      self.vless.port()
    );

    let addr = ProxyAddress::local(port);
    self.process = Some(child);
    self.config_file = Some(config_file);
    self.local_addr = Some(addr.clone());
    Ok(addr)
  }

  /// Terminate the process (SIGTERM, then a bounded wait, then SIGKILL) and
  /// delete the config file. Safe to call repeatedly or when never started;
  /// never fails, cleanup problems are logged and swallowed.
  pub async fn stop(&mut self) {
    if let Some(mut child) = self.process.take() {
      let pid = child.id();

      #[cfg(unix)]
      {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
          let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
        }
      }

      let deadline = tokio::time::Instant::now() + STOP_GRACE;
      loop {
        match child.try_wait() {
          Ok(Some(status)) => {
            log::info!("xray (pid {pid}) exited: {status}");
            break;
          }
          Ok(None) => {
            if tokio::time::Instant::now() >= deadline {
              log::warn!("xray (pid {pid}) did not exit within {STOP_GRACE:?}, killing");
              let _ = child.kill();
              let _ = child.wait();
              break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
          }
          Err(e) => {
            log::warn!("failed to poll xray (pid {pid}): {e}; killing");
            let _ = child.kill();
            let _ = child.wait();
            break;
          }
        }
      }
    }

    if let Some(config_file) = self.config_file.take() {
      if let Err(e) = config_file.close() {
        log::warn!("failed to remove xray config file: {e}");
      }
    }

    self.local_addr = None;
  }

  /// True iff the process was spawned and the OS still reports it alive.
  pub fn is_running(&mut self) -> bool {
    match self.process.as_mut() {
      Some(child) => matches!(child.try_wait(), Ok(None)),
      None => false,
    }
  }

  /// The local address returned by the last successful `start`.
  pub fn local_addr(&self) -> Option<&ProxyAddress> {
    self.local_addr.as_ref()
  }
}

impl Drop for XrayProxy {
  fn drop(&mut self) {
    // Last-resort cleanup; stop() is the ordered path.
    if let Some(mut child) = self.process.take() {
      let _ = child.kill();
      let _ = child.wait();
    }
  }
}
