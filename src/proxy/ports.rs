//! Free local port probing.

use std::net::TcpListener;

use super::ProxyError;

/// How many ascending candidates to try by default.
pub const DEFAULT_SEARCH_WINDOW: u16 = 1000;

/// Find a free TCP port on 127.0.0.1, starting at `start` and walking upward
/// through [`DEFAULT_SEARCH_WINDOW`] candidates.
///
/// This is a best-effort probe, not a reservation: the throwaway bind is
/// released before returning, so a concurrently starting process can still
/// grab the port in between.
pub fn find_free_port(start: u16) -> Result<u16, ProxyError> {
  find_free_port_in_window(start, DEFAULT_SEARCH_WINDOW)
}

pub fn find_free_port_in_window(start: u16, window: u16) -> Result<u16, ProxyError> {
  for candidate in (start as u32)..(start as u32 + window as u32) {
    let Ok(candidate) = u16::try_from(candidate) else {
      break;
    };
    if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
      return Ok(candidate);
    }
  }
  Err(ProxyError::NoFreePort { start, window })
}
