//! Cookie persistence for Firefox-format profiles.
//!
//! Camoufox keeps its cookie jar in `cookies.sqlite` (`moz_cookies`) inside
//! the user-data directory. This module reads that jar into storage-state
//! records and seeds it from a profile's stored cookies before launch.
//! Seeding merges: an existing cookie with the same host/name/path is
//! overwritten, everything else is left alone.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::profile::CookieRecord;

const COOKIE_DB: &str = "cookies.sqlite";

/// Subset of the Firefox moz_cookies schema, enough for a cold profile
/// directory. A real Camoufox run replaces it with the full schema on its own
/// first write; the columns here match what both sides touch.
const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS moz_cookies (
  id INTEGER PRIMARY KEY,
  originAttributes TEXT NOT NULL DEFAULT '',
  name TEXT,
  value TEXT,
  host TEXT,
  path TEXT,
  expiry INTEGER,
  lastAccessed INTEGER,
  creationTime INTEGER,
  isSecure INTEGER,
  isHttpOnly INTEGER,
  inBrowserElement INTEGER DEFAULT 0,
  sameSite INTEGER DEFAULT 0,
  rawSameSite INTEGER DEFAULT 0,
  schemeMap INTEGER DEFAULT 0
)";

fn same_site_to_int(same_site: Option<&str>) -> i32 {
  match same_site {
    Some("Lax") => 1,
    Some("Strict") => 2,
    _ => 0,
  }
}

fn same_site_from_int(value: i32) -> Option<String> {
  match value {
    1 => Some("Lax".to_string()),
    2 => Some("Strict".to_string()),
    _ => Some("None".to_string()),
  }
}

/// Read the live cookie jar of a profile directory. A directory that has no
/// jar yet reads as empty.
pub fn read_profile_cookies(profile_dir: &Path) -> Result<Vec<CookieRecord>, rusqlite::Error> {
  let db_path = profile_dir.join(COOKIE_DB);
  if !db_path.exists() {
    return Ok(Vec::new());
  }

  let conn = Connection::open(&db_path)?;
  let mut stmt = conn.prepare(
    "SELECT name, value, host, path, expiry, isSecure, isHttpOnly, sameSite
     FROM moz_cookies",
  )?;

  let cookies = stmt
    .query_map([], |row| {
      let expiry: i64 = row.get(4)?;
      Ok(CookieRecord {
        name: row.get(0)?,
        value: row.get(1)?,
        domain: row.get(2)?,
        path: row.get(3)?,
        // expiry 0 is the session-cookie convention used by the seeder
        expires: if expiry == 0 { -1 } else { expiry },
        secure: row.get::<_, i32>(5)? != 0,
        http_only: row.get::<_, i32>(6)? != 0,
        same_site: same_site_from_int(row.get(7)?),
      })
    })?
    .collect::<Result<Vec<_>, _>>()?;

  Ok(cookies)
}

/// Write a profile's stored cookies into the jar before launch, creating the
/// database when absent. Returns (inserted, replaced).
pub fn seed_profile_cookies(
  profile_dir: &Path,
  cookies: &[CookieRecord],
) -> Result<(usize, usize), rusqlite::Error> {
  if cookies.is_empty() {
    return Ok((0, 0));
  }

  let conn = Connection::open(profile_dir.join(COOKIE_DB))?;
  conn.execute(SCHEMA, [])?;

  let now_us = chrono::Utc::now().timestamp_micros();
  let mut inserted = 0;
  let mut replaced = 0;

  for cookie in cookies {
    let expiry = cookie.expires.max(0);
    let same_site = same_site_to_int(cookie.same_site.as_deref());

    let existing: Option<i64> = conn
      .query_row(
        "SELECT id FROM moz_cookies WHERE host = ?1 AND name = ?2 AND path = ?3",
        params![&cookie.domain, &cookie.name, &cookie.path],
        |row| row.get(0),
      )
      .ok();

    if let Some(id) = existing {
      conn.execute(
        "UPDATE moz_cookies SET value = ?1, expiry = ?2, isSecure = ?3,
         isHttpOnly = ?4, sameSite = ?5, lastAccessed = ?6
         WHERE id = ?7",
        params![
          &cookie.value,
          expiry,
          cookie.secure as i32,
          cookie.http_only as i32,
          same_site,
          now_us,
          id,
        ],
      )?;
      replaced += 1;
    } else {
      conn.execute(
        "INSERT INTO moz_cookies
         (originAttributes, name, value, host, path, expiry, lastAccessed,
          creationTime, isSecure, isHttpOnly, sameSite, rawSameSite, schemeMap)
         VALUES ('', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, 2)",
        params![
          &cookie.name,
          &cookie.value,
          &cookie.domain,
          &cookie.path,
          expiry,
          now_us,
          now_us,
          cookie.secure as i32,
          cookie.http_only as i32,
          same_site,
        ],
      )?;
      inserted += 1;
    }
  }

  Ok((inserted, replaced))
}
