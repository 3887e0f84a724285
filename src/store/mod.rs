//! Persistent OAuth token storage.
//!
//! SQLite-backed, shared between the daemon and any CLI helper that
//! completes an interactive flow on its behalf. Tokens are keyed by a
//! stable hash of `(name, url)` so every process computing the key for the
//! same server agrees; at most one record exists per key.

mod schema;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub use schema::{SCHEMA, SCHEMA_VERSION};

/// Get current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Stable identifier for a server's token record.
///
/// Two processes computing the key for the same `(name, url)` must agree,
/// so this is a plain SHA-256 over `name || '|' || url`, hex-encoded.
pub fn server_key(name: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Persisted credential for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Absolute expiry, Unix ms. `None` means the token does not expire.
    pub expires_at: Option<i64>,
    pub display_name: Option<String>,
    pub created: i64,
    pub updated: i64,
}

impl TokenRecord {
    pub fn new(access_token: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            display_name: None,
            created: now,
            updated: now,
        }
    }

    /// True when the token expires within `leeway` from now.
    ///
    /// Tokens without an expiry never report as expiring.
    pub fn expires_within(&self, leeway: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ms() + leeway.as_millis() as i64 >= expires_at,
            None => false,
        }
    }
}

/// Completion-log entry: an OAuth flow for `server_name` finished at
/// `completed_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub server_name: String,
    /// Unix timestamp ms.
    pub completed_at: i64,
}

/// Token store handle (thread-safe via Mutex).
pub struct TokenStore {
    conn: Mutex<Connection>,
}

impl TokenStore {
    /// Acquire the connection, converting PoisonError to anyhow::Error.
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("token store lock poisoned: {}", e))
    }

    /// Open or create the store at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open token store at {:?}", path.as_ref()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Open in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize schema and run migrations
    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("failed to get schema version")?;

        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)
                .context("failed to create token store schema")?;
            conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])
                .context("failed to set schema version")?;
            tracing::info!("initialized token store schema version {}", SCHEMA_VERSION);
        }

        Ok(())
    }

    /// Load the token for `(name, url)`, if one is stored.
    pub fn load(&self, name: &str, url: &str) -> Result<Option<TokenRecord>> {
        let key = server_key(name, url);
        let conn = self.conn()?;
        conn.query_row(
            "SELECT access_token, refresh_token, token_type, expires_at,
                    display_name, created_at, updated_at
             FROM oauth_tokens WHERE server_key = ?1",
            params![key],
            |row| {
                Ok(TokenRecord {
                    access_token: row.get(0)?,
                    refresh_token: row.get(1)?,
                    token_type: row.get(2)?,
                    expires_at: row.get(3)?,
                    display_name: row.get(4)?,
                    created: row.get(5)?,
                    updated: row.get(6)?,
                })
            },
        )
        .optional()
        .context("failed to load token record")
    }

    /// Upsert the token for `(name, url)`.
    ///
    /// The `updated` stamp is set here; `created` survives from an existing
    /// row.
    pub fn save(&self, name: &str, url: &str, record: &TokenRecord) -> Result<()> {
        let key = server_key(name, url);
        let now = now_ms();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO oauth_tokens
                 (server_key, server_name, url, access_token, refresh_token,
                  token_type, expires_at, display_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(server_key) DO UPDATE SET
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 token_type = excluded.token_type,
                 expires_at = excluded.expires_at,
                 display_name = excluded.display_name,
                 updated_at = excluded.updated_at",
            params![
                key,
                name,
                url,
                record.access_token,
                record.refresh_token,
                record.token_type,
                record.expires_at,
                record.display_name,
                now,
            ],
        )
        .context("failed to save token record")?;
        Ok(())
    }

    /// Delete the token for `(name, url)`. Only explicit logout calls this.
    pub fn clear(&self, name: &str, url: &str) -> Result<()> {
        let key = server_key(name, url);
        let conn = self.conn()?;
        conn.execute("DELETE FROM oauth_tokens WHERE server_key = ?1", params![key])
            .context("failed to clear token record")?;
        Ok(())
    }

    /// Record that an OAuth flow completed, for the supervisor to pick up.
    pub fn publish_completion(&self, server_name: &str, completed_at: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO oauth_completions (id, server_name, completed_at)
             VALUES (?1, ?2, ?3)",
            params![Uuid::now_v7().to_string(), server_name, completed_at],
        )
        .context("failed to publish completion event")?;
        Ok(())
    }

    /// All completion events not yet marked processed.
    ///
    /// Does not consume them: delivery is at-least-once and the caller must
    /// be idempotent. Call [`mark_processed`](Self::mark_processed) once
    /// handled.
    pub fn take_unprocessed(&self) -> Result<Vec<CompletionEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT server_name, completed_at FROM oauth_completions
             WHERE processed = 0 ORDER BY completed_at",
        )?;
        let events = stmt
            .query_map([], |row| {
                Ok(CompletionEvent {
                    server_name: row.get(0)?,
                    completed_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read completion events")?;
        Ok(events)
    }

    /// Mark one completion event as handled.
    pub fn mark_processed(&self, server_name: &str, completed_at: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE oauth_completions SET processed = 1
             WHERE server_name = ?1 AND completed_at = ?2",
            params![server_name, completed_at],
        )
        .context("failed to mark completion processed")?;
        Ok(())
    }

    /// Drop completion events older than `retention`.
    pub fn cleanup_old(&self, retention: Duration) -> Result<usize> {
        let cutoff = now_ms() - retention.as_millis() as i64;
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM oauth_completions WHERE completed_at < ?1",
                params![cutoff],
            )
            .context("failed to clean up completion events")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_key_is_stable_and_distinct() {
        let a = server_key("s1", "https://a");
        let b = server_key("s1", "https://a");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Name and URL both participate; the separator prevents ambiguity.
        assert_ne!(server_key("s1", "https://b"), a);
        assert_ne!(server_key("s2", "https://a"), a);
        assert_ne!(server_key("s1|https://a", ""), a);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = TokenStore::in_memory().unwrap();
        let mut record = TokenRecord::new("at-123");
        record.refresh_token = Some("rt-456".to_string());
        record.expires_at = Some(now_ms() + 3_600_000);
        record.display_name = Some("Test Server".to_string());

        store.save("s1", "https://a", &record).unwrap();
        let loaded = store.load("s1", "https://a").unwrap().unwrap();

        assert_eq!(loaded.access_token, record.access_token);
        assert_eq!(loaded.refresh_token, record.refresh_token);
        assert_eq!(loaded.token_type, "Bearer");
        assert_eq!(loaded.expires_at, record.expires_at);
        assert_eq!(loaded.display_name, record.display_name);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let store = TokenStore::in_memory().unwrap();
        assert!(store.load("nope", "https://a").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_and_preserves_created() {
        let store = TokenStore::in_memory().unwrap();
        store.save("s1", "https://a", &TokenRecord::new("old")).unwrap();
        let first = store.load("s1", "https://a").unwrap().unwrap();

        store.save("s1", "https://a", &TokenRecord::new("new")).unwrap();
        let second = store.load("s1", "https://a").unwrap().unwrap();

        assert_eq!(second.access_token, "new");
        assert_eq!(second.created, first.created);
        assert!(second.updated >= first.updated);
    }

    #[test]
    fn test_clear_removes_record() {
        let store = TokenStore::in_memory().unwrap();
        store.save("s1", "https://a", &TokenRecord::new("at")).unwrap();
        store.clear("s1", "https://a").unwrap();
        assert!(store.load("s1", "https://a").unwrap().is_none());
    }

    #[test]
    fn test_clear_is_scoped_to_key() {
        let store = TokenStore::in_memory().unwrap();
        store.save("s1", "https://a", &TokenRecord::new("at-a")).unwrap();
        store.save("s1", "https://b", &TokenRecord::new("at-b")).unwrap();
        store.clear("s1", "https://a").unwrap();
        assert!(store.load("s1", "https://a").unwrap().is_none());
        assert!(store.load("s1", "https://b").unwrap().is_some());
    }

    #[test]
    fn test_completions_are_at_least_once() {
        let store = TokenStore::in_memory().unwrap();
        let at = now_ms();
        store.publish_completion("s1", at).unwrap();

        // Unconsumed events keep coming back until marked.
        let first = store.take_unprocessed().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].server_name, "s1");
        let second = store.take_unprocessed().unwrap();
        assert_eq!(second, first);

        store.mark_processed("s1", at).unwrap();
        assert!(store.take_unprocessed().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let store = TokenStore::in_memory().unwrap();
        let at = now_ms();
        store.publish_completion("s1", at).unwrap();
        store.publish_completion("s1", at).unwrap();
        assert_eq!(store.take_unprocessed().unwrap().len(), 1);
    }

    #[test]
    fn test_cleanup_old_drops_stale_events() {
        let store = TokenStore::in_memory().unwrap();
        let now = now_ms();
        store.publish_completion("stale", now - 86_400_000).unwrap();
        store.publish_completion("fresh", now).unwrap();

        let removed = store.cleanup_old(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 1);
        let remaining = store.take_unprocessed().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].server_name, "fresh");
    }

    #[test]
    fn test_expires_within() {
        let mut record = TokenRecord::new("at");
        assert!(!record.expires_within(Duration::from_secs(300)));

        record.expires_at = Some(now_ms() + 60_000);
        assert!(record.expires_within(Duration::from_secs(300)));

        record.expires_at = Some(now_ms() + 3_600_000);
        assert!(!record.expires_within(Duration::from_secs(300)));
    }
}
