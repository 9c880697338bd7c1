//! TTL-aware key/value storage shared by the result cache and the job store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

/// Storage primitive with per-entry expiry. Expired entries must behave
/// exactly like missing ones for every operation.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    /// Writes only when no live entry exists. Returns whether the write happened.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<bool>;

    fn delete(&self, key: &str) -> AppResult<bool>;

    /// Deletes the entry only while it still holds `expected`.
    fn delete_if_eq(&self, key: &str, expected: &str) -> AppResult<bool>;

    fn delete_prefix(&self, prefix: &str) -> AppResult<usize>;

    fn purge_expired(&self) -> AppResult<usize>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms().saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64))
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at_ms: Option<i64>,
}

impl MemoryEntry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at_ms.map_or(true, |expires| expires > now)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = now_ms();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = now_ms();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms: expiry_ms(ttl),
            },
        );
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<bool> {
        let now = now_ms();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms: expiry_ms(ttl),
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> AppResult<bool> {
        let now = now_ms();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    fn delete_if_eq(&self, key: &str, expected: &str) -> AppResult<bool> {
        let now = now_ms();
        let mut entries = self.entries.lock();
        let matches = entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    fn delete_prefix(&self, prefix: &str) -> AppResult<usize> {
        let now = now_ms();
        let mut removed = 0;
        self.entries.lock().retain(|key, entry| {
            if key.starts_with(prefix) {
                if entry.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    fn purge_expired(&self) -> AppResult<usize> {
        let now = now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

/// SQLite-backed store so cached results and job records survive restarts.
pub struct SqliteStore {
    connection: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(path, flags)?;
        configure(&connection)?;
        run_migrations(&connection)?;
        info!(
            target: "kv_store",
            path = %path.display(),
            "sqlite key/value store ready"
        );
        Ok(Self {
            connection: Mutex::new(connection),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS kv_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_kv_entries_expires_at ON kv_entries(expires_at);
        "#,
    )?;
    Ok(())
}

fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.connection.lock();
        conn.query_row(
            "SELECT value FROM kv_entries
            WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            (key, now_ms()),
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO kv_entries (key, value, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            (key, value, expiry_ms(ttl)),
        )?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<bool> {
        let conn = self.connection.lock();
        let changed = conn.execute(
            "INSERT INTO kv_entries (key, value, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?4",
            (key, value, expiry_ms(ttl), now_ms()),
        )?;
        Ok(changed == 1)
    }

    fn delete(&self, key: &str) -> AppResult<bool> {
        let conn = self.connection.lock();
        let removed = conn.execute(
            "DELETE FROM kv_entries
            WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            (key, now_ms()),
        )?;
        Ok(removed > 0)
    }

    fn delete_if_eq(&self, key: &str, expected: &str) -> AppResult<bool> {
        let conn = self.connection.lock();
        let removed = conn.execute(
            "DELETE FROM kv_entries
            WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
            (key, expected, now_ms()),
        )?;
        Ok(removed > 0)
    }

    fn delete_prefix(&self, prefix: &str) -> AppResult<usize> {
        let conn = self.connection.lock();
        let removed = conn.execute(
            "DELETE FROM kv_entries
            WHERE key LIKE ?1 ESCAPE '\\' AND (expires_at IS NULL OR expires_at > ?2)",
            (escape_like(prefix), now_ms()),
        )?;
        // expired rows under the prefix are dead weight either way
        conn.execute(
            "DELETE FROM kv_entries WHERE key LIKE ?1 ESCAPE '\\'",
            [escape_like(prefix)],
        )?;
        Ok(removed)
    }

    fn purge_expired(&self) -> AppResult<usize> {
        let conn = self.connection.lock();
        let removed = conn.execute(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [now_ms()],
        )?;
        if removed > 0 {
            debug!(target: "kv_store", removed, "purged expired sqlite entries");
        }
        Ok(removed)
    }
}
