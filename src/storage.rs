//! SQLite cache for fetched Nightscout payloads

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::path::Path;

/// Identifies one cached fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKey<'a> {
    pub source: &'a str,
    pub kind: &'a str,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// SQLite database holding raw fetch payloads
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Create or open a database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fetch_cache (
                source TEXT NOT NULL,
                kind TEXT NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                payload TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (source, kind, range_start, range_end)
            );

            CREATE INDEX IF NOT EXISTS idx_fetch_cache_fetched_at
                ON fetch_cache(fetched_at);",
        )?;

        Ok(Self { conn })
    }

    /// Store a payload, replacing any earlier fetch for the same key
    pub fn put(&self, key: &CacheKey, payload: &str, fetched_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO fetch_cache
                (source, kind, range_start, range_end, payload, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.source,
                key.kind,
                key.start_ms,
                key.end_ms,
                payload,
                fetched_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Payload for `key` if it was fetched at or after `not_before`
    pub fn get(&self, key: &CacheKey, not_before: DateTime<Utc>) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT payload FROM fetch_cache
                 WHERE source = ?1 AND kind = ?2 AND range_start = ?3 AND range_end = ?4
                   AND fetched_at >= ?5",
                params![
                    key.source,
                    key.kind,
                    key.start_ms,
                    key.end_ms,
                    not_before.timestamp_millis(),
                ],
                |row| row.get(0),
            )
            .optional()
    }

    /// Drop payloads fetched before `cutoff`, returns the number removed
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn.execute(
            "DELETE FROM fetch_cache WHERE fetched_at < ?1",
            params![cutoff.timestamp_millis()],
        )
    }

    /// Number of cached payloads
    pub fn count(&self) -> Result<i64> {
        self.conn.query_row("SELECT COUNT(*) FROM fetch_cache", [], |row| row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn key(kind: &str) -> CacheKey<'_> {
        CacheKey {
            source: "https://ns.example",
            kind,
            start_ms: 1_000,
            end_ms: 2_000,
        }
    }

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("cache.db")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        storage.put(&key("entries"), "[1]", now).unwrap();
        assert_eq!(storage.get(&key("entries"), now).unwrap().as_deref(), Some("[1]"));
        assert_eq!(storage.get(&key("treatments"), now).unwrap(), None);

        // Too old for the caller's freshness bound
        assert_eq!(storage.get(&key("entries"), now + Duration::seconds(1)).unwrap(), None);
    }

    #[test]
    fn test_put_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("cache.db")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        storage.put(&key("entries"), "[1]", now).unwrap();
        storage.put(&key("entries"), "[2]", now + Duration::minutes(1)).unwrap();
        assert_eq!(storage.count().unwrap(), 1);
        assert_eq!(storage.get(&key("entries"), now).unwrap().as_deref(), Some("[2]"));
    }

    #[test]
    fn test_purge_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        {
            let storage = Storage::new(&path).unwrap();
            storage.put(&key("entries"), "[]", now - Duration::hours(2)).unwrap();
            storage.put(&key("profile"), "[]", now).unwrap();
        }

        let storage = Storage::new(&path).unwrap();
        assert_eq!(storage.count().unwrap(), 2);
        assert_eq!(storage.purge_older_than(now - Duration::hours(1)).unwrap(), 1);
        assert_eq!(storage.count().unwrap(), 1);
    }
}
