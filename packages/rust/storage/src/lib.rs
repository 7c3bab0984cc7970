//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the persistent
//! enrichment cache. Entries carry an absolute expiry and are never returned
//! once it has passed.
//!
//! **Access rules:**
//! - `councilgen run` / `extract`: read-write via [`Storage::open`]
//! - `councilgen cache get|ttl` / `status`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use councilgen_shared::{CouncilgenError, Result};
use libsql::{Connection, Database, params};

/// One unexpired cache row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: String,
    pub cached_at: String,
    pub expires_at: DateTime<Utc>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: libsql::Error) -> CouncilgenError {
    CouncilgenError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CouncilgenError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CouncilgenError::Storage(format!(
                "cache database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CouncilgenError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CouncilgenError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Enrichment cache operations
    // -----------------------------------------------------------------------

    /// Get a cache entry if it exists and has not expired at `now`.
    pub async fn get_cache_entry(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value_json, cached_at, expires_at FROM enrichment_cache
                 WHERE cache_key = ?1 AND expires_at > ?2",
                params![key, now.timestamp_millis()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row.get(0).map_err(storage_err)?;
                let cached_at: String = row.get(1).map_err(storage_err)?;
                let expires_ms: i64 = row.get(2).map_err(storage_err)?;
                Ok(Some(CacheEntry {
                    value,
                    cached_at,
                    expires_at: from_millis(expires_ms)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store a cache entry (upserts).
    pub async fn set_cache_entry(
        &self,
        key: &str,
        value: &str,
        cached_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO enrichment_cache (cache_key, value_json, cached_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cache_key) DO UPDATE SET
                   value_json = excluded.value_json,
                   cached_at = excluded.cached_at,
                   expires_at = excluded.expires_at",
                params![
                    key,
                    value,
                    cached_at.to_rfc3339(),
                    expires_at.timestamp_millis()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Delete a cache entry. Returns whether a row existed.
    pub async fn delete_cache_entry(&self, key: &str) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "DELETE FROM enrichment_cache WHERE cache_key = ?1",
                params![key],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Expiry of an unexpired entry.
    pub async fn cache_expiry(&self, key: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_cache_entry(key, now)
            .await?
            .map(|entry| entry.expires_at))
    }

    /// Delete every entry expired at `now`. Returns the number removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM enrichment_cache WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .await
            .map_err(storage_err)?;
        if removed > 0 {
            tracing::debug!(removed, "purged expired cache entries");
        }
        Ok(removed)
    }

    /// Number of unexpired entries whose key starts with `prefix`.
    pub async fn count_cache_entries(&self, prefix: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM enrichment_cache
                 WHERE substr(cache_key, 1, length(?1)) = ?1 AND expires_at > ?2",
                params![prefix, now.timestamp_millis()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CouncilgenError::Storage(format!("invalid expiry timestamp {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("cg_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cg_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn cache_entry_lifecycle() {
        let storage = test_storage().await;
        let now = Utc::now();
        let key = "councilgen:enrichment:adur";

        assert!(storage.get_cache_entry(key, now).await.unwrap().is_none());

        storage
            .set_cache_entry(key, r#"{"planning_email":"dc@adur.gov.uk"}"#, now, now + Duration::hours(24))
            .await
            .expect("set");

        let entry = storage.get_cache_entry(key, now).await.unwrap().expect("hit");
        assert!(entry.value.contains("dc@adur.gov.uk"));
        assert_eq!(
            entry.expires_at.timestamp_millis(),
            (now + Duration::hours(24)).timestamp_millis()
        );

        // Upsert replaces value and expiry
        storage
            .set_cache_entry(key, "{}", now, now + Duration::hours(1))
            .await
            .unwrap();
        let expiry = storage.cache_expiry(key, now).await.unwrap().unwrap();
        assert_eq!(expiry.timestamp_millis(), (now + Duration::hours(1)).timestamp_millis());

        assert!(storage.delete_cache_entry(key).await.unwrap());
        assert!(!storage.delete_cache_entry(key).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purgeable() {
        let storage = test_storage().await;
        let now = Utc::now();

        storage
            .set_cache_entry("councilgen:enrichment:a", "{}", now, now + Duration::hours(24))
            .await
            .unwrap();
        storage
            .set_cache_entry("councilgen:enrichment:b", "{}", now, now + Duration::minutes(5))
            .await
            .unwrap();
        storage
            .set_cache_entry("other:ns:c", "{}", now, now + Duration::hours(24))
            .await
            .unwrap();

        let later = now + Duration::hours(1);
        assert!(storage.get_cache_entry("councilgen:enrichment:b", later).await.unwrap().is_none());
        assert_eq!(
            storage.count_cache_entries("councilgen:enrichment:", later).await.unwrap(),
            1
        );
        assert_eq!(storage.purge_expired(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cg_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let now = Utc::now();
        assert!(ro.set_cache_entry("k", "{}", now, now).await.is_err());
        assert!(ro.get_cache_entry("k", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("cg_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
