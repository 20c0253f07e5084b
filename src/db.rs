//! SQLite store shared by every host process in the fleet
//!
//! Holds the tenant records, the task locks and the task run log. Processes
//! only read site records; `save_site`, `set_published` and `trash_site` are
//! used by the `sites` command and by tests, and `delete_site` removes the
//! throwaway sites created for one-off task runs.

use crate::error::Error;
use crate::tasks::{LockService, LockToken, RunLog};
use crate::tenant::{Redirect, SiteStore, TenantFilter, TenantRecord, TenantRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 3;

const SITE_COLUMNS: &str = "id, short_name, published, trashed, updated_at,
    redirect_url, redirect_preserve_path, redirect_status,
    canonical_hostname, canonicalize, canonicalize_status, base_urls, theme";

/// Lease and retry settings for task locks
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// A lock not released within this time is considered abandoned
    pub lease: Duration,
    /// Give up acquiring after this long
    pub timeout: Duration,
    /// Pause between acquisition attempts
    pub retry: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            timeout: Duration::from_secs(60),
            retry: Duration::from_millis(250),
        }
    }
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    locks: LockSettings,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Several processes share the file
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: LockSettings::default(),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: LockSettings::default(),
        };

        db.run_migrations()?;
        Ok(db)
    }

    pub fn with_lock_settings(mut self, locks: LockSettings) -> Self {
        self.locks = locks;
        self
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }

            if current_version < 3 {
                Self::migrate_v3(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: sites and their hostnames
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: sites");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                short_name TEXT UNIQUE,
                published INTEGER NOT NULL DEFAULT 1,
                trashed INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                redirect_url TEXT,
                redirect_preserve_path INTEGER NOT NULL DEFAULT 0,
                redirect_status INTEGER NOT NULL DEFAULT 302,
                canonical_hostname TEXT,
                canonicalize INTEGER NOT NULL DEFAULT 0,
                canonicalize_status INTEGER NOT NULL DEFAULT 302,
                base_urls TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS site_hostnames (
                hostname TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                position INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_site_hostnames_site ON site_hostnames(site_id);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: task locks and run log
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: task coordination");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task TEXT NOT NULL,
                started_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_log_task_started ON task_log(task, started_at DESC);

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    /// Migration v3: site themes
    fn migrate_v3(conn: &Connection) -> Result<()> {
        debug!("Applying migration v3: site themes");

        conn.execute_batch(
            r#"
            ALTER TABLE sites ADD COLUMN theme TEXT;

            INSERT INTO schema_migrations (version) VALUES (3);
            "#,
        )?;

        Ok(())
    }

    // ==================== Site Operations ====================

    fn site_from_row(row: &Row) -> rusqlite::Result<TenantRecord> {
        let redirect_url: Option<String> = row.get(5)?;
        let redirect = match redirect_url {
            Some(url) => Some(Redirect {
                url,
                preserve_path: row.get(6)?,
                status: row.get(7)?,
            }),
            None => None,
        };
        let base_urls: String = row.get(11)?;

        Ok(TenantRecord {
            id: row.get(0)?,
            short_name: row.get(1)?,
            hostnames: Vec::new(),
            published: row.get(2)?,
            trashed: row.get(3)?,
            updated_at: from_millis(row.get(4)?),
            redirect,
            canonical_hostname: row.get(8)?,
            canonicalize: row.get(9)?,
            canonicalize_status: row.get(10)?,
            base_urls: serde_json::from_str(&base_urls).unwrap_or_default(),
            theme: row.get(12)?,
        })
    }

    fn load_hostnames(conn: &Connection, record: &mut TenantRecord) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "SELECT hostname FROM site_hostnames WHERE site_id = ?1 ORDER BY position",
        )?;
        record.hostnames = stmt
            .query_map(params![record.id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(())
    }

    fn query_site(conn: &Connection, condition: &str, value: &str) -> Result<Option<TenantRecord>> {
        let sql = format!("SELECT {} FROM sites WHERE {}", SITE_COLUMNS, condition);
        let record = conn
            .query_row(&sql, params![value], Self::site_from_row)
            .optional()
            .context("Failed to get site")?;

        match record {
            Some(mut record) => {
                Self::load_hostnames(conn, &mut record)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace a site and its hostnames.
    ///
    /// `updated_at` is set to the current time, and always moves forward,
    /// so running instances notice the change. Returns the stored record.
    pub fn save_site(&self, record: &TenantRecord) -> Result<TenantRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let previous: Option<i64> = tx
            .query_row(
                "SELECT updated_at FROM sites WHERE id = ?1",
                params![record.id],
                |row| row.get(0),
            )
            .optional()?;
        let now = Utc::now().timestamp_millis();
        let updated_at = match previous {
            Some(prev) if prev >= now => prev + 1,
            _ => now,
        };

        let (redirect_url, preserve_path, redirect_status) = match &record.redirect {
            Some(r) => (Some(r.url.as_str()), r.preserve_path, r.status),
            None => (None, false, 302),
        };
        let base_urls = serde_json::to_string(&record.base_urls)?;

        tx.execute(
            "INSERT INTO sites (id, short_name, published, trashed, updated_at,
                redirect_url, redirect_preserve_path, redirect_status,
                canonical_hostname, canonicalize, canonicalize_status, base_urls, theme)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                short_name = excluded.short_name,
                published = excluded.published,
                trashed = excluded.trashed,
                updated_at = excluded.updated_at,
                redirect_url = excluded.redirect_url,
                redirect_preserve_path = excluded.redirect_preserve_path,
                redirect_status = excluded.redirect_status,
                canonical_hostname = excluded.canonical_hostname,
                canonicalize = excluded.canonicalize,
                canonicalize_status = excluded.canonicalize_status,
                base_urls = excluded.base_urls,
                theme = excluded.theme",
            params![
                record.id,
                record.short_name,
                record.published,
                record.trashed,
                updated_at,
                redirect_url,
                preserve_path,
                redirect_status,
                record.canonical_hostname,
                record.canonicalize,
                record.canonicalize_status,
                base_urls,
                record.theme,
            ],
        )
        .with_context(|| format!("Failed to save site {}", record.id))?;

        tx.execute("DELETE FROM site_hostnames WHERE site_id = ?1", params![record.id])?;
        for (position, hostname) in record.hostnames.iter().enumerate() {
            tx.execute(
                "INSERT INTO site_hostnames (hostname, site_id, position) VALUES (?1, ?2, ?3)",
                params![hostname.to_lowercase(), record.id, position as i64],
            )
            .with_context(|| format!("Hostname {} is already in use", hostname))?;
        }

        tx.commit()?;

        let mut stored = record.clone();
        stored.updated_at = from_millis(updated_at);
        stored.hostnames = record.hostnames.iter().map(|h| h.to_lowercase()).collect();
        Ok(stored)
    }

    /// Get a site by id, including unpublished and trashed sites
    pub fn get_site(&self, id: &str) -> Result<Option<TenantRecord>> {
        let conn = self.conn.lock();
        Self::query_site(&conn, "id = ?1", id)
    }

    fn update_flag(&self, id: &str, column: &str, value: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE sites SET {} = ?1, updated_at = MAX(updated_at + 1, ?2) WHERE id = ?3",
            column
        );
        let rows = conn.execute(&sql, params![value, Utc::now().timestamp_millis(), id])?;
        Ok(rows > 0)
    }

    pub fn set_published(&self, id: &str, published: bool) -> Result<bool> {
        self.update_flag(id, "published", published)
    }

    /// Move a site to the trash
    pub fn trash_site(&self, id: &str) -> Result<bool> {
        self.update_flag(id, "trashed", true)
    }

    /// Delete a site and its hostnames outright
    pub fn delete_site(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM site_hostnames WHERE site_id = ?1", params![id])?;
        let rows = tx
            .execute("DELETE FROM sites WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to delete site {}", id))?;
        tx.commit()?;
        Ok(rows > 0)
    }

    fn list_sites(&self, filter: TenantFilter) -> Result<Vec<TenantRecord>> {
        let conn = self.conn.lock();
        let condition = match filter {
            TenantFilter::Live => "published = 1 AND trashed = 0",
            TenantFilter::All => "trashed = 0",
        };
        let sql = format!(
            "SELECT {} FROM sites WHERE {} ORDER BY id",
            SITE_COLUMNS, condition
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut records = stmt
            .query_map([], Self::site_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for record in &mut records {
            Self::load_hostnames(&conn, record)?;
        }
        Ok(records)
    }

    // ==================== Lock Operations ====================

    /// Take the lock if it is free or its lease ran out
    pub fn try_lock(&self, name: &str, token: &str, lease: Duration) -> Result<bool> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + lease.as_millis() as i64;
        let rows = conn.execute(
            "INSERT INTO locks (name, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
             WHERE locks.expires_at < ?4",
            params![name, token, expires_at, now],
        )?;
        Ok(rows == 1)
    }

    /// Release a lock held with `token`. Returns false if it was not ours.
    pub fn release_lock(&self, name: &str, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND token = ?2",
            params![name, token],
        )?;
        Ok(rows > 0)
    }

    // ==================== Task Log Operations ====================

    pub fn latest_task_start(
        &self,
        task: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let latest: Option<i64> = conn
            .query_row(
                "SELECT started_at FROM task_log WHERE task = ?1 AND started_at >= ?2
                 ORDER BY started_at DESC LIMIT 1",
                params![task, since.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read task log")?;
        Ok(latest.map(from_millis))
    }

    pub fn insert_task_start(&self, task: &str, started_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_log (task, started_at) VALUES (?1, ?2)",
            params![task, started_at.timestamp_millis()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TenantRegistry for Database {
    async fn find_by_hostname(&self, hostname: &str) -> crate::error::Result<Option<TenantRecord>> {
        let conn = self.conn.lock();
        Ok(Self::query_site(
            &conn,
            "published = 1 AND trashed = 0
             AND id = (SELECT site_id FROM site_hostnames WHERE hostname = ?1)",
            &hostname.to_lowercase(),
        )?)
    }

    async fn find_by_id(&self, id: &str) -> crate::error::Result<Option<TenantRecord>> {
        let conn = self.conn.lock();
        Ok(Self::query_site(
            &conn,
            "id = ?1 AND published = 1 AND trashed = 0",
            id,
        )?)
    }

    async fn find_by_short_name(
        &self,
        short_name: &str,
    ) -> crate::error::Result<Option<TenantRecord>> {
        let conn = self.conn.lock();
        Ok(Self::query_site(
            &conn,
            "short_name = ?1 AND published = 1 AND trashed = 0",
            short_name,
        )?)
    }

    async fn find_any(&self, id_or_hostname: &str) -> crate::error::Result<Option<TenantRecord>> {
        let conn = self.conn.lock();
        Ok(Self::query_site(
            &conn,
            "trashed = 0 AND (id = ?1
                OR id = (SELECT site_id FROM site_hostnames WHERE hostname = lower(?1)))",
            id_or_hostname,
        )?)
    }

    async fn live_ids(&self, ids: &[String]) -> crate::error::Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM sites WHERE id = ?1 AND published = 1 AND trashed = 0",
        )?;
        let mut live = Vec::new();
        for id in ids {
            if stmt.exists(params![id])? {
                live.push(id.clone());
            }
        }
        Ok(live)
    }

    async fn list(&self, filter: TenantFilter) -> crate::error::Result<Vec<TenantRecord>> {
        Ok(self.list_sites(filter)?)
    }
}

#[async_trait]
impl SiteStore for Database {
    async fn create_site(&self, record: &TenantRecord) -> crate::error::Result<TenantRecord> {
        if self.get_site(&record.id)?.is_some() {
            return Err(Error::Store(format!("site {} already exists", record.id)));
        }
        Ok(self.save_site(record)?)
    }

    async fn remove_site(&self, tenant_id: &str) -> crate::error::Result<bool> {
        Ok(self.delete_site(tenant_id)?)
    }
}

#[async_trait]
impl LockService for Database {
    async fn lock(&self, key: &str) -> crate::error::Result<LockToken> {
        let token = LockToken::new();
        let start = Instant::now();
        loop {
            let acquired = self
                .try_lock(key, token.as_str(), self.locks.lease)
                .map_err(|e| Error::LockUnavailable {
                    key: key.to_string(),
                    message: format!("{:#}", e),
                })?;
            if acquired {
                debug!(key, "Lock acquired");
                return Ok(token);
            }
            if start.elapsed() >= self.locks.timeout {
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited: start.elapsed(),
                });
            }
            tokio::time::sleep(self.locks.retry).await;
        }
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> crate::error::Result<()> {
        if !self.release_lock(key, token.as_str())? {
            tracing::warn!(key, "Lock was no longer held at release");
        }
        Ok(())
    }
}

#[async_trait]
impl RunLog for Database {
    async fn last_started_since(
        &self,
        task: &str,
        since: DateTime<Utc>,
    ) -> crate::error::Result<Option<DateTime<Utc>>> {
        Ok(self.latest_task_start(task, since)?)
    }

    async fn record_start(&self, task: &str, started_at: DateTime<Utc>) -> crate::error::Result<()> {
        Ok(self.insert_task_start(task, started_at)?)
    }
}

/// Parse a TOML document of `[[site]]` tables, as used by `multisite sites put`
pub fn parse_sites_file(contents: &str) -> Result<Vec<TenantRecord>> {
    #[derive(serde::Deserialize)]
    struct SitesFile {
        #[serde(default, rename = "site")]
        sites: Vec<SiteEntry>,
    }

    #[derive(serde::Deserialize)]
    struct SiteEntry {
        id: String,
        #[serde(default)]
        short_name: Option<String>,
        #[serde(default)]
        hostnames: Vec<String>,
        #[serde(default = "default_true")]
        published: bool,
        #[serde(default)]
        redirect: Option<Redirect>,
        #[serde(default)]
        canonical_hostname: Option<String>,
        #[serde(default)]
        canonicalize: bool,
        #[serde(default = "crate::tenant::default_redirect_status")]
        canonicalize_status: u16,
        #[serde(default)]
        base_urls: HashMap<String, String>,
        #[serde(default)]
        theme: Option<String>,
    }

    fn default_true() -> bool {
        true
    }

    let file: SitesFile = toml::from_str(contents).context("Failed to parse sites file")?;
    Ok(file
        .sites
        .into_iter()
        .map(|entry| TenantRecord {
            id: entry.id,
            short_name: entry.short_name,
            hostnames: entry.hostnames,
            published: entry.published,
            trashed: false,
            updated_at: Utc::now(),
            redirect: entry.redirect,
            canonical_hostname: entry.canonical_hostname,
            canonicalize: entry.canonicalize,
            canonicalize_status: entry.canonicalize_status,
            base_urls: entry.base_urls,
            theme: entry.theme,
        })
        .collect())
}
