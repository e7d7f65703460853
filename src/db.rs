//! Local SQLite database layer for the offline store.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and the `OfflineDb` handle shared between the UI layer and the
//! background sync engine. The handle is constructed explicitly at startup
//! and passed to whoever needs it; there is no module-level connection.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::SyncError;

/// Shared handle to the on-device database.
///
/// Lock scopes are kept short (lock, execute, unlock) so UI writes and a
/// running drain interleave without blocking each other for long.
pub struct OfflineDb {
    pub(crate) conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

impl OfflineDb {
    /// Initialize the database at `{data_dir}/offline.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn init(data_dir: &Path) -> Result<Self, SyncError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| SyncError::Storage(format!("create data dir: {e}")))?;

        let db_path = data_dir.join("offline.db");
        info!("Opening offline database at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!("Database open failed ({first_err}), deleting and retrying once");
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    // Also remove WAL/SHM files if present
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                open_and_configure(&db_path)
                    .map_err(|e| SyncError::Storage(format!("open after retry: {e}")))?
            }
        };

        run_migrations(&conn)?;

        info!("Offline database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Acquire the connection. A poisoned lock means a writer panicked
    /// mid-operation; the store cannot be trusted after that.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("db lock poisoned: {e}")))
    }

    /// In-memory database with the full schema, for tests.
    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        run_migrations(&conn).expect("run migrations");
        Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        }
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn =
        Connection::open(path).map_err(|e| SyncError::Storage(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| SyncError::Storage(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
///
/// Migrations are additive only: new tables, guarded new columns, new
/// indexes. Opening an older on-device database upgrades it in place.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| SyncError::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: offline record tables, menu cache, and the sync queue.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store for engine bookkeeping)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- offline_orders
        CREATE TABLE IF NOT EXISTS offline_orders (
            id TEXT PRIMARY KEY,
            order_number TEXT NOT NULL,
            server_id TEXT,
            restaurant_id TEXT NOT NULL,
            customer_name TEXT,
            customer_phone TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            delivery_fee REAL NOT NULL DEFAULT 0,
            service_fee REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            delivery_type TEXT NOT NULL DEFAULT 'dine-in'
                CHECK (delivery_type IN ('delivery', 'pickup', 'dine-in')),
            payment_method TEXT,
            delivery_address TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            synced INTEGER NOT NULL DEFAULT 0,
            sync_attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        -- offline_customers (one row per phone per restaurant)
        CREATE TABLE IF NOT EXISTS offline_customers (
            id TEXT PRIMARY KEY,
            server_id TEXT,
            restaurant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            tax_id TEXT,
            address TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE (restaurant_id, phone)
        );

        -- menu_cache (one snapshot per restaurant)
        CREATE TABLE IF NOT EXISTS menu_cache (
            restaurant_id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            cached_at TEXT NOT NULL
        );

        -- sync_queue (append-only; rows are deleted on successful sync)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL
                CHECK (action IN ('create_order', 'create_customer', 'update_order')),
            entity_type TEXT NOT NULL CHECK (entity_type IN ('order', 'customer')),
            entity_id TEXT NOT NULL,
            restaurant_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_flight', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_orders_synced ON offline_orders(synced);
        CREATE INDEX IF NOT EXISTS idx_orders_restaurant ON offline_orders(restaurant_id, synced);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON offline_orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_customers_restaurant ON offline_customers(restaurant_id, synced);
        CREATE INDEX IF NOT EXISTS idx_customers_phone ON offline_customers(phone);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_restaurant ON sync_queue(restaurant_id, status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::Storage(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, SyncError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| SyncError::Storage(format!("table_info {table}: {e}")))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| SyncError::Storage(format!("table_info query: {e}")))?;
    while let Some(row) = rows
        .next()
        .map_err(|e| SyncError::Storage(format!("table_info next: {e}")))?
    {
        let name: String = row
            .get(1)
            .map_err(|e| SyncError::Storage(format!("table_info name: {e}")))?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: retry scheduling for the sync queue.
///
/// Adds `next_retry_at` so failed items defer their next submission instead
/// of being re-attempted on every drain pass.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    if !column_exists(conn, "sync_queue", "next_retry_at")? {
        conn.execute_batch("ALTER TABLE sync_queue ADD COLUMN next_retry_at TEXT;")
            .map_err(|e| SyncError::Storage(format!("migration v2 add next_retry_at: {e}")))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_next_retry
            ON sync_queue(status, next_retry_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::Storage(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (sync queue retry scheduling)");
    Ok(())
}

/// Migration v3: sync timestamps and menu snapshot versioning.
fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    if !column_exists(conn, "offline_orders", "synced_at")? {
        conn.execute_batch("ALTER TABLE offline_orders ADD COLUMN synced_at TEXT;")
            .map_err(|e| SyncError::Storage(format!("migration v3 orders synced_at: {e}")))?;
    }
    if !column_exists(conn, "offline_customers", "synced_at")? {
        conn.execute_batch("ALTER TABLE offline_customers ADD COLUMN synced_at TEXT;")
            .map_err(|e| SyncError::Storage(format!("migration v3 customers synced_at: {e}")))?;
    }
    if !column_exists(conn, "menu_cache", "version")? {
        conn.execute_batch("ALTER TABLE menu_cache ADD COLUMN version TEXT;")
            .map_err(|e| SyncError::Storage(format!("migration v3 menu version: {e}")))?;
    }

    conn.execute_batch("INSERT INTO schema_version (version) VALUES (3);")
        .map_err(|e| {
            error!("Migration v3 failed: {e}");
            SyncError::Storage(format!("migration v3: {e}"))
        })?;

    info!("Applied migration v3 (sync timestamps + menu version)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| SyncError::Storage(format!("set_setting: {e}")))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_conn();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for table in [
            "local_settings",
            "offline_orders",
            "offline_customers",
            "menu_cache",
            "sync_queue",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }

        // v2/v3 columns exist (the queries fail if they do not)
        conn.prepare("SELECT next_retry_at FROM sync_queue LIMIT 0")
            .expect("next_retry_at column");
        conn.prepare("SELECT synced_at FROM offline_orders LIMIT 0")
            .expect("orders synced_at column");
        conn.prepare("SELECT synced_at FROM offline_customers LIMIT 0")
            .expect("customers synced_at column");
        conn.prepare("SELECT version FROM menu_cache LIMIT 0")
            .expect("menu_cache version column");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1_preserves_data() {
        let conn = test_conn();
        // Stop at v1, insert data, then upgrade to latest.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT (datetime('now'))
            );",
        )
        .unwrap();
        migrate_v1(&conn).expect("v1");

        conn.execute(
            "INSERT INTO sync_queue (action, entity_type, entity_id, restaurant_id, payload,
                                     idempotency_key, created_at, updated_at)
             VALUES ('create_order', 'order', 'ord-1', 'rest-1', '{}', 'key-1',
                     datetime('now'), datetime('now'))",
            [],
        )
        .expect("insert v1 queue row");

        run_migrations(&conn).expect("upgrade to latest");

        let (count, next_retry): (i64, Option<String>) = conn
            .query_row(
                "SELECT COUNT(*), MAX(next_retry_at) FROM sync_queue",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("query upgraded row");
        assert_eq!(count, 1, "v1 data should survive the upgrade");
        assert!(next_retry.is_none(), "new column defaults to NULL");
    }

    #[test]
    fn test_sync_queue_idempotency_key_unique() {
        let conn = test_conn();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO sync_queue (action, entity_type, entity_id, restaurant_id, payload,
                                     idempotency_key, created_at, updated_at)
             VALUES ('create_order', 'order', 'ord-1', 'rest-1', '{}', 'key-1',
                     datetime('now'), datetime('now'))",
            [],
        )
        .expect("first insert");

        let result = conn.execute(
            "INSERT INTO sync_queue (action, entity_type, entity_id, restaurant_id, payload,
                                     idempotency_key, created_at, updated_at)
             VALUES ('create_order', 'order', 'ord-2', 'rest-1', '{}', 'key-1',
                     datetime('now'), datetime('now'))",
            [],
        );
        assert!(result.is_err(), "duplicate idempotency_key should be rejected");
    }

    #[test]
    fn test_customer_phone_unique_per_restaurant() {
        let conn = test_conn();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO offline_customers (id, restaurant_id, name, phone, created_at)
             VALUES ('c1', 'rest-1', 'Ana', '5511999990000', datetime('now'))",
            [],
        )
        .expect("first insert");

        // Same phone in another restaurant is fine
        conn.execute(
            "INSERT INTO offline_customers (id, restaurant_id, name, phone, created_at)
             VALUES ('c2', 'rest-2', 'Ana', '5511999990000', datetime('now'))",
            [],
        )
        .expect("other restaurant insert");

        // Same phone in the same restaurant violates the unique index
        let dup = conn.execute(
            "INSERT INTO offline_customers (id, restaurant_id, name, phone, created_at)
             VALUES ('c3', 'rest-1', 'Ana Maria', '5511999990000', datetime('now'))",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        // WAL only works on file-backed databases; in-memory always reports
        // "memory". Use a tempfile to exercise the full configure path.
        let dir = std::env::temp_dir().join("mesa_offline_test_wal");
        let _ = std::fs::create_dir_all(&dir);
        let db_path = dir.join("test_wal.db");
        let _ = std::fs::remove_file(&db_path);

        let conn = open_and_configure(&db_path).expect("open temp db");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal");

        drop(conn);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
