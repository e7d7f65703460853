//! Menu cache layer.
//!
//! Keeps one snapshot of the remote menu per restaurant in the local
//! `menu_cache` table, refreshed whenever connectivity allows and served as
//! a read-through fallback while the remote is unreachable.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{info, trace, warn};

use crate::api::RemoteBackend;
use crate::db::OfflineDb;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promo_price: Option<f64>,
    #[serde(default = "default_available")]
    pub available: bool,
    pub category_id: String,
}

fn default_available() -> bool {
    true
}

/// One restaurant's menu as pulled from the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MenuSnapshot {
    #[serde(default)]
    pub categories: Vec<MenuCategory>,
    #[serde(default)]
    pub items: Vec<MenuItem>,
}

/// A cached snapshot plus its bookkeeping columns.
#[derive(Debug, Clone)]
pub struct MenuCacheEntry {
    pub snapshot: MenuSnapshot,
    pub version: Option<String>,
    pub cached_at: String,
}

/// Compute a stable version digest from the snapshot content, so identical
/// pulls skip the cache write.
fn snapshot_version(snapshot: &MenuSnapshot) -> String {
    let serialized = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    format!("digest:{:016x}", hasher.finish())
}

/// Overwrite the cached snapshot for a restaurant.
pub fn cache_menu(
    db: &OfflineDb,
    restaurant_id: &str,
    snapshot: &MenuSnapshot,
) -> Result<(), SyncError> {
    let version = snapshot_version(snapshot);
    let data = serde_json::to_string(snapshot)
        .map_err(|e| SyncError::Storage(format!("serialize menu: {e}")))?;

    let conn = db.lock()?;

    let cached_version: Option<String> = conn
        .query_row(
            "SELECT version FROM menu_cache WHERE restaurant_id = ?1",
            params![restaurant_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read menu version: {e}")))?
        .flatten();

    if cached_version.as_deref() == Some(version.as_str()) {
        trace!(restaurant_id, version = %version, "menu cache already at latest version");
        return Ok(());
    }

    conn.execute(
        "INSERT INTO menu_cache (restaurant_id, data, version, cached_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(restaurant_id) DO UPDATE SET
            data = excluded.data,
            version = excluded.version,
            cached_at = excluded.cached_at",
        params![restaurant_id, data, version, Utc::now().to_rfc3339()],
    )
    .map_err(|e| SyncError::Storage(format!("upsert menu cache: {e}")))?;

    info!(
        restaurant_id,
        categories = snapshot.categories.len(),
        items = snapshot.items.len(),
        "Menu cache updated"
    );
    Ok(())
}

/// The most recent cached snapshot for a restaurant, if any.
pub fn menu_cache(
    db: &OfflineDb,
    restaurant_id: &str,
) -> Result<Option<MenuCacheEntry>, SyncError> {
    let conn = db.lock()?;
    let row: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT data, version, cached_at FROM menu_cache WHERE restaurant_id = ?1",
            params![restaurant_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read menu cache: {e}")))?;

    let Some((data, version, cached_at)) = row else {
        return Ok(None);
    };

    let snapshot: MenuSnapshot = serde_json::from_str(&data)
        .map_err(|e| SyncError::Storage(format!("corrupt menu cache: {e}")))?;
    Ok(Some(MenuCacheEntry {
        snapshot,
        version,
        cached_at,
    }))
}

/// Pull the menu from the remote and overwrite the local cache.
pub async fn refresh_menu(
    db: &OfflineDb,
    remote: &dyn RemoteBackend,
    restaurant_id: &str,
) -> Result<MenuSnapshot, SyncError> {
    let snapshot = remote.fetch_menu(restaurant_id).await?;
    cache_menu(db, restaurant_id, &snapshot)?;
    Ok(snapshot)
}

/// Read-through menu load: remote first, cached snapshot as fallback when
/// the remote is unreachable. Semantic rejections and storage failures
/// propagate; only connectivity-shaped errors fall back.
pub async fn load_menu(
    db: &OfflineDb,
    remote: &dyn RemoteBackend,
    restaurant_id: &str,
) -> Result<MenuSnapshot, SyncError> {
    match refresh_menu(db, remote, restaurant_id).await {
        Ok(snapshot) => Ok(snapshot),
        Err(err) if err.is_retryable() => match menu_cache(db, restaurant_id)? {
            Some(entry) => {
                warn!(
                    restaurant_id,
                    cached_at = %entry.cached_at,
                    error = %err,
                    "Remote menu unreachable, serving cached snapshot"
                );
                Ok(entry.snapshot)
            }
            None => Err(err),
        },
        Err(err) => Err(err),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockBackend;
    use std::sync::atomic::Ordering;

    fn sample_snapshot() -> MenuSnapshot {
        MenuSnapshot {
            categories: vec![MenuCategory {
                id: "cat-pizza".to_string(),
                name: "Pizzas".to_string(),
                sort_order: 1,
            }],
            items: vec![
                MenuItem {
                    id: "itm-margherita".to_string(),
                    name: "Margherita".to_string(),
                    price: 42.0,
                    promo_price: Some(35.0),
                    available: true,
                    category_id: "cat-pizza".to_string(),
                },
                MenuItem {
                    id: "itm-calabresa".to_string(),
                    name: "Calabresa".to_string(),
                    price: 45.0,
                    promo_price: None,
                    available: false,
                    category_id: "cat-pizza".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_cache_roundtrip() {
        let db = OfflineDb::open_in_memory();
        assert!(menu_cache(&db, "rest-1").unwrap().is_none());

        cache_menu(&db, "rest-1", &sample_snapshot()).unwrap();
        let entry = menu_cache(&db, "rest-1").unwrap().expect("cached entry");
        assert_eq!(entry.snapshot, sample_snapshot());
        assert!(entry.version.is_some());

        // One row per restaurant: overwriting replaces, never accumulates.
        let mut changed = sample_snapshot();
        changed.items[1].available = true;
        cache_menu(&db, "rest-1", &changed).unwrap();
        let entry = menu_cache(&db, "rest-1").unwrap().unwrap();
        assert!(entry.snapshot.items[1].available);

        let conn = db.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM menu_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_unchanged_snapshot_skips_write() {
        let db = OfflineDb::open_in_memory();
        cache_menu(&db, "rest-1", &sample_snapshot()).unwrap();
        let first = menu_cache(&db, "rest-1").unwrap().unwrap();
        cache_menu(&db, "rest-1", &sample_snapshot()).unwrap();
        let second = menu_cache(&db, "rest-1").unwrap().unwrap();
        assert_eq!(first.cached_at, second.cached_at);
    }

    #[tokio::test]
    async fn test_load_menu_prefers_remote_and_caches() {
        let db = OfflineDb::open_in_memory();
        let backend = MockBackend::new();
        *backend.menu.lock().unwrap() = Some(sample_snapshot());

        let snapshot = load_menu(&db, &backend, "rest-1").await.unwrap();
        assert_eq!(snapshot, sample_snapshot());
        assert!(menu_cache(&db, "rest-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_menu_falls_back_to_cache_when_offline() {
        let db = OfflineDb::open_in_memory();
        let backend = MockBackend::new();
        *backend.menu.lock().unwrap() = Some(sample_snapshot());
        load_menu(&db, &backend, "rest-1").await.unwrap();

        backend.online.store(false, Ordering::SeqCst);
        let snapshot = load_menu(&db, &backend, "rest-1").await.unwrap();
        assert_eq!(snapshot, sample_snapshot());
    }

    #[tokio::test]
    async fn test_load_menu_offline_without_cache_errors() {
        let db = OfflineDb::open_in_memory();
        let backend = MockBackend::new();
        backend.online.store(false, Ordering::SeqCst);
        assert!(matches!(
            load_menu(&db, &backend, "rest-1").await,
            Err(SyncError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_load_menu_rejection_does_not_fall_back() {
        let db = OfflineDb::open_in_memory();
        let backend = MockBackend::new();
        *backend.menu.lock().unwrap() = Some(sample_snapshot());
        load_menu(&db, &backend, "rest-1").await.unwrap();

        backend.push_failure(SyncError::Rejected("restaurant suspended".to_string()));
        assert!(matches!(
            load_menu(&db, &backend, "rest-1").await,
            Err(SyncError::Rejected(_))
        ));
    }
}
