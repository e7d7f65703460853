//! Offline customer records.
//!
//! Customers are deduplicated by digits-normalized phone number within a
//! restaurant: creating a customer whose phone already exists updates the
//! existing row (last write wins) and re-queues it for sync instead of
//! inserting a duplicate.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::OfflineDb;
use crate::error::SyncError;
use crate::ids;
use crate::sync::{self, SyncAction};

/// A customer persisted in the offline store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineCustomer {
    pub id: String,
    pub server_id: Option<String>,
    pub restaurant_id: String,
    pub name: String,
    /// Digits-only phone, the dedup key within a restaurant.
    pub phone: String,
    pub tax_id: Option<String>,
    pub address: Option<String>,
    pub synced: bool,
    pub created_at: String,
    pub synced_at: Option<String>,
}

/// Caller input for creating a customer while offline.
#[derive(Debug, Clone)]
pub struct CustomerDraft {
    pub restaurant_id: String,
    pub name: String,
    pub phone: String,
    pub tax_id: Option<String>,
    pub address: Option<String>,
}

/// Strip a phone number down to its digits.
pub fn normalize_phone(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Create or update a customer locally and enqueue it for sync.
///
/// The normalized phone is the identity: a second create with the same
/// phone updates name/tax id/address on the existing row, resets its
/// `synced` flag, and refreshes the queued payload.
pub fn create_offline_customer(
    db: &OfflineDb,
    draft: &CustomerDraft,
) -> Result<OfflineCustomer, SyncError> {
    if draft.restaurant_id.trim().is_empty() {
        return Err(SyncError::Invalid("missing restaurant id".into()));
    }
    if draft.name.trim().is_empty() {
        return Err(SyncError::Invalid("missing customer name".into()));
    }
    let phone = normalize_phone(&draft.phone);
    if phone.is_empty() {
        return Err(SyncError::Invalid(format!(
            "phone '{}' has no digits",
            draft.phone
        )));
    }

    let conn = db.lock()?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SyncError::Storage(format!("begin customer tx: {e}")))?;

    tx.execute(
        "INSERT INTO offline_customers (
            id, restaurant_id, name, phone, tax_id, address, synced, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
        ON CONFLICT(restaurant_id, phone) DO UPDATE SET
            name = excluded.name,
            tax_id = excluded.tax_id,
            address = excluded.address,
            synced = 0,
            synced_at = NULL",
        params![
            ids::offline_id(),
            draft.restaurant_id,
            draft.name.trim(),
            phone,
            draft.tax_id,
            draft.address,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| SyncError::Storage(format!("upsert customer: {e}")))?;

    // The conflict path keeps the original row id, so read the record back
    // before enqueueing under its id.
    let customer = tx
        .query_row(
            &format!(
                "SELECT {CUSTOMER_COLUMNS} FROM offline_customers
                 WHERE restaurant_id = ?1 AND phone = ?2"
            ),
            params![draft.restaurant_id, phone],
            customer_from_row,
        )
        .map_err(|e| SyncError::Storage(format!("read back customer: {e}")))?;

    let payload = serde_json::to_value(&customer)
        .map_err(|e| SyncError::Storage(format!("serialize customer payload: {e}")))?;
    sync::enqueue(
        &tx,
        SyncAction::CreateCustomer,
        "customer",
        &customer.id,
        &customer.restaurant_id,
        &payload,
        &customer.id,
    )?;

    tx.commit()
        .map_err(|e| SyncError::Storage(format!("commit customer tx: {e}")))?;
    drop(conn);

    info!(
        customer_id = %customer.id,
        phone = %customer.phone,
        "Customer stored offline and queued for sync"
    );

    Ok(customer)
}

const CUSTOMER_COLUMNS: &str =
    "id, server_id, restaurant_id, name, phone, tax_id, address, synced, created_at, synced_at";

fn customer_from_row(row: &Row) -> rusqlite::Result<OfflineCustomer> {
    Ok(OfflineCustomer {
        id: row.get(0)?,
        server_id: row.get(1)?,
        restaurant_id: row.get(2)?,
        name: row.get(3)?,
        phone: row.get(4)?,
        tax_id: row.get(5)?,
        address: row.get(6)?,
        synced: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        synced_at: row.get(9)?,
    })
}

/// Look up a customer by phone (any formatting) within a restaurant.
pub fn customer_by_phone(
    db: &OfflineDb,
    restaurant_id: &str,
    phone: &str,
) -> Result<Option<OfflineCustomer>, SyncError> {
    let normalized = normalize_phone(phone);
    let conn = db.lock()?;
    conn.query_row(
        &format!(
            "SELECT {CUSTOMER_COLUMNS} FROM offline_customers
             WHERE restaurant_id = ?1 AND phone = ?2"
        ),
        params![restaurant_id, normalized],
        customer_from_row,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("get customer: {e}")))
}

/// All unsynced customers for a restaurant, in insertion order.
pub fn unsynced_customers(
    db: &OfflineDb,
    restaurant_id: &str,
) -> Result<Vec<OfflineCustomer>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM offline_customers
             WHERE restaurant_id = ?1 AND synced = 0
             ORDER BY created_at ASC, rowid ASC"
        ))
        .map_err(|e| SyncError::Storage(format!("prepare unsynced customers: {e}")))?;

    let rows = stmt
        .query_map(params![restaurant_id], customer_from_row)
        .map_err(|e| SyncError::Storage(format!("query unsynced customers: {e}")))?;

    let mut customers = Vec::new();
    for row in rows {
        match row {
            Ok(customer) => customers.push(customer),
            Err(e) => warn!("skipping malformed customer row: {e}"),
        }
    }
    Ok(customers)
}

/// Mark a customer as synced, recording the server-assigned id. Idempotent.
pub fn mark_customer_synced(
    db: &OfflineDb,
    id: &str,
    server_id: Option<&str>,
) -> Result<(), SyncError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE offline_customers
             SET synced = 1,
                 synced_at = COALESCE(synced_at, ?1),
                 server_id = COALESCE(?2, server_id)
             WHERE id = ?3",
            params![now, server_id, id],
        )
        .map_err(|e| SyncError::Storage(format!("mark customer synced: {e}")))?;
    if changed == 0 {
        warn!(customer_id = %id, "mark_customer_synced: no such customer");
    }
    Ok(())
}

/// Delete synced customers older than the retention window. Explicit repair
/// operation; nothing prunes automatically.
pub fn prune_synced_customers(db: &OfflineDb, retention_days: i64) -> Result<usize, SyncError> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
    let conn = db.lock()?;
    let removed = conn
        .execute(
            "DELETE FROM offline_customers WHERE synced = 1 AND created_at < ?1",
            params![cutoff],
        )
        .map_err(|e| SyncError::Storage(format!("prune customers: {e}")))?;
    if removed > 0 {
        info!(removed, retention_days, "Pruned synced customers");
    }
    Ok(removed)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str, phone: &str) -> CustomerDraft {
        CustomerDraft {
            restaurant_id: "rest-1".to_string(),
            name: name.to_string(),
            phone: phone.to_string(),
            tax_id: None,
            address: None,
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+55 (11) 98888-7777"), "5511988887777");
        assert_eq!(normalize_phone("11 3333 4444"), "1133334444");
        assert_eq!(normalize_phone("no digits"), "");
    }

    #[test]
    fn test_create_stores_normalized_phone() {
        let db = OfflineDb::open_in_memory();
        let customer =
            create_offline_customer(&db, &draft("Marina", "+55 (11) 98888-7777")).unwrap();
        assert_eq!(customer.phone, "5511988887777");

        // Lookup works with any formatting of the same number.
        let found = customer_by_phone(&db, "rest-1", "11 98888 7777");
        // Different digit count is a different number
        assert!(found.unwrap().is_none());
        let found = customer_by_phone(&db, "rest-1", "+55 11 98888-7777")
            .unwrap()
            .expect("customer by phone");
        assert_eq!(found.id, customer.id);
    }

    #[test]
    fn test_same_phone_updates_instead_of_duplicating() {
        let db = OfflineDb::open_in_memory();
        let first = create_offline_customer(&db, &draft("Marina", "5511988887777")).unwrap();
        let mut updated_draft = draft("Marina Souza", "+55 11 98888-7777");
        updated_draft.tax_id = Some("123.456.789-00".to_string());
        let second = create_offline_customer(&db, &updated_draft).unwrap();

        // Same row: the original id survives, the fields are the new ones.
        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "Marina Souza");
        assert_eq!(second.tax_id.as_deref(), Some("123.456.789-00"));

        let conn = db.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM offline_customers", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);

        // And exactly one queue entry, keyed by the surviving id.
        let queue_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE idempotency_key = ?1",
                params![first.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(queue_rows, 1);
    }

    #[test]
    fn test_update_after_sync_requeues() {
        let db = OfflineDb::open_in_memory();
        let customer = create_offline_customer(&db, &draft("Marina", "5511988887777")).unwrap();
        mark_customer_synced(&db, &customer.id, Some("srv_c1")).unwrap();
        {
            // Simulate the engine having drained the queue row.
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "DELETE FROM sync_queue WHERE entity_id = ?1",
                params![customer.id],
            )
            .unwrap();
        }

        let updated = create_offline_customer(&db, &draft("Marina S.", "5511988887777")).unwrap();
        assert!(!updated.synced, "update resets the synced flag");
        // Server id from the first sync is kept for the upsert on the remote.
        assert_eq!(updated.server_id.as_deref(), Some("srv_c1"));

        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM sync_queue WHERE entity_id = ?1",
                params![customer.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "pending");
    }

    #[test]
    fn test_validation() {
        let db = OfflineDb::open_in_memory();
        assert!(matches!(
            create_offline_customer(&db, &draft("", "5511988887777")),
            Err(SyncError::Invalid(_))
        ));
        assert!(matches!(
            create_offline_customer(&db, &draft("Marina", "no digits")),
            Err(SyncError::Invalid(_))
        ));
    }

    #[test]
    fn test_unsynced_and_prune() {
        let db = OfflineDb::open_in_memory();
        let kept = create_offline_customer(&db, &draft("Ana", "111")).unwrap();
        let pruned = create_offline_customer(&db, &draft("Bia", "222")).unwrap();
        mark_customer_synced(&db, &pruned.id, None).unwrap();

        let unsynced = unsynced_customers(&db, "rest-1").unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, kept.id);

        let stale = (Utc::now() - chrono::Duration::days(90)).to_rfc3339();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE offline_customers SET created_at = ?1",
                params![stale],
            )
            .unwrap();
        }
        let removed = prune_synced_customers(&db, 30).unwrap();
        assert_eq!(removed, 1);
        assert!(customer_by_phone(&db, "rest-1", "111").unwrap().is_some());
        assert!(customer_by_phone(&db, "rest-1", "222").unwrap().is_none());
    }
}
