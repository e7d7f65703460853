//! Background sync engine.
//!
//! Walks the sync queue for a restaurant and submits each pending item to
//! the remote backend, sequentially and in creation order. One failing item
//! never stops the drain, but it does block later items for the same entity
//! so an update can never overtake the create it depends on. Failed items
//! retry with bounded exponential backoff until their attempt cap, then
//! surface as `failed` for manual repair.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::RemoteBackend;
use crate::config::SyncConfig;
use crate::customers;
use crate::db::{self, OfflineDb};
use crate::error::SyncError;
use crate::notify::OrderNotifier;
use crate::orders;

/// Attempt cap written on each queue row at enqueue time.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

// ---------------------------------------------------------------------------
// Queue item model
// ---------------------------------------------------------------------------

/// What a queue item asks the remote to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    CreateOrder,
    CreateCustomer,
    UpdateOrder,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::CreateOrder => "create_order",
            SyncAction::CreateCustomer => "create_customer",
            SyncAction::UpdateOrder => "update_order",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "create_order" => Some(SyncAction::CreateOrder),
            "create_customer" => Some(SyncAction::CreateCustomer),
            "update_order" => Some(SyncAction::UpdateOrder),
            _ => None,
        }
    }
}

/// A claimed queue row, as loaded at the start of a drain pass.
#[derive(Debug, Clone)]
struct QueueItem {
    id: i64,
    action: SyncAction,
    entity_type: String,
    entity_id: String,
    payload: Value,
    idempotency_key: String,
    attempts: i64,
    max_attempts: i64,
}

/// Append a sync task for an entity.
///
/// Re-enqueueing under an existing idempotency key (a customer updated
/// before its previous sync ran) refreshes the payload and resets the retry
/// bookkeeping instead of inserting a second row. A row currently in flight
/// is left untouched.
pub(crate) fn enqueue(
    conn: &Connection,
    action: SyncAction,
    entity_type: &str,
    entity_id: &str,
    restaurant_id: &str,
    payload: &Value,
    idempotency_key: &str,
) -> Result<(), SyncError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_queue (
            action, entity_type, entity_id, restaurant_id, payload,
            idempotency_key, status, attempts, max_attempts, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?8)
        ON CONFLICT(idempotency_key) DO UPDATE SET
            payload = excluded.payload,
            status = 'pending',
            attempts = 0,
            last_error = NULL,
            next_retry_at = NULL,
            updated_at = excluded.updated_at
        WHERE sync_queue.status != 'in_flight'",
        params![
            action.as_str(),
            entity_type,
            entity_id,
            restaurant_id,
            payload.to_string(),
            idempotency_key,
            DEFAULT_MAX_ATTEMPTS,
            now,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("enqueue sync item: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

/// Shared state between the driver, the engine, and status queries.
pub struct SyncState {
    /// Claimed while a drain pass is running; guarantees at most one.
    draining: AtomicBool,
    /// Keeps the driver loop alive; cleared by `driver::stop`.
    pub(crate) running: AtomicBool,
    last_drain: Mutex<Option<String>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            draining: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_drain: Mutex::new(None),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn last_drain(&self) -> Option<String> {
        self.last_drain.lock().ok().and_then(|g| g.clone())
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the drain claim on every exit path, including early returns.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// A drain was already running; this trigger was skipped.
    pub coalesced: bool,
    /// Items submitted and acknowledged.
    pub synced: usize,
    /// Items returned to pending with a retry scheduled.
    pub requeued: usize,
    /// Items marked failed (rejection or attempt cap).
    pub failed: usize,
    /// Items skipped because an earlier item for the same entity is not
    /// synced yet.
    pub deferred: usize,
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// One full pass over the restaurant's pending queue.
///
/// Re-entrant-safe: a concurrent call while a drain is running returns a
/// `coalesced` report without touching the queue. Remote failures are
/// recorded per item and never abort the pass; storage failures do.
pub async fn drain(
    db: &OfflineDb,
    remote: &dyn RemoteBackend,
    notifier: Option<&dyn OrderNotifier>,
    state: &SyncState,
    config: &SyncConfig,
    restaurant_id: &str,
) -> Result<DrainReport, SyncError> {
    if state
        .draining
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("Drain already in progress, coalescing trigger");
        return Ok(DrainReport {
            coalesced: true,
            ..DrainReport::default()
        });
    }
    let _guard = DrainGuard(&state.draining);

    // A crash between submission and bookkeeping leaves rows in_flight.
    // Only one drain ever runs, so at this point they are all stale; the
    // idempotency key makes the resubmission safe.
    let recovered = recover_stale_in_flight(db)?;
    if recovered > 0 {
        info!(recovered, "Reset stale in-flight queue rows to pending");
    }

    let items = eligible_items(db, restaurant_id, config.batch_limit)?;
    let mut report = DrainReport::default();
    let mut blocked: HashSet<String> = HashSet::new();

    for item in items {
        if blocked.contains(&item.entity_id) || has_unsynced_predecessor(db, &item)? {
            report.deferred += 1;
            continue;
        }

        claim_item(db, item.id)?;
        if item.entity_type == "order" {
            orders::record_sync_attempt(db, &item.entity_id)?;
        }

        // Bounded wait regardless of what the backend implementation does;
        // a hung request must not stall the rest of the queue forever.
        let result =
            match tokio::time::timeout(config.request_timeout, submit_item(db, remote, &item))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!(
                    "submission exceeded {:?}",
                    config.request_timeout
                ))),
            };

        match result {
            Ok(server_id) => {
                finish_item(db, &item, server_id.as_deref())?;
                report.synced += 1;
                debug!(
                    queue_id = item.id,
                    entity_id = %item.entity_id,
                    server_id = server_id.as_deref().unwrap_or(""),
                    "Sync item applied"
                );
                if let Some(notifier) = notifier {
                    notify_best_effort(db, notifier, &item).await;
                }
            }
            Err(err @ SyncError::Storage(_)) => {
                // Durability is safety-critical; stop and surface.
                return Err(err);
            }
            Err(err) => {
                blocked.insert(item.entity_id.clone());
                let exhausted = item.attempts + 1 >= item.max_attempts;
                if err.is_retryable() && !exhausted {
                    requeue_item(db, &item, &err, config)?;
                    report.requeued += 1;
                } else {
                    fail_item(db, &item, &err)?;
                    report.failed += 1;
                    warn!(
                        queue_id = item.id,
                        entity_id = %item.entity_id,
                        attempts = item.attempts + 1,
                        error = %err,
                        "Sync item marked failed"
                    );
                }
            }
        }
    }

    let now = Utc::now().to_rfc3339();
    {
        let conn = db.lock()?;
        db::set_setting(&conn, "sync", "last_drain_at", &now)?;
    }
    if let Ok(mut guard) = state.last_drain.lock() {
        *guard = Some(now);
    }

    if report.synced > 0 || report.failed > 0 {
        info!(
            synced = report.synced,
            requeued = report.requeued,
            failed = report.failed,
            deferred = report.deferred,
            "Drain complete"
        );
    }
    Ok(report)
}

fn recover_stale_in_flight(db: &OfflineDb) -> Result<usize, SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'in_flight'",
        [],
    )
    .map_err(|e| SyncError::Storage(format!("recover in-flight rows: {e}")))
}

/// Pending rows due for submission, in creation order. Snapshot taken
/// before any network work so UI writes during the drain are unaffected.
fn eligible_items(
    db: &OfflineDb,
    restaurant_id: &str,
    limit: usize,
) -> Result<Vec<QueueItem>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, action, entity_type, entity_id, payload, idempotency_key,
                    attempts, max_attempts
             FROM sync_queue
             WHERE restaurant_id = ?1
               AND status = 'pending'
               AND attempts < max_attempts
               AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )
        .map_err(|e| SyncError::Storage(format!("prepare eligible items: {e}")))?;

    let rows = stmt
        .query_map(params![restaurant_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })
        .map_err(|e| SyncError::Storage(format!("query eligible items: {e}")))?;

    let mut items = Vec::new();
    for row in rows {
        let (id, action, entity_type, entity_id, payload, idempotency_key, attempts, max_attempts) =
            row.map_err(|e| SyncError::Storage(format!("read queue row: {e}")))?;
        let Some(action) = SyncAction::parse(&action) else {
            warn!(queue_id = id, action = %action, "Skipping queue row with unknown action");
            continue;
        };
        let payload = serde_json::from_str(&payload).unwrap_or(Value::Null);
        items.push(QueueItem {
            id,
            action,
            entity_type,
            entity_id,
            payload,
            idempotency_key,
            attempts,
            max_attempts,
        });
    }
    Ok(items)
}

/// An earlier queue row for the same entity that is still present (pending,
/// in flight, or failed) means this item must wait its turn.
fn has_unsynced_predecessor(db: &OfflineDb, item: &QueueItem) -> Result<bool, SyncError> {
    let conn = db.lock()?;
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sync_queue WHERE entity_id = ?1 AND id < ?2)",
            params![item.entity_id, item.id],
            |row| row.get(0),
        )
        .map_err(|e| SyncError::Storage(format!("predecessor check: {e}")))?;
    Ok(exists != 0)
}

fn claim_item(db: &OfflineDb, queue_id: i64) -> Result<(), SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue SET status = 'in_flight', updated_at = datetime('now') WHERE id = ?1",
        params![queue_id],
    )
    .map_err(|e| SyncError::Storage(format!("claim queue item: {e}")))?;
    Ok(())
}

/// Submit one item to the remote. Returns the server-assigned id for
/// creates, `None` for updates.
async fn submit_item(
    db: &OfflineDb,
    remote: &dyn RemoteBackend,
    item: &QueueItem,
) -> Result<Option<String>, SyncError> {
    match item.action {
        SyncAction::CreateOrder => {
            let order: orders::OfflineOrder = serde_json::from_value(item.payload.clone())
                .map_err(|e| SyncError::Rejected(format!("corrupt order payload: {e}")))?;
            let ack = remote.submit_order(&item.idempotency_key, &order).await?;
            Ok(Some(ack.server_id))
        }
        SyncAction::CreateCustomer => {
            let customer: customers::OfflineCustomer = serde_json::from_value(item.payload.clone())
                .map_err(|e| SyncError::Rejected(format!("corrupt customer payload: {e}")))?;
            let ack = remote
                .submit_customer(&item.idempotency_key, &customer)
                .await?;
            Ok(Some(ack.server_id))
        }
        SyncAction::UpdateOrder => {
            let status = item
                .payload
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    SyncError::Rejected("update payload missing status".to_string())
                })?;
            // Address by server id once the create has synced, local id
            // otherwise (the remote maps it via the idempotency key).
            let order = orders::order_by_id(db, &item.entity_id)?.ok_or_else(|| {
                SyncError::Rejected(format!("order {} no longer exists locally", item.entity_id))
            })?;
            let order_ref = order.server_id.as_deref().unwrap_or(&order.id);
            remote.update_order(order_ref, status).await?;
            Ok(None)
        }
    }
}

/// Success bookkeeping: entity marked synced, queue row removed.
fn finish_item(db: &OfflineDb, item: &QueueItem, server_id: Option<&str>) -> Result<(), SyncError> {
    match item.entity_type.as_str() {
        "order" => orders::mark_order_synced(db, &item.entity_id, server_id)?,
        "customer" => customers::mark_customer_synced(db, &item.entity_id, server_id)?,
        other => warn!(entity_type = other, "Synced item with unknown entity type"),
    }

    let conn = db.lock()?;
    conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![item.id])
        .map_err(|e| SyncError::Storage(format!("remove synced queue item: {e}")))?;
    Ok(())
}

fn requeue_item(
    db: &OfflineDb,
    item: &QueueItem,
    err: &SyncError,
    config: &SyncConfig,
) -> Result<(), SyncError> {
    let attempts = item.attempts + 1;
    let delay_ms = retry_delay_ms(attempts, config) + deterministic_jitter_ms(item.id);
    let next_retry_at = (Utc::now() + ChronoDuration::milliseconds(delay_ms)).to_rfc3339();

    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'pending',
             attempts = ?1,
             last_error = ?2,
             next_retry_at = ?3,
             updated_at = datetime('now')
         WHERE id = ?4",
        params![attempts, err.to_string(), next_retry_at, item.id],
    )
    .map_err(|e| SyncError::Storage(format!("requeue item: {e}")))?;

    debug!(
        queue_id = item.id,
        attempts,
        delay_ms,
        error = %err,
        "Sync item requeued with backoff"
    );
    Ok(())
}

fn fail_item(db: &OfflineDb, item: &QueueItem, err: &SyncError) -> Result<(), SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE sync_queue
         SET status = 'failed',
             attempts = ?1,
             last_error = ?2,
             updated_at = datetime('now')
         WHERE id = ?3",
        params![item.attempts + 1, err.to_string(), item.id],
    )
    .map_err(|e| SyncError::Storage(format!("fail item: {e}")))?;
    Ok(())
}

/// Base delay doubling per attempt, capped.
fn retry_delay_ms(attempts: i64, config: &SyncConfig) -> i64 {
    let base = config.base_retry_delay.as_millis() as i64;
    let cap = config.max_retry_delay.as_millis() as i64;
    let exp = attempts.saturating_sub(1).clamp(0, 16) as u32;
    base.saturating_mul(1_i64 << exp).min(cap)
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.abs() % 700) + 50
}

async fn notify_best_effort(db: &OfflineDb, notifier: &dyn OrderNotifier, item: &QueueItem) {
    if item.entity_type != "order" {
        return;
    }
    let order = match orders::order_by_id(db, &item.entity_id) {
        Ok(Some(order)) => order,
        _ => return,
    };
    let Some(phone) = order.customer_phone.clone() else {
        return;
    };
    if let Err(err) = notifier
        .notify_order_status(&order.id, &order.status, &phone, &order.order_number, None)
        .await
    {
        warn!(order_id = %order.id, error = %err, "Order status notification failed");
    }
}

// ---------------------------------------------------------------------------
// Status and repair
// ---------------------------------------------------------------------------

/// Queue counters surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub in_flight: i64,
    pub failed: i64,
    pub last_drain_at: Option<String>,
}

pub fn queue_stats(db: &OfflineDb, restaurant_id: &str) -> Result<QueueStats, SyncError> {
    let conn = db.lock()?;
    let count = |status: &str| -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE restaurant_id = ?1 AND status = ?2",
            params![restaurant_id, status],
            |row| row.get(0),
        )
        .unwrap_or(0)
    };

    Ok(QueueStats {
        pending: count("pending"),
        in_flight: count("in_flight"),
        failed: count("failed"),
        last_drain_at: db::get_setting(&conn, "sync", "last_drain_at"),
    })
}

/// A queue item past its attempt cap or rejected by the remote, needing
/// operator attention.
#[derive(Debug, Clone)]
pub struct FailedItem {
    pub queue_id: i64,
    pub action: String,
    pub entity_id: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
}

pub fn failed_items(db: &OfflineDb, restaurant_id: &str) -> Result<Vec<FailedItem>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(
            "SELECT id, action, entity_id, attempts, last_error, created_at
             FROM sync_queue
             WHERE restaurant_id = ?1 AND status = 'failed'
             ORDER BY created_at ASC",
        )
        .map_err(|e| SyncError::Storage(format!("prepare failed items: {e}")))?;

    let items = stmt
        .query_map(params![restaurant_id], |row| {
            Ok(FailedItem {
                queue_id: row.get(0)?,
                action: row.get(1)?,
                entity_id: row.get(2)?,
                attempts: row.get(3)?,
                last_error: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .map_err(|e| SyncError::Storage(format!("query failed items: {e}")))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(items)
}

/// Reset failed items for another round of attempts, after the operator
/// fixed whatever the remote rejected.
pub fn requeue_failed(db: &OfflineDb, queue_ids: &[i64]) -> Result<usize, SyncError> {
    if queue_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = queue_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let query = format!(
        "UPDATE sync_queue
         SET status = 'pending', attempts = 0, last_error = NULL,
             next_retry_at = NULL, updated_at = datetime('now')
         WHERE status = 'failed' AND id IN ({placeholders})"
    );
    let params_vec: Vec<&dyn rusqlite::ToSql> = queue_ids
        .iter()
        .map(|id| id as &dyn rusqlite::ToSql)
        .collect();

    let conn = db.lock()?;
    let requeued = conn
        .execute(&query, params_vec.as_slice())
        .map_err(|e| SyncError::Storage(format!("requeue failed items: {e}")))?;
    info!(requeued, "Requeued failed sync items");
    Ok(requeued)
}

/// Drop queue items that can never sync (e.g. rejected payloads the
/// operator chose to discard). The underlying entity rows are untouched.
pub fn remove_queue_items(db: &OfflineDb, queue_ids: &[i64]) -> Result<usize, SyncError> {
    if queue_ids.is_empty() {
        return Ok(0);
    }
    let placeholders = queue_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let query = format!("DELETE FROM sync_queue WHERE id IN ({placeholders})");
    let params_vec: Vec<&dyn rusqlite::ToSql> = queue_ids
        .iter()
        .map(|id| id as &dyn rusqlite::ToSql)
        .collect();

    let conn = db.lock()?;
    let removed = conn
        .execute(&query, params_vec.as_slice())
        .map_err(|e| SyncError::Storage(format!("remove queue items: {e}")))?;
    info!(removed, "Removed sync queue items");
    Ok(removed)
}

// ===========================================================================
// Tests
// ===========================================================================
