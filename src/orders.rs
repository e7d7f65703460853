//! Offline order records.
//!
//! Orders created while disconnected (or optimistically while online) are
//! inserted here with `synced = 0` and a matching sync queue entry, in one
//! transaction. The sync engine is the only writer of `synced`,
//! `sync_attempts`, and `server_id`; everything else belongs to the caller.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::db::OfflineDb;
use crate::error::SyncError;
use crate::ids;
use crate::sync::{self, SyncAction};

/// How the order leaves the restaurant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryType {
    Delivery,
    Pickup,
    DineIn,
}

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Delivery => "delivery",
            DeliveryType::Pickup => "pickup",
            DeliveryType::DineIn => "dine-in",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "delivery" => Some(DeliveryType::Delivery),
            "pickup" => Some(DeliveryType::Pickup),
            "dine-in" => Some(DeliveryType::DineIn),
            _ => None,
        }
    }
}

/// Structured delivery address, stored as a JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    pub street: String,
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// A priced line on an order. `line_total` is always
/// `quantity * unit_price`, computed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub item_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub line_total: f64,
}

/// Caller input for one order line.
#[derive(Debug, Clone)]
pub struct OrderItemDraft {
    pub item_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
}

/// Caller input for creating an order while offline.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub restaurant_id: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub items: Vec<OrderItemDraft>,
    pub delivery_fee: f64,
    pub service_fee: f64,
    pub discount: f64,
    pub delivery_type: DeliveryType,
    pub payment_method: Option<String>,
    pub delivery_address: Option<DeliveryAddress>,
}

/// An order persisted in the offline store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineOrder {
    pub id: String,
    pub order_number: String,
    pub server_id: Option<String>,
    pub restaurant_id: String,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub delivery_fee: f64,
    pub service_fee: f64,
    pub discount: f64,
    pub total: f64,
    pub delivery_type: DeliveryType,
    pub payment_method: Option<String>,
    pub delivery_address: Option<DeliveryAddress>,
    pub status: String,
    pub synced: bool,
    pub sync_attempts: u32,
    pub created_at: String,
    pub synced_at: Option<String>,
}

/// Round to cent precision. All money math goes through this so float noise
/// never breaks the total invariant.
pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn validate_draft(draft: &OrderDraft) -> Result<(), SyncError> {
    if draft.restaurant_id.trim().is_empty() {
        return Err(SyncError::Invalid("missing restaurant id".into()));
    }
    if draft.items.is_empty() {
        return Err(SyncError::Invalid("order has no items".into()));
    }
    for item in &draft.items {
        if item.quantity == 0 {
            return Err(SyncError::Invalid(format!(
                "item {} has zero quantity",
                item.item_id
            )));
        }
        if item.unit_price < 0.0 {
            return Err(SyncError::Invalid(format!(
                "item {} has a negative unit price",
                item.item_id
            )));
        }
    }
    if draft.delivery_fee < 0.0 || draft.service_fee < 0.0 || draft.discount < 0.0 {
        return Err(SyncError::Invalid("negative fee or discount".into()));
    }
    if draft.delivery_address.is_none() && draft.delivery_type == DeliveryType::Delivery {
        return Err(SyncError::Invalid(
            "delivery order without a delivery address".into(),
        ));
    }
    Ok(())
}

/// Create an order locally: insert into `offline_orders` and enqueue it for
/// sync in one transaction.
///
/// Line totals, subtotal, and total are computed here, so
/// `total = subtotal + delivery_fee + service_fee - discount` holds for
/// every stored order. The order's local id doubles as the idempotency key
/// for its remote submission.
pub fn create_offline_order(db: &OfflineDb, draft: &OrderDraft) -> Result<OfflineOrder, SyncError> {
    validate_draft(draft)?;

    let items: Vec<OrderItem> = draft
        .items
        .iter()
        .map(|i| OrderItem {
            item_id: i.item_id.clone(),
            name: i.name.clone(),
            quantity: i.quantity,
            unit_price: i.unit_price,
            line_total: round_cents(f64::from(i.quantity) * i.unit_price),
        })
        .collect();

    let subtotal = round_cents(items.iter().map(|i| i.line_total).sum());
    let total = round_cents(subtotal + draft.delivery_fee + draft.service_fee - draft.discount);
    if total < 0.0 {
        return Err(SyncError::Invalid(format!(
            "discount {:.2} exceeds order value",
            draft.discount
        )));
    }

    let order = OfflineOrder {
        id: ids::offline_id(),
        order_number: ids::offline_order_number(),
        server_id: None,
        restaurant_id: draft.restaurant_id.clone(),
        customer_name: draft.customer_name.clone(),
        customer_phone: draft.customer_phone.clone(),
        items,
        subtotal,
        delivery_fee: round_cents(draft.delivery_fee),
        service_fee: round_cents(draft.service_fee),
        discount: round_cents(draft.discount),
        total,
        delivery_type: draft.delivery_type,
        payment_method: draft.payment_method.clone(),
        delivery_address: draft.delivery_address.clone(),
        status: "pending".to_string(),
        synced: false,
        sync_attempts: 0,
        created_at: Utc::now().to_rfc3339(),
        synced_at: None,
    };

    let items_json = serde_json::to_string(&order.items)
        .map_err(|e| SyncError::Storage(format!("serialize items: {e}")))?;
    let address_json = order
        .delivery_address
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| SyncError::Storage(format!("serialize address: {e}")))?;
    let payload = serde_json::to_value(&order)
        .map_err(|e| SyncError::Storage(format!("serialize order payload: {e}")))?;

    let conn = db.lock()?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SyncError::Storage(format!("begin order tx: {e}")))?;

    tx.execute(
        "INSERT INTO offline_orders (
            id, order_number, restaurant_id, customer_name, customer_phone,
            items, subtotal, delivery_fee, service_fee, discount, total,
            delivery_type, payment_method, delivery_address, status,
            synced, sync_attempts, created_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, 'pending',
            0, 0, ?15
        )",
        params![
            order.id,
            order.order_number,
            order.restaurant_id,
            order.customer_name,
            order.customer_phone,
            items_json,
            order.subtotal,
            order.delivery_fee,
            order.service_fee,
            order.discount,
            order.total,
            order.delivery_type.as_str(),
            order.payment_method,
            address_json,
            order.created_at,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("insert order: {e}")))?;

    sync::enqueue(
        &tx,
        SyncAction::CreateOrder,
        "order",
        &order.id,
        &order.restaurant_id,
        &payload,
        &order.id,
    )?;

    tx.commit()
        .map_err(|e| SyncError::Storage(format!("commit order tx: {e}")))?;
    drop(conn);

    info!(
        order_id = %order.id,
        order_number = %order.order_number,
        total = order.total,
        "Order created offline and queued for sync"
    );

    Ok(order)
}

/// Update an order's status locally and enqueue an `update_order` sync item.
///
/// The queued update waits behind the order's own `create_order` item; the
/// engine never submits it before the create has synced.
pub fn set_order_status(db: &OfflineDb, id: &str, status: &str) -> Result<(), SyncError> {
    let conn = db.lock()?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| SyncError::Storage(format!("begin status tx: {e}")))?;

    let restaurant_id: Option<String> = tx
        .query_row(
            "SELECT restaurant_id FROM offline_orders WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("query order: {e}")))?;
    let restaurant_id =
        restaurant_id.ok_or_else(|| SyncError::Invalid(format!("unknown order {id}")))?;

    tx.execute(
        "UPDATE offline_orders SET status = ?1 WHERE id = ?2",
        params![status, id],
    )
    .map_err(|e| SyncError::Storage(format!("update order status: {e}")))?;

    let key = format!("{id}:update:{}", ids::offline_id());
    sync::enqueue(
        &tx,
        SyncAction::UpdateOrder,
        "order",
        id,
        &restaurant_id,
        &json!({ "status": status }),
        &key,
    )?;

    tx.commit()
        .map_err(|e| SyncError::Storage(format!("commit status tx: {e}")))?;
    Ok(())
}

const ORDER_COLUMNS: &str = "id, order_number, server_id, restaurant_id, customer_name, \
     customer_phone, items, subtotal, delivery_fee, service_fee, discount, total, \
     delivery_type, payment_method, delivery_address, status, synced, sync_attempts, \
     created_at, synced_at";

fn order_from_row(row: &Row) -> rusqlite::Result<OfflineOrder> {
    let items_str: String = row.get(6)?;
    let items: Vec<OrderItem> = serde_json::from_str(&items_str).unwrap_or_default();
    let address_str: Option<String> = row.get(14)?;
    let delivery_address = address_str
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());
    let delivery_type_str: String = row.get(12)?;

    Ok(OfflineOrder {
        id: row.get(0)?,
        order_number: row.get(1)?,
        server_id: row.get(2)?,
        restaurant_id: row.get(3)?,
        customer_name: row.get(4)?,
        customer_phone: row.get(5)?,
        items,
        subtotal: row.get(7)?,
        delivery_fee: row.get(8)?,
        service_fee: row.get(9)?,
        discount: row.get(10)?,
        total: row.get(11)?,
        delivery_type: DeliveryType::parse(&delivery_type_str).unwrap_or(DeliveryType::DineIn),
        payment_method: row.get(13)?,
        delivery_address,
        status: row.get(15)?,
        synced: row.get::<_, i64>(16)? != 0,
        sync_attempts: row.get::<_, i64>(17)?.max(0) as u32,
        created_at: row.get(18)?,
        synced_at: row.get(19)?,
    })
}

/// Get a single order by its local id.
pub fn order_by_id(db: &OfflineDb, id: &str) -> Result<Option<OfflineOrder>, SyncError> {
    let conn = db.lock()?;
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM offline_orders WHERE id = ?1"),
        params![id],
        order_from_row,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("get order: {e}")))
}

/// All unsynced orders for a restaurant, in insertion order.
pub fn unsynced_orders(db: &OfflineDb, restaurant_id: &str) -> Result<Vec<OfflineOrder>, SyncError> {
    let conn = db.lock()?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM offline_orders
             WHERE restaurant_id = ?1 AND synced = 0
             ORDER BY created_at ASC, rowid ASC"
        ))
        .map_err(|e| SyncError::Storage(format!("prepare unsynced orders: {e}")))?;

    let rows = stmt
        .query_map(params![restaurant_id], order_from_row)
        .map_err(|e| SyncError::Storage(format!("query unsynced orders: {e}")))?;

    let mut orders = Vec::new();
    for row in rows {
        match row {
            Ok(order) => orders.push(order),
            Err(e) => warn!("skipping malformed order row: {e}"),
        }
    }
    Ok(orders)
}

/// Mark an order as synced, recording the server-assigned id.
///
/// Idempotent: marking an already-synced order again is a no-op, and an
/// already-recorded server id is never overwritten with `None`.
pub fn mark_order_synced(
    db: &OfflineDb,
    id: &str,
    server_id: Option<&str>,
) -> Result<(), SyncError> {
    let conn = db.lock()?;
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE offline_orders
             SET synced = 1,
                 synced_at = COALESCE(synced_at, ?1),
                 server_id = COALESCE(?2, server_id)
             WHERE id = ?3",
            params![now, server_id, id],
        )
        .map_err(|e| SyncError::Storage(format!("mark order synced: {e}")))?;
    if changed == 0 {
        warn!(order_id = %id, "mark_order_synced: no such order");
    }
    Ok(())
}

/// Count one submission attempt against the order. Called by the engine
/// every time it puts the order on the wire, success or not.
pub(crate) fn record_sync_attempt(db: &OfflineDb, id: &str) -> Result<(), SyncError> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE offline_orders SET sync_attempts = sync_attempts + 1 WHERE id = ?1",
        params![id],
    )
    .map_err(|e| SyncError::Storage(format!("record sync attempt: {e}")))?;
    Ok(())
}

/// Delete synced orders older than the retention window. Explicit repair
/// operation; nothing prunes automatically.
pub fn prune_synced_orders(db: &OfflineDb, retention_days: i64) -> Result<usize, SyncError> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
    let conn = db.lock()?;
    let removed = conn
        .execute(
            "DELETE FROM offline_orders WHERE synced = 1 AND created_at < ?1",
            params![cutoff],
        )
        .map_err(|e| SyncError::Storage(format!("prune orders: {e}")))?;
    if removed > 0 {
        info!(removed, retention_days, "Pruned synced orders");
    }
    Ok(removed)
}

// ===========================================================================
// Tests
// ===========================================================================
