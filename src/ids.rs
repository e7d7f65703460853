//! Local identifier and order number generation.
//!
//! Records created while disconnected need primary keys that cannot collide
//! with anything else the device produces, and order numbers that staff can
//! read aloud without mistaking an unsynced order for a confirmed one.

use chrono::Utc;
use uuid::Uuid;

/// Prefix marking an order number as locally generated. Server-issued
/// numbers are plain sequential codes, so the prefix keeps the two visually
/// distinct on tickets and screens.
pub const OFFLINE_ORDER_PREFIX: &str = "OFF-";

/// Generate a local record id: millisecond timestamp plus an 8-hex-char
/// random suffix.
///
/// Unique within a single device's lifetime with overwhelming probability.
/// The id doubles as the idempotency key for the record's first remote
/// submission and is superseded by the server-assigned id once synced.
pub fn offline_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let random = Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &random[..8])
}

/// Generate a human-facing order number for a locally created order:
/// the `OFF-` prefix plus the low-order six digits of the clock.
pub fn offline_order_number() -> String {
    let millis = Utc::now().timestamp_millis();
    format!("{OFFLINE_ORDER_PREFIX}{:06}", millis % 1_000_000)
}
