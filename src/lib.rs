//! Offline-first order store and sync engine for the Mesa restaurant
//! platform.
//!
//! Durably buffers orders and customers created while the device cannot
//! reach the backend, then reconciles them when connectivity returns:
//! at-least-once submission with client idempotency keys, bounded
//! exponential backoff, per-entity ordering, and a single coalesced drain
//! at a time. A per-restaurant menu snapshot is cached locally as the
//! read-through fallback while offline.
//!
//! The embedding shell constructs the pieces explicitly and wires them up:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mesa_offline::{driver, HttpBackend, OfflineDb, SyncConfig, SyncState};
//!
//! # fn main() -> Result<(), mesa_offline::SyncError> {
//! mesa_offline::logging::init(None);
//! let config = SyncConfig::default();
//! let db = Arc::new(OfflineDb::init("/var/lib/mesa".as_ref())?);
//! let remote = Arc::new(HttpBackend::new(
//!     "https://api.mesa.rest",
//!     "pos-api-key",
//!     config.request_timeout,
//! )?);
//! let state = Arc::new(SyncState::new());
//!
//! let (online_tx, online_rx) = tokio::sync::watch::channel(false);
//! let _probe =
//!     driver::spawn_connectivity_probe(remote.clone(), online_tx, Duration::from_secs(15));
//! let _driver = driver::start_sync_driver(
//!     db,
//!     remote,
//!     None,
//!     state,
//!     config,
//!     "rest-1".to_string(),
//!     online_rx,
//! );
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod customers;
pub mod db;
pub mod driver;
pub mod error;
pub mod ids;
pub mod logging;
pub mod menu;
pub mod notify;
pub mod orders;
pub mod sync;

pub use api::{HttpBackend, RemoteAck, RemoteBackend};
pub use config::SyncConfig;
pub use customers::{CustomerDraft, OfflineCustomer};
pub use db::OfflineDb;
pub use error::SyncError;
pub use menu::MenuSnapshot;
pub use notify::{HttpNotifier, OrderNotifier};
pub use orders::{DeliveryType, OfflineOrder, OrderDraft, OrderItemDraft};
pub use sync::{DrainReport, QueueStats, SyncState};
