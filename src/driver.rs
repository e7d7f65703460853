//! Connectivity-triggered sync driver.
//!
//! Watches the device's online/offline signal and a periodic timer, and
//! invokes the sync engine's drain for the active restaurant. Triggers
//! funnel into the engine's single-drain claim, so a flurry of signals
//! coalesces into one running drain. On the offline→online transition the
//! menu cache is refreshed as well.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RemoteBackend;
use crate::config::SyncConfig;
use crate::db::OfflineDb;
use crate::error::SyncError;
use crate::menu;
use crate::notify::OrderNotifier;
use crate::sync::{self, DrainReport, SyncState};

/// Start the background driver task.
///
/// `online_rx` carries the connectivity signal, fed either by the host
/// platform's own network monitoring or by [`spawn_connectivity_probe`].
/// The task runs until [`stop`] is called or the channel's sender is
/// dropped; a drain in progress always finishes its current item.
pub fn start_sync_driver(
    db: Arc<OfflineDb>,
    remote: Arc<dyn RemoteBackend>,
    notifier: Option<Arc<dyn OrderNotifier>>,
    state: Arc<SyncState>,
    config: SyncConfig,
    restaurant_id: String,
    mut online_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    state.running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!(
            restaurant_id = %restaurant_id,
            interval = ?config.drain_interval,
            "Sync driver started"
        );

        let mut ticker = tokio::time::interval(config.drain_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the loop runs
        // on the transition/interval cadence.
        ticker.tick().await;

        let mut was_online = *online_rx.borrow();
        if was_online {
            run_cycle(
                &db,
                remote.as_ref(),
                notifier.as_deref(),
                &state,
                &config,
                &restaurant_id,
                true,
            )
            .await;
        }

        loop {
            if !state.running.load(Ordering::SeqCst) {
                info!("Sync driver stopped");
                break;
            }

            tokio::select! {
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        info!("Connectivity channel closed, stopping sync driver");
                        break;
                    }
                    let online = *online_rx.borrow();
                    if online && !was_online {
                        info!("Connectivity restored, refreshing menu and draining queue");
                        run_cycle(
                            &db,
                            remote.as_ref(),
                            notifier.as_deref(),
                            &state,
                            &config,
                            &restaurant_id,
                            true,
                        )
                        .await;
                    } else if !online && was_online {
                        info!("Device offline, deferring sync and keeping queue pending");
                    }
                    was_online = online;
                }
                _ = ticker.tick() => {
                    if was_online {
                        run_cycle(
                            &db,
                            remote.as_ref(),
                            notifier.as_deref(),
                            &state,
                            &config,
                            &restaurant_id,
                            false,
                        )
                        .await;
                    } else {
                        debug!("Offline, skipping scheduled drain");
                    }
                }
            }
        }
    })
}

/// Signal the driver loop to exit after its current cycle.
pub fn stop(state: &SyncState) {
    state.running.store(false, Ordering::SeqCst);
}

/// Trigger an immediate drain, outside the driver's cadence. Coalesces like
/// any other trigger if a drain is already running.
pub async fn force_drain(
    db: &OfflineDb,
    remote: &dyn RemoteBackend,
    notifier: Option<&dyn OrderNotifier>,
    state: &SyncState,
    config: &SyncConfig,
    restaurant_id: &str,
) -> Result<DrainReport, SyncError> {
    sync::drain(db, remote, notifier, state, config, restaurant_id).await
}

async fn run_cycle(
    db: &OfflineDb,
    remote: &dyn RemoteBackend,
    notifier: Option<&dyn OrderNotifier>,
    state: &SyncState,
    config: &SyncConfig,
    restaurant_id: &str,
    refresh_menu: bool,
) {
    if refresh_menu {
        if let Err(err) = menu::refresh_menu(db, remote, restaurant_id).await {
            warn!(error = %err, "Menu refresh failed");
        }
    }

    match sync::drain(db, remote, notifier, state, config, restaurant_id).await {
        Ok(report) if report.coalesced => debug!("Drain trigger coalesced"),
        Ok(report) => {
            if report.synced > 0 {
                info!(synced = report.synced, "Background sync complete");
            }
        }
        Err(err) => warn!(error = %err, "Drain failed"),
    }
}

/// Feed the connectivity channel from periodic health checks, for hosts
/// without an OS-level online/offline signal. Stops once every receiver is
/// gone.
pub fn spawn_connectivity_probe(
    remote: Arc<dyn RemoteBackend>,
    tx: watch::Sender<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                debug!("Connectivity watchers gone, stopping probe");
                break;
            }
            let online = remote.health_check().await;
            let changed = tx.send_if_modified(|current| {
                if *current != online {
                    *current = online;
                    true
                } else {
                    false
                }
            });
            if changed {
                info!(online, "Connectivity changed");
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockBackend;
    use crate::orders::{create_offline_order, order_by_id, DeliveryType, OrderDraft, OrderItemDraft};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn order_draft() -> OrderDraft {
        OrderDraft {
            restaurant_id: "rest-1".to_string(),
            customer_name: None,
            customer_phone: None,
            items: vec![OrderItemDraft {
                item_id: "itm-espresso".to_string(),
                name: "Espresso".to_string(),
                quantity: 1,
                unit_price: 6.0,
            }],
            delivery_fee: 0.0,
            service_fee: 0.0,
            discount: 0.0,
            delivery_type: DeliveryType::DineIn,
            payment_method: None,
            delivery_address: None,
        }
    }

    /// Long interval: only connectivity transitions can trigger work.
    fn transition_only_config() -> SyncConfig {
        SyncConfig {
            drain_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reconnect_drains_and_refreshes_menu() {
        let db = Arc::new(OfflineDb::open_in_memory());
        let backend = Arc::new(MockBackend::new());
        *backend.menu.lock().unwrap() = Some(crate::menu::MenuSnapshot::default());
        let state = Arc::new(SyncState::new());

        let order = create_offline_order(&db, &order_draft()).unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = start_sync_driver(
            db.clone(),
            backend.clone(),
            None,
            state.clone(),
            transition_only_config(),
            "rest-1".to_string(),
            rx,
        );

        // Still offline: nothing submitted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.submit_calls.load(AtomicOrdering::SeqCst), 0);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(order_by_id(&db, &order.id).unwrap().unwrap().synced);
        assert!(
            crate::menu::menu_cache(&db, "rest-1").unwrap().is_some(),
            "reconnect refreshes the menu cache"
        );

        stop(&state);
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_ticks_do_not_submit() {
        let db = Arc::new(OfflineDb::open_in_memory());
        let backend = Arc::new(MockBackend::new());
        let state = Arc::new(SyncState::new());

        create_offline_order(&db, &order_draft()).unwrap();
        let (tx, rx) = watch::channel(false);

        let config = SyncConfig {
            drain_interval: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        let handle = start_sync_driver(
            db.clone(),
            backend.clone(),
            None,
            state.clone(),
            config,
            "rest-1".to_string(),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.submit_calls.load(AtomicOrdering::SeqCst), 0);

        stop(&state);
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_force_drain_coalesces_with_running_drain() {
        let db = OfflineDb::open_in_memory();
        let backend = MockBackend::new();
        let state = SyncState::new();
        let config = SyncConfig::default();

        create_offline_order(&db, &order_draft()).unwrap();
        backend.set_delay_ms(30);

        let (first, second) = tokio::join!(
            force_drain(&db, &backend, None, &state, &config, "rest-1"),
            force_drain(&db, &backend, None, &state, &config, "rest-1"),
        );
        let reports = [first.unwrap(), second.unwrap()];
        assert_eq!(reports.iter().filter(|r| r.coalesced).count(), 1);
        assert_eq!(reports.iter().map(|r| r.synced).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_probe_feeds_connectivity_channel() {
        let backend = Arc::new(MockBackend::new());
        backend.online.store(false, AtomicOrdering::SeqCst);
        let (tx, rx) = watch::channel(true);

        let handle = spawn_connectivity_probe(
            backend.clone(),
            tx,
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!*rx.borrow(), "probe observed the backend offline");

        backend.online.store(true, AtomicOrdering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(*rx.borrow(), "probe observed the backend back online");

        drop(rx);
        handle.await.unwrap();
    }
}
