//! Connectivity monitor
//!
//! Single source of truth for "are we online". The effective state is the
//! platform signal combined with the persisted offline-mode override: the
//! device is online only when the platform says so and the override is off.
//! Every effective transition is broadcast exactly once.

use mirror_store::{DeviceFlag, MirrorStore, StoreResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    BecameOnline,
    BecameOffline,
}

#[derive(Debug)]
struct Signals {
    platform_online: bool,
    offline_mode: bool,
    effective: ConnectivityState,
}

impl Signals {
    fn resolve(&self) -> ConnectivityState {
        if self.platform_online && !self.offline_mode {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

/// Passive observer of connectivity; it never probes the network.
pub struct ConnectivityMonitor {
    store: Arc<MirrorStore>,
    signals: Mutex<Signals>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    /// Build the monitor from the platform's initial signal and the
    /// persisted override. An unreadable override counts as unset.
    pub async fn new(store: Arc<MirrorStore>, platform_online: bool) -> Self {
        let offline_mode = match store.flag(DeviceFlag::OfflineMode).await {
            Ok(value) => value.as_deref() == Some("true"),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read offline mode flag, assuming unset");
                false
            }
        };

        let mut signals = Signals {
            platform_online,
            offline_mode,
            effective: ConnectivityState::Offline,
        };
        signals.effective = signals.resolve();

        tracing::info!(
            platform_online,
            offline_mode,
            state = ?signals.effective,
            "Connectivity monitor started"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            signals: Mutex::new(signals),
            events,
        }
    }

    pub fn current_state(&self) -> ConnectivityState {
        self.signals.lock().effective
    }

    pub fn is_online(&self) -> bool {
        self.current_state() == ConnectivityState::Online
    }

    /// Whether the persisted offline-mode override is set
    pub fn offline_mode(&self) -> bool {
        self.signals.lock().offline_mode
    }

    /// Listen for transitions. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Feed the platform's online/offline signal.
    ///
    /// Returns the event emitted, if the effective state changed.
    pub fn report_platform_signal(&self, online: bool) -> Option<ConnectivityEvent> {
        self.apply(|signals| signals.platform_online = online)
    }

    /// Persist and apply the offline-mode override
    pub async fn set_offline_mode(&self, enabled: bool) -> StoreResult<Option<ConnectivityEvent>> {
        if enabled {
            self.store.set_flag(DeviceFlag::OfflineMode, "true").await?;
        } else {
            self.store.clear_flag(DeviceFlag::OfflineMode).await?;
        }
        Ok(self.apply(|signals| signals.offline_mode = enabled))
    }

    fn apply(&self, update: impl FnOnce(&mut Signals)) -> Option<ConnectivityEvent> {
        let mut signals = self.signals.lock();
        update(&mut signals);

        let next = signals.resolve();
        if next == signals.effective {
            return None;
        }
        signals.effective = next;

        let event = match next {
            ConnectivityState::Online => ConnectivityEvent::BecameOnline,
            ConnectivityState::Offline => ConnectivityEvent::BecameOffline,
        };

        // Sent under the lock so listeners see events in transition order.
        // No receivers is not an error.
        let receivers = self.events.send(event).unwrap_or(0);
        tracing::info!(event = ?event, receivers, "Connectivity changed");

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_store::StoreConfig;
    use tempfile::NamedTempFile;

    async fn create_test_store() -> (Arc<MirrorStore>, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let config = StoreConfig {
            db_path: temp_file.path().to_str().unwrap().to_string(),
            max_connections: 2,
            enable_wal: true,
        };
        (Arc::new(MirrorStore::open(config).await.unwrap()), temp_file)
    }

    #[tokio::test]
    async fn test_emits_once_per_transition() {
        let (store, _file) = create_test_store().await;
        let monitor = ConnectivityMonitor::new(store, false).await;
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.report_platform_signal(true), Some(ConnectivityEvent::BecameOnline));
        assert_eq!(monitor.report_platform_signal(true), None);
        assert_eq!(monitor.report_platform_signal(false), Some(ConnectivityEvent::BecameOffline));
        assert_eq!(monitor.report_platform_signal(false), None);

        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::BecameOnline);
        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::BecameOffline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_mode_overrides_platform_signal() {
        let (store, _file) = create_test_store().await;
        let monitor = ConnectivityMonitor::new(store, true).await;
        assert!(monitor.is_online());

        let event = monitor.set_offline_mode(true).await.unwrap();
        assert_eq!(event, Some(ConnectivityEvent::BecameOffline));

        // Connectivity flickering back does not leave offline mode
        assert_eq!(monitor.report_platform_signal(false), None);
        assert_eq!(monitor.report_platform_signal(true), None);
        assert_eq!(monitor.current_state(), ConnectivityState::Offline);

        let event = monitor.set_offline_mode(false).await.unwrap();
        assert_eq!(event, Some(ConnectivityEvent::BecameOnline));
    }

    #[tokio::test]
    async fn test_offline_mode_is_persisted() {
        let (store, _file) = create_test_store().await;

        let monitor = ConnectivityMonitor::new(Arc::clone(&store), true).await;
        monitor.set_offline_mode(true).await.unwrap();
        drop(monitor);

        let restarted = ConnectivityMonitor::new(store, true).await;
        assert!(restarted.offline_mode());
        assert_eq!(restarted.current_state(), ConnectivityState::Offline);
    }
}
