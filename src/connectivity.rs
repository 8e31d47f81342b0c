//! Connectivity monitor: one probe loop for any number of consumers.
//!
//! A single `ConnectivityMonitor` owns the online/offline truth for the whole
//! process. Consumers subscribe for edge-triggered events; the background
//! heartbeat starts with the first subscriber and stops when the last one
//! drops. Link-layer hints (`nudge`) only schedule a probe — reachability is
//! decided by an actual liveness request against the dashboard, because a
//! connected interface says nothing about whether the server can be reached.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::RemoteBackend;

/// Edge-triggered connectivity transition. `Online` carries how long the
/// monitor had been offline, so consumers can decide whether cached state
/// needs refreshing after the outage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online { offline_for: Option<Duration> },
    Offline,
}

struct MonitorShared {
    online: AtomicBool,
    offline_since: Mutex<Option<Instant>>,
    last_transition_at: Mutex<Option<DateTime<Utc>>>,
    subscribers: AtomicUsize,
    events: broadcast::Sender<ConnectivityEvent>,
    probe_nudge: Notify,
    heartbeat: Mutex<Option<CancellationToken>>,
}

/// Process-wide online/offline source of truth.
///
/// Constructed once at the composition root and shared via `Arc`; never a
/// module-level global.
pub struct ConnectivityMonitor {
    shared: Arc<MonitorShared>,
    backend: Arc<dyn RemoteBackend>,
    heartbeat_interval: Duration,
    liveness_timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        heartbeat_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(MonitorShared {
                // Optimistic until the first probe says otherwise
                online: AtomicBool::new(true),
                offline_since: Mutex::new(None),
                last_transition_at: Mutex::new(None),
                subscribers: AtomicUsize::new(0),
                events,
                probe_nudge: Notify::new(),
                heartbeat: Mutex::new(None),
            }),
            backend,
            heartbeat_interval,
            liveness_timeout,
        }
    }

    /// Current state. Synchronous, never probes.
    pub fn snapshot(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    /// When the state last flipped, if it ever has.
    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        *self
            .shared
            .last_transition_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register for edge-triggered notifications. The first subscription
    /// lazily starts the heartbeat; dropping the last one stops it.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let receiver = self.shared.events.subscribe();
        let prev = self.shared.subscribers.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            self.start_heartbeat();
        }
        ConnectivitySubscription {
            shared: self.shared.clone(),
            receiver,
        }
    }

    /// Platform hint that the link state may have changed (OS network event,
    /// window regained focus). Schedules an immediate probe; the hint alone
    /// never flips the state.
    pub fn nudge(&self) {
        self.shared.probe_nudge.notify_one();
    }

    fn start_heartbeat(&self) {
        let token = CancellationToken::new();
        {
            let mut guard = self
                .shared
                .heartbeat
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *guard = Some(token.clone());
        }

        let shared = self.shared.clone();
        let backend = self.backend.clone();
        let interval = self.heartbeat_interval;
        let timeout = self.liveness_timeout;

        tokio::spawn(async move {
            debug!(interval_secs = interval.as_secs(), "heartbeat started");
            // Probe right away so the first subscriber gets fresh state
            probe_once(&shared, backend.as_ref(), timeout).await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = shared.probe_nudge.notified() => {}
                }
                probe_once(&shared, backend.as_ref(), timeout).await;
            }
            debug!("heartbeat stopped");
        });
    }

    #[cfg(test)]
    pub(crate) fn heartbeat_active(&self) -> bool {
        self.shared
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Run one liveness probe and fold the result into the shared state.
/// Never fails; a probe error or timeout simply reads as offline.
async fn probe_once(shared: &MonitorShared, backend: &dyn RemoteBackend, timeout: Duration) {
    let online = tokio::time::timeout(timeout, backend.liveness_check())
        .await
        .unwrap_or(false);
    apply_probe(shared, online);
}

/// Edge-triggered state fold: listeners hear about transitions, not about
/// every probe.
fn apply_probe(shared: &MonitorShared, now_online: bool) {
    let was_online = shared.online.swap(now_online, Ordering::SeqCst);
    if was_online == now_online {
        return;
    }

    {
        let mut guard = shared
            .last_transition_at
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Utc::now());
    }

    if now_online {
        let offline_for = shared
            .offline_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|since| since.elapsed());
        info!(?offline_for, "connectivity restored");
        let _ = shared.events.send(ConnectivityEvent::Online { offline_for });
    } else {
        let mut guard = shared
            .offline_since
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Instant::now());
        info!("connectivity lost");
        let _ = shared.events.send(ConnectivityEvent::Offline);
    }
}

/// Live subscription to connectivity edges. Dropping it releases the
/// subscriber slot; the heartbeat stops when the last slot is released.
pub struct ConnectivitySubscription {
    shared: Arc<MonitorShared>,
    receiver: broadcast::Receiver<ConnectivityEvent>,
}

impl ConnectivitySubscription {
    /// Next transition. Lagged slots are skipped (only edges matter, and a
    /// consumer that fell behind still sees the latest one). Returns `None`
    /// once the monitor is gone.
    pub async fn next_event(&mut self) -> Option<ConnectivityEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ConnectivitySubscription {
    fn drop(&mut self) {
        let prev = self.shared.subscribers.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            let mut guard = self
                .shared
                .heartbeat
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(token) = guard.take() {
                token.cancel();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::MockBackend;
    use std::time::Duration;
    use tokio::time::timeout;

    const EVENT_WAIT: Duration = Duration::from_secs(2);

    fn monitor_with(backend: Arc<MockBackend>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            backend,
            Duration::from_secs(3600), // ticks never fire in tests; probes come from nudges
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_offline_probe_fires_single_edge_event() {
        let backend = Arc::new(MockBackend::online());
        let monitor = monitor_with(backend.clone());
        let mut sub = monitor.subscribe();

        assert!(monitor.snapshot());

        backend.set_online(false);
        monitor.nudge();

        let event = timeout(EVENT_WAIT, sub.next_event())
            .await
            .expect("event within wait window")
            .unwrap();
        assert_eq!(event, ConnectivityEvent::Offline);
        assert!(!monitor.snapshot());
        assert!(monitor.last_transition_at().is_some());

        // Still offline: further probes must not emit another edge
        monitor.nudge();
        monitor.nudge();
        let extra = timeout(Duration::from_millis(300), sub.next_event()).await;
        assert!(extra.is_err(), "no duplicate Offline event expected");
    }

    #[tokio::test]
    async fn test_online_edge_reports_offline_duration() {
        let backend = Arc::new(MockBackend::offline());
        let monitor = monitor_with(backend.clone());
        let mut sub = monitor.subscribe();

        // Initial probe flips the optimistic start state to offline
        let event = timeout(EVENT_WAIT, sub.next_event()).await.unwrap().unwrap();
        assert_eq!(event, ConnectivityEvent::Offline);

        backend.set_online(true);
        monitor.nudge();
        let event = timeout(EVENT_WAIT, sub.next_event()).await.unwrap().unwrap();
        match event {
            ConnectivityEvent::Online { offline_for } => {
                assert!(offline_for.is_some(), "offline duration should be tracked");
            }
            other => panic!("expected Online edge, got {other:?}"),
        }
        assert!(monitor.snapshot());
    }

    #[tokio::test]
    async fn test_hung_probe_times_out_as_offline() {
        let backend = Arc::new(MockBackend::online());
        backend.hang_liveness.store(true, Ordering::SeqCst);
        let monitor = monitor_with(backend.clone());
        let mut sub = monitor.subscribe();

        // The initial probe hangs; the 100ms bound degrades state to offline.
        let event = timeout(EVENT_WAIT, sub.next_event()).await.unwrap().unwrap();
        assert_eq!(event, ConnectivityEvent::Offline);
        assert!(!monitor.snapshot());
    }

    #[tokio::test]
    async fn test_heartbeat_runs_while_any_subscriber_remains() {
        let backend = Arc::new(MockBackend::online());
        let monitor = monitor_with(backend);

        assert!(!monitor.heartbeat_active());

        let first = monitor.subscribe();
        let second = monitor.subscribe();
        assert!(monitor.heartbeat_active());

        drop(first);
        assert!(monitor.heartbeat_active());

        drop(second);
        assert!(!monitor.heartbeat_active());

        // A fresh subscriber restarts it
        let _third = monitor.subscribe();
        assert!(monitor.heartbeat_active());
    }
}
