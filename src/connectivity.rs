//! Connectivity monitoring
//!
//! "Online" means the link layer is up and, when a probe is configured, the
//! remote API answered the last reachability check. Changes are published
//! on a `watch` channel; the service loop triggers a sync on each
//! offline → online edge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ConnectivityConfig;
use crate::remote::ReachabilityProbe;

pub struct ConnectivityMonitor {
    link_up: AtomicBool,
    state: watch::Sender<bool>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    last_checked: Mutex<Option<Instant>>,
    stale_after: Duration,
}

impl ConnectivityMonitor {
    pub fn new(config: &ConnectivityConfig, probe: Option<Arc<dyn ReachabilityProbe>>) -> Self {
        let initial = config.assume_online_at_start;
        let (state, _) = watch::channel(initial);
        Self {
            link_up: AtomicBool::new(initial),
            state,
            probe: if config.probe_enabled { probe } else { None },
            last_checked: Mutex::new(None),
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn publish(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    /// Link-layer signal from the platform; returns whether the state changed.
    ///
    /// Link-up is trusted until the next [`recheck`](Self::recheck) refines it.
    pub fn set_link_online(&self, up: bool) -> bool {
        self.link_up.store(up, Ordering::SeqCst);
        self.publish(up)
    }

    /// Probe the remote API and publish the combined state
    pub async fn recheck(&self) -> bool {
        let link = self.link_up.load(Ordering::SeqCst);
        let reachable = match (&self.probe, link) {
            (_, false) => false,
            (None, true) => true,
            (Some(probe), true) => probe.probe().await,
        };
        if let Ok(mut last) = self.last_checked.lock() {
            *last = Some(Instant::now());
        }
        debug!(link, reachable, "Reachability rechecked");
        self.publish(link && reachable);
        self.is_online()
    }

    /// Whether the last reachability check is too old to trust
    pub fn is_stale(&self) -> bool {
        match self.last_checked.lock() {
            Ok(last) => last.map_or(true, |at| at.elapsed() >= self.stale_after),
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedProbe(bool);

    #[async_trait]
    impl ReachabilityProbe for FixedProbe {
        async fn probe(&self) -> bool {
            self.0
        }
    }

    fn config(assume_online: bool) -> ConnectivityConfig {
        ConnectivityConfig {
            probe_enabled: true,
            stale_after_secs: 60,
            assume_online_at_start: assume_online,
        }
    }

    #[tokio::test]
    async fn test_link_changes_are_published() {
        let monitor = ConnectivityMonitor::new(&config(false), None);
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_online());

        assert!(monitor.set_link_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        assert!(!monitor.set_link_online(true));
        assert!(monitor.set_link_online(false));
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_unreachable_remote_means_offline() {
        let monitor = ConnectivityMonitor::new(&config(true), Some(Arc::new(FixedProbe(false))));
        assert!(monitor.is_stale());
        assert!(!monitor.recheck().await);
        assert!(!monitor.is_online());
        assert!(!monitor.is_stale());
    }

    #[tokio::test]
    async fn test_recheck_without_link_skips_probe() {
        let monitor = ConnectivityMonitor::new(&config(true), Some(Arc::new(FixedProbe(true))));
        monitor.set_link_online(false);
        assert!(!monitor.recheck().await);
        monitor.set_link_online(true);
        assert!(monitor.recheck().await);
    }
}
