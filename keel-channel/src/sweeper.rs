//! Background sweep of expired sessions
//!
//! Lookups already refuse expired sessions; the sweep only bounds how long
//! their key material stays in memory.

use crate::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for the session sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps (default: 60 seconds)
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Spawn the sweeper; it stops when `cancel` fires
pub fn spawn_session_sweeper(
    store: Arc<dyn SessionStore>,
    config: SweeperConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_sweep_loop(store, config, cancel))
}

async fn run_sweep_loop(store: Arc<dyn SessionStore>, config: SweeperConfig, cancel: CancellationToken) {
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    info!(
        interval_secs = config.interval.as_secs(),
        "Session sweeper started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Session sweeper shutting down");
                break;
            }
            _ = ticker.tick() => {
                let removed = store.cleanup_expired();
                if removed > 0 {
                    info!(removed, remaining = store.len(), "Expired sessions removed");
                } else {
                    debug!("Session sweep: nothing expired");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemorySessionStore, SessionContext, KEY_LEN};
    use chrono::Utc;
    use zeroize::Zeroizing;

    #[test]
    fn test_default_config() {
        assert_eq!(SweeperConfig::default().interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_and_stops() {
        let store = Arc::new(InMemorySessionStore::new());
        let expired = Arc::new(SessionContext::new(
            Zeroizing::new([1u8; KEY_LEN]),
            Vec::new(),
            Utc::now() - chrono::Duration::seconds(1),
        ));
        store.store("client-a", "s1", Arc::clone(&expired));

        let cancel = CancellationToken::new();
        let handle = spawn_session_sweeper(
            store.clone(),
            SweeperConfig {
                interval: Duration::from_millis(10),
            },
            cancel.clone(),
        );

        for _ in 0..100 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.is_empty());
        assert!(expired.is_wiped());

        cancel.cancel();
        handle.await.unwrap();
    }
}
