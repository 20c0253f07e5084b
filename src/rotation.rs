//! Request-count based process rotation
//!
//! Long-running site processes slowly accumulate memory. After serving a
//! randomized number of requests the host drains and exits with status 0 so
//! its supervisor starts a fresh one. The jitter keeps a fleet that started
//! together from restarting together.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::info;

pub const DEFAULT_ADDITIONAL_REQUESTS: u64 = 1000;

pub struct RotationController {
    limit: Option<u64>,
    served: AtomicU64,
    fired: AtomicBool,
    trigger: watch::Sender<bool>,
}

impl RotationController {
    /// `max_requests` of `None` or zero disables rotation
    pub fn new(max_requests: Option<u64>, additional_requests: u64) -> Self {
        let limit = max_requests
            .filter(|max| *max > 0)
            .map(|max| max + rand::thread_rng().gen_range(0..=additional_requests));
        Self::with_limit(limit)
    }

    pub fn with_limit(limit: Option<u64>) -> Self {
        if let Some(limit) = limit {
            info!(limit, "Process will rotate after serving this many requests");
        }
        let (trigger, _) = watch::channel(false);
        Self {
            limit,
            served: AtomicU64::new(0),
            fired: AtomicBool::new(false),
            trigger,
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Becomes true once the limit is reached
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.trigger.subscribe()
    }

    /// Count one completed request. Returns true for the one call that
    /// crossed the limit.
    pub fn record_completed(&self) -> bool {
        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(limit) = self.limit else {
            return false;
        };
        if served < limit || self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(served, "Request limit reached, rotating process");
        self.trigger.send_replace(true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_includes_jitter() {
        for _ in 0..50 {
            let rotation = RotationController::new(Some(100), 10);
            let limit = rotation.limit().unwrap();
            assert!((100..=110).contains(&limit));
        }
    }

    #[test]
    fn test_disabled() {
        assert_eq!(RotationController::new(None, 1000).limit(), None);
        assert_eq!(RotationController::new(Some(0), 1000).limit(), None);

        let rotation = RotationController::with_limit(None);
        for _ in 0..10 {
            assert!(!rotation.record_completed());
        }
        assert_eq!(rotation.served(), 10);
    }

    #[test]
    fn test_fires_exactly_once() {
        let rotation = RotationController::with_limit(Some(3));
        let rx = rotation.subscribe();

        assert!(!rotation.record_completed());
        assert!(!rotation.record_completed());
        assert!(!*rx.borrow());
        assert!(rotation.record_completed());
        assert!(*rx.borrow());
        assert!(!rotation.record_completed());
    }

    #[tokio::test]
    async fn test_subscriber_notified() {
        let rotation = std::sync::Arc::new(RotationController::with_limit(Some(1)));
        let mut rx = rotation.subscribe();

        let counter = rotation.clone();
        tokio::spawn(async move {
            counter.record_completed();
        });

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
