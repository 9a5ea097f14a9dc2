//! Coordinator status owner: serialized transitions, callback delivered
//! outside the lock.

use std::sync::{Arc, Mutex};

use wallpanel_core::status::{HaStatus, StatusTracker};

pub type HaStatusCallback = Arc<dyn Fn(bool, bool, &str) + Send + Sync>;

struct StatusInner {
    tracker: StatusTracker,
    callback: Option<HaStatusCallback>,
}

pub struct HaStatusOwner {
    inner: Mutex<StatusInner>,
}

impl HaStatusOwner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StatusInner {
                tracker: StatusTracker::new(),
                callback: None,
            }),
        })
    }

    pub fn register_callback(&self, callback: HaStatusCallback) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.callback = Some(callback);
        log::info!("HA status callback registered");
    }

    #[allow(dead_code)]
    pub fn current(&self) -> HaStatus {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tracker
            .current()
    }

    /// Apply a transition. The callback pointer is copied under the lock and
    /// invoked after release to avoid re-entrant deadlock; distinct
    /// transitions emit exactly once, in order.
    pub fn change(&self, status: HaStatus) {
        let (emitted, callback) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            (inner.tracker.transition(status), inner.callback.clone())
        };

        if let (Some(status), Some(cb)) = (emitted, callback) {
            cb(status.is_ready(), status.is_syncing(), status.text());
        }
    }
}
