//! Smart-home coordinator status machine.
//!
//! A single-valued status advances through a serialized transition function;
//! every distinct transition produces exactly one emission, in order. The
//! firmware wraps [`StatusTracker`] in a mutex and delivers the emission
//! outside the lock.

/// Coordinator status surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaStatus {
    /// No reachable server; subsystem idle.
    Offline,
    /// A sync or service call is in flight.
    Syncing,
    /// Initialized, idle between ticks.
    Ready,
    /// Last poll returned all requested entities.
    StatesSynced,
    /// Some requested entities were missing.
    PartialSync,
    /// Transport or precheck failure ended the cycle.
    SyncFailed,
}

impl HaStatus {
    pub fn text(self) -> &'static str {
        match self {
            HaStatus::Offline => "Offline",
            HaStatus::Syncing => "Syncing...",
            HaStatus::Ready => "Ready",
            HaStatus::StatesSynced => "States Synced",
            HaStatus::PartialSync => "Partial Sync",
            HaStatus::SyncFailed => "Sync Failed",
        }
    }

    pub fn is_ready(self) -> bool {
        matches!(self, HaStatus::Ready | HaStatus::StatesSynced)
    }

    pub fn is_syncing(self) -> bool {
        self == HaStatus::Syncing
    }
}

/// Distinct-transition tracker. [`StatusTracker::transition`] returns the new
/// status only when it differs from the current one, so callers emit exactly
/// one callback per change.
#[derive(Debug)]
pub struct StatusTracker {
    current: HaStatus,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            current: HaStatus::Offline,
        }
    }

    pub fn current(&self) -> HaStatus {
        self.current
    }

    pub fn transition(&mut self, next: HaStatus) -> Option<HaStatus> {
        if self.current == next {
            return None;
        }
        log::info!("HA status changed: {} -> {}", self.current.text(), next.text());
        self.current = next;
        Some(next)
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal status of a sync cycle from its found/requested counts.
pub fn sync_outcome(found: usize, requested: usize) -> HaStatus {
    if requested > 0 && found == requested {
        HaStatus::StatesSynced
    } else if found > 0 {
        HaStatus::PartialSync
    } else {
        HaStatus::SyncFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_offline() {
        assert_eq!(StatusTracker::new().current(), HaStatus::Offline);
    }

    #[test]
    fn only_distinct_transitions_emit() {
        let mut t = StatusTracker::new();
        assert_eq!(t.transition(HaStatus::Syncing), Some(HaStatus::Syncing));
        assert_eq!(t.transition(HaStatus::Syncing), None);
        assert_eq!(t.transition(HaStatus::StatesSynced), Some(HaStatus::StatesSynced));
        assert_eq!(t.current(), HaStatus::StatesSynced);
    }

    #[test]
    fn emissions_follow_transition_order() {
        let mut t = StatusTracker::new();
        let sequence = [
            HaStatus::Syncing,
            HaStatus::SyncFailed,
            HaStatus::Syncing,
            HaStatus::Syncing,
            HaStatus::PartialSync,
        ];
        let emitted: Vec<HaStatus> = sequence
            .iter()
            .filter_map(|&s| t.transition(s))
            .collect();
        assert_eq!(
            emitted,
            vec![
                HaStatus::Syncing,
                HaStatus::SyncFailed,
                HaStatus::Syncing,
                HaStatus::PartialSync
            ]
        );
    }

    #[test]
    fn outcome_mapping() {
        assert_eq!(sync_outcome(3, 3), HaStatus::StatesSynced);
        assert_eq!(sync_outcome(2, 3), HaStatus::PartialSync);
        assert_eq!(sync_outcome(0, 3), HaStatus::SyncFailed);
        assert_eq!(sync_outcome(0, 0), HaStatus::SyncFailed);
    }

    #[test]
    fn ready_and_syncing_predicates() {
        assert!(HaStatus::Ready.is_ready());
        assert!(HaStatus::StatesSynced.is_ready());
        assert!(!HaStatus::PartialSync.is_ready());
        assert!(HaStatus::Syncing.is_syncing());
        assert!(!HaStatus::Offline.is_syncing());
    }

    #[test]
    fn status_text_map() {
        assert_eq!(HaStatus::Offline.text(), "Offline");
        assert_eq!(HaStatus::Syncing.text(), "Syncing...");
        assert_eq!(HaStatus::StatesSynced.text(), "States Synced");
        assert_eq!(HaStatus::PartialSync.text(), "Partial Sync");
        assert_eq!(HaStatus::SyncFailed.text(), "Sync Failed");
    }
}
