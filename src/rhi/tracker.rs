// Live resource registry
//
// Every tracked resource registers on creation and unregisters from its
// drop. The registry never owns anything; it exists so a device can tell
// which resources outlived it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::error::ResourceKind;

#[derive(Debug)]
struct TrackedResource {
    kind: ResourceKind,
    label: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ResourceTracker {
    next_id: AtomicU64,
    live: Mutex<BTreeMap<u64, TrackedResource>>,
}

impl ResourceTracker {
    pub fn register(&self, kind: ResourceKind, label: Option<&str>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(
            id,
            TrackedResource {
                kind,
                label: label.map(str::to_owned),
            },
        );
        id
    }

    pub fn release(&self, id: u64) {
        self.live.lock().remove(&id);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Human-readable description of every live resource, oldest first
    pub fn outstanding(&self) -> Vec<String> {
        self.live
            .lock()
            .values()
            .map(|r| match &r.label {
                Some(label) => format!("{} '{}'", r.kind, label),
                None => r.kind.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_resources_are_not_reported() {
        let tracker = ResourceTracker::default();
        let a = tracker.register(ResourceKind::Buffer, Some("lights"));
        let b = tracker.register(ResourceKind::Texture, None);
        tracker.release(a);
        assert_eq!(tracker.live_count(), 1);
        assert_eq!(tracker.outstanding(), vec!["texture".to_string()]);
        tracker.release(b);
        assert!(tracker.outstanding().is_empty());
    }

    #[test]
    fn labels_appear_in_report() {
        let tracker = ResourceTracker::default();
        tracker.register(ResourceKind::Buffer, Some("lights"));
        assert_eq!(tracker.outstanding(), vec!["buffer 'lights'".to_string()]);
    }
}
