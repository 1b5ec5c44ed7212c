use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::AbortCause;
use crate::segment::Segment;
use crate::token::GlobalSequenceToken;

/// Per-segment observable snapshot. Error states are kept visible until the
/// package actually terminates, so a monitor can tell a crash apart from an
/// orderly shutdown even though both eventually remove the entry.
#[derive(Clone, Debug)]
pub struct TrackerStatus {
    pub segment: Segment,
    pub current_token: GlobalSequenceToken,
    pub caught_up: bool,
    pub error: Option<AbortCause>,
    pub replaying: bool,
}

impl TrackerStatus {
    pub fn initial(segment: Segment, current_token: GlobalSequenceToken) -> Self {
        TrackerStatus {
            segment,
            current_token,
            caught_up: false,
            error: None,
            replaying: false,
        }
    }

    pub fn with_position(mut self, token: GlobalSequenceToken) -> Self {
        self.current_token = token;
        self
    }

    pub fn with_error(mut self, cause: AbortCause) -> Self {
        self.error = Some(cause);
        self
    }
}

/// `segmentId -> TrackerStatus`, updated via a compare-and-publish function
/// closed over the map rather than a back-reference from the Work Package —
/// the callback is the only thing the package holds, so there is no
/// ownership cycle between worker and registry.
#[derive(Default)]
pub struct StatusRegistry {
    inner: Mutex<HashMap<u32, TrackerStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        StatusRegistry::default()
    }

    /// Applies `update` to the current status for `segment_id` (absent if
    /// there is none yet). Returning `None` from `update` removes the entry.
    pub fn update_with<F>(&self, segment_id: u32, update: F)
    where
        F: FnOnce(Option<TrackerStatus>) -> Option<TrackerStatus>,
    {
        let mut guard = self.inner.lock().expect("status registry poisoned");
        let current = guard.remove(&segment_id);
        if let Some(next) = update(current) {
            guard.insert(segment_id, next);
        }
    }

    pub fn snapshot(&self, segment_id: u32) -> Option<TrackerStatus> {
        self.inner
            .lock()
            .expect("status registry poisoned")
            .get(&segment_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<(u32, TrackerStatus)> {
        self.inner
            .lock()
            .expect("status registry poisoned")
            .iter()
            .map(|(id, status)| (*id, status.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_with_none_removes_entry() {
        let registry = StatusRegistry::new();
        let segment = Segment::new(0, 1);
        registry.update_with(0, |_| Some(TrackerStatus::initial(segment, GlobalSequenceToken::ZERO)));
        assert!(registry.snapshot(0).is_some());
        registry.update_with(0, |_| None);
        assert!(registry.snapshot(0).is_none());
    }
}
