//! Warm-set tracker: the short-horizon anti-thrash memory.
//!
//! A retrieval tool marks the objects (and the tool-call id) it just
//! touched as warm; the externalizer skips warm groups so content is not
//! re-externalized the moment it was pulled back in. Entries count down
//! one per `context` turn and expire at zero.

use std::collections::HashMap;

use parking_lot::RwLock;

struct WarmInner {
    objects: HashMap<String, u32>,
    tool_calls: HashMap<String, u32>,
}

/// Countdown maps for object ids and tool-call ids.
pub struct WarmTracker {
    inner: RwLock<WarmInner>,
}

impl WarmTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(WarmInner {
                objects: HashMap::new(),
                tool_calls: HashMap::new(),
            }),
        }
    }

    /// Set each id's remaining count to `warm_turns`.
    pub fn mark_warm<I, S>(&self, ids: I, warm_turns: u32)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if warm_turns == 0 {
            return;
        }
        let mut inner = self.inner.write();
        for id in ids {
            inner.objects.insert(id.into(), warm_turns);
        }
    }

    pub fn mark_tool_call_warm(&self, id: impl Into<String>, warm_turns: u32) {
        if warm_turns == 0 {
            return;
        }
        self.inner.write().tool_calls.insert(id.into(), warm_turns);
    }

    pub fn is_warm(&self, id: &str) -> bool {
        self.inner.read().objects.get(id).is_some_and(|&n| n > 0)
    }

    pub fn is_tool_call_warm(&self, id: &str) -> bool {
        self.inner.read().tool_calls.get(id).is_some_and(|&n| n > 0)
    }

    /// Decrement all counts, dropping entries that reach zero. Called once
    /// per `context` event.
    pub fn tick(&self) {
        let mut inner = self.inner.write();
        inner.objects.retain(|_, n| {
            *n -= 1;
            *n > 0
        });
        inner.tool_calls.retain(|_, n| {
            *n -= 1;
            *n > 0
        });
    }

    pub fn warm_object_count(&self) -> usize {
        self.inner.read().objects.len()
    }
}

impl Default for WarmTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_ids_are_warm() {
        let tracker = WarmTracker::new();
        tracker.mark_warm(["rlm-obj-1", "rlm-obj-2"], 3);
        assert!(tracker.is_warm("rlm-obj-1"));
        assert!(tracker.is_warm("rlm-obj-2"));
        assert!(!tracker.is_warm("rlm-obj-3"));
    }

    #[test]
    fn entries_expire_after_warm_turns_ticks() {
        let tracker = WarmTracker::new();
        tracker.mark_warm(["rlm-obj-1"], 2);

        tracker.tick();
        assert!(tracker.is_warm("rlm-obj-1"));
        tracker.tick();
        assert!(!tracker.is_warm("rlm-obj-1"));
        assert_eq!(tracker.warm_object_count(), 0);
    }

    #[test]
    fn remarking_resets_the_countdown() {
        let tracker = WarmTracker::new();
        tracker.mark_warm(["rlm-obj-1"], 2);
        tracker.tick();
        tracker.mark_warm(["rlm-obj-1"], 2);
        tracker.tick();
        assert!(tracker.is_warm("rlm-obj-1"));
    }

    #[test]
    fn tool_call_map_is_independent() {
        let tracker = WarmTracker::new();
        tracker.mark_tool_call_warm("call-7", 1);
        assert!(tracker.is_tool_call_warm("call-7"));
        assert!(!tracker.is_warm("call-7"));

        tracker.tick();
        assert!(!tracker.is_tool_call_warm("call-7"));
    }

    #[test]
    fn zero_horizon_is_a_no_op() {
        let tracker = WarmTracker::new();
        tracker.mark_warm(["rlm-obj-1"], 0);
        assert!(!tracker.is_warm("rlm-obj-1"));
    }
}
