use std::collections::BTreeMap;
use std::time::Duration;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;

#[cfg(target_arch = "wasm32")]
use web_time::Instant;

use crate::node::NodeId;

/// Per-node rebuild debounce. A node rebuilt less than `window` ago is
/// deferred; its dirty flags stay set so a later frame picks it up.
#[derive(Debug, Clone, Default)]
pub struct RebuildThrottle {
    window: Duration,
    last_rebuild: BTreeMap<NodeId, Instant>,
}

impl RebuildThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_rebuild: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    pub fn should_defer(&self, node: NodeId, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.last_rebuild.get(&node) {
            Some(last) => now.saturating_duration_since(*last) < self.window,
            None => false,
        }
    }

    pub fn record(&mut self, node: NodeId, now: Instant) {
        if self.is_enabled() {
            self.last_rebuild.insert(node, now);
        }
    }

    pub fn forget(&mut self, node: NodeId) {
        self.last_rebuild.remove(&node);
    }

    /// Drops entries for nodes that no longer exist.
    pub fn retain(&mut self, mut alive: impl FnMut(NodeId) -> bool) {
        self.last_rebuild.retain(|id, _| alive(*id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_throttle_never_defers() {
        let mut throttle = RebuildThrottle::default();
        let now = Instant::now();
        throttle.record(NodeId::new(1), now);
        assert!(!throttle.should_defer(NodeId::new(1), now));
    }

    #[test]
    fn rebuilds_inside_the_window_are_deferred() {
        let mut throttle = RebuildThrottle::new(Duration::from_millis(100));
        let start = Instant::now();
        let node = NodeId::new(4);
        assert!(!throttle.should_defer(node, start));
        throttle.record(node, start);
        assert!(throttle.should_defer(node, start + Duration::from_millis(50)));
        assert!(!throttle.should_defer(node, start + Duration::from_millis(150)));
        assert!(!throttle.should_defer(NodeId::new(5), start));

        throttle.forget(node);
        assert!(!throttle.should_defer(node, start + Duration::from_millis(10)));
    }
}
