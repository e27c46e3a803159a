use std::sync::Arc;
use std::time::Duration;

use pvcd_coordinator::CoordinationStore;

use crate::config::NodeConfig;

/// Monotonic time source, abstracted so reconciliation logic (grace-window
/// checks, migration timeouts) can be driven by a fake clock in tests
/// instead of sleeping in real time (spec §9: "pass an explicit context
/// object... clock... into every controller; tests substitute fakes").
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// The real clock, backed by a monotonic `Instant`.
pub struct SystemClock {
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Everything a controller needs at construction: the coordination-store
/// handle, a config snapshot, and a clock. Replaces the global
/// store-handle-and-config pattern the original agent used (spec §9).
#[derive(Clone)]
pub struct AgentContext {
    pub store: Arc<dyn CoordinationStore>,
    pub config: Arc<NodeConfig>,
    pub clock: Arc<dyn Clock>,
}

impl AgentContext {
    pub fn new(store: Arc<dyn CoordinationStore>, config: Arc<NodeConfig>, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }
}

#[cfg(test)]
pub struct FakeClock {
    now: std::sync::Mutex<Duration>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), Duration::from_secs(30));
    }
}
