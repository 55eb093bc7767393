//! Shared engine and event loop.
//!
//! Servers and clients built from the same [`Hub`] dispatch on one loop, so
//! their callbacks are totally ordered with respect to each other.

// ============================================================================
// Imports
// ============================================================================

use crate::connection::Connection;
use crate::engine::{Engine, EngineConfig};
use crate::event_loop::EventLoop;

// ============================================================================
// Hub
// ============================================================================

/// An engine plus the loop its callbacks run on. Cloning shares both.
#[derive(Debug, Clone)]
pub struct Hub {
    engine: Engine<Connection>,
}

impl Hub {
    /// Creates a hub with default engine tuning.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates a hub with custom engine tuning.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(EventLoop::new(), config),
        }
    }

    /// The shared engine.
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &Engine<Connection> {
        &self.engine
    }

    /// The loop every callback runs on.
    #[inline]
    #[must_use]
    pub fn event_loop(&self) -> &EventLoop {
        self.engine.event_loop()
    }

    /// Open connections across every group on this hub.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.engine.connection_count()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn test_hub_shares_engine() {
        let hub = Hub::with_config(EngineConfig {
            close_timeout: Duration::from_secs(1),
        });
        let clone = hub.clone();

        assert_eq!(clone.engine().config().close_timeout, Duration::from_secs(1));
        assert_eq!(hub.connection_count(), 0);
        clone.event_loop().barrier().await;
    }
}
