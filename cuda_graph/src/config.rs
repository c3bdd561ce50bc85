//! Engine configuration

use std::time::Duration;

use crate::sentinel::SentinelLayout;

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Sentinel pointer constants used by sentinel captures.
    pub sentinel: SentinelLayout,

    /// Sleep between polls while waiting for pending event queries to drain.
    pub event_query_poll: Duration,

    /// Keep captured graphs after instantiation so they can be dumped.
    pub debug: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sentinel: SentinelLayout::default(),
            event_query_poll: Duration::from_millis(10),
            debug: false,
        }
    }
}

impl GraphConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(debug) = std::env::var("CUDA_GRAPH_DEBUG") {
            config.debug = matches!(debug.trim(), "1" | "true" | "yes" | "on");
        }

        if let Ok(ms) = std::env::var("CUDA_GRAPH_EVENT_POLL_MS") {
            if let Ok(ms) = ms.parse() {
                config.event_query_poll = Duration::from_millis(ms);
            }
        }

        config
    }
}
