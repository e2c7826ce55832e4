use std::time::Duration;

use crate::trace::DEFAULT_MAX_NODES;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONTENT_BYTES: usize = 4 * 1024 * 1024;

/// Per-stream limits applied by the coordinator and its assemblers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// No element within this window is treated as a transport failure.
    pub inactivity_timeout: Duration,
    pub max_thinking_nodes: usize,
    pub max_content_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_thinking_nodes: DEFAULT_MAX_NODES,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
        }
    }
}
