/*!
 * Server Configuration
 *
 * Tunables for the listener and the reactor pool. Defaults mirror the
 * values the server has always shipped with.
 */

use anyhow::{ensure, Result};
use std::time::Duration;

/// Default number of reactor threads
pub const DEFAULT_REACTORS: usize = 5;
/// Default listen(2) backlog
pub const DEFAULT_BACKLOG: i32 = 1000;
/// Default capacity of each reactor's event batch
pub const DEFAULT_MAX_EVENTS: usize = 1024;
/// Default bounded wait; also the worst-case shutdown latency
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);
/// Default size of a single socket read
pub const DEFAULT_READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub reactors: usize,
    pub backlog: i32,
    pub max_events: usize,
    pub poll_timeout: Duration,
    pub read_chunk: usize,
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reactors: DEFAULT_REACTORS,
            backlog: DEFAULT_BACKLOG,
            max_events: DEFAULT_MAX_EVENTS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            read_chunk: DEFAULT_READ_CHUNK,
            nodelay: true,
        }
    }
}

impl ServerConfig {
    pub fn with_reactors(mut self, n: usize) -> Self {
        self.reactors = n;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.reactors > 0, "at least one reactor is required");
        ensure!(self.max_events > 0, "event batch capacity must be positive");
        ensure!(self.read_chunk > 0, "read chunk size must be positive");
        ensure!(self.backlog > 0, "listen backlog must be positive");
        Ok(())
    }
}
