//! Configuration surfaces for the client and server. Construction is
//! purely programmatic: there is no file or environment-based loader,
//! matching the "no persisted state, no filesystem surface" external
//! interface.

use std::time::Duration;

/// 512 KiB, the default max initial read watermark for Memcached values.
pub const DEFAULT_MAX_INITIAL_READ: usize = 512 * 1024;

/// Default bound on the client's outstanding response-descriptor queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum number of outstanding reply-expecting requests.
    pub queue_capacity: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Initial capacity reserved for the read buffer.
    pub initial_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_timeout: None,
            write_timeout: None,
            initial_buffer_size: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Maximum bytes the server will buffer for a single command's value
    /// body before treating it as fatal.
    pub max_initial_read: usize,
    pub enable_gat: bool,
    pub enable_cas: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            max_initial_read: DEFAULT_MAX_INITIAL_READ,
            enable_gat: true,
            enable_cas: true,
        }
    }
}
