//! Dial and request configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Produces the auth token presented during authentication.
pub type TokenGetter = Arc<dyn Fn() -> Result<String> + Send + Sync>;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_WRITE_QUEUE_SIZE: usize = 16;
const DEFAULT_READ_QUEUE_SIZE: usize = 16;
const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
const DEFAULT_MIN_GZIP_SIZE: usize = 1024;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for dialing and running a connection.
///
/// Setters follow the builder pattern and ignore zero values, so chaining
/// never downgrades a default to something unusable.
#[derive(Clone)]
pub struct DialOptions {
    pub token_getter: Option<TokenGetter>,
    pub dial_timeout: Duration,
    pub auth_timeout: Duration,
    /// Heartbeat interval; zero disables keepalive.
    pub keepalive: Duration,
    pub keepalive_timeout: Duration,
    pub write_queue_size: usize,
    pub read_queue_size: usize,
    pub read_buffer_size: usize,
    pub min_gzip_size: usize,
    /// Give up after this many consecutive reconnect attempts; zero retries
    /// until the session expires.
    pub max_reconnect: u32,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            token_getter: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
            read_queue_size: DEFAULT_READ_QUEUE_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            min_gzip_size: DEFAULT_MIN_GZIP_SIZE,
            max_reconnect: 0,
        }
    }
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token_getter(mut self, getter: TokenGetter) -> Self {
        self.token_getter = Some(getter);
        self
    }

    pub fn with_dial_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.dial_timeout = d;
        }
        self
    }

    pub fn with_auth_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.auth_timeout = d;
        }
        self
    }

    /// Set the heartbeat interval. Unlike the other setters, zero is
    /// meaningful here: it disables keepalive entirely.
    pub fn with_keepalive(mut self, d: Duration) -> Self {
        self.keepalive = d;
        self
    }

    pub fn with_keepalive_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.keepalive_timeout = d;
        }
        self
    }

    pub fn with_write_queue_size(mut self, n: usize) -> Self {
        if n > 0 {
            self.write_queue_size = n;
        }
        self
    }

    pub fn with_read_queue_size(mut self, n: usize) -> Self {
        if n > 0 {
            self.read_queue_size = n;
        }
        self
    }

    /// Read buffer size in bytes.
    pub fn with_read_buffer_size(mut self, n: usize) -> Self {
        if n > 0 {
            self.read_buffer_size = n;
        }
        self
    }

    pub fn with_min_gzip_size(mut self, n: usize) -> Self {
        if n > 0 {
            self.min_gzip_size = n;
        }
        self
    }

    pub fn with_max_reconnect(mut self, n: u32) -> Self {
        if n > 0 {
            self.max_reconnect = n;
        }
        self
    }
}

/// Per-request configuration.
#[derive(Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    /// Extra metadata pairs applied to the request packet (v2 only on the
    /// wire; silently unused under v1).
    pub metadata: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
            metadata: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        if !d.is_zero() {
            self.timeout = d;
        }
        self
    }

    pub fn with_metadata(mut self, key: &str, val: &str) -> Self {
        self.metadata.push((key.to_owned(), val.to_owned()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = DialOptions::default();
        assert_eq!(opts.dial_timeout, Duration::from_secs(5));
        assert_eq!(opts.auth_timeout, Duration::from_secs(10));
        assert_eq!(opts.keepalive, Duration::from_secs(60));
        assert_eq!(opts.keepalive_timeout, Duration::from_secs(120));
        assert_eq!(opts.write_queue_size, 16);
        assert_eq!(opts.read_queue_size, 16);
        assert_eq!(opts.read_buffer_size, 4096);
        assert_eq!(opts.min_gzip_size, 1024);
        assert_eq!(opts.max_reconnect, 0);
        assert!(opts.token_getter.is_none());
    }

    #[test]
    fn test_zero_values_keep_defaults() {
        let opts = DialOptions::new()
            .with_dial_timeout(Duration::ZERO)
            .with_write_queue_size(0)
            .with_max_reconnect(0);

        assert_eq!(opts.dial_timeout, Duration::from_secs(5));
        assert_eq!(opts.write_queue_size, 16);
        assert_eq!(opts.max_reconnect, 0);
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let opts = DialOptions::new().with_keepalive(Duration::ZERO);
        assert!(opts.keepalive.is_zero());
    }

    #[test]
    fn test_request_options() {
        let opts = RequestOptions::new()
            .with_timeout(Duration::from_secs(3))
            .with_metadata("trace", "t1");

        assert_eq!(opts.timeout, Duration::from_secs(3));
        assert_eq!(opts.metadata, vec![("trace".to_owned(), "t1".to_owned())]);
    }
}
