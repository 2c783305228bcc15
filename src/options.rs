//! Server configuration.

use std::time::Duration;

use crate::MAX_MESSAGE_SIZE;

/// How long the negotiator may spend reading a request head.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a graceful close waits for the peer's Close reply.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Listen backlog passed to the kernel.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// How many handshakes may run concurrently before accepted sockets queue.
pub const DEFAULT_MAX_CONCURRENT_HANDSHAKES: usize = 32;

/// Configuration options for a [`Server`](crate::Server).
///
/// ```rust
/// use std::time::Duration;
///
/// use gale::Options;
///
/// let options = Options::default()
///     .with_max_message_size(4 * 1024 * 1024)
///     .with_close_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Ceiling on a reassembled message. Crossing it closes the connection
    /// with status 1009.
    ///
    /// Default: 16 MiB ([`MAX_MESSAGE_SIZE`]).
    pub max_message_size: usize,

    /// Ceiling on a single frame's payload. `None` uses the message
    /// ceiling, since a larger frame could never complete a valid message.
    pub max_frame_size: Option<usize>,

    /// Total budget for reading and answering the upgrade request.
    ///
    /// Default: 5 s.
    pub handshake_timeout: Duration,

    /// How long [`Connection::close`](crate::Connection::close) waits for
    /// the peer's Close reply before releasing the transport.
    ///
    /// Default: 5 s.
    pub close_timeout: Duration,

    /// Bound on concurrently running handshakes, so slow clients cannot
    /// pile up negotiation work behind the accept loop.
    ///
    /// Default: 32.
    pub max_concurrent_handshakes: usize,

    /// Listen backlog.
    ///
    /// Default: 1024.
    pub backlog: u32,

    /// Disable Nagle's algorithm on accepted sockets.
    ///
    /// Default: `true`.
    pub nodelay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            max_frame_size: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            max_concurrent_handshakes: DEFAULT_MAX_CONCURRENT_HANDSHAKES,
            backlog: DEFAULT_BACKLOG,
            nodelay: true,
        }
    }
}

impl Options {
    /// Sets the reassembled-message ceiling.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the single-frame ceiling.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Sets the handshake time budget.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the close-handshake wait ceiling.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the concurrent-handshake bound.
    pub fn with_max_concurrent_handshakes(mut self, limit: usize) -> Self {
        self.max_concurrent_handshakes = limit.max(1);
        self
    }

    /// Sets the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// The effective single-frame ceiling.
    pub(crate) fn frame_size_limit(&self) -> usize {
        self.max_frame_size.unwrap_or(self.max_message_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.max_message_size, 16 * 1024 * 1024);
        assert_eq!(options.frame_size_limit(), 16 * 1024 * 1024);
        assert_eq!(options.handshake_timeout, Duration::from_secs(5));
        assert_eq!(options.close_timeout, Duration::from_secs(5));
        assert_eq!(options.backlog, 1024);
        assert!(options.nodelay);
    }

    #[test]
    fn builders() {
        let options = Options::default()
            .with_max_message_size(1024)
            .with_max_frame_size(512)
            .with_close_timeout(Duration::from_millis(100))
            .with_max_concurrent_handshakes(0);
        assert_eq!(options.max_message_size, 1024);
        assert_eq!(options.frame_size_limit(), 512);
        assert_eq!(options.close_timeout, Duration::from_millis(100));
        // the bound is clamped to at least one permit
        assert_eq!(options.max_concurrent_handshakes, 1);
    }
}
