//! Transport tuning

use nodemux_proto::HEADER_SIZE;
use std::time::Duration;

/// Bytes kept free below the node connection's message limit
pub const DEFAULT_READ_BUFFER_MARGIN: usize = 100;

/// Payload bytes parked per stream while its application dial is pending
pub const DEFAULT_DIAL_BACKLOG_BYTES: usize = 1024 * 1024;

/// Smallest node message limit that still fits a header and one payload byte
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE + 1;

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Time allowed to dial the application address for a new stream
    pub dial_timeout: Duration,

    /// Safety margin subtracted from the node message limit when sizing
    /// application read buffers
    pub read_buffer_margin: usize,

    /// Payload bytes parked for a stream whose dial has not finished; past
    /// this the stream is closed once the dial lands
    pub dial_backlog_bytes: usize,
}

impl TunnelConfig {
    /// Payload bytes one application read may produce for a node connection
    /// accepting messages of up to `max_message_size` bytes
    pub fn read_buffer_size(&self, max_message_size: usize) -> usize {
        max_message_size
            .saturating_sub(self.read_buffer_margin)
            .saturating_sub(HEADER_SIZE)
            .max(1)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            read_buffer_margin: DEFAULT_READ_BUFFER_MARGIN,
            dial_backlog_bytes: DEFAULT_DIAL_BACKLOG_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.read_buffer_margin, 100);
        assert_eq!(config.dial_backlog_bytes, 1024 * 1024);
    }

    #[test]
    fn test_read_buffer_size() {
        let config = TunnelConfig::default();
        assert_eq!(config.read_buffer_size(16 * 1024), 16 * 1024 - 100 - 5);

        // Never zero, a zero-length read would look like EOF
        assert_eq!(config.read_buffer_size(50), 1);

        // One payload byte still fits the smallest accepted message
        assert_eq!(config.read_buffer_size(MIN_MESSAGE_SIZE) + HEADER_SIZE, MIN_MESSAGE_SIZE);
    }
}
