use std::time::Duration;

/// Tunables for the coordinator. Defaults match the service-level
/// configuration surface.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Matcher cadence.
    pub tick_interval: Duration,
    /// Pending-match deadline.
    pub ballot_ttl: Duration,
    /// Per-connection outbound buffer, in events.
    pub send_queue: usize,
    /// Per-event delivery deadline on a connection.
    pub send_timeout: Duration,
    /// Message content rejected above this many bytes (after trimming).
    pub max_content_bytes: usize,
    /// Hard upper bound for message page sizes.
    pub page_size_max: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            ballot_ttl: Duration::from_secs(120),
            send_queue: 256,
            send_timeout: Duration::from_secs(5),
            max_content_bytes: 4096,
            page_size_max: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(3));
        assert_eq!(config.ballot_ttl, Duration::from_secs(120));
        assert_eq!(config.send_queue, 256);
        assert_eq!(config.max_content_bytes, 4096);
    }
}
