//! Prometheus metrics for the relay
//!
//! Every relay owns its registry, so several relays in one process (tests,
//! embedding) never share counters.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    messages_published: IntCounter,
    messages_delivered: IntCounter,
    bytes_delivered: IntCounter,
    active_publishers: IntGauge,
    active_subscribers: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_published = IntCounter::new(
            "speedy_messages_published_total",
            "Total number of messages accepted from publishers",
        )?;
        let messages_delivered = IntCounter::new(
            "speedy_messages_delivered_total",
            "Total number of messages written to subscribers",
        )?;
        let bytes_delivered = IntCounter::new(
            "speedy_bytes_delivered_total",
            "Total number of bytes written to subscribers, delimiters included",
        )?;
        let active_publishers = IntGauge::new(
            "speedy_active_publishers",
            "Number of publish streams currently open",
        )?;
        let active_subscribers = IntGauge::new(
            "speedy_active_subscribers",
            "Number of subscribe streams currently open",
        )?;

        registry.register(Box::new(messages_published.clone()))?;
        registry.register(Box::new(messages_delivered.clone()))?;
        registry.register(Box::new(bytes_delivered.clone()))?;
        registry.register(Box::new(active_publishers.clone()))?;
        registry.register(Box::new(active_subscribers.clone()))?;

        Ok(Self {
            registry,
            messages_published,
            messages_delivered,
            bytes_delivered,
            active_publishers,
            active_subscribers,
        })
    }

    pub(crate) fn message_published(&self) {
        self.messages_published.inc();
    }

    pub(crate) fn message_delivered(&self, bytes: usize) {
        self.messages_delivered.inc();
        self.bytes_delivered.inc_by(bytes as u64);
    }

    pub(crate) fn publisher_opened(&self) {
        self.active_publishers.inc();
    }

    pub(crate) fn publisher_closed(&self) {
        self.active_publishers.dec();
    }

    pub(crate) fn subscriber_opened(&self) {
        self.active_subscribers.inc();
    }

    pub(crate) fn subscriber_closed(&self) {
        self.active_subscribers.dec();
    }

    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.get()
    }

    #[must_use]
    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered.get()
    }

    #[must_use]
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered.get()
    }

    #[must_use]
    pub fn active_publishers(&self) -> i64 {
        self.active_publishers.get()
    }

    #[must_use]
    pub fn active_subscribers(&self) -> i64 {
        self.active_subscribers.get()
    }

    /// Gather all metrics and encode them in Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMetrics")
            .field("messages_published", &self.messages_published())
            .field("messages_delivered", &self.messages_delivered())
            .field("active_publishers", &self.active_publishers())
            .field("active_subscribers", &self.active_subscribers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let first = RelayMetrics::new().unwrap();
        let second = RelayMetrics::new().unwrap();

        first.message_published();
        first.message_delivered(6);

        assert_eq!(first.messages_published(), 1);
        assert_eq!(first.bytes_delivered(), 6);
        assert_eq!(second.messages_published(), 0);
    }

    #[test]
    fn test_encode_text_format() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.subscriber_opened();
        metrics.message_delivered(4);

        let text = metrics.encode().unwrap();

        assert!(text.contains("speedy_active_subscribers 1"));
        assert!(text.contains("speedy_messages_delivered_total 1"));
        assert!(text.contains("speedy_bytes_delivered_total 4"));
        assert!(text.contains("# TYPE speedy_active_publishers gauge"));
    }
}
