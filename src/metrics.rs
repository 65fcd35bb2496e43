//! Pipeline counters and Prometheus exposition

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges for the ingestion pipeline.
///
/// Counters only go up; gauges track live depth. All handles are cheap
/// clones backed by shared atomics, so every component holds the same
/// `Arc<PipelineMetrics>` and bumps freely.
pub struct PipelineMetrics {
    registry: Registry,

    /// Records received at the intake handler.
    pub received: IntCounter,
    /// Micro-batches handed to the ingestion queue.
    pub queued: IntCounter,
    /// Micro-batches left to WAL recovery because the queue was full.
    pub deferred: IntCounter,
    /// Records refused before durability (WAL write failures).
    pub dropped: IntCounter,
    /// Records durably loaded into the store.
    pub flushed: IntCounter,
    /// Macro-batch store loads that failed.
    pub flush_errors: IntCounter,
    /// WAL write or sync failures.
    pub wal_errors: IntCounter,
    /// Credential or token validation failures.
    pub auth_failures: IntCounter,
    /// Records not handed to the hub because its inbox was full.
    pub broadcast_drops: IntCounter,
    /// Subscribers evicted for falling behind.
    pub evicted_subscribers: IntCounter,

    /// Micro-batches currently sitting in the ingestion queue.
    pub queue_depth: IntGauge,
    /// Workers currently inside a store flush.
    pub active_workers: IntGauge,
    /// Connected websocket subscribers.
    pub subscribers: IntGauge,
}

impl PipelineMetrics {
    pub fn new() -> crate::Result<Self> {
        let registry = Registry::new();

        let received = IntCounter::new(
            "logflume_ingest_received_total",
            "Records received at the intake handler",
        )?;
        let queued = IntCounter::new(
            "logflume_ingest_queued_total",
            "Micro-batches enqueued for workers",
        )?;
        let deferred = IntCounter::new(
            "logflume_ingest_deferred_total",
            "Micro-batches deferred to WAL recovery (queue full)",
        )?;
        let dropped = IntCounter::new(
            "logflume_ingest_dropped_total",
            "Records refused before durability",
        )?;
        let flushed = IntCounter::new(
            "logflume_ingest_flushed_total",
            "Records bulk-loaded into the store",
        )?;
        let flush_errors = IntCounter::new(
            "logflume_ingest_flush_errors_total",
            "Failed store bulk loads",
        )?;
        let wal_errors =
            IntCounter::new("logflume_wal_errors_total", "WAL write or sync failures")?;
        let auth_failures = IntCounter::new(
            "logflume_auth_failures_total",
            "Rejected credential or token validations",
        )?;
        let broadcast_drops = IntCounter::new(
            "logflume_hub_broadcast_drops_total",
            "Records dropped because the hub inbox was full",
        )?;
        let evicted_subscribers = IntCounter::new(
            "logflume_hub_evicted_subscribers_total",
            "Subscribers evicted for falling behind",
        )?;
        let queue_depth = IntGauge::new(
            "logflume_ingest_queue_depth",
            "Micro-batches currently queued",
        )?;
        let active_workers = IntGauge::new(
            "logflume_ingest_active_workers",
            "Workers currently flushing to the store",
        )?;
        let subscribers = IntGauge::new(
            "logflume_hub_subscribers",
            "Connected websocket subscribers",
        )?;

        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(queued.clone()))?;
        registry.register(Box::new(deferred.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(flushed.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(wal_errors.clone()))?;
        registry.register(Box::new(auth_failures.clone()))?;
        registry.register(Box::new(broadcast_drops.clone()))?;
        registry.register(Box::new(evicted_subscribers.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        Ok(Self {
            registry,
            received,
            queued,
            deferred,
            dropped,
            flushed,
            flush_errors,
            wal_errors,
            auth_failures,
            broadcast_drops,
            evicted_subscribers,
            queue_depth,
            active_workers,
            subscribers,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_text_format() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.received.inc_by(3);
        metrics.queue_depth.set(2);

        let text = metrics.render();
        assert!(text.contains("logflume_ingest_received_total 3"));
        assert!(text.contains("logflume_ingest_queue_depth 2"));
    }
}
