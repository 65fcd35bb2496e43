//! Broadcast hub: per-project fan-out of committed records
//!
//! A single event-loop task owns the subscriber map outright; registration,
//! removal and record fan-out all arrive as messages on three channels, so
//! the map needs no lock. Slow subscribers are evicted rather than allowed
//! to block the loop.

pub mod client;

use crate::metrics::PipelineMetrics;
use crate::record::LogRecord;
use axum::extract::ws::Utf8Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the hub's broadcast inbox; workers drop rather than wait.
const BROADCAST_BUFFER: usize = 4_096;

/// Capacity of the register/unregister control channels.
const CONTROL_BUFFER: usize = 64;

pub type SubscriberId = Uuid;

/// A connected websocket client for one project.
pub struct Subscriber {
    pub id: SubscriberId,
    pub project_id: i32,
    pub user_id: i32,
    /// Bounded buffer of serialized frames; filling it up gets the
    /// subscriber evicted.
    pub sender: mpsc::Sender<Utf8Bytes>,
}

/// Cloneable handle the rest of the system uses to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Subscriber>,
    unregister_tx: mpsc::Sender<(i32, SubscriberId)>,
    broadcast_tx: mpsc::Sender<LogRecord>,
}

impl HubHandle {
    /// Attach a subscriber. Returns false if the hub is shut down.
    pub async fn register(&self, subscriber: Subscriber) -> bool {
        self.register_tx.send(subscriber).await.is_ok()
    }

    /// Detach a subscriber; idempotent.
    pub async fn unregister(&self, project_id: i32, id: SubscriberId) {
        let _ = self.unregister_tx.send((project_id, id)).await;
    }

    /// Offer a committed record for fan-out without blocking.
    ///
    /// Returns false when the hub inbox is full or the hub is gone; the
    /// caller counts the drop and moves on. Live tail is best-effort.
    pub fn broadcast(&self, record: LogRecord) -> bool {
        self.broadcast_tx.try_send(record).is_ok()
    }
}

/// The event loop state. Build with [`hub`], then [`Hub::spawn`].
pub struct Hub {
    register_rx: mpsc::Receiver<Subscriber>,
    unregister_rx: mpsc::Receiver<(i32, SubscriberId)>,
    broadcast_rx: mpsc::Receiver<LogRecord>,
    rooms: HashMap<i32, HashMap<SubscriberId, mpsc::Sender<Utf8Bytes>>>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

/// Build a hub and its handle.
pub fn hub(metrics: Arc<PipelineMetrics>, cancel: CancellationToken) -> (Hub, HubHandle) {
    let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER);
    let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_BUFFER);
    (
        Hub {
            register_rx,
            unregister_rx,
            broadcast_rx,
            rooms: HashMap::new(),
            metrics,
            cancel,
        },
        HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
        },
    )
}

impl Hub {
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("broadcast hub started");
        loop {
            tokio::select! {
                Some(subscriber) = self.register_rx.recv() => self.on_register(subscriber),
                Some((project_id, id)) = self.unregister_rx.recv() => {
                    self.on_unregister(project_id, id)
                }
                Some(record) = self.broadcast_rx.recv() => self.on_broadcast(record),
                _ = self.cancel.cancelled() => break,
            }
        }
        // Dropping the rooms drops every send buffer, which ends each
        // subscriber's write pump.
        let open = self.rooms.values().map(|room| room.len()).sum::<usize>();
        self.metrics.subscribers.sub(open as i64);
        self.rooms.clear();
        info!("broadcast hub stopped");
    }

    fn on_register(&mut self, subscriber: Subscriber) {
        debug!(
            project_id = subscriber.project_id,
            subscriber = %subscriber.id,
            "subscriber registered"
        );
        self.rooms
            .entry(subscriber.project_id)
            .or_default()
            .insert(subscriber.id, subscriber.sender);
        self.metrics.subscribers.inc();
    }

    fn on_unregister(&mut self, project_id: i32, id: SubscriberId) {
        if let Some(room) = self.rooms.get_mut(&project_id) {
            if room.remove(&id).is_some() {
                self.metrics.subscribers.dec();
                debug!(project_id, subscriber = %id, "subscriber unregistered");
            }
            if room.is_empty() {
                self.rooms.remove(&project_id);
            }
        }
    }

    fn on_broadcast(&mut self, record: LogRecord) {
        let project_id = record.project_id;
        let Some(room) = self.rooms.get_mut(&project_id) else {
            return;
        };

        let frame: Utf8Bytes = match serde_json::to_string(&record) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast frame");
                return;
            }
        };

        let mut evicted = Vec::new();
        for (id, sender) in room.iter() {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(project_id, subscriber = %id, "evicting slow subscriber");
                    self.metrics.evicted_subscribers.inc();
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            room.remove(&id);
            self.metrics.subscribers.dec();
        }
        if room.is_empty() {
            self.rooms.remove(&project_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn record(project_id: i32, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: "info".to_string(),
            message: message.to_string(),
            service: "svc".to_string(),
            project_id,
            data: None,
            segment_id: 1,
        }
    }

    fn start_hub() -> (HubHandle, CancellationToken, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let cancel = CancellationToken::new();
        let (hub, handle) = hub(metrics.clone(), cancel.clone());
        hub.spawn();
        (handle, cancel, metrics)
    }

    async fn subscribe(
        handle: &HubHandle,
        project_id: i32,
        buffer: usize,
    ) -> (SubscriberId, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = Uuid::new_v4();
        assert!(
            handle
                .register(Subscriber {
                    id,
                    project_id,
                    user_id: 1,
                    sender: tx,
                })
                .await
        );
        // Registration is a buffered message; let the loop pick it up before
        // anything gets broadcast.
        tokio::time::sleep(Duration::from_millis(20)).await;
        (id, rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_project_subscribers_in_order() {
        let (handle, _cancel, _metrics) = start_hub();
        let (_id, mut rx) = subscribe(&handle, 1, 16).await;

        for i in 0..3 {
            assert!(handle.broadcast(record(1, &format!("m{i}"))));
        }

        for i in 0..3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let decoded: LogRecord = serde_json::from_str(frame.as_str()).unwrap();
            assert_eq!(decoded.message, format!("m{i}"));
            assert_eq!(decoded.project_id, 1);
        }
    }

    #[tokio::test]
    async fn records_do_not_cross_projects() {
        let (handle, _cancel, _metrics) = start_hub();
        let (_id1, mut rx1) = subscribe(&handle, 1, 16).await;
        let (_id2, mut rx2) = subscribe(&handle, 2, 16).await;

        handle.broadcast(record(1, "only for one"));

        let frame = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.as_str().contains("only for one"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_hurting_others() {
        let (handle, _cancel, metrics) = start_hub();
        // Slow subscriber never drains its 4-slot buffer.
        let (_slow_id, slow_rx) = subscribe(&handle, 1, 4).await;
        let (_other_id, mut other_rx) = subscribe(&handle, 2, 2048).await;

        for i in 0..1_000 {
            handle.broadcast(record(1, &format!("flood {i}")));
            if i % 100 == 0 {
                // Give the hub loop room to drain its inbox.
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        handle.broadcast(record(2, "still alive"));

        let frame = tokio::time::timeout(Duration::from_secs(1), other_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.as_str().contains("still alive"));
        assert!(metrics.evicted_subscribers.get() >= 1);

        // The evicted buffer is closed once the hub dropped its sender.
        let mut slow_rx = slow_rx;
        while slow_rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn unregister_closes_the_send_buffer() {
        let (handle, _cancel, metrics) = start_hub();
        let (id, mut rx) = subscribe(&handle, 1, 16).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(metrics.subscribers.get(), 1);

        handle.unregister(1, id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(metrics.subscribers.get(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_all_subscribers() {
        let (handle, cancel, _metrics) = start_hub();
        let (_id, mut rx) = subscribe(&handle, 1, 16).await;

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
