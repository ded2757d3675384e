//! Ingest session: drains the delivery stream into the batch buffer.
//!
//! One dispatch loop leases deliveries from the transport and hands each to a
//! spawned worker, with a semaphore bounding how many are in flight. The
//! session ends when the stream closes or the drain deadline passes; whatever
//! the buffer still holds is flushed before the summary is returned.
//!
//! Every delivery is settled exactly once, after local handling and no matter
//! how that handling went. A record that failed validation or decoding has
//! been dealt with (counted and discarded), and an accepted record belongs to
//! the buffer; redelivery would only produce duplicates.

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, warn};

use crate::buffer::BreadcrumbBuffer;
use crate::record::{RawBreadcrumb, validate_and_normalize};
use crate::transport::{Delivery, Transport};

pub struct Subscriber<T> {
    transport: T,
    buffer: Arc<BreadcrumbBuffer>,
    drain_timeout: Duration,
    worker_concurrency: usize,
}

#[derive(Default)]
struct SessionCounters {
    received: AtomicU64,
    malformed: AtomicU64,
}

/// What one ingest session did, for the closing log line and the ops
/// notification.
#[derive(Debug, Clone, Copy)]
pub struct IngestSummary {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub stored_rows: u64,
}

impl<T: Transport> Subscriber<T> {
    pub fn new(
        transport: T,
        buffer: Arc<BreadcrumbBuffer>,
        drain_timeout: Duration,
        worker_concurrency: usize,
    ) -> Self {
        Subscriber {
            transport,
            buffer,
            drain_timeout,
            worker_concurrency,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs one ingest session to completion.
    ///
    /// # Errors
    ///
    /// Fails when the final drain cannot reach the raw store. Flush failures
    /// during the session are logged and retried, not fatal.
    pub async fn run(&self) -> Result<IngestSummary> {
        let deadline = Instant::now() + self.drain_timeout;
        let semaphore = Arc::new(Semaphore::new(self.worker_concurrency));
        let counters = Arc::new(SessionCounters::default());
        let mut workers: JoinSet<()> = JoinSet::new();

        info!(
            timeout_secs = self.drain_timeout.as_secs(),
            workers = self.worker_concurrency,
            "Listening for breadcrumb deliveries"
        );

        loop {
            // Reap whatever finished since the last lap.
            while workers.try_join_next().is_some() {}

            // Take a worker slot before leasing the next delivery, so a slow
            // store backs pressure all the way up to the publisher.
            let leased = tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    info!("Session deadline reached, stopping intake");
                    None
                }
                pair = async {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("session semaphore is never closed");
                    (permit, self.transport.next_delivery().await)
                } => Some(pair),
            };

            let Some((permit, maybe_delivery)) = leased else {
                break;
            };
            let Some(delivery) = maybe_delivery else {
                info!("Delivery stream closed");
                break;
            };

            let seq = counters.received.fetch_add(1, Ordering::Relaxed) + 1;
            let buffer = self.buffer.clone();
            let counters = counters.clone();
            let span = tracing::debug_span!("handle_delivery", seq);
            workers.spawn(
                async move {
                    let _permit = permit;
                    handle_delivery(delivery, &buffer, &counters).await;
                }
                .instrument(span),
            );
        }

        // Let in-flight workers finish, then push the remainder to the store.
        while workers.join_next().await.is_some() {}
        self.buffer
            .drain()
            .await
            .context("draining buffer at end of session")?;

        let stats = self.buffer.stats().await;
        let received = counters.received.load(Ordering::Relaxed);
        let malformed = counters.malformed.load(Ordering::Relaxed);
        let summary = IngestSummary {
            received,
            accepted: received - malformed - stats.rejected,
            rejected: stats.rejected,
            malformed,
            flushes: stats.flushes,
            flush_failures: stats.flush_failures,
            stored_rows: stats.flushed_rows,
        };

        info!(
            received = summary.received,
            accepted = summary.accepted,
            rejected = summary.rejected,
            malformed = summary.malformed,
            stored_rows = summary.stored_rows,
            "Ingest session complete"
        );
        Ok(summary)
    }
}

/// Decodes, validates, and queues one delivery, then settles its lease.
async fn handle_delivery(
    delivery: Delivery,
    buffer: &BreadcrumbBuffer,
    counters: &SessionCounters,
) {
    match serde_json::from_slice::<RawBreadcrumb>(&delivery.payload) {
        Ok(raw) => match validate_and_normalize(raw, Local::now().date_naive()) {
            Ok(crumb) => {
                if let Err(e) = buffer.accept(crumb).await {
                    // The record and its batch are retained for the next
                    // flush trigger.
                    error!(error = %e, "Batch flush failed");
                }
            }
            Err(reason) => {
                let rejected = buffer.note_rejected().await;
                debug!(%reason, rejected, "Rejected breadcrumb");
            }
        },
        Err(e) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Discarding undecodable delivery");
        }
    }
    delivery.ack();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::ChannelTransport;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_session_settles_every_delivery_once() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(BreadcrumbBuffer::new(store.clone(), 100, 1000));
        let (publisher, transport) = ChannelTransport::open(16);

        for i in 0..3 {
            publisher.publish(valid_payload(i, 100 + i)).await.unwrap();
        }
        publisher
            .publish(Bytes::from_static(b"not even json"))
            .await
            .unwrap();
        publisher.publish(poor_accuracy_payload()).await.unwrap();
        drop(publisher);

        let subscriber = Subscriber::new(transport, buffer, Duration::from_secs(5), 4);
        let summary = subscriber.run().await.unwrap();

        assert_eq!(summary.received, 5);
        assert_eq!(summary.accepted, 3);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.stored_rows, 3);
        assert_eq!(store.raw_rows().len(), 3);
        assert_eq!(subscriber.transport().acked(), 5);
    }

    #[tokio::test]
    async fn test_deadline_ends_an_idle_session() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(BreadcrumbBuffer::new(store, 100, 1000));
        let (publisher, transport) = ChannelTransport::open(16);

        let subscriber = Subscriber::new(transport, buffer, Duration::from_millis(50), 4);
        let summary = subscriber.run().await.unwrap();
        drop(publisher);

        assert_eq!(summary.received, 0);
        assert_eq!(summary.stored_rows, 0);
    }

    #[tokio::test]
    async fn test_high_volume_session_stores_every_accepted_record() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(BreadcrumbBuffer::new(store.clone(), 10, 1000));
        let (publisher, transport) = ChannelTransport::open(8);

        let producer = tokio::spawn(async move {
            for i in 0..100 {
                publisher.publish(valid_payload(i, i)).await.unwrap();
            }
        });

        let subscriber = Subscriber::new(transport, buffer, Duration::from_secs(10), 4);
        let summary = subscriber.run().await.unwrap();
        producer.await.unwrap();

        assert_eq!(summary.received, 100);
        assert_eq!(summary.accepted, 100);
        assert_eq!(summary.stored_rows, 100);
        assert_eq!(store.raw_rows().len(), 100);
        assert_eq!(subscriber.transport().acked(), 100);
    }

    fn valid_payload(trip_id: i64, act_time: i64) -> Bytes {
        Bytes::from(format!(
            concat!(
                r#"{{"EVENT_NO_TRIP":{},"EVENT_NO_STOP":{},"OPD_DATE":"07SEP2022:00:00:00","#,
                r#""VEHICLE_ID":3909,"METERS":1852.0,"ACT_TIME":{},"#,
                r#""GPS_LONGITUDE":-122.67,"GPS_LATITUDE":45.52,"GPS_HDOP":0.8,"#,
                r#""GPS_SATELLITES":12}}"#
            ),
            trip_id, trip_id, act_time
        ))
    }

    fn poor_accuracy_payload() -> Bytes {
        Bytes::from_static(
            br#"{"EVENT_NO_TRIP":1,"OPD_DATE":"07SEP2022:00:00:00","VEHICLE_ID":3909,"METERS":1852.0,"ACT_TIME":50,"GPS_LONGITUDE":-122.67,"GPS_LATITUDE":45.52,"GPS_HDOP":25.0,"GPS_SATELLITES":3}"#,
        )
    }
}
