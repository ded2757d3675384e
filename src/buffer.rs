//! Concurrent accumulation of normalized records with threshold flushing.
//!
//! Delivery workers call [`BreadcrumbBuffer::accept`] concurrently; a single
//! async mutex serializes access to the pending batch. The worker that finds
//! the batch full pays for the store append inline (back-pressure), everyone
//! else queues on the lock for an O(1) push. A failed append keeps the batch
//! in memory so the next flush trigger retries the same rows; records are
//! never dropped between accept and a successful flush.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::record::NormalizedBreadcrumb;
use crate::store::Store;

pub struct BreadcrumbBuffer {
    store: Arc<dyn Store>,
    flush_threshold: usize,
    reject_high_water: u64,
    state: Mutex<BufferState>,
}

/// `pending: None` is the "already flushed, nothing pending" sentinel.
#[derive(Default)]
struct BufferState {
    pending: Option<Vec<NormalizedBreadcrumb>>,
    rejected: u64,
    reject_warned: bool,
    flushes: u64,
    flush_failures: u64,
    flushed_rows: u64,
}

/// Counter snapshot for summaries and tests.
#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub pending: usize,
    pub rejected: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub flushed_rows: u64,
}

impl BreadcrumbBuffer {
    pub fn new(store: Arc<dyn Store>, flush_threshold: usize, reject_high_water: u64) -> Self {
        BreadcrumbBuffer {
            store,
            flush_threshold,
            reject_high_water,
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Queues one record, flushing first if the batch is already at the
    /// threshold.
    ///
    /// The record is retained even when the triggered flush fails; the error
    /// reports the failed store append, which will be retried on the next
    /// trigger.
    pub async fn accept(&self, crumb: NormalizedBreadcrumb) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut flush_result = Ok(0);
        let at_capacity = state
            .pending
            .as_ref()
            .is_some_and(|batch| batch.len() >= self.flush_threshold);
        if at_capacity {
            flush_result = self.flush_locked(&mut state).await;
        }

        state.pending.get_or_insert_with(Vec::new).push(crumb);
        flush_result.map(|_| ())
    }

    /// Counts a record the validator refused. Crossing the high-water mark
    /// surfaces a single warning; counting continues either way.
    pub async fn note_rejected(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.rejected += 1;
        if state.rejected > self.reject_high_water && !state.reject_warned {
            state.reject_warned = true;
            warn!(
                rejected = state.rejected,
                high_water = self.reject_high_water,
                "Rejected-record count crossed the high-water mark"
            );
        }
        state.rejected
    }

    /// Appends the entire pending batch to the raw store and resets the
    /// accumulator. No-op returning 0 when nothing is pending, so it is
    /// always safe at shutdown.
    pub async fn flush(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    /// Final flush for shutdown. Same as [`flush`](Self::flush) but logs the
    /// session counters.
    pub async fn drain(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let rows = self.flush_locked(&mut state).await?;
        info!(
            rows,
            rejected = state.rejected,
            flushes = state.flushes,
            flush_failures = state.flush_failures,
            "Buffer drained"
        );
        Ok(rows)
    }

    pub async fn stats(&self) -> BufferStats {
        let state = self.state.lock().await;
        BufferStats {
            pending: state.pending.as_ref().map_or(0, Vec::len),
            rejected: state.rejected,
            flushes: state.flushes,
            flush_failures: state.flush_failures,
            flushed_rows: state.flushed_rows,
        }
    }

    /// The one place the batch is handed to the store. Callers hold the state
    /// lock, so a batch can never be flushed twice or observed mid-flush.
    async fn flush_locked(&self, state: &mut BufferState) -> Result<usize> {
        let Some(batch) = state.pending.take() else {
            return Ok(0);
        };

        match self.store.append_raw(&batch).await {
            Ok(()) => {
                state.flushes += 1;
                state.flushed_rows += batch.len() as u64;
                info!(rows = batch.len(), "Flushed batch to raw store");
                Ok(batch.len())
            }
            Err(e) => {
                state.flush_failures += 1;
                // Put the batch back; the next trigger retries it.
                state.pending = Some(batch);
                Err(e).context("appending batch to raw store")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BreadcrumbRow, TripRow};
    use crate::store::{MemoryStore, RawKey, Store};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_no_flush_until_threshold_exceeded() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BreadcrumbBuffer::new(store.clone(), 3, 1000);

        for i in 0..3 {
            buffer.accept(crumb(i)).await.unwrap();
        }

        assert!(store.raw_rows().is_empty());
        let stats = buffer.stats().await;
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.flushes, 0);
    }

    #[tokio::test]
    async fn test_threshold_plus_one_accepts_flush_once_leaving_one_pending() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BreadcrumbBuffer::new(store.clone(), 3, 1000);

        for i in 0..4 {
            buffer.accept(crumb(i)).await.unwrap();
        }

        assert_eq!(store.raw_rows().len(), 3);
        let stats = buffer.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.flushed_rows, 3);
    }

    #[tokio::test]
    async fn test_flush_is_a_noop_on_the_empty_sentinel() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BreadcrumbBuffer::new(store.clone(), 3, 1000);

        buffer.accept(crumb(0)).await.unwrap();
        assert_eq!(buffer.flush().await.unwrap(), 1);
        assert_eq!(buffer.flush().await.unwrap(), 0);
        assert_eq!(buffer.drain().await.unwrap(), 0);

        assert_eq!(store.raw_rows().len(), 1);
        assert_eq!(buffer.stats().await.flushes, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_retains_batch_for_retry() {
        let store = Arc::new(FlakyStore::failing_appends(1));
        let buffer = BreadcrumbBuffer::new(store.clone(), 2, 1000);

        buffer.accept(crumb(0)).await.unwrap();
        buffer.accept(crumb(1)).await.unwrap();
        // Third accept trips the flush, which fails; the batch must survive
        // and the new record must still be queued.
        let err = buffer.accept(crumb(2)).await;
        assert!(err.is_err());

        let stats = buffer.stats().await;
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.flush_failures, 1);
        assert!(store.inner.raw_rows().is_empty());

        // Next trigger retries the whole retained batch.
        buffer.accept(crumb(3)).await.unwrap();
        let stats = buffer.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(store.inner.raw_rows().len(), 3);
    }

    #[tokio::test]
    async fn test_drain_flushes_everything_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BreadcrumbBuffer::new(store.clone(), 100, 1000);

        for i in 0..7 {
            buffer.accept(crumb(i)).await.unwrap();
        }
        assert_eq!(buffer.drain().await.unwrap(), 7);

        assert_eq!(store.raw_rows().len(), 7);
        assert_eq!(buffer.stats().await.pending, 0);
    }

    #[tokio::test]
    async fn test_rejected_counter_keeps_counting_past_the_mark() {
        let store = Arc::new(MemoryStore::new());
        let buffer = BreadcrumbBuffer::new(store, 100, 2);

        for _ in 0..5 {
            buffer.note_rejected().await;
        }

        assert_eq!(buffer.stats().await.rejected, 5);
    }

    #[tokio::test]
    async fn test_concurrent_accepts_lose_nothing() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(BreadcrumbBuffer::new(store.clone(), 10, 1000));

        let mut tasks = Vec::new();
        for t in 0..8 {
            let buffer = buffer.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    buffer.accept(crumb(t * 100 + i)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        buffer.drain().await.unwrap();

        let rows = store.raw_rows();
        assert_eq!(rows.len(), 200);
        // Every accepted record lands exactly once.
        let mut ids: Vec<i64> = rows.iter().map(|r| r.trip_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    // Store that fails the first `n` appends, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        remaining_failures: AtomicU32,
    }

    impl FlakyStore {
        fn failing_appends(n: u32) -> Self {
            FlakyStore {
                inner: MemoryStore::new(),
                remaining_failures: AtomicU32::new(n),
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn append_raw(&self, rows: &[NormalizedBreadcrumb]) -> Result<()> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("injected append failure");
            }
            self.inner.append_raw(rows).await
        }

        async fn select_unpromoted(&self) -> Result<Vec<NormalizedBreadcrumb>> {
            self.inner.select_unpromoted().await
        }

        async fn upsert_trips(&self, rows: &[TripRow]) -> Result<()> {
            self.inner.upsert_trips(rows).await
        }

        async fn insert_breadcrumbs(&self, rows: &[BreadcrumbRow]) -> Result<u64> {
            self.inner.insert_breadcrumbs(rows).await
        }

        async fn mark_promoted(&self, keys: &[RawKey]) -> Result<u64> {
            self.inner.mark_promoted(keys).await
        }
    }

    fn crumb(trip_id: i64) -> NormalizedBreadcrumb {
        NormalizedBreadcrumb {
            trip_id,
            vehicle_id: 3909,
            tstamp: NaiveDate::from_ymd_opt(2022, 9, 7)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            meters: 100.0,
            latitude: 45.52,
            longitude: -122.67,
            processed_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            promoted: false,
        }
    }
}
