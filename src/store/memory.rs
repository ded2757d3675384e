use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

use super::{RawKey, Store, TableNames};
use crate::record::{BreadcrumbRow, NormalizedBreadcrumb, TripRow};

/// In-memory [`Store`] with the same observable semantics a warehouse-backed
/// implementation would have: idempotent trip upserts, breadcrumb inserts
/// deduplicated on (trip_id, tstamp), and promoted flags that only ever flip
/// false to true.
pub struct MemoryStore {
    tables: TableNames,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    raw: Vec<NormalizedBreadcrumb>,
    trips: BTreeMap<i64, TripRow>,
    breadcrumbs: Vec<BreadcrumbRow>,
    breadcrumb_keys: HashSet<(i64, NaiveDateTime)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tables(TableNames::default())
    }

    pub fn with_tables(tables: TableNames) -> Self {
        MemoryStore {
            tables,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Snapshot of the raw table, promoted rows included.
    pub fn raw_rows(&self) -> Vec<NormalizedBreadcrumb> {
        self.lock().raw.clone()
    }

    /// Snapshot of the trip table in trip-id order.
    pub fn trip_rows(&self) -> Vec<TripRow> {
        self.lock().trips.values().cloned().collect()
    }

    /// Snapshot of the breadcrumb table in insertion order.
    pub fn breadcrumb_rows(&self) -> Vec<BreadcrumbRow> {
        self.lock().breadcrumbs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_raw(&self, rows: &[NormalizedBreadcrumb]) -> Result<()> {
        let mut inner = self.lock();
        inner.raw.extend_from_slice(rows);
        debug!(table = %self.tables.raw, appended = rows.len(), "Appended raw rows");
        Ok(())
    }

    async fn select_unpromoted(&self) -> Result<Vec<NormalizedBreadcrumb>> {
        let inner = self.lock();
        Ok(inner.raw.iter().filter(|r| !r.promoted).cloned().collect())
    }

    async fn upsert_trips(&self, rows: &[TripRow]) -> Result<()> {
        let mut inner = self.lock();
        for row in rows {
            inner.trips.insert(row.trip_id, row.clone());
        }
        debug!(table = %self.tables.trip, upserted = rows.len(), "Upserted trip rows");
        Ok(())
    }

    async fn insert_breadcrumbs(&self, rows: &[BreadcrumbRow]) -> Result<u64> {
        let mut inner = self.lock();
        let mut inserted = 0u64;
        for row in rows {
            if inner.breadcrumb_keys.insert((row.trip_id, row.tstamp)) {
                inner.breadcrumbs.push(row.clone());
                inserted += 1;
            }
        }
        debug!(
            table = %self.tables.breadcrumb,
            inserted,
            skipped = rows.len() as u64 - inserted,
            "Inserted breadcrumb rows"
        );
        Ok(inserted)
    }

    async fn mark_promoted(&self, keys: &[RawKey]) -> Result<u64> {
        let keyset: HashSet<&RawKey> = keys.iter().collect();
        let mut inner = self.lock();
        let mut marked = 0u64;
        for row in inner.raw.iter_mut().filter(|r| !r.promoted) {
            let key = RawKey {
                trip_id: row.trip_id,
                tstamp: row.tstamp,
            };
            if keyset.contains(&key) {
                row.promoted = true;
                marked += 1;
            }
        }
        debug!(table = %self.tables.raw, marked, "Marked raw rows promoted");
        Ok(marked)
    }
}
