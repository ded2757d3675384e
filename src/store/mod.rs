//! Durable-store seam.
//!
//! [`Store`] is the async trait the pipeline writes through: append to the
//! raw table, read back the un-promoted set, upsert/insert the derived
//! tables, and flip promoted flags. The pipeline assumes each call is atomic
//! on the store's side and nothing more. [`MemoryStore`] is the in-process
//! implementation used by tests and the demo binary; deployments back the
//! trait with their warehouse.

mod memory;

pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::record::{BreadcrumbRow, NormalizedBreadcrumb, TripRow};

/// Identity of a raw row for promotion bookkeeping.
///
/// Duplicate deliveries can produce several raw rows with the same key; they
/// describe the same physical sample and are promoted (and deduplicated)
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawKey {
    pub trip_id: i64,
    pub tstamp: NaiveDateTime,
}

impl From<&NormalizedBreadcrumb> for RawKey {
    fn from(crumb: &NormalizedBreadcrumb) -> Self {
        RawKey {
            trip_id: crumb.trip_id,
            tstamp: crumb.tstamp,
        }
    }
}

/// Names of the three target tables, configurable per deployment.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub raw: String,
    pub trip: String,
    pub breadcrumb: String,
}

impl Default for TableNames {
    fn default() -> Self {
        TableNames {
            raw: "raw_breadcrumb".to_string(),
            trip: "trip".to_string(),
            breadcrumb: "breadcrumb".to_string(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Appends normalized rows to the raw table in one call.
    async fn append_raw(&self, rows: &[NormalizedBreadcrumb]) -> Result<()>;

    /// Returns every raw row whose promoted flag is still false.
    async fn select_unpromoted(&self) -> Result<Vec<NormalizedBreadcrumb>>;

    /// Upserts trip rows keyed by `trip_id`. Existing rows get their route,
    /// vehicle, service key, and direction overwritten (last write wins).
    async fn upsert_trips(&self, rows: &[TripRow]) -> Result<()>;

    /// Inserts breadcrumb rows, ignoring any whose (trip_id, tstamp) already
    /// exists. Returns the number actually inserted.
    async fn insert_breadcrumbs(&self, rows: &[BreadcrumbRow]) -> Result<u64>;

    /// Flips promoted=true on un-promoted raw rows matching `keys`.
    /// Returns the number of rows flipped.
    async fn mark_promoted(&self, keys: &[RawKey]) -> Result<u64>;
}
