//! Promotion of raw breadcrumbs into the processed trip and breadcrumb
//! tables.
//!
//! Promotion is a pull: it selects every raw row not yet promoted, derives
//! speeds and trip rows, writes the processed tables, and only then marks the
//! selected rows promoted. Raw rows are retired last so a crash anywhere in
//! between leaves them selectable again; the duplicate-ignoring breadcrumb
//! insert makes the rerun converge instead of double-writing.

use anyhow::{Result, bail};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::record::{BreadcrumbRow, TripRow};
use crate::speed::add_speed;
use crate::store::{RawKey, Store};

pub struct Promoter {
    store: Arc<dyn Store>,
}

#[derive(Debug, Clone, Copy)]
pub struct PromotionSummary {
    pub selected: u64,
    pub trips: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub marked: u64,
}

impl Promoter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Promoter { store }
    }

    /// Promotes everything currently selectable. Safe to rerun after a
    /// failure; already-written breadcrumbs are skipped, not duplicated.
    #[tracing::instrument(skip(self))]
    pub async fn promote(&self) -> Result<PromotionSummary> {
        let rows = self.store.select_unpromoted().await?;
        if rows.is_empty() {
            info!("No unpromoted breadcrumbs");
            return Ok(PromotionSummary {
                selected: 0,
                trips: 0,
                inserted: 0,
                skipped: 0,
                marked: 0,
            });
        }

        let selected = rows.len() as u64;
        let mut keys: Vec<RawKey> = rows.iter().map(RawKey::from).collect();
        keys.sort_unstable();
        keys.dedup();

        let measured = add_speed(rows);

        let mut seen = HashSet::new();
        let mut trips = Vec::new();
        for m in &measured {
            if seen.insert(m.crumb.trip_id) {
                trips.push(TripRow {
                    trip_id: m.crumb.trip_id,
                    route_id: None,
                    vehicle_id: m.crumb.vehicle_id,
                    service_key: None,
                    direction: None,
                });
            }
        }

        let breadcrumbs: Vec<BreadcrumbRow> = measured
            .iter()
            .map(|m| BreadcrumbRow {
                tstamp: m.crumb.tstamp,
                latitude: m.crumb.latitude,
                longitude: m.crumb.longitude,
                speed: m.speed,
                trip_id: m.crumb.trip_id,
            })
            .collect();

        // Trips go first so no breadcrumb ever references a trip the store
        // has not seen.
        self.store.upsert_trips(&trips).await?;
        let inserted = self.store.insert_breadcrumbs(&breadcrumbs).await?;

        // Retire the selected rows only now, after both writes held.
        let marked = self.store.mark_promoted(&keys).await?;
        if marked < selected {
            bail!("promotion marked {marked} of {selected} selected rows");
        }
        if marked > selected {
            // Rows sharing a selected key arrived mid-promotion and were
            // retired with it.
            warn!(marked, selected, "Marked more rows than were selected");
        }

        let summary = PromotionSummary {
            selected,
            trips: trips.len() as u64,
            inserted,
            skipped: breadcrumbs.len() as u64 - inserted,
            marked,
        };
        info!(
            selected = summary.selected,
            trips = summary.trips,
            inserted = summary.inserted,
            skipped = summary.skipped,
            "Promotion complete"
        );
        Ok(summary)
    }
}
