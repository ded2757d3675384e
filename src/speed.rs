//! Speed computation over complete trip/vehicle groups.
//!
//! Speeds are meter deltas over timestamp deltas between consecutive samples
//! of the same (trip, vehicle) group. A group's deltas are only meaningful
//! when every sample of the group is present, which is why raw records are
//! buffered untouched and speeds are computed at promotion time rather than
//! during ingestion.

use chrono::NaiveDateTime;

use crate::record::NormalizedBreadcrumb;

/// A normalized sample paired with its computed speed.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredBreadcrumb {
    pub crumb: NormalizedBreadcrumb,
    /// Meters per second since the previous sample of the same group.
    /// `None` when there is no predecessor or the time delta is zero.
    pub speed: Option<f64>,
}

/// Sorts samples by (trip, vehicle, timestamp) and attaches per-sample speeds.
///
/// The first sample of every group has no predecessor and gets `None`; so does
/// any sample whose timestamp equals its predecessor's, since a zero time
/// delta has no defined rate.
pub fn add_speed(mut rows: Vec<NormalizedBreadcrumb>) -> Vec<MeasuredBreadcrumb> {
    rows.sort_by_key(|r| (r.trip_id, r.vehicle_id, r.tstamp));

    let mut out = Vec::with_capacity(rows.len());
    let mut prev: Option<(i64, i64, f64, NaiveDateTime)> = None;

    for crumb in rows {
        let speed = match prev {
            Some((trip_id, vehicle_id, meters, tstamp))
                if trip_id == crumb.trip_id && vehicle_id == crumb.vehicle_id =>
            {
                let seconds = (crumb.tstamp - tstamp).num_seconds();
                if seconds == 0 {
                    None
                } else {
                    Some((crumb.meters - meters) / seconds as f64)
                }
            }
            _ => None,
        };

        prev = Some((crumb.trip_id, crumb.vehicle_id, crumb.meters, crumb.tstamp));
        out.push(MeasuredBreadcrumb { crumb, speed });
    }

    out
}
