//! Breadcrumb record types and per-record validation/normalization.
//!
//! A [`RawBreadcrumb`] mirrors the wire payload 1:1 with every field optional;
//! [`validate_and_normalize`] either shapes it into a [`NormalizedBreadcrumb`]
//! or returns the [`RejectReason`] that disqualified it. Rejection is expected
//! traffic, not an error: bad records are counted and dropped, never retried.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::fmt;

/// Format of the `OPD_DATE` wire field, e.g. `07SEP2022:00:00:00`.
pub const SERVICE_DATE_FORMAT: &str = "%d%b%Y:%H:%M:%S";

/// Records with a horizontal dilution of precision above this are considered
/// too inaccurate to keep.
pub const MAX_HDOP: f64 = 20.0;

/// One telemetry sample exactly as delivered, before any validation.
///
/// Field names map to the upstream feed's column names; everything is
/// `Option` so that a missing key and an explicit `null` both land as `None`
/// and are rejected by the validator rather than failing JSON decode.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawBreadcrumb {
    #[serde(rename = "EVENT_NO_TRIP")]
    pub trip_id: Option<i64>,
    /// Internal stop-event id; never required, always dropped.
    #[serde(rename = "EVENT_NO_STOP")]
    pub stop_event_id: Option<i64>,
    /// Service date in [`SERVICE_DATE_FORMAT`].
    #[serde(rename = "OPD_DATE")]
    pub service_date: Option<String>,
    #[serde(rename = "VEHICLE_ID")]
    pub vehicle_id: Option<i64>,
    /// Odometer reading in meters.
    #[serde(rename = "METERS")]
    pub meters: Option<f64>,
    /// Seconds past local midnight of the service date.
    #[serde(rename = "ACT_TIME")]
    pub act_time: Option<i64>,
    #[serde(rename = "GPS_LONGITUDE")]
    pub longitude: Option<f64>,
    #[serde(rename = "GPS_LATITUDE")]
    pub latitude: Option<f64>,
    /// Horizontal dilution of precision; lower is more accurate.
    #[serde(rename = "GPS_HDOP")]
    pub hdop: Option<f64>,
    #[serde(rename = "GPS_SATELLITES")]
    pub satellites: Option<i64>,
}

/// A validated sample ready for the raw table.
///
/// The service date and time offset are merged into `tstamp`; accuracy fields
/// are gone. `promoted` starts false and flips true exactly once, after the
/// row's derived counterparts are durably written.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBreadcrumb {
    pub trip_id: i64,
    pub vehicle_id: i64,
    pub tstamp: NaiveDateTime,
    pub meters: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Date this record was processed, not the date it was recorded.
    pub processed_date: NaiveDate,
    pub promoted: bool,
}

/// One row of the derived trip table, keyed by `trip_id`.
///
/// Route, service key, and direction start out unknown; a later enrichment
/// feed may overwrite them (last write wins on upsert).
#[derive(Debug, Clone, PartialEq)]
pub struct TripRow {
    pub trip_id: i64,
    pub route_id: Option<String>,
    pub vehicle_id: i64,
    pub service_key: Option<String>,
    pub direction: Option<String>,
}

/// One row of the derived breadcrumb table. Append-only; never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct BreadcrumbRow {
    pub tstamp: NaiveDateTime,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters per second; `None` for the first sample of a trip/vehicle group
    /// and for samples sharing a timestamp with their predecessor.
    pub speed: Option<f64>,
    pub trip_id: i64,
}

/// Why a record was dropped at the validation boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// A required field was absent from the payload or explicitly null.
    MissingField(&'static str),
    /// HDOP above [`MAX_HDOP`]: the fix is too inaccurate to trust.
    PoorAccuracy(f64),
    NegativeValue(&'static str),
    /// Service date did not parse under [`SERVICE_DATE_FORMAT`].
    UnparsableDate(String),
    /// The time offset pushed the timestamp out of representable range.
    InvalidTimestamp(i64),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingField(field) => {
                write!(f, "required field {} missing or null", field)
            }
            RejectReason::PoorAccuracy(hdop) => {
                write!(f, "GPS_HDOP {} exceeds {}", hdop, MAX_HDOP)
            }
            RejectReason::NegativeValue(field) => write!(f, "negative value in {}", field),
            RejectReason::UnparsableDate(raw) => write!(f, "unparsable OPD_DATE {:?}", raw),
            RejectReason::InvalidTimestamp(secs) => {
                write!(f, "ACT_TIME {} overflows the timestamp", secs)
            }
        }
    }
}

/// Validates a raw sample and merges its timestamp components.
///
/// Pure: the caller supplies the processing date so repeated calls over the
/// same input always agree. Returns the first disqualifying condition found;
/// an unparsable date is a rejection like any other, not a panic.
pub fn validate_and_normalize(
    raw: RawBreadcrumb,
    processed_date: NaiveDate,
) -> Result<NormalizedBreadcrumb, RejectReason> {
    use RejectReason::MissingField;

    let trip_id = raw.trip_id.ok_or(MissingField("EVENT_NO_TRIP"))?;
    let service_date = raw.service_date.ok_or(MissingField("OPD_DATE"))?;
    let vehicle_id = raw.vehicle_id.ok_or(MissingField("VEHICLE_ID"))?;
    let meters = raw.meters.ok_or(MissingField("METERS"))?;
    let act_time = raw.act_time.ok_or(MissingField("ACT_TIME"))?;
    let longitude = raw.longitude.ok_or(MissingField("GPS_LONGITUDE"))?;
    let latitude = raw.latitude.ok_or(MissingField("GPS_LATITUDE"))?;
    let hdop = raw.hdop.ok_or(MissingField("GPS_HDOP"))?;
    raw.satellites.ok_or(MissingField("GPS_SATELLITES"))?;

    if hdop > MAX_HDOP {
        return Err(RejectReason::PoorAccuracy(hdop));
    }
    if meters < 0.0 {
        return Err(RejectReason::NegativeValue("METERS"));
    }
    if act_time < 0 {
        return Err(RejectReason::NegativeValue("ACT_TIME"));
    }
    if vehicle_id < 0 {
        return Err(RejectReason::NegativeValue("VEHICLE_ID"));
    }

    let base = NaiveDateTime::parse_from_str(&service_date, SERVICE_DATE_FORMAT)
        .map_err(|_| RejectReason::UnparsableDate(service_date.clone()))?;
    let tstamp = Duration::try_seconds(act_time)
        .and_then(|offset| base.checked_add_signed(offset))
        .ok_or(RejectReason::InvalidTimestamp(act_time))?;

    Ok(NormalizedBreadcrumb {
        trip_id,
        vehicle_id,
        tstamp,
        meters,
        latitude,
        longitude,
        processed_date,
        promoted: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_record_normalizes() {
        let crumb = validate_and_normalize(valid_raw(), today()).unwrap();

        assert_eq!(crumb.trip_id, 229_000_101);
        assert_eq!(crumb.vehicle_id, 3909);
        assert_eq!(crumb.meters, 5163.0);
        assert_eq!(crumb.latitude, 45.523);
        assert_eq!(crumb.longitude, -122.676);
        assert_eq!(crumb.processed_date, today());
        assert!(!crumb.promoted);
    }

    #[test]
    fn test_timestamp_merges_date_and_offset() {
        let raw = RawBreadcrumb {
            service_date: Some("01JAN2024:00:00:10".to_string()),
            act_time: Some(5),
            ..valid_raw()
        };

        let crumb = validate_and_normalize(raw, today()).unwrap();

        let expected = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 15)
            .unwrap();
        assert_eq!(crumb.tstamp, expected);
    }

    #[test]
    fn test_offset_past_midnight_rolls_into_next_day() {
        let raw = RawBreadcrumb {
            service_date: Some("31DEC2023:00:00:00".to_string()),
            act_time: Some(86_400 + 60),
            ..valid_raw()
        };

        let crumb = validate_and_normalize(raw, today()).unwrap();

        let expected = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 1, 0)
            .unwrap();
        assert_eq!(crumb.tstamp, expected);
    }

    #[test]
    fn test_each_required_field_rejects_when_missing() {
        let cases: Vec<(&str, RawBreadcrumb)> = vec![
            ("EVENT_NO_TRIP", RawBreadcrumb { trip_id: None, ..valid_raw() }),
            ("OPD_DATE", RawBreadcrumb { service_date: None, ..valid_raw() }),
            ("VEHICLE_ID", RawBreadcrumb { vehicle_id: None, ..valid_raw() }),
            ("METERS", RawBreadcrumb { meters: None, ..valid_raw() }),
            ("ACT_TIME", RawBreadcrumb { act_time: None, ..valid_raw() }),
            ("GPS_LONGITUDE", RawBreadcrumb { longitude: None, ..valid_raw() }),
            ("GPS_LATITUDE", RawBreadcrumb { latitude: None, ..valid_raw() }),
            ("GPS_HDOP", RawBreadcrumb { hdop: None, ..valid_raw() }),
            ("GPS_SATELLITES", RawBreadcrumb { satellites: None, ..valid_raw() }),
        ];

        for (field, raw) in cases {
            assert_eq!(
                validate_and_normalize(raw, today()),
                Err(RejectReason::MissingField(field)),
            );
        }
    }

    #[test]
    fn test_stop_event_id_is_optional() {
        let raw = RawBreadcrumb { stop_event_id: None, ..valid_raw() };
        assert!(validate_and_normalize(raw, today()).is_ok());
    }

    #[test]
    fn test_hdop_at_limit_passes_above_rejects() {
        let at_limit = RawBreadcrumb { hdop: Some(20.0), ..valid_raw() };
        assert!(validate_and_normalize(at_limit, today()).is_ok());

        let above = RawBreadcrumb { hdop: Some(20.1), ..valid_raw() };
        assert_eq!(
            validate_and_normalize(above, today()),
            Err(RejectReason::PoorAccuracy(20.1)),
        );
    }

    #[test]
    fn test_negative_values_reject() {
        let negative_meters = RawBreadcrumb { meters: Some(-1.0), ..valid_raw() };
        assert_eq!(
            validate_and_normalize(negative_meters, today()),
            Err(RejectReason::NegativeValue("METERS")),
        );

        let negative_act_time = RawBreadcrumb { act_time: Some(-5), ..valid_raw() };
        assert_eq!(
            validate_and_normalize(negative_act_time, today()),
            Err(RejectReason::NegativeValue("ACT_TIME")),
        );

        let negative_vehicle = RawBreadcrumb { vehicle_id: Some(-1), ..valid_raw() };
        assert_eq!(
            validate_and_normalize(negative_vehicle, today()),
            Err(RejectReason::NegativeValue("VEHICLE_ID")),
        );
    }

    #[test]
    fn test_zero_values_pass() {
        let raw = RawBreadcrumb {
            meters: Some(0.0),
            act_time: Some(0),
            vehicle_id: Some(0),
            ..valid_raw()
        };
        assert!(validate_and_normalize(raw, today()).is_ok());
    }

    #[test]
    fn test_unparsable_date_rejects_without_panic() {
        let raw = RawBreadcrumb {
            service_date: Some("2022-09-07 00:00:00".to_string()),
            ..valid_raw()
        };
        assert_eq!(
            validate_and_normalize(raw, today()),
            Err(RejectReason::UnparsableDate("2022-09-07 00:00:00".to_string())),
        );
    }

    #[test]
    fn test_absurd_offset_rejects() {
        let raw = RawBreadcrumb { act_time: Some(i64::MAX), ..valid_raw() };
        assert_eq!(
            validate_and_normalize(raw, today()),
            Err(RejectReason::InvalidTimestamp(i64::MAX)),
        );
    }

    #[test]
    fn test_wire_decode_treats_null_and_absent_alike() {
        let with_null: RawBreadcrumb =
            serde_json::from_str(r#"{"EVENT_NO_TRIP": null, "VEHICLE_ID": 3909}"#).unwrap();
        let with_absent: RawBreadcrumb =
            serde_json::from_str(r#"{"VEHICLE_ID": 3909}"#).unwrap();

        assert_eq!(with_null.trip_id, None);
        assert_eq!(with_absent.trip_id, None);
        assert_eq!(with_null.vehicle_id, Some(3909));
    }

    #[test]
    fn test_wire_decode_rejects_wrong_types() {
        let result: Result<RawBreadcrumb, _> =
            serde_json::from_str(r#"{"ACT_TIME": "not a number"}"#);
        assert!(result.is_err());
    }

    // Helper: a raw record that passes every validation.
    fn valid_raw() -> RawBreadcrumb {
        RawBreadcrumb {
            trip_id: Some(229_000_101),
            stop_event_id: Some(44),
            service_date: Some("07SEP2022:00:00:00".to_string()),
            vehicle_id: Some(3909),
            meters: Some(5163.0),
            act_time: Some(61_974),
            longitude: Some(-122.676),
            latitude: Some(45.523),
            hdop: Some(0.8),
            satellites: Some(12),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }
}
