//! Data-quality checks over the derived trip and breadcrumb tables.
//!
//! Every check appends one [`CheckResult`] to the tester, in call order. A
//! check that cannot run, because the column is missing or holds the wrong
//! kind of data, records an errored outcome instead of propagating; a bad
//! check never stops the rest of the battery.

mod dataset;

pub use dataset::{Dataset, Value};

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use tracing::{error, info, warn};

use crate::record::{BreadcrumbRow, SERVICE_DATE_FORMAT, TripRow};

/// Upper bound for plausible vehicle speed, meters per second.
pub const MAX_REASONABLE_SPEED: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckOutcome {
    Passed,
    Failed,
    Errored,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub outcome: CheckOutcome,
    pub dataset: String,
    pub check: &'static str,
    pub message: String,
    pub value: Option<f64>,
}

#[derive(Default)]
pub struct QualityTester {
    results: Vec<CheckResult>,
}

impl QualityTester {
    pub fn new() -> Self {
        QualityTester::default()
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    /// Counts results per outcome as (passed, failed, errored).
    pub fn outcome_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for r in &self.results {
            match r.outcome {
                CheckOutcome::Passed => counts.0 += 1,
                CheckOutcome::Failed => counts.1 += 1,
                CheckOutcome::Errored => counts.2 += 1,
            }
        }
        counts
    }

    /// Fails when a column holds any repeated value.
    pub fn test_unique_column(&mut self, dataset: &Dataset, column: &str) {
        let run = || -> Result<(bool, String, f64)> {
            let values = dataset.column(column)?;
            let distinct: HashSet<&Value> = values.iter().copied().collect();
            let non_unique = values.len() - distinct.len();
            Ok((
                non_unique > 0,
                format!("Found {non_unique} non-unique values in column {column}"),
                non_unique as f64,
            ))
        };
        self.record(dataset.name(), "unique_column", run());
    }

    /// Fails when any row is repeated in full.
    pub fn test_duplicate_rows(&mut self, dataset: &Dataset) {
        let run = || -> Result<(bool, String, f64)> {
            let distinct: HashSet<&Vec<Value>> = dataset.rows().iter().collect();
            let duplicates = dataset.len() - distinct.len();
            Ok((
                duplicates > 0,
                format!("Found {duplicates} duplicate rows"),
                duplicates as f64,
            ))
        };
        self.record(dataset.name(), "duplicate_rows", run());
    }

    /// Fails when a numeric column holds any negative value. Nulls are not
    /// negative; non-numeric cells error the check.
    pub fn test_for_negative_values(&mut self, dataset: &Dataset, column: &str) {
        let run = || -> Result<(bool, String, f64)> {
            let negatives = numeric_column(dataset, column)?
                .into_iter()
                .flatten()
                .filter(|v| *v < 0.0)
                .count();
            Ok((
                negatives > 0,
                format!("Found {negatives} negative values in column {column}"),
                negatives as f64,
            ))
        };
        self.record(dataset.name(), "negative_values", run());
    }

    /// Fails when a column holds any null.
    pub fn test_for_missing_values(&mut self, dataset: &Dataset, column: &str) {
        let run = || -> Result<(bool, String, f64)> {
            let missing = dataset
                .column(column)?
                .iter()
                .filter(|v| v.is_null())
                .count();
            Ok((
                missing > 0,
                format!("Found {missing} missing values in column {column}"),
                missing as f64,
            ))
        };
        self.record(dataset.name(), "missing_values", run());
    }

    /// Fails when any value sits at or above the threshold.
    pub fn test_value_above_threshold(&mut self, dataset: &Dataset, column: &str, threshold: f64) {
        let run = || -> Result<(bool, String, f64)> {
            let count = numeric_column(dataset, column)?
                .into_iter()
                .flatten()
                .filter(|v| *v >= threshold)
                .count();
            Ok((
                count > 0,
                format!("Found {count} values at or above {threshold} in column {column}"),
                count as f64,
            ))
        };
        self.record(dataset.name(), "values_above_threshold", run());
    }

    /// Fails when the change between any two consecutive non-null values
    /// exceeds `max_pct` percent of the earlier value. A zero-to-zero pair
    /// has no defined percentage and is skipped; a zero-to-nonzero pair is
    /// an infinite change and exceeds any bound. Fewer than two comparable
    /// values passes with 0.
    pub fn test_for_percentage_difference(&mut self, dataset: &Dataset, column: &str, max_pct: f64) {
        let run = || -> Result<(bool, String, f64)> {
            let values = numeric_column(dataset, column)?;
            let mut max_change: Option<(f64, f64, f64)> = None;
            for pair in values.windows(2) {
                let (Some(prev), Some(cur)) = (pair[0], pair[1]) else {
                    continue;
                };
                let pct = ((cur - prev) / prev * 100.0).abs();
                // NaN here means 0/0 or a NaN operand; it would also poison
                // every later `>` comparison, so it never enters the max.
                if pct.is_nan() {
                    continue;
                }
                if max_change.is_none_or(|(best, _, _)| pct > best) {
                    max_change = Some((pct, prev, cur));
                }
            }
            Ok(match max_change {
                Some((pct, from, to)) => (
                    pct > max_pct,
                    format!("Found max percentage change of {pct:.2}% in column {column} ({from} to {to})"),
                    pct,
                ),
                None => (
                    false,
                    format!("No consecutive value pairs to compare in column {column}"),
                    0.0,
                ),
            })
        };
        self.record(dataset.name(), "percentage_difference", run());
    }

    /// Fails when a text column holds any value that does not parse with the
    /// service date format. Non-text cells error the check.
    pub fn test_for_malformed_dates(&mut self, dataset: &Dataset, column: &str) {
        let run = || -> Result<(bool, String, f64)> {
            let mut malformed = 0usize;
            for value in dataset.column(column)? {
                match value {
                    Value::Text(s) => {
                        if NaiveDateTime::parse_from_str(s, SERVICE_DATE_FORMAT).is_err() {
                            malformed += 1;
                        }
                    }
                    other => bail!("non-text value {other} in date column {column}"),
                }
            }
            Ok((
                malformed > 0,
                format!("Found {malformed} malformed dates in column {column}"),
                malformed as f64,
            ))
        };
        self.record(dataset.name(), "malformed_dates", run());
    }

    /// Fails when a column holds more than one distinct value. Used on the
    /// service date of a single day's intake.
    pub fn test_for_single_date(&mut self, dataset: &Dataset, column: &str) {
        let run = || -> Result<(bool, String, f64)> {
            let distinct: HashSet<&Value> = dataset.column(column)?.into_iter().collect();
            let count = distinct.len();
            Ok((
                count > 1,
                format!("Found {count} distinct dates in column {column}"),
                count as f64,
            ))
        };
        self.record(dataset.name(), "single_date", run());
    }

    pub fn log_results(&self) {
        for r in &self.results {
            match r.outcome {
                CheckOutcome::Passed => {
                    info!(dataset = %r.dataset, check = r.check, message = %r.message, "Check passed");
                }
                CheckOutcome::Failed => {
                    error!(dataset = %r.dataset, check = r.check, message = %r.message, "Check failed");
                }
                CheckOutcome::Errored => {
                    warn!(dataset = %r.dataset, check = r.check, message = %r.message, "Check errored");
                }
            }
        }
    }

    /// Writes the accumulated results, in run order, to a CSV report.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating quality report {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);
        for result in &self.results {
            writer.serialize(result)?;
        }
        writer.flush()?;
        info!(path = %path.display(), checks = self.results.len(), "Quality report written");
        Ok(())
    }

    fn record(&mut self, dataset: &str, check: &'static str, run: Result<(bool, String, f64)>) {
        let result = match run {
            Ok((failed, message, value)) => CheckResult {
                outcome: if failed {
                    CheckOutcome::Failed
                } else {
                    CheckOutcome::Passed
                },
                dataset: dataset.to_string(),
                check,
                message,
                value: Some(value),
            },
            Err(e) => CheckResult {
                outcome: CheckOutcome::Errored,
                dataset: dataset.to_string(),
                check,
                message: format!("{e:#}"),
                value: None,
            },
        };
        self.results.push(result);
    }
}

/// The post-promotion battery over both derived tables.
pub fn standard_battery(trips: &Dataset, breadcrumbs: &Dataset) -> QualityTester {
    let mut tester = QualityTester::new();
    tester.test_unique_column(trips, "trip_id");
    tester.test_duplicate_rows(trips);
    tester.test_for_negative_values(trips, "trip_id");
    tester.test_for_missing_values(trips, "trip_id");
    tester.test_for_missing_values(trips, "vehicle_id");
    tester.test_duplicate_rows(breadcrumbs);
    tester.test_for_negative_values(breadcrumbs, "speed");
    tester.test_value_above_threshold(breadcrumbs, "speed", MAX_REASONABLE_SPEED);
    tester.test_for_missing_values(breadcrumbs, "tstamp");
    tester.test_for_missing_values(breadcrumbs, "trip_id");
    tester.test_for_missing_values(breadcrumbs, "speed");
    tester
}

pub fn trip_dataset(rows: &[TripRow]) -> Dataset {
    let mut ds = Dataset::new(
        "trip",
        &["trip_id", "route_id", "vehicle_id", "service_key", "direction"],
    );
    for row in rows {
        ds.push_row(vec![
            Value::Int(row.trip_id),
            row.route_id.clone().map_or(Value::Null, Value::Text),
            Value::Int(row.vehicle_id),
            row.service_key.clone().map_or(Value::Null, Value::Text),
            row.direction.clone().map_or(Value::Null, Value::Text),
        ]);
    }
    ds
}

pub fn breadcrumb_dataset(rows: &[BreadcrumbRow]) -> Dataset {
    let mut ds = Dataset::new(
        "breadcrumb",
        &["tstamp", "latitude", "longitude", "speed", "trip_id"],
    );
    for row in rows {
        ds.push_row(vec![
            Value::Text(row.tstamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            Value::Float(row.latitude),
            Value::Float(row.longitude),
            row.speed.map_or(Value::Null, Value::Float),
            Value::Int(row.trip_id),
        ]);
    }
    ds
}

fn numeric_column(dataset: &Dataset, column: &str) -> Result<Vec<Option<f64>>> {
    let mut out = Vec::new();
    for value in dataset.column(column)? {
        if value.is_null() {
            out.push(None);
        } else {
            let number = value
                .as_f64()
                .with_context(|| format!("non-numeric value {value} in column {column}"))?;
            out.push(Some(number));
        }
    }
    Ok(out)
}
