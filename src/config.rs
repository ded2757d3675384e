//! Runtime configuration, read from the environment (with `.env` support in
//! the binary).

use anyhow::{Context, Result, anyhow, ensure};
use std::str::FromStr;
use std::time::Duration;

use crate::store::TableNames;

/// Tunables for one pipeline run.
///
/// Defaults: flush at 1000 records, drain after 4500 seconds, warn past 1000
/// rejected records, 8 delivery workers, standard table names, no webhook.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub flush_threshold: usize,
    pub drain_timeout: Duration,
    pub reject_high_water: u64,
    pub worker_concurrency: usize,
    pub tables: TableNames,
    pub webhook_url: Option<String>,
    pub webhook_mention: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            flush_threshold: 1000,
            drain_timeout: Duration::from_secs(4500),
            reject_high_water: 1000,
            worker_concurrency: 8,
            tables: TableNames::default(),
            webhook_url: None,
            webhook_mention: None,
        }
    }
}

impl PipelineConfig {
    /// Builds the config from environment overrides on top of the defaults.
    ///
    /// # Errors
    ///
    /// Fails on an unparsable numeric variable or a zero threshold/worker
    /// count.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = PipelineConfig::default();

        if let Some(v) = parse_setting(lookup("FLUSH_THRESHOLD"), "FLUSH_THRESHOLD")? {
            config.flush_threshold = v;
        }
        if let Some(secs) = parse_setting::<u64>(lookup("DRAIN_TIMEOUT_SECS"), "DRAIN_TIMEOUT_SECS")?
        {
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_setting(lookup("REJECT_WARN_MARK"), "REJECT_WARN_MARK")? {
            config.reject_high_water = v;
        }
        if let Some(v) = parse_setting(lookup("WORKER_CONCURRENCY"), "WORKER_CONCURRENCY")? {
            config.worker_concurrency = v;
        }
        if let Some(v) = lookup("RAW_TABLE") {
            config.tables.raw = v;
        }
        if let Some(v) = lookup("TRIP_TABLE") {
            config.tables.trip = v;
        }
        if let Some(v) = lookup("BREADCRUMB_TABLE") {
            config.tables.breadcrumb = v;
        }
        config.webhook_url = lookup("OPS_WEBHOOK_URL").filter(|v| !v.is_empty());
        config.webhook_mention = lookup("OPS_WEBHOOK_MENTION").filter(|v| !v.is_empty());

        ensure!(config.flush_threshold > 0, "FLUSH_THRESHOLD must be positive");
        ensure!(
            config.worker_concurrency > 0,
            "WORKER_CONCURRENCY must be positive"
        );
        Ok(config)
    }
}

fn parse_setting<T>(raw: Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw
        .parse()
        .map_err(|e| anyhow!("{e}"))
        .with_context(|| format!("invalid {name} value {raw:?}"))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_hold_without_overrides() {
        let config = PipelineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.flush_threshold, 1000);
        assert_eq!(config.drain_timeout, Duration::from_secs(4500));
        assert_eq!(config.reject_high_water, 1000);
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.tables.raw, "raw_breadcrumb");
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("FLUSH_THRESHOLD", "500"),
            ("DRAIN_TIMEOUT_SECS", "60"),
            ("REJECT_WARN_MARK", "10"),
            ("WORKER_CONCURRENCY", "2"),
            ("RAW_TABLE", "staging_raw"),
            ("OPS_WEBHOOK_URL", "https://example.invalid/hook"),
        ]))
        .unwrap();

        assert_eq!(config.flush_threshold, 500);
        assert_eq!(config.drain_timeout, Duration::from_secs(60));
        assert_eq!(config.reject_high_water, 10);
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.tables.raw, "staging_raw");
        assert_eq!(config.tables.trip, "trip");
        assert_eq!(
            config.webhook_url.as_deref(),
            Some("https://example.invalid/hook")
        );
    }

    #[test]
    fn test_unparsable_number_names_the_variable() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("FLUSH_THRESHOLD", "lots")]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("FLUSH_THRESHOLD"));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let result = PipelineConfig::from_lookup(lookup_from(&[("WORKER_CONCURRENCY", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_webhook_url_counts_as_unset() {
        let config =
            PipelineConfig::from_lookup(lookup_from(&[("OPS_WEBHOOK_URL", "")])).unwrap();
        assert!(config.webhook_url.is_none());
    }
}
