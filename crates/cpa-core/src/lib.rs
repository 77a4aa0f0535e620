//! Core domain model for campaign CPA sync: metric records, the CPA rule,
//! date ranges and the per-run summary accumulator.

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cpa-core";

/// Date format used by sources, the CLI and log lines.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Unified per-(date, campaign) row handed from the reader to the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub date: NaiveDate,
    pub campaign_id: String,
    pub spend: f64,
    pub conversions: u32,
    pub cpa: Option<f64>,
}

impl MetricRecord {
    pub fn new(date: NaiveDate, campaign_id: impl Into<String>, spend: f64, conversions: u32) -> Self {
        Self {
            date,
            campaign_id: campaign_id.into(),
            spend,
            conversions,
            cpa: None,
        }
    }
}

/// Cost per acquisition. Undefined when there were no conversions, whatever was spent;
/// zero spend over positive conversions is a valid `0.0`.
pub fn calculate_cpa(spend: f64, conversions: u32) -> Option<f64> {
    if conversions == 0 {
        return None;
    }
    Some(spend / f64::from(conversions))
}

pub fn derive_cpa(mut record: MetricRecord) -> MetricRecord {
    record.cpa = calculate_cpa(record.spend, record.conversions);
    record
}

pub fn derive_batch(records: Vec<MetricRecord>) -> Vec<MetricRecord> {
    records.into_iter().map(derive_cpa).collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("invalid date `{input}`: expected YYYY-MM-DD")]
    InvalidDate { input: String },
    #[error("start date {start} is after end date {end}")]
    StartAfterEnd { start: NaiveDate, end: NaiveDate },
}

/// Inclusive, ascending range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::StartAfterEnd { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, DateRangeError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// `lookback_days` full days before `end`, plus `end` itself.
    pub fn trailing(end: NaiveDate, lookback_days: u64) -> Self {
        let start = end.checked_sub_days(Days::new(lookback_days)).unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn day_count(&self) -> usize {
        let span = (self.end - self.start).num_days();
        usize::try_from(span).map_or(usize::MAX, |days| days.saturating_add(1))
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |day| *day <= end)
    }
}

pub fn parse_date(input: &str) -> Result<NaiveDate, DateRangeError> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT).map_err(|_| DateRangeError::InvalidDate {
        input: input.to_string(),
    })
}

/// Run-scoped accumulator of processed rows and the CPA values they defined.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub total_records: usize,
    pub cpa_values: Vec<f64>,
}

impl ProcessingSummary {
    pub fn record_batch(&mut self, records: &[MetricRecord]) {
        self.total_records += records.len();
        self.cpa_values.extend(records.iter().filter_map(|r| r.cpa));
    }

    pub fn average_cpa(&self) -> Option<f64> {
        if self.cpa_values.is_empty() {
            return None;
        }
        let total: f64 = self.cpa_values.iter().sum();
        Some(total / self.cpa_values.len() as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.total_records == 0
    }
}
