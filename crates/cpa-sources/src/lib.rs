//! JSON metric sources and their reconciliation into unified per-(date, campaign) records.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use cpa_core::MetricRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cpa-sources";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Spend,
    Conversions,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spend => f.write_str("spend"),
            Self::Conversions => f.write_str("conversions"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpendRow {
    pub date: NaiveDate,
    pub campaign_id: String,
    pub spend: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversionRow {
    pub date: NaiveDate,
    pub campaign_id: String,
    pub conversions: u32,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: row {index}: {reason}", .path.display())]
    InvalidRow {
        path: PathBuf,
        index: usize,
        reason: String,
    },
}

/// Which keys survive reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Every key present in either source.
    #[default]
    Outer,
    /// Only keys with a spend row; conversions without spend are dropped.
    Left,
}

impl FromStr for JoinMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outer" | "full" => Ok(Self::Outer),
            "left" => Ok(Self::Left),
            other => Err(format!("unknown join mode `{other}` (expected outer|left)")),
        }
    }
}

/// Result of one read. An unavailable source is kept distinct from a source with no rows
/// so the caller decides whether to skip the day or abort.
#[derive(Debug)]
pub enum ReadOutcome {
    Loaded(Vec<MetricRecord>),
    Unavailable { source: SourceKind, error: SourceError },
}

impl ReadOutcome {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

pub trait MetricsReader: Send + Sync {
    fn read(&self) -> ReadOutcome;
}

#[derive(Debug, Clone)]
pub struct JsonMetricsReader {
    spend_path: PathBuf,
    conversions_path: PathBuf,
    join_mode: JoinMode,
}

impl JsonMetricsReader {
    pub fn new(spend_path: impl Into<PathBuf>, conversions_path: impl Into<PathBuf>) -> Self {
        Self {
            spend_path: spend_path.into(),
            conversions_path: conversions_path.into(),
            join_mode: JoinMode::default(),
        }
    }

    pub fn with_join_mode(mut self, join_mode: JoinMode) -> Self {
        self.join_mode = join_mode;
        self
    }

    pub fn spend_path(&self) -> &Path {
        &self.spend_path
    }

    pub fn conversions_path(&self) -> &Path {
        &self.conversions_path
    }
}

impl MetricsReader for JsonMetricsReader {
    fn read(&self) -> ReadOutcome {
        let spend = match load_spend_rows(&self.spend_path) {
            Ok(rows) => rows,
            Err(err) => return unavailable(SourceKind::Spend, err),
        };
        let conversions = match load_conversion_rows(&self.conversions_path) {
            Ok(rows) => rows,
            Err(err) => return unavailable(SourceKind::Conversions, err),
        };

        let records = reconcile(spend, conversions, self.join_mode);
        info!(
            records = records.len(),
            join_mode = ?self.join_mode,
            "read and merged metric sources"
        );
        ReadOutcome::Loaded(records)
    }
}

fn unavailable(source: SourceKind, error: SourceError) -> ReadOutcome {
    error!(%source, error = %error, "metric source unavailable");
    ReadOutcome::Unavailable { source, error }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    let data = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_spend_rows(path: impl AsRef<Path>) -> Result<Vec<SpendRow>, SourceError> {
    let path = path.as_ref();
    let rows: Vec<SpendRow> = read_json_file(path)?;
    for (index, row) in rows.iter().enumerate() {
        if !row.spend.is_finite() || row.spend < 0.0 {
            return Err(SourceError::InvalidRow {
                path: path.to_path_buf(),
                index,
                reason: format!("spend must be a non-negative number, got {}", row.spend),
            });
        }
        check_campaign_id(path, index, &row.campaign_id)?;
    }
    Ok(rows)
}

pub fn load_conversion_rows(path: impl AsRef<Path>) -> Result<Vec<ConversionRow>, SourceError> {
    let path = path.as_ref();
    let rows: Vec<ConversionRow> = read_json_file(path)?;
    for (index, row) in rows.iter().enumerate() {
        check_campaign_id(path, index, &row.campaign_id)?;
    }
    Ok(rows)
}

fn check_campaign_id(path: &Path, index: usize, campaign_id: &str) -> Result<(), SourceError> {
    if campaign_id.trim().is_empty() {
        return Err(SourceError::InvalidRow {
            path: path.to_path_buf(),
            index,
            reason: "campaign_id is empty".to_string(),
        });
    }
    Ok(())
}

/// Joins spend and conversion rows on (date, campaign_id), zero-filling the missing side.
/// Repeated keys within one source are summed. Output is sorted by key.
pub fn reconcile(
    spend: Vec<SpendRow>,
    conversions: Vec<ConversionRow>,
    join_mode: JoinMode,
) -> Vec<MetricRecord> {
    let mut merged: BTreeMap<(NaiveDate, String), (Option<f64>, u32)> = BTreeMap::new();

    for row in spend {
        let entry = merged.entry((row.date, row.campaign_id)).or_insert((None, 0));
        entry.0 = Some(entry.0.unwrap_or(0.0) + row.spend);
    }

    for row in conversions {
        let key = (row.date, row.campaign_id);
        match join_mode {
            JoinMode::Outer => {
                let entry = merged.entry(key).or_insert((None, 0));
                entry.1 = entry.1.saturating_add(row.conversions);
            }
            JoinMode::Left => {
                if let Some(entry) = merged.get_mut(&key) {
                    entry.1 = entry.1.saturating_add(row.conversions);
                }
            }
        }
    }

    merged
        .into_iter()
        .map(|((date, campaign_id), (spend, conversions))| {
            MetricRecord::new(date, campaign_id, spend.unwrap_or(0.0), conversions)
        })
        .collect()
}
