//! Reporting over a frozen [`RunSnapshot`].
//!
//! The "cherry" view derives per-cell percentages at read time; nothing here
//! mutates the snapshot.

pub mod render;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::DateString;
use crate::engine::{AggregateCell, Bucket, RunSnapshot};

pub use render::{render_markdown, render_page, render_summary, write_report};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("template rendering failed: {0}")]
    Render(#[from] askama::Error),

    #[error("could not serialize snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid report path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Output flavors selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Full page: summary table plus raw data.
    Page,
    /// Standalone summary table.
    Summary,
    Markdown,
}

impl ReportKind {
    pub fn extension(self) -> &'static str {
        match self {
            ReportKind::Page | ReportKind::Summary => "html",
            ReportKind::Markdown => "md",
        }
    }

    fn file_stem(self) -> &'static str {
        match self {
            ReportKind::Page | ReportKind::Markdown => "saber_report",
            ReportKind::Summary => "saber_summary",
        }
    }

    /// `$HOME/<stem>_<stamp>.<ext>`
    pub fn default_path(self, started_at: DateTime<Utc>) -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let stamp = started_at.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        Path::new(&home).join(format!("{}_{stamp}.{}", self.file_stem(), self.extension()))
    }

    /// Reject paths with the wrong extension or a missing parent directory.
    pub fn validate_path(self, path: &Path) -> Result<(), ReportError> {
        let invalid = |reason: String| ReportError::InvalidPath {
            path: path.to_path_buf(),
            reason,
        };
        if path.extension().and_then(|e| e.to_str()) != Some(self.extension()) {
            return Err(invalid(format!("expected a .{} file", self.extension())));
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                Err(invalid(format!("directory {} does not exist", parent.display())))
            }
            _ => Ok(()),
        }
    }
}

/// Derived per-cell figures for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cherry {
    pub server: String,
    pub endpoint: String,
    pub total: u32,
    /// Hard error: connection failure or no attempts at all.
    pub bb_errors: bool,
    pub successful: f64,
    pub failed: f64,
    pub running: f64,
    pub queued: f64,
    pub new: f64,
    pub waiting: f64,
    pub timeout: f64,
}

impl Cherry {
    pub fn from_cell(cell: &AggregateCell) -> Self {
        let pct = |bucket| cell.share(bucket).unwrap_or(0.0);
        Self {
            server: cell.server.clone(),
            endpoint: cell.endpoint.clone(),
            total: cell.attempts(),
            bb_errors: cell.has_connection_error || cell.attempts() == 0,
            successful: pct(Bucket::Successful),
            failed: pct(Bucket::Failed),
            running: pct(Bucket::Running),
            queued: pct(Bucket::Queued),
            new: pct(Bucket::New),
            waiting: pct(Bucket::Waiting),
            timeout: pct(Bucket::Timeout),
        }
    }

    pub fn share(&self, bucket: Bucket) -> f64 {
        match bucket {
            Bucket::Successful => self.successful,
            Bucket::Failed => self.failed,
            Bucket::Running => self.running,
            Bucket::Queued => self.queued,
            Bucket::New => self.new,
            Bucket::Waiting => self.waiting,
            Bucket::Timeout => self.timeout,
            Bucket::ConnectionError => 0.0,
        }
    }
}

/// Cherry view of every cell in snapshot order.
pub fn cherry(snapshot: &RunSnapshot) -> Vec<Cherry> {
    snapshot.cells.iter().map(Cherry::from_cell).collect()
}

/// Header date of a report: the run start, and the optional label.
pub fn date_line(snapshot: &RunSnapshot, date_string: Option<&DateString>) -> (String, Option<String>) {
    let started = snapshot
        .started_at
        .with_timezone(&Local)
        .format("%b %d, %Y %H:%M")
        .to_string();
    let label = match date_string {
        Some(DateString::Flag(true)) => Some(started.clone()),
        Some(DateString::Text(text)) if !text.is_empty() => Some(text.clone()),
        _ => None,
    };
    (started, label)
}

/// Pretty JSON of the snapshot, as printed by `run --json`.
pub fn to_json(snapshot: &RunSnapshot) -> Result<String, ReportError> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Aggregator, Outcome, Stall};
    use std::collections::BTreeMap;

    fn sample() -> RunSnapshot {
        let mut agg = Aggregator::new(Utc::now());
        agg.record("Main", "Default", Outcome::Successful);
        agg.record("Main", "Default", Outcome::TimedOut { last: Some(Stall::Queued) });
        agg.record("Main", "pulsar", Outcome::ConnectionError);
        agg.finish(BTreeMap::from([(
            "Main".to_string(),
            "https://usegalaxy.example".to_string(),
        )]))
    }

    #[test]
    fn test_cherry_percentages() {
        let rows = cherry(&sample());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].total, 2);
        assert!(!rows[0].bb_errors);
        assert_eq!(rows[0].successful, 50.0);
        assert_eq!(rows[0].queued, 50.0);
        assert!(rows[1].bb_errors);
        assert_eq!(rows[1].successful, 0.0);
    }

    #[test]
    fn test_validate_path() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ReportKind::Page.validate_path(&dir.path().join("r.html")).is_ok());
        assert!(ReportKind::Markdown.validate_path(&dir.path().join("r.html")).is_err());
        assert!(ReportKind::Summary
            .validate_path(&dir.path().join("missing").join("r.html"))
            .is_err());
    }

    #[test]
    fn test_default_path_extension() {
        let path = ReportKind::Summary.default_path(Utc::now());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("saber_summary_"));
        assert!(name.ends_with(".html"));
    }

    #[test]
    fn test_date_line_label() {
        let snap = sample();
        let (started, none) = date_line(&snap, Some(&DateString::Flag(false)));
        assert!(none.is_none());
        let (_, flagged) = date_line(&snap, Some(&DateString::Flag(true)));
        assert_eq!(flagged.as_deref(), Some(started.as_str()));
        let (_, text) = date_line(&snap, Some(&DateString::Text("weekly".to_string())));
        assert_eq!(text.as_deref(), Some("weekly"));
    }

    #[test]
    fn test_json_contains_cells() {
        let json = to_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cells"][1]["has_connection_error"], true);
        assert_eq!(value["urls"]["Main"], "https://usegalaxy.example");
    }
}
