//! Per-(server, endpoint) outcome tallies and the run snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::outcome::{Bucket, Outcome};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CONNECTION: i32 = 3;
pub const EXIT_JOB_ERRORS: i32 = 42;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub successful: u32,
    pub failed: u32,
    pub running: u32,
    pub new: u32,
    pub queued: u32,
    pub waiting: u32,
    pub timeout: u32,
    pub connection_error: u32,
}

impl OutcomeCounts {
    fn slot(&mut self, bucket: Bucket) -> &mut u32 {
        match bucket {
            Bucket::Successful => &mut self.successful,
            Bucket::Failed => &mut self.failed,
            Bucket::Running => &mut self.running,
            Bucket::New => &mut self.new,
            Bucket::Queued => &mut self.queued,
            Bucket::Waiting => &mut self.waiting,
            Bucket::Timeout => &mut self.timeout,
            Bucket::ConnectionError => &mut self.connection_error,
        }
    }

    pub fn get(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Successful => self.successful,
            Bucket::Failed => self.failed,
            Bucket::Running => self.running,
            Bucket::New => self.new,
            Bucket::Queued => self.queued,
            Bucket::Waiting => self.waiting,
            Bucket::Timeout => self.timeout,
            Bucket::ConnectionError => self.connection_error,
        }
    }

    pub fn total(&self) -> u32 {
        self.successful
            + self.failed
            + self.running
            + self.new
            + self.queued
            + self.waiting
            + self.timeout
            + self.connection_error
    }

    fn add(&mut self, other: &OutcomeCounts) {
        for bucket in Bucket::DISTRIBUTION.into_iter().chain([Bucket::ConnectionError]) {
            *self.slot(bucket) += other.get(bucket);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateCell {
    pub server: String,
    pub endpoint: String,
    pub counts: OutcomeCounts,
    /// Once set, the cell is a hard error and has no distribution.
    pub has_connection_error: bool,
}

impl AggregateCell {
    fn new(server: &str, endpoint: &str) -> Self {
        Self {
            server: server.to_string(),
            endpoint: endpoint.to_string(),
            counts: OutcomeCounts::default(),
            has_connection_error: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.counts.total()
    }

    /// Share of attempts in `bucket`, in percent. `None` for hard-error cells
    /// and cells without attempts.
    pub fn share(&self, bucket: Bucket) -> Option<f64> {
        let total = self.attempts();
        if self.has_connection_error || total == 0 {
            return None;
        }
        Some(f64::from(self.counts.get(bucket)) * 100.0 / f64::from(total))
    }

    fn record(&mut self, outcome: Outcome) {
        let bucket = outcome.bucket();
        *self.counts.slot(bucket) += 1;
        if bucket == Bucket::ConnectionError {
            self.has_connection_error = true;
        }
    }

    fn has_job_errors(&self) -> bool {
        Bucket::DISTRIBUTION
            .into_iter()
            .filter(|b| *b != Bucket::Successful)
            .any(|b| self.counts.get(b) > 0)
    }
}

/// Frozen result of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Server name to base URL.
    pub urls: BTreeMap<String, String>,
    /// In configuration order: servers, then endpoints.
    pub cells: Vec<AggregateCell>,
}

impl RunSnapshot {
    pub fn cell(&self, server: &str, endpoint: &str) -> Option<&AggregateCell> {
        self.cells
            .iter()
            .find(|c| c.server == server && c.endpoint == endpoint)
    }

    /// Fold a partial snapshot (one server task) into this one.
    pub fn merge(&mut self, other: RunSnapshot) {
        for cell in other.cells {
            match self
                .cells
                .iter_mut()
                .find(|c| c.server == cell.server && c.endpoint == cell.endpoint)
            {
                Some(existing) => {
                    existing.counts.add(&cell.counts);
                    existing.has_connection_error |= cell.has_connection_error;
                }
                None => self.cells.push(cell),
            }
        }
        self.urls.extend(other.urls);
        self.started_at = self.started_at.min(other.started_at);
        self.finished_at = self.finished_at.max(other.finished_at);
    }

    pub fn has_connection_error(&self) -> bool {
        self.cells.iter().any(|c| c.has_connection_error)
    }

    /// Connection errors win over failed or stalled jobs.
    pub fn exit_code(&self) -> i32 {
        if self.has_connection_error() {
            EXIT_CONNECTION
        } else if self.cells.iter().any(AggregateCell::has_job_errors) {
            EXIT_JOB_ERRORS
        } else {
            EXIT_SUCCESS
        }
    }
}

/// Accumulates recorded outcomes for one run.
#[derive(Debug, Clone)]
pub struct Aggregator {
    started_at: DateTime<Utc>,
    cells: Vec<AggregateCell>,
}

impl Aggregator {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            cells: Vec::new(),
        }
    }

    pub fn record(&mut self, server: &str, endpoint: &str, outcome: Outcome) {
        let index = match self
            .cells
            .iter()
            .position(|c| c.server == server && c.endpoint == endpoint)
        {
            Some(index) => index,
            None => {
                self.cells.push(AggregateCell::new(server, endpoint));
                self.cells.len() - 1
            }
        };
        self.cells[index].record(outcome);
    }

    pub fn cell(&self, server: &str, endpoint: &str) -> Option<&AggregateCell> {
        self.cells
            .iter()
            .find(|c| c.server == server && c.endpoint == endpoint)
    }

    pub fn finish(self, urls: BTreeMap<String, String>) -> RunSnapshot {
        RunSnapshot {
            run_id: Uuid::new_v4(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            urls,
            cells: self.cells,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::outcome::Stall;

    fn snapshot(records: &[(&str, &str, Outcome)]) -> RunSnapshot {
        let mut agg = Aggregator::new(Utc::now());
        for (server, endpoint, outcome) in records {
            agg.record(server, endpoint, *outcome);
        }
        agg.finish(BTreeMap::new())
    }

    #[test]
    fn test_counts_sum_to_attempts() {
        let snap = snapshot(&[
            ("A", "Default", Outcome::Successful),
            ("A", "Default", Outcome::Failed),
            ("A", "Default", Outcome::TimedOut { last: Some(Stall::Queued) }),
            ("A", "Default", Outcome::ConnectionError),
            ("A", "pulsar", Outcome::TimedOut { last: None }),
        ]);
        let cell = snap.cell("A", "Default").unwrap();
        assert_eq!(cell.attempts(), 4);
        assert_eq!(cell.counts.queued, 1);
        assert_eq!(snap.cell("A", "pulsar").unwrap().counts.timeout, 1);
    }

    #[test]
    fn test_connection_error_flag_is_monotonic() {
        let mut agg = Aggregator::new(Utc::now());
        agg.record("A", "x", Outcome::ConnectionError);
        assert!(agg.cell("A", "x").unwrap().has_connection_error);
        agg.record("A", "x", Outcome::Successful);
        agg.record("A", "x", Outcome::Successful);
        assert!(agg.cell("A", "x").unwrap().has_connection_error);
    }

    #[test]
    fn test_share_is_derived() {
        let snap = snapshot(&[
            ("A", "x", Outcome::Successful),
            ("A", "x", Outcome::Successful),
            ("A", "x", Outcome::Successful),
            ("A", "x", Outcome::Failed),
        ]);
        let cell = snap.cell("A", "x").unwrap();
        assert_eq!(cell.share(Bucket::Successful), Some(75.0));
        assert_eq!(cell.share(Bucket::Failed), Some(25.0));
        assert_eq!(cell.share(Bucket::Running), Some(0.0));

        let broken = snapshot(&[("A", "y", Outcome::ConnectionError)]);
        assert_eq!(broken.cell("A", "y").unwrap().share(Bucket::Successful), None);
    }

    #[test]
    fn test_cells_keep_insertion_order() {
        let snap = snapshot(&[
            ("B", "z", Outcome::Successful),
            ("A", "y", Outcome::Successful),
            ("B", "z", Outcome::Successful),
        ]);
        let keys: Vec<_> = snap.cells.iter().map(|c| (c.server.as_str(), c.endpoint.as_str())).collect();
        assert_eq!(keys, vec![("B", "z"), ("A", "y")]);
    }

    #[test]
    fn test_merge_combines_partials() {
        let mut main = snapshot(&[("A", "x", Outcome::Successful)]);
        let mut other = snapshot(&[
            ("A", "x", Outcome::ConnectionError),
            ("B", "Default", Outcome::Failed),
        ]);
        other.urls.insert("B".to_string(), "https://b.example".to_string());
        main.merge(other);

        let merged = main.cell("A", "x").unwrap();
        assert_eq!(merged.attempts(), 2);
        assert!(merged.has_connection_error);
        assert_eq!(main.cells.len(), 2);
        assert_eq!(main.urls["B"], "https://b.example");
    }

    #[test]
    fn test_exit_code_precedence() {
        assert_eq!(snapshot(&[("A", "x", Outcome::Successful)]).exit_code(), EXIT_SUCCESS);
        assert_eq!(
            snapshot(&[("A", "x", Outcome::TimedOut { last: Some(Stall::Running) })]).exit_code(),
            EXIT_JOB_ERRORS
        );
        assert_eq!(
            snapshot(&[
                ("A", "x", Outcome::Failed),
                ("A", "y", Outcome::ConnectionError),
            ])
            .exit_code(),
            EXIT_CONNECTION
        );
    }
}
