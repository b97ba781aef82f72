//! Canonical outcome taxonomy and the classifier that produces it.

use serde::Serialize;

use crate::galaxy::RemoteStatus;

/// Intermediate remote state a timed-out job was stuck in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stall {
    New,
    Queued,
    Waiting,
    Running,
}

impl Stall {
    pub fn from_remote(status: RemoteStatus) -> Option<Self> {
        match status {
            RemoteStatus::New => Some(Stall::New),
            RemoteStatus::Queued => Some(Stall::Queued),
            RemoteStatus::Waiting => Some(Stall::Waiting),
            RemoteStatus::Running => Some(Stall::Running),
            RemoteStatus::Ok | RemoteStatus::Error => None,
        }
    }
}

/// Terminal classification of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Successful,
    Failed,
    /// Budget exhausted; `last` is the stalled state when one was observed.
    TimedOut { last: Option<Stall> },
    ConnectionError,
}

/// Flat reporting category of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Successful,
    Failed,
    Running,
    New,
    Queued,
    Waiting,
    Timeout,
    ConnectionError,
}

impl Bucket {
    /// Buckets that make up the percentage distribution of a cell.
    pub const DISTRIBUTION: [Bucket; 7] = [
        Bucket::Successful,
        Bucket::Failed,
        Bucket::Running,
        Bucket::Queued,
        Bucket::New,
        Bucket::Waiting,
        Bucket::Timeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Successful => "successful",
            Bucket::Failed => "failed",
            Bucket::Running => "running",
            Bucket::New => "new",
            Bucket::Queued => "queued",
            Bucket::Waiting => "waiting",
            Bucket::Timeout => "timeout",
            Bucket::ConnectionError => "connection_error",
        }
    }
}

impl Outcome {
    pub fn bucket(self) -> Bucket {
        match self {
            Outcome::Successful => Bucket::Successful,
            Outcome::Failed => Bucket::Failed,
            Outcome::TimedOut { last: None } => Bucket::Timeout,
            Outcome::TimedOut { last: Some(Stall::New) } => Bucket::New,
            Outcome::TimedOut { last: Some(Stall::Queued) } => Bucket::Queued,
            Outcome::TimedOut { last: Some(Stall::Waiting) } => Bucket::Waiting,
            Outcome::TimedOut { last: Some(Stall::Running) } => Bucket::Running,
            Outcome::ConnectionError => Bucket::ConnectionError,
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Successful
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.bucket().as_str())
    }
}

/// How the polling state machine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Succeeded,
    Failed,
    TimedOut,
    ConnectionLost,
}

/// Map a terminal polling state and the last observed remote status to an
/// [`Outcome`]. Pure and deterministic.
pub fn classify(terminal: Terminal, last: Option<RemoteStatus>) -> Outcome {
    match terminal {
        Terminal::Succeeded => Outcome::Successful,
        Terminal::Failed => Outcome::Failed,
        Terminal::TimedOut => Outcome::TimedOut {
            last: last.and_then(Stall::from_remote),
        },
        Terminal::ConnectionLost => Outcome::ConnectionError,
    }
}
