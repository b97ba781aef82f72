//! Benchmark execution and status aggregation.
//!
//! For every server and every endpoint of that server the runner submits one
//! test job ([`driver`]), drives it through upload and execution polling
//! ([`poll`]), classifies where it ended ([`outcome`]) and folds the result
//! into the per-cell tallies ([`aggregate`]).

pub mod aggregate;
pub mod driver;
pub mod outcome;
pub mod poll;
pub mod runner;

pub use aggregate::{
    AggregateCell, Aggregator, OutcomeCounts, RunSnapshot, EXIT_CONNECTION, EXIT_JOB_ERRORS,
    EXIT_SUCCESS,
};
pub use driver::{JobDriver, JobRun};
pub use outcome::{classify, Bucket, Outcome, Stall, Terminal};
pub use poll::{JobState, Phase};
pub use runner::{run, Interrupt, RunOptions};
