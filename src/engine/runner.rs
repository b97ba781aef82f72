//! Run orchestration across all configured (server, endpoint) pairs.

use std::future::Future;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

use super::aggregate::{Aggregator, RunSnapshot};
use super::driver::{JobDriver, JobRun};
use super::outcome::{classify, Outcome, Terminal};
use super::poll::{self, JobState};
use crate::config::{Configuration, ConfigurationError, Endpoint, Server};
use crate::galaxy::OrchestrationClient;

/// Exit status after a second interrupt, as a shell reports SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Benchmark servers concurrently. Endpoints of one server always run in
    /// sequence.
    pub parallel_servers: bool,
}

/// Cancellation signal checked between and during job runs.
#[derive(Debug, Clone)]
pub struct Interrupt(watch::Receiver<bool>);

impl Interrupt {
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self(receiver)
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    /// Fires on the first Ctrl-C. A second Ctrl-C exits the process right
    /// away, even in the middle of clean-up.
    pub fn on_ctrl_c() -> Self {
        Self::on_signal(tokio::signal::ctrl_c, || {
            warn!("second interrupt, exiting without clean-up");
            std::process::exit(EXIT_INTERRUPTED);
        })
    }

    /// Fires on the first `signal`; `on_repeat` runs on the second one.
    pub fn on_signal<S, F, R>(mut signal: S, on_repeat: R) -> Self
    where
        S: FnMut() -> F + Send + 'static,
        F: Future<Output = std::io::Result<()>> + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if signal().await.is_err() {
                return;
            }
            warn!("interrupt received, finishing with partial results");
            let _ = tx.send(true);
            if signal().await.is_ok() {
                on_repeat();
            }
        });
        Self(rx)
    }

    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the signal fires; pends forever if the sender is gone.
    pub async fn fired(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Submit, poll, classify and record one pair.
async fn run_pair(client: &dyn OrchestrationClient, server: &Server, endpoint: &Endpoint) -> JobRun {
    let mut run = JobRun::new(server, endpoint);
    let driver = JobDriver::new(client);

    let outcome = match driver.submit(server, endpoint, &mut run).await {
        Err(_) => Outcome::ConnectionError,
        Ok(mut handle) => {
            let report = poll::drive(driver.client(), &mut handle, &endpoint.timing, run.submitted_at).await;
            if !matches!(report.state, JobState::ConnectionLost { .. }) {
                driver.finalize(server, &handle).await;
            }
            run.observed = report.observed;
            let (terminal, last) = report
                .state
                .terminal()
                .unwrap_or((Terminal::TimedOut, run.last_observed()));
            classify(terminal, last)
        }
    };
    info!(outcome = %outcome, "job finished");
    run.outcome = Some(outcome);
    run
}

async fn run_server(
    client: &dyn OrchestrationClient,
    server: &Server,
    mut interrupt: Interrupt,
) -> RunSnapshot {
    let mut aggregator = Aggregator::new(Utc::now());
    let mut had_failures = false;

    for endpoint in &server.endpoints {
        if interrupt.is_set() {
            break;
        }
        let span = info_span!("endpoint", endpoint = %endpoint.name);
        tokio::select! {
            biased;
            _ = interrupt.fired() => {
                warn!(endpoint = %endpoint.name, "job abandoned");
                break;
            }
            run = run_pair(client, server, endpoint).instrument(span) => {
                let outcome = run.outcome.unwrap_or(Outcome::ConnectionError);
                had_failures |= !outcome.is_success();
                aggregator.record(&run.server, &run.endpoint, outcome);
            }
        }
    }

    if let Err(e) = client.clean_up(server, had_failures).await {
        warn!(error = %e, "clean-up incomplete");
    }
    aggregator.finish(std::iter::once((server.name.clone(), server.url.clone())).collect())
}

/// Benchmark every configured pair and return the frozen snapshot.
///
/// Only configuration problems abort the run; every per-pair failure becomes
/// an outcome. An interrupt stops the run early and keeps completed cells.
pub async fn run(
    config: &Configuration,
    client: &dyn OrchestrationClient,
    options: RunOptions,
    interrupt: Interrupt,
) -> Result<RunSnapshot, ConfigurationError> {
    if config.servers.is_empty() {
        return Err(ConfigurationError::NoServers);
    }
    let mut snapshot = Aggregator::new(Utc::now()).finish(config.urls());
    info!(run_id = %snapshot.run_id, servers = config.servers.len(), "benchmark started");

    let partials = if options.parallel_servers {
        join_all(config.servers.iter().map(|server| {
            run_server(client, server, interrupt.clone())
                .instrument(info_span!("server", server = %server.name))
        }))
        .await
    } else {
        let mut partials = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            if interrupt.is_set() {
                break;
            }
            let partial = run_server(client, server, interrupt.clone())
                .instrument(info_span!("server", server = %server.name))
                .await;
            partials.push(partial);
        }
        partials
    };

    for partial in partials {
        snapshot.merge(partial);
    }
    snapshot.finished_at = Utc::now();
    info!(run_id = %snapshot.run_id, cells = snapshot.cells.len(), "benchmark finished");
    Ok(snapshot)
}
