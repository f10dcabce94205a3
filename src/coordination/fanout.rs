//! Run a set of named units concurrently and collect one outcome per name
//!
//! Every unit is spawned as its own tokio task and reports exactly one
//! [`TaskOutcome`] over a bounded channel sized to the number of units. The
//! aggregator waits for every join handle before draining the channel, so a
//! slow unit is never dropped and a panicking one still yields a failure.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FatalFailure, PartialFailure, Phase, WorkerPanic};
use crate::telemetry::{Telemetry, TelemetryEvent};

type UnitFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// A named piece of work dispatched by a phase
pub struct Unit<T, E> {
    name: String,
    work: UnitFuture<T, E>,
}

impl<T, E> Unit<T, E> {
    pub fn new<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Box::pin(work),
        }
    }
}

/// Outcome reported by one unit
#[derive(Debug)]
pub struct TaskOutcome<T, E> {
    /// Position of the unit in dispatch order
    pub index: usize,
    pub name: String,
    pub result: Result<T, E>,
}

/// Per-phase aggregation of outcomes, in dispatch order
#[derive(Debug)]
pub struct PhaseResult<T, E> {
    pub successes: Vec<(String, T)>,
    pub failures: Vec<(String, E)>,
}

impl<T, E> Default for PhaseResult<T, E> {
    fn default() -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T, E> PhaseResult<T, E> {
    pub fn from_outcomes(mut outcomes: Vec<TaskOutcome<T, E>>) -> Self {
        outcomes.sort_by_key(|o| o.index);

        let mut result = Self::default();
        for outcome in outcomes {
            match outcome.result {
                Ok(value) => result.successes.push((outcome.name, value)),
                Err(err) => result.failures.push((outcome.name, err)),
            }
        }
        result
    }

    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn succeeded(&self) -> Vec<String> {
        self.successes.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn failed(&self) -> Vec<String> {
        self.failures.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// True when no unit succeeded, including when nothing was dispatched
    pub fn none_succeeded(&self) -> bool {
        self.successes.is_empty()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn failure(&self, name: &str) -> Option<&E> {
        self.failures
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, err)| err)
    }

    /// Non-fatal summary when some, but not all, units failed
    pub fn partial_failure(&self, phase: Phase) -> Option<PartialFailure> {
        if self.failures.is_empty() || self.successes.is_empty() {
            return None;
        }
        Some(PartialFailure {
            phase,
            total: self.total(),
            failed: self.failed(),
        })
    }
}

impl<T, E> PhaseResult<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    /// Convert into a fatal failure carrying the first failure in dispatch order
    pub fn into_fatal(self, phase: Phase) -> FatalFailure {
        let total = self.total();
        let failed = self.failed();
        let first: Box<dyn StdError + Send + Sync> = match self.failures.into_iter().next() {
            Some((_, err)) => Box::new(err),
            None => Box::new(NoUnits),
        };

        FatalFailure {
            phase,
            total,
            failed,
            first,
        }
    }
}

/// Raised as the cause of a fatal phase that dispatched nothing
#[derive(Debug)]
struct NoUnits;

impl fmt::Display for NoUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no units were dispatched")
    }
}

impl StdError for NoUnits {}

/// Run every unit concurrently and aggregate their outcomes
pub async fn run_all<T, E>(
    phase: Phase,
    units: Vec<Unit<T, E>>,
    telemetry: &Telemetry,
) -> PhaseResult<T, E>
where
    T: Send + 'static,
    E: From<WorkerPanic> + Send + 'static,
{
    let total = units.len();
    telemetry.emit(TelemetryEvent::PhaseStarted {
        phase,
        units: total,
    });

    let (tx, mut rx) = mpsc::channel::<TaskOutcome<T, E>>(total.max(1));
    let mut names = Vec::with_capacity(total);
    let mut handles = Vec::with_capacity(total);

    for (index, unit) in units.into_iter().enumerate() {
        names.push(unit.name.clone());
        let tx = tx.clone();
        let telemetry = telemetry.clone();

        handles.push(tokio::spawn(async move {
            let Unit { name, work } = unit;
            telemetry.emit(TelemetryEvent::UnitStarted {
                phase,
                name: name.clone(),
            });

            let started = Instant::now();
            let result = work.await;
            telemetry.emit(TelemetryEvent::UnitFinished {
                phase,
                name: name.clone(),
                ok: result.is_ok(),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            // Capacity equals the number of units, so this never waits
            let _ = tx.send(TaskOutcome {
                index,
                name,
                result,
            })
            .await;
        }));
    }
    drop(tx);

    let joined = join_all(handles).await;

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = rx.recv().await {
        outcomes.push(outcome);
    }

    for (index, join_result) in joined.into_iter().enumerate() {
        let Err(join_error) = join_result else {
            continue;
        };
        if outcomes.iter().any(|o| o.index == index) {
            continue;
        }

        let name = names[index].clone();
        telemetry.emit(TelemetryEvent::UnitFinished {
            phase,
            name: name.clone(),
            ok: false,
            duration_ms: 0,
        });
        outcomes.push(TaskOutcome {
            index,
            name: name.clone(),
            result: Err(E::from(WorkerPanic {
                name,
                message: join_error.to_string(),
            })),
        });
    }

    debug!(%phase, total, "collected unit outcomes");
    PhaseResult::from_outcomes(outcomes)
}
