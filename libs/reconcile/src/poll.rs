//! Cancellable polling toward a target state.
//!
//! [`poll`] returns a lazy stream of [`ConvergenceEvent`]s. Each item is one
//! observation of the resource; the stream ends after the target is met, the
//! resource diverges, the deadline passes, or the caller cancels. A fresh
//! call starts a fresh sequence.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{ConvergenceStatus, ReconcileError, DEFAULT_POLL_DEADLINE, DEFAULT_POLL_INTERVAL};

/// What the provider reports for a resource at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<S> {
    /// The resource exists in the given state.
    Present(S),

    /// The provider no longer knows the resource.
    Absent,
}

impl<S> Observation<S> {
    /// Returns the observed state, if the resource exists.
    pub fn present(&self) -> Option<&S> {
        match self {
            Self::Present(state) => Some(state),
            Self::Absent => None,
        }
    }

    /// Consumes the observation and returns the state, if any.
    pub fn into_present(self) -> Option<S> {
        match self {
            Self::Present(state) => Some(state),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Poll timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait between two consecutive polls (not before the first one).
    pub interval: Duration,

    /// Total time budget measured from the call to [`poll`].
    pub deadline: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            deadline: DEFAULT_POLL_DEADLINE,
        }
    }
}

/// Point-in-time snapshot emitted once per poll tick.
#[derive(Debug, Clone)]
pub struct ConvergenceEvent<S> {
    /// Resource being polled.
    pub resource: String,

    /// 1-based tick number.
    pub attempt: u32,

    /// Time since the sequence started.
    pub elapsed: Duration,

    /// Observation for this tick; `None` when the fetch failed or the
    /// sequence stopped before fetching.
    pub observed: Option<Observation<S>>,

    /// Verdict of the target predicate for this tick.
    pub status: ConvergenceStatus,

    /// Failure attached to this tick.
    pub error: Option<ReconcileError>,
}

impl<S> ConvergenceEvent<S> {
    /// Returns true if this is the last event of its sequence.
    pub fn is_final(&self) -> bool {
        self.status.is_terminal() || self.error.as_ref().is_some_and(|e| !e.is_transient())
    }
}

struct Poller<F, P> {
    resource: String,
    fetch: F,
    target: P,
    config: PollConfig,
    cancel: watch::Receiver<bool>,
    started: Instant,
    deadline: Instant,
    attempt: u32,
    finished: bool,
}

impl<F, P> Poller<F, P> {
    fn stop<S>(&mut self, error: ReconcileError) -> ConvergenceEvent<S> {
        self.finished = true;
        warn!(
            resource = %self.resource,
            attempt = self.attempt,
            error = %error,
            "Poll stopped"
        );
        ConvergenceEvent {
            resource: self.resource.clone(),
            attempt: self.attempt,
            elapsed: self.started.elapsed(),
            observed: None,
            status: ConvergenceStatus::Unknown,
            error: Some(error),
        }
    }

    fn timeout(&self) -> ReconcileError {
        ReconcileError::Timeout {
            resource: self.resource.clone(),
            elapsed: self.started.elapsed(),
        }
    }

    fn cancelled(&self) -> ReconcileError {
        ReconcileError::Cancelled {
            resource: self.resource.clone(),
        }
    }
}

/// Poll `fetch` until `target` reports [`ConvergenceStatus::Converged`].
///
/// The target predicate decides what each observation means:
/// `Converged` ends the sequence successfully, `Diverged` ends it with
/// [`ReconcileError::Diverged`] (terminal provider state, or the resource
/// vanished while waiting for something other than deletion), anything else
/// keeps polling. Fetch errors are reported as
/// [`ReconcileError::Transient`] events and retried on the next tick.
///
/// Setting `cancel` to `true` stops the sequence at the next suspension
/// point with [`ReconcileError::Cancelled`].
pub fn poll<S, F, Fut, E, P>(
    resource: impl Into<String>,
    fetch: F,
    target: P,
    config: PollConfig,
    cancel: watch::Receiver<bool>,
) -> impl Stream<Item = ConvergenceEvent<S>>
where
    S: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<S>, E>>,
    E: Display,
    P: Fn(&Observation<S>) -> ConvergenceStatus,
{
    let started = Instant::now();
    let poller = Poller {
        resource: resource.into(),
        fetch,
        target,
        config,
        cancel,
        started,
        deadline: started + config.deadline,
        attempt: 0,
        finished: false,
    };

    debug!(
        resource = %poller.resource,
        interval_ms = config.interval.as_millis() as u64,
        deadline_ms = config.deadline.as_millis() as u64,
        "Polling resource"
    );

    stream::unfold(poller, |mut poller| async move {
        if poller.finished {
            return None;
        }
        let event = tick(&mut poller).await;
        Some((event, poller))
    })
}

async fn tick<S, F, Fut, E, P>(poller: &mut Poller<F, P>) -> ConvergenceEvent<S>
where
    S: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<S>, E>>,
    E: Display,
    P: Fn(&Observation<S>) -> ConvergenceStatus,
{
    let first = poller.attempt == 0;
    poller.attempt += 1;

    if first {
        if *poller.cancel.borrow() {
            let error = poller.cancelled();
            return poller.stop(error);
        }
    } else {
        let wake = (Instant::now() + poller.config.interval).min(poller.deadline);
        let woke = tokio::select! {
            biased;
            _ = cancelled(&mut poller.cancel) => false,
            _ = tokio::time::sleep_until(wake) => true,
        };
        if !woke {
            let error = poller.cancelled();
            return poller.stop(error);
        }
        if Instant::now() >= poller.deadline {
            let error = poller.timeout();
            return poller.stop(error);
        }
    }

    let fetched = tokio::select! {
        biased;
        _ = cancelled(&mut poller.cancel) => None,
        result = tokio::time::timeout_at(poller.deadline, (poller.fetch)()) => Some(result),
    };

    let result = match fetched {
        None => {
            let error = poller.cancelled();
            return poller.stop(error);
        }
        Some(Err(_)) => {
            let error = poller.timeout();
            return poller.stop(error);
        }
        Some(Ok(result)) => result,
    };

    let elapsed = poller.started.elapsed();
    match result {
        Err(e) => {
            warn!(
                resource = %poller.resource,
                attempt = poller.attempt,
                error = %e,
                "Observation failed, retrying on next tick"
            );
            ConvergenceEvent {
                resource: poller.resource.clone(),
                attempt: poller.attempt,
                elapsed,
                observed: None,
                status: ConvergenceStatus::Unknown,
                error: Some(ReconcileError::Transient {
                    resource: poller.resource.clone(),
                    detail: e.to_string(),
                }),
            }
        }
        Ok(observation) => {
            let status = (poller.target)(&observation);
            debug!(
                resource = %poller.resource,
                attempt = poller.attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                observed = ?observation,
                status = ?status,
                "Poll"
            );

            let error = match status {
                ConvergenceStatus::Converged => {
                    poller.finished = true;
                    info!(
                        resource = %poller.resource,
                        attempt = poller.attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Reached desired state"
                    );
                    None
                }
                ConvergenceStatus::Diverged => {
                    poller.finished = true;
                    warn!(
                        resource = %poller.resource,
                        observed = ?observation,
                        "Resource entered a terminal state"
                    );
                    Some(ReconcileError::Diverged {
                        resource: poller.resource.clone(),
                        detail: format!("{observation:?}"),
                    })
                }
                ConvergenceStatus::Converging | ConvergenceStatus::Unknown => None,
            };

            ConvergenceEvent {
                resource: poller.resource.clone(),
                attempt: poller.attempt,
                elapsed,
                observed: Some(observation),
                status,
                error,
            }
        }
    }
}

/// Resolves once the cancel flag is set. Never resolves if the sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drain a poll sequence and return the converged observation.
///
/// Transient errors are skipped; any other error ends the wait.
pub async fn converge<S, St>(events: St) -> Result<Observation<S>, ReconcileError>
where
    St: Stream<Item = ConvergenceEvent<S>>,
{
    futures_util::pin_mut!(events);

    let mut resource = String::new();
    while let Some(event) = events.next().await {
        resource = event.resource;
        if let Some(error) = event.error {
            if error.is_transient() {
                continue;
            }
            return Err(error);
        }
        if event.status.is_converged() {
            if let Some(observed) = event.observed {
                return Ok(observed);
            }
        }
    }

    Err(ReconcileError::Cancelled { resource })
}
