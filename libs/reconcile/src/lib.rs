//! Convergence primitives.
//!
//! This library provides helpers for driving a resource whose state is owned
//! by a remote provider to a target state. Key concepts:
//!
//! - **Observation**: What the provider reports right now (or that the
//!   resource is gone).
//! - **Target**: A predicate classifying an observation as converged,
//!   converging, or diverged.
//! - **Convergence**: Polling until the target is met, the deadline passes,
//!   the caller cancels, or the resource enters a state it cannot leave.
//!
//! # Invariants
//!
//! - The first poll happens immediately; later polls wait one interval
//! - Exactly one event is emitted per poll, oldest first
//! - A poll sequence always terminates (deadline is mandatory)
//! - Transient fetch failures never terminate a sequence on their own

use std::time::Duration;

use thiserror::Error;

mod poll;
mod retry;

pub use poll::{cancelled, converge, poll, ConvergenceEvent, Observation, PollConfig};
pub use retry::RetryPolicy;

/// Reconciliation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// The caller asked the poll to stop.
    #[error("wait for {resource} cancelled")]
    Cancelled { resource: String },

    /// Resource entered a state it will never leave on its own.
    #[error("{resource} diverged: {detail}")]
    Diverged { resource: String, detail: String },

    /// Fetching the current state failed; the next tick retries.
    #[error("transient error observing {resource}: {detail}")]
    Transient { resource: String, detail: String },
}

impl ReconcileError {
    /// Returns true if polling continues after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (insufficient data).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }

    /// Returns true if no further polling can change the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Diverged)
    }
}

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default deadline for a single convergence wait.
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(5 * 60);
