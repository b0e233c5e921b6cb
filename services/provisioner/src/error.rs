//! Error types for provisioning.

use thiserror::Error;
use zoneclaim_reconcile::ReconcileError;

use crate::backend::BackendError;
use crate::state::StateStoreError;

/// Provisioning errors with standardized reason codes.
///
/// `NotFound` and `LeaseRejected` are expected outcomes that drive the
/// fallback to creation; every other variant aborts the boot sequence.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No reusable resource matched the selector.
    #[error("not_found: {0}")]
    NotFound(String),

    /// Another node holds the resource through a fresh lease or an attachment.
    #[error("lease_rejected: {resource} held by {holder}")]
    LeaseRejected { resource: String, holder: String },

    /// Network failure or throttling on a call the poller does not own.
    #[error("transient_backend: {0}")]
    TransientBackend(String),

    /// The resource entered a failed or deleted state unexpectedly.
    #[error("terminal_provider_failure: {0}")]
    TerminalProviderFailure(String),

    /// Ambiguous or conflicting provider state that needs an operator.
    #[error("configuration_conflict: {0}")]
    ConfigurationConflict(String),

    /// A convergence wait ran out of time.
    #[error("deadline_exceeded: {0}")]
    DeadlineExceeded(String),

    /// Shutdown was requested.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Local state file could not be read or written.
    #[error("state error: {0}")]
    State(#[from] StateStoreError),

    /// Filesystem preparation failed.
    #[error("init_failed: {0}")]
    Init(String),

    /// Invalid configuration.
    #[error("config_invalid: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProvisionError::NotFound(_) => "not_found",
            ProvisionError::LeaseRejected { .. } => "lease_rejected",
            ProvisionError::TransientBackend(_) => "transient_backend",
            ProvisionError::TerminalProviderFailure(_) => "terminal_provider_failure",
            ProvisionError::ConfigurationConflict(_) => "configuration_conflict",
            ProvisionError::DeadlineExceeded(_) => "deadline_exceeded",
            ProvisionError::Cancelled(_) => "cancelled",
            ProvisionError::State(_) => "state_error",
            ProvisionError::Init(_) => "init_failed",
            ProvisionError::Config(_) => "config_invalid",
        }
    }

    /// Returns true for outcomes that steer the caller towards creation
    /// rather than aborting.
    pub fn is_expected(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_) | ProvisionError::LeaseRejected { .. })
    }
}

impl From<BackendError> for ProvisionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(detail) => ProvisionError::NotFound(detail),
            BackendError::Conflict(detail) => ProvisionError::ConfigurationConflict(detail),
            BackendError::Transient(detail) => ProvisionError::TransientBackend(detail),
            BackendError::Invalid(detail) => ProvisionError::TerminalProviderFailure(detail),
        }
    }
}

impl From<ReconcileError> for ProvisionError {
    fn from(err: ReconcileError) -> Self {
        let message = err.to_string();
        match err {
            ReconcileError::Timeout { .. } => ProvisionError::DeadlineExceeded(message),
            ReconcileError::Cancelled { .. } => ProvisionError::Cancelled(message),
            ReconcileError::Diverged { .. } => ProvisionError::TerminalProviderFailure(message),
            ReconcileError::Transient { .. } => ProvisionError::TransientBackend(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let err: ProvisionError = BackendError::Conflict("attached elsewhere".to_string()).into();
        assert_eq!(err.reason_code(), "configuration_conflict");

        let err: ProvisionError = BackendError::NotFound("vol-1".to_string()).into();
        assert!(err.is_expected());

        let err: ProvisionError = BackendError::Transient("throttled".to_string()).into();
        assert_eq!(err.reason_code(), "transient_backend");
    }

    #[test]
    fn test_reconcile_error_mapping() {
        let err: ProvisionError = ReconcileError::Timeout {
            resource: "vol-1".to_string(),
            elapsed: Duration::from_secs(300),
        }
        .into();
        assert_eq!(err.reason_code(), "deadline_exceeded");
        assert!(!err.is_expected());

        let err: ProvisionError = ReconcileError::Diverged {
            resource: "vol-1".to_string(),
            detail: "failed".to_string(),
        }
        .into();
        assert_eq!(err.reason_code(), "terminal_provider_failure");
    }
}
