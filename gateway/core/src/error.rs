//! Error Taxonomy
//!
//! One typed error enum for the whole engine. Producer-facing failures
//! (validation, not-found, conflict) surface synchronously at create/query
//! time; everything hit during execution is captured into the task record
//! instead of being thrown back at the producer.

use serde::{Deserialize, Serialize};

/// Gateway engine errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// Malformed task spec rejected at creation time
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown task or provider
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting request (idempotency key reused with a different spec,
    /// cancel on a terminal task, etc.)
    #[error("conflict: {0}")]
    Conflict(String),

    /// No preset matches the requested provider name
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),

    /// A preset failed validation during provider construction
    #[error("invalid provider config for '{name}': {reason}")]
    InvalidConfig {
        /// Provider name
        name: String,
        /// What was wrong with the preset
        reason: String,
    },

    /// Backend rejected our credentials
    #[error("authentication failed for provider '{0}'")]
    AuthenticationFailure(String),

    /// Accelerator lease could not be acquired within the wait budget
    #[error("accelerator busy (held by {holder})")]
    DeviceBusy {
        /// Task currently holding the lease
        holder: String,
    },

    /// The accelerator or its monitor could not be reached
    #[error("accelerator unavailable: {0}")]
    DeviceUnavailable(String),

    /// Admission denied: the requested footprint does not fit under the
    /// configured ceiling, or the dispatch queue is full
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Provider does not declare the requested capability
    #[error("provider '{provider}' does not support {capability}")]
    CapabilityUnsupported {
        /// Provider name
        provider: String,
        /// The missing capability
        capability: &'static str,
    },

    /// The backend call itself failed
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The backend call exceeded its time budget
    #[error("timed out: {0}")]
    Timeout(String),

    /// The backend throttled us (transient, retried inside the execution)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Webhook delivery exhausted its attempts (non-fatal, logged only)
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// Internal consistency violation (out-of-order status transition,
    /// double release). These indicate programming errors, not conditions
    /// to recover from.
    #[error("internal consistency error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, persisted in task error records and
    /// webhook payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::AuthenticationFailure(_) => "authentication_failure",
            Self::DeviceBusy { .. } => "device_busy",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::CapabilityUnsupported { .. } => "capability_unsupported",
            Self::GenerationFailed(_) => "generation_failed",
            Self::Timeout(_) => "timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::DeliveryFailed(_) => "delivery_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether a retry inside the same task execution may succeed.
    /// Only remote-provider throttling and timeouts qualify; everything
    /// else fails the task on first occurrence.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_))
    }
}

/// Error description persisted on a failed task and shipped in webhooks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Stable error code (see [`Error::code`])
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl TaskError {
    /// Build the persisted description from an engine error.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// The terminal description recorded for cooperatively cancelled tasks.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            code: "cancelled".to_string(),
            message: "task cancelled".to_string(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
