use thiserror::Error;

use crate::types::{TransportErrorKind, UnitPhase};

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph definition errors
    #[error("Graph definition error: {0}")]
    GraphDefinition(String),

    #[error("Invalid config for node {node_id}: {message}")]
    InvalidNodeConfig { node_id: String, message: String },

    #[error("Unresolved reference on node {node_id}: {reference}")]
    UnresolvedReference { node_id: String, reference: String },

    // Guardrail errors
    #[error("Guardrail exceeded: {0}")]
    GuardrailExceeded(String),

    // Dispatch errors
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Dispatch {dispatch_id} is in an ambiguous state: {message}")]
    DispatchUncertain { dispatch_id: String, message: String },

    #[error("Duplicate dispatch rejected: {scope}/{key}")]
    DuplicateDispatch { scope: String, key: String },

    #[error("No executor registered for provider: {0}")]
    ExecutorNotFound(String),

    // Compute errors
    #[error("Compute failed for {node_type} node: {message}")]
    Compute { node_type: String, message: String },

    #[error("Transient backend failure: {0}")]
    TransientBackend(String),

    #[error("No compute registered for node type: {0}")]
    ComputeNotFound(String),

    #[error("Compute timeout after {timeout_secs}s: {node_id}")]
    ComputeTimeout { node_id: String, timeout_secs: u64 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Whether a collaborator may retry the failed operation.
    ///
    /// The scheduler itself never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::TransientBackend(_))
    }

    /// Whether this failure is a graph-definition error (fatal, never retried).
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::GraphDefinition(_) | Self::InvalidNodeConfig { .. } | Self::UnresolvedReference { .. }
        )
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }
}

/// A failure talking to a remote execution backend.
#[derive(Debug, Clone, Error)]
#[error("{phase} failed ({kind}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub phase: UnitPhase,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, phase: UnitPhase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
        }
    }

    /// Build an error whose kind is inferred from the backend's message text.
    pub fn classify(phase: UnitPhase, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: TransportErrorKind::from_message(&message),
            phase,
            message,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transport = WeftError::from(TransportError::new(
            TransportErrorKind::Timeout,
            UnitPhase::Create,
            "deadline",
        ));
        assert!(transport.is_retryable());
        assert!(WeftError::TransientBackend("503".into()).is_retryable());
        assert!(!WeftError::GraphDefinition("no start".into()).is_retryable());
        assert!(!WeftError::DispatchUncertain {
            dispatch_id: "d".into(),
            message: "marker".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_transport_display_names_phase_and_kind() {
        let err = TransportError::new(TransportErrorKind::AuthError, UnitPhase::Probe, "401");
        assert_eq!(err.to_string(), "probe failed (auth_error): 401");
    }
}
