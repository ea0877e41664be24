use crate::data_model::Document;
use thiserror::Error;

/// Custom Result type for this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// The Error type for store, protocol and supervisor operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration validation error: {0}")]
    ConfigValidationError(String),

    #[error("I/O error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization/Deserialization error: {source}")]
    SerializationError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// The caller does not hold the claim it presented: it was reissued after a
    /// lease expired, already ended, or never existed.
    #[error("Claim lost: {0}")]
    ClaimLost(String),

    #[error("Document id '{0}' already exists")]
    DuplicateId(String),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Another caller won the race for this document. Never leaves the store.
    #[error("Claim on document '{id}' for stage '{stage}' lost to a concurrent caller")]
    ClaimConflict { id: String, stage: String },

    #[error("Document '{document_id}' filtered out: {reason}", document_id = document.id)]
    DocumentFiltered {
        document: Box<Document>,
        reason: String,
    },

    #[error("Processing failed in '{step_name}': {message}")]
    ProcessError { step_name: String, message: String },

    #[error("Error in processing step '{step_name}': {source}")]
    StepError {
        step_name: String,
        source: Box<PipelineError>,
    },

    #[error("Stage '{stage}' exhausted its restart budget after {attempts} attempts")]
    SupervisorRestartExhausted { stage: String, attempts: u32 },

    #[error("Artifact '{0}' not found")]
    ArtifactNotFound(String),

    #[error("Attachment '{0}' not found")]
    AttachmentNotFound(String),

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl PipelineError {
    /// Stable, machine-readable name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ConfigError(_) => "config",
            PipelineError::ConfigValidationError(_) => "config_validation",
            PipelineError::IoError { .. } => "io",
            PipelineError::SerializationError { .. } => "serialization",
            PipelineError::MalformedQuery(_) => "malformed_query",
            PipelineError::ClaimLost(_) => "claim_lost",
            PipelineError::DuplicateId(_) => "duplicate_id",
            PipelineError::DocumentNotFound(_) => "document_not_found",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::ClaimConflict { .. } => "claim_conflict",
            PipelineError::DocumentFiltered { .. } => "document_filtered",
            PipelineError::ProcessError { .. } => "process",
            PipelineError::StepError { .. } => "step",
            PipelineError::SupervisorRestartExhausted { .. } => "restart_exhausted",
            PipelineError::ArtifactNotFound(_) => "artifact_not_found",
            PipelineError::AttachmentNotFound(_) => "attachment_not_found",
            PipelineError::InvalidPipeline(_) => "invalid_pipeline",
            PipelineError::ProtocolError(_) => "protocol",
            PipelineError::Unexpected(_) => "unexpected",
        }
    }

    /// Rebuilds an error from its wire `kind` and message.
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "malformed_query" => PipelineError::MalformedQuery(message),
            "claim_lost" => PipelineError::ClaimLost(message),
            "duplicate_id" => PipelineError::DuplicateId(message),
            "document_not_found" => PipelineError::DocumentNotFound(message),
            "store_unavailable" => PipelineError::StoreUnavailable(message),
            "artifact_not_found" => PipelineError::ArtifactNotFound(message),
            "attachment_not_found" => PipelineError::AttachmentNotFound(message),
            "invalid_pipeline" => PipelineError::InvalidPipeline(message),
            "config_validation" => PipelineError::ConfigValidationError(message),
            _ => PipelineError::ProtocolError(message),
        }
    }

    /// Transient failures the protocol client retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_))
    }

    /// Unwraps `StepError` layers down to the error a step actually raised.
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::StepError { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn into_root(self) -> PipelineError {
        match self {
            PipelineError::StepError { source, .. } => source.into_root(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            PipelineError::StoreUnavailable(err.to_string())
        } else {
            PipelineError::ProtocolError(err.to_string())
        }
    }
}
