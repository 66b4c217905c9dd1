//! Unified error types for the recruitment pipeline.
//!
//! Mirrors the error taxonomy in the design doc (`ErrorKind`): every error
//! that can surface from a worker classifies into transient, permanent, or
//! logic, which the worker harness (`pipeline::worker`) uses to decide
//! between negative-acking for redelivery and routing to a DLQ.

use std::fmt;

/// Main error type for the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// Message bus errors (publish rejected, subscription failure).
    Bus(BusError),
    /// Object store errors (checksum mismatch, oversized blob, I/O).
    ObjectStore(ObjectStoreError),
    /// LLM adapter errors.
    Llm(LlmError),
    /// DTO/invariant validation errors.
    Validation(ValidationError),
    /// Missing/invalid environment configuration.
    Configuration(ConfigurationError),
    /// Catch-all for unexpected application errors (wraps panics caught at
    /// the worker boundary).
    Application(String),
}

/// How a worker should react to an error (§7 of the design doc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Negative-ack; the bus redelivers with exponential backoff.
    Transient,
    /// Publish the envelope (with a failure annotation) to the subject's
    /// DLQ and positively ack.
    Permanent,
    /// Unexpected exception. Treated as transient for the first two
    /// attempts, then promoted to permanent to avoid poisoning the queue.
    Logic,
}

#[derive(Debug, Clone)]
pub enum BusError {
    PublishRejected(String),
    Unreachable(String),
    NotFound(String),
}

#[derive(Debug, Clone)]
pub enum ObjectStoreError {
    ChecksumMismatch { expected: String, actual: String },
    TooLarge { size: u64, limit: u64 },
    NotFound(String),
    Io(String),
}

#[derive(Debug, Clone)]
pub enum LlmError {
    Network(String),
    RateLimitExceeded,
    InvalidApiKey,
    InvalidResponse(String),
    Unknown(String),
}

#[derive(Debug, Clone)]
pub enum ValidationError {
    MissingField(String),
    InvalidFormat(String),
    InvariantViolation(String),
}

#[derive(Debug, Clone)]
pub enum ConfigurationError {
    Missing(String),
    InvalidValue(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Bus(e) => write!(f, "bus error: {}", e),
            PipelineError::ObjectStore(e) => write!(f, "object store error: {}", e),
            PipelineError::Llm(e) => write!(f, "LLM error: {}", e),
            PipelineError::Validation(e) => write!(f, "validation error: {}", e),
            PipelineError::Configuration(e) => write!(f, "configuration error: {}", e),
            PipelineError::Application(msg) => write!(f, "application error: {}", msg),
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::PublishRejected(msg) => write!(f, "publish rejected: {}", msg),
            BusError::Unreachable(msg) => write!(f, "bus unreachable: {}", msg),
            BusError::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreError::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {}, got {}", expected, actual)
            }
            ObjectStoreError::TooLarge { size, limit } => {
                write!(f, "blob too large: {} bytes (limit {})", size, limit)
            }
            ObjectStoreError::NotFound(id) => write!(f, "file not found: {}", id),
            ObjectStoreError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Network(msg) => write!(f, "network error: {}", msg),
            LlmError::RateLimitExceeded => write!(f, "rate limit exceeded"),
            LlmError::InvalidApiKey => write!(f, "invalid API key"),
            LlmError::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
            LlmError::Unknown(msg) => write!(f, "unknown error: {}", msg),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "missing required field: {}", field),
            ValidationError::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            ValidationError::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::Missing(var) => write!(f, "missing environment variable: {}", var),
            ConfigurationError::InvalidValue(msg) => write!(f, "invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}
impl std::error::Error for BusError {}
impl std::error::Error for ObjectStoreError {}
impl std::error::Error for LlmError {}
impl std::error::Error for ValidationError {}
impl std::error::Error for ConfigurationError {}

impl From<BusError> for PipelineError {
    fn from(e: BusError) -> Self {
        PipelineError::Bus(e)
    }
}
impl From<ObjectStoreError> for PipelineError {
    fn from(e: ObjectStoreError) -> Self {
        PipelineError::ObjectStore(e)
    }
}
impl From<LlmError> for PipelineError {
    fn from(e: LlmError) -> Self {
        PipelineError::Llm(e)
    }
}
impl From<ValidationError> for PipelineError {
    fn from(e: ValidationError) -> Self {
        PipelineError::Validation(e)
    }
}
impl From<ConfigurationError> for PipelineError {
    fn from(e: ConfigurationError) -> Self {
        PipelineError::Configuration(e)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                PipelineError::Bus(BusError::NotFound("query returned no rows".to_string()))
            }
            other => PipelineError::Application(format!("sqlite error: {}", other)),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::ObjectStore(ObjectStoreError::Io(err.to_string()))
    }
}

impl PipelineError {
    /// Classify the error for the worker harness (§7).
    pub fn classify(&self) -> ErrorKind {
        match self {
            PipelineError::Bus(BusError::Unreachable(_)) => ErrorKind::Transient,
            PipelineError::Bus(_) => ErrorKind::Permanent,
            PipelineError::ObjectStore(ObjectStoreError::Io(_)) => ErrorKind::Transient,
            PipelineError::ObjectStore(_) => ErrorKind::Permanent,
            PipelineError::Llm(LlmError::Network(_)) => ErrorKind::Transient,
            PipelineError::Llm(LlmError::RateLimitExceeded) => ErrorKind::Transient,
            PipelineError::Llm(_) => ErrorKind::Permanent,
            PipelineError::Validation(_) => ErrorKind::Permanent,
            PipelineError::Configuration(_) => ErrorKind::Permanent,
            PipelineError::Application(_) => ErrorKind::Logic,
        }
    }
}

/// Whether an LLM error specifically should be retried in-process before
/// negative-acking (§4.3, §5 — outbound LLM calls retry twice in-process).
pub fn is_retryable_llm_error(error: &LlmError) -> bool {
    matches!(error, LlmError::Network(_) | LlmError::RateLimitExceeded)
}
