use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeaveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Path outside workspace: {0}")]
    PathOutsideWorkspace(String),

    #[error("Path traversal attack: {0}")]
    PathTraversalAttack(String),

    #[error("Invalid path: {0}")]
    PathInvalid(String),

    #[error("Invalid workspace: {0}")]
    WorkspaceInvalid(String),

    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Memory limit exceeded: {0}")]
    Memory(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    #[error("Low confidence: {confidence:.2}")]
    LowConfidence { confidence: f32 },

    #[error("Learning failure: {0}")]
    Learning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl WeaveError {
    /// Whether the caller may usefully retry the failed operation.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            WeaveError::StorageUnavailable(_)
                | WeaveError::ToolUnavailable(_)
                | WeaveError::Timeout(_)
        )
    }

    /// Stable machine-readable code surfaced in terminal results.
    pub fn kind(&self) -> &'static str {
        match self {
            WeaveError::Io(_) => "IO_ERROR",
            WeaveError::Json(_) => "JSON_ERROR",
            WeaveError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            WeaveError::Schema(_) => "SCHEMA_ERROR",
            WeaveError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            WeaveError::Validation(_) => "VALIDATION_ERROR",
            WeaveError::PathOutsideWorkspace(_) => "PATH_OUTSIDE_WORKSPACE",
            WeaveError::PathTraversalAttack(_) => "PATH_TRAVERSAL_ATTACK",
            WeaveError::PathInvalid(_) => "PATH_INVALID",
            WeaveError::WorkspaceInvalid(_) => "WORKSPACE_INVALID",
            WeaveError::ToolUnavailable(_) => "TOOL_UNAVAILABLE",
            WeaveError::Serialization(_) => "SERIALIZATION_ERROR",
            WeaveError::Timeout(_) => "TIMEOUT",
            WeaveError::Memory(_) => "MEMORY_ERROR",
            WeaveError::ResourceLimit(_) => "RESOURCE_LIMIT",
            WeaveError::Syntax(_) => "SYNTAX_ERROR",
            WeaveError::Runtime(_) => "RUNTIME_ERROR",
            WeaveError::Permission(_) => "PERMISSION_ERROR",
            WeaveError::Security(_) => "SECURITY_ERROR",
            WeaveError::CycleDetected(_) => "CYCLE_DETECTED",
            WeaveError::LowConfidence { .. } => "LOW_CONFIDENCE",
            WeaveError::Learning(_) => "LEARNING_FAILURE",
            WeaveError::NotFound(_) => "NOT_FOUND",
            WeaveError::InvalidOperation(_) => "INVALID_OPERATION",
        }
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind().to_string(),
            message: self.to_string(),
            retriable: self.retriable(),
        }
    }
}

/// Error surface attached to terminal results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
}

pub type Result<T> = std::result::Result<T, WeaveError>;
