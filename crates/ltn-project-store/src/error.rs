use ltn_project_core::{AppFocus, ProjectError, ProjectId};

use crate::backend::BackendError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("project {0} not found")]
    NotFound(ProjectId),
    #[error("project name already taken: {0}")]
    NameTaken(String),
    #[error("invalid project identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("project {id} belongs to focus {stored}, not {expected}")]
    FocusMismatch { id: ProjectId, stored: AppFocus, expected: AppFocus },
    #[error("{focus} project {project_name:?} must name a study area")]
    MissingStudyArea { focus: AppFocus, project_name: String },
    #[error("stored document {key} is corrupt: {reason}")]
    CorruptDocument { key: String, reason: String },
    #[error("unsupported schema version {found}; latest known is {latest}")]
    UnsupportedSchemaVersion { found: u32, latest: u32 },
    #[error("invalid store configuration: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<ProjectError> for StoreError {
    fn from(err: ProjectError) -> Self {
        match err {
            ProjectError::InvalidIdentifier(raw) => Self::InvalidIdentifier(raw),
            ProjectError::Validation(message) => Self::Validation(message),
            ProjectError::Decode(message) => Self::Codec(message),
        }
    }
}

impl StoreError {
    /// Stable code for surfacing the failure to an end user.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NameTaken(_) => "name_taken",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::FocusMismatch { .. } => "focus_mismatch",
            Self::MissingStudyArea { .. } => "missing_study_area",
            Self::CorruptDocument { .. } => "corrupt_document",
            Self::UnsupportedSchemaVersion { .. } => "unsupported_schema_version",
            Self::Config(_) => "invalid_config",
            Self::Validation(_) => "validation",
            Self::Codec(_) => "codec",
            Self::Backend(BackendError::QuotaExceeded { .. }) => "quota_exceeded",
            Self::Backend(BackendError::Io(_)) => "storage_failure",
        }
    }
}
