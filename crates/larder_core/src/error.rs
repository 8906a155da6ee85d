use thiserror::Error;

#[derive(Debug, Error)]
pub enum LarderError {
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("invalid reference: {message}")]
    InvalidReference { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("duplicate tag: {message}")]
    DuplicateTag { message: String },
    #[error("internal inconsistency: {message}")]
    Internal { message: String },
}

impl LarderError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidReference {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn duplicate_tag(message: impl Into<String>) -> Self {
        Self::DuplicateTag {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the unique-constraint race a concurrent checkpoint loses;
    /// callers fall back to the tag-merge path exactly once.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type LarderResult<T> = Result<T, LarderError>;

impl From<sea_orm::DbErr> for LarderError {
    fn from(value: sea_orm::DbErr) -> Self {
        if let Some(sea_orm::SqlErr::UniqueConstraintViolation(detail)) = value.sql_err() {
            return LarderError::conflict(detail);
        }
        LarderError::storage(value.to_string())
    }
}
