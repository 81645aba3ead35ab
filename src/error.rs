use crate::backend::BackendError;
use crate::storage::MediaError;

/// Application-level error taxonomy. Every service operation returns this;
/// surfacing is uniform (typed error to the caller, tracing log) with no
/// retries.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("sign-in required")]
    AuthRequired,
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("conflict")]
    Conflict,
    #[error("backend: {0}")]
    Backend(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("config: {0}")]
    Config(String),
}

impl From<BackendError> for AppError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Conflict => AppError::Conflict,
            BackendError::NotFound => AppError::NotFound,
            BackendError::Unauthorized => AppError::AuthRequired,
            BackendError::Other(msg) => AppError::Backend(msg),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
