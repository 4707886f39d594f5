use thiserror::Error;

/// Top-level error type for the detection pipeline and its supporting services.
///
/// Mirrors the external taxonomy (IO / unsupported-format / external-unavailable /
/// rate-limited / auth / validation / internal) so every layer can map cleanly onto it.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Io(_) => "IO_ERROR",
            CoreError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            CoreError::ExternalUnavailable(_) => "EXTERNAL_UNAVAILABLE",
            CoreError::RateLimited { .. } => "RATE_LIMITED",
            CoreError::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Database(_) => "INTERNAL_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::AuthenticationFailure => 401,
            CoreError::RateLimited { .. } => 429,
            CoreError::UnsupportedFormat(_) => 415,
            CoreError::ExternalUnavailable(_) => 503,
            CoreError::Io(_) | CoreError::Database(_) | CoreError::Internal(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ExternalUnavailable(_) | CoreError::RateLimited { .. }
        )
    }
}

/// Errors specific to the embedded persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("record not found")]
    NotFound,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound,
            sqlx::Error::PoolTimedOut => DatabaseError::Connection(err.to_string()),
            sqlx::Error::Io(e) => DatabaseError::Connection(e.to_string()),
            other => DatabaseError::Query(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database(DatabaseError::from(err))
    }
}

/// Errors specific to the external reputation client.
#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("exhausted retries after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("analysis polling timed out after {elapsed_secs}s")]
    PollTimeout { elapsed_secs: u64 },
}

impl From<ReputationError> for CoreError {
    fn from(err: ReputationError) -> Self {
        match err {
            ReputationError::RateLimited { retry_after_secs } => {
                CoreError::RateLimited { retry_after_secs }
            }
            other => CoreError::ExternalUnavailable(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
