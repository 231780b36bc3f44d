use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}
