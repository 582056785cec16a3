use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid document: {0}")]
    Codec(String),

    /// The request envelope was rejected before reaching the backend.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Backend(String),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn missing(field: &str) -> Self {
        Error::Validation(format!("{} must be specified", field))
    }

    pub fn invalid(field: &str, expected: &str) -> Self {
        Error::Validation(format!("{} must be {}", field, expected))
    }
}

pub type Result<T> = StdResult<T, Error>;
