use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate parameter key `{0}`")]
    DuplicateKey(String),
    #[error("unknown parameter key `{0}`")]
    UnknownKey(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failed: {0}")]
    Io(String),
    #[error("stored parameters are not valid json")]
    Encoding(#[from] serde_json::Error),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("{label}: `{value}` is not a number")]
    NotANumber { label: String, value: String },
    #[error("{label}: {value} is outside {min}..={max}")]
    OutOfRange {
        label: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{label}: `{value}` is not one of the offered choices")]
    UnknownChoice { label: String, value: String },
    #[error("{label}: value longer than {max} bytes")]
    TooLong { label: String, max: usize },
    #[error("{label}: at least {min} characters required")]
    TooShort { label: String, min: usize },
    #[error("{label} cannot be empty")]
    Empty { label: String },
}
