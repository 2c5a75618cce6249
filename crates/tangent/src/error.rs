use thiserror::Error;

/// Errors that can occur when talking to a chat backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached at all.
    #[error("connection error: {0}")]
    Connection(String),
    /// The backend answered with a non-success status code.
    #[error("backend returned status {code}: {message}")]
    Status {
        /// Remote HTTP status code.
        code: u16,
        /// Body or reason phrase reported by the backend.
        message: String,
    },
    /// The backend answered, but the payload did not match the expected shape.
    #[error("response validation error: {0}")]
    ResponseValidation(String),
    /// The backend produced neither text nor tool calls.
    #[error("backend returned an empty response")]
    EmptyResponse,
    /// The conversation contains images and the backend cannot accept them.
    #[error("image inputs are not supported by `{0}`")]
    ImagesUnsupported(String),
    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(feature = "http-client")]
impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Connection(err.to_string())
    }
}
