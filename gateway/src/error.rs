use thiserror::Error;

/// Errors from the directory client. Hot-path callers log these and
/// continue; only `backend_id_from_token` propagates a failure as
/// terminal for the session (see `tunnel_transport::AuthError::DirectoryUnavailable`).
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory backend unreachable: {0}")]
    Unreachable(#[source] redis::RedisError),
    #[error("directory returned malformed data for key {key}")]
    Malformed { key: String },
}

impl From<redis::RedisError> for DirectoryError {
    fn from(err: redis::RedisError) -> Self {
        DirectoryError::Unreachable(err)
    }
}
