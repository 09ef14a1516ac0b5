//! Library error type.

use crate::ActorId;

pub type DelegResult<T> = Result<T, DelegError>;

#[derive(Debug, thiserror::Error)]
pub enum DelegError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("trace error: {0}")]
    Trace(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("{actor} actor failed: {detail}")]
    Actor { actor: ActorId, detail: String },

    #[error("remote call to {target} failed: {detail}")]
    Remote { target: String, detail: String },
}
