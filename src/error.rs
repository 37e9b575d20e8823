use crate::types::RunId;

/// Errors surfaced by the shared state store
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Stored value has unexpected shape: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while driving a draw
#[derive(Debug, thiserror::Error)]
pub enum DrawError {
    #[error("{requested_by:?} is not the owner of this room")]
    PermissionDenied { requested_by: String },

    #[error("Draw {0} is still spinning")]
    AlreadySpinning(RunId),

    #[error("Cannot draw from an empty roster")]
    EmptyRoster,

    #[error("Durable write failed: {0}")]
    WriteFailure(#[from] ChannelError),

    #[error("Invalid session: {0}")]
    InvalidSession(String),
}

pub type DrawResult<T> = Result<T, DrawError>;
