use std::{path::PathBuf, time::Duration};

/// Core error type for batch runs.
///
/// The first group of variants is user-facing and recoverable: the front-end
/// renders a short message and the user can try again. Everything else is an
/// internal failure that still ends in cleanup plus a message, never a crash.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid upload: {0}")]
    InvalidFormat(String),

    #[error("extracted content too large: {actual} bytes (max {limit})")]
    TooLarge { limit: u64, actual: u64 },

    #[error("no matching items found in archive")]
    NoItemsFound,

    #[error("system misconfigured: {0}")]
    SystemMisconfigured(String),

    #[error("batch run timed out after {}s", .0.as_secs())]
    RunTimeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the failure is caused by the upload or the environment and can be
    /// fixed by the user (or an admin) without a code change.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::InvalidFormat(_)
                | Error::TooLarge { .. }
                | Error::NoItemsFound
                | Error::SystemMisconfigured(_)
                | Error::RunTimeout(_)
                | Error::Security(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
