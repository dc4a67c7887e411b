use thiserror::Error;

use crate::model::GroupType;

/// Errors surfaced to callers of the roster store and the control API client.
///
/// Probe failures never show up here; they are converted into per-proxy
/// `DelayRecord::Error` entries instead.
#[derive(Debug, Error)]
pub enum RosterError {
    #[error("Control API base URL is not configured")]
    ConfigUnavailable,

    #[error("Invalid control API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("Control API answered {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed control API payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unknown proxy group: {0}")]
    UnknownGroup(String),

    #[error("'{member}' is not a member of group '{group}'")]
    UnknownMember { group: String, member: String },

    #[error("Group '{group}' is a {group_type} group and cannot be switched manually")]
    NotSelectable { group: String, group_type: GroupType },

    #[error("Unknown proxy provider: {0}")]
    UnknownProvider(String),
}

pub type RosterResult<T> = Result<T, RosterError>;
