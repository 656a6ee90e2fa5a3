use std::collections::HashMap;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Session token rejected (401/403). Recovery requires a new token.
    #[error("unauthorized: the session token was rejected by the marketplace")]
    Unauthorized,

    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Raise rejected with an upstream cooldown hint.
    #[error("raise rejected: {error_message}")]
    Raise {
        wait_time: Option<u64>,
        error_message: String,
    },

    /// Lot save rejected; `errors` maps offending field names to messages.
    #[error("lot save rejected: {errors:?}")]
    LotSaving { errors: HashMap<String, String> },

    #[error("feedback editing rejected: {0}")]
    FeedbackEditing(String),

    #[error("failed to parse upstream response: {0}")]
    Parse(String),
}

impl ClientError {
    /// The upstream dropped the TCP session mid-response. The supervisor
    /// treats this as the proxy being blocked rather than a transient fault.
    pub fn is_connection_dropped(&self) -> bool {
        match self {
            ClientError::RequestFailed { body, .. } => {
                body.contains("EOF") || body.contains("RemoteDisconnected")
            }
            ClientError::Network(e) => {
                let text = e.to_string();
                text.contains("connection closed") || text.contains("IncompleteMessage")
            }
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::RequestFailed { status, .. } => Some(*status),
            ClientError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
