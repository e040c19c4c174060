use ai_relay::InferenceFailure;
use chat_api::ErrorBody;
use thiserror::Error;

/// Everything that can go wrong while driving the conversation API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Nothing to send: no file and only whitespace text.
    #[error("Message content is required")]
    EmptyMessage,

    /// The server answered with a non-success status.
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Request timed out. Please try again.")]
    Timeout,

    #[error("network error: {0}")]
    Transport(String),

    #[error(transparent)]
    Inference(#[from] InferenceFailure),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Build from a failed response body, falling back to the raw text.
    pub(crate) fn from_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.message)
            .unwrap_or_else(|_| body.trim().to_string());
        ClientError::Api { status, message }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}
