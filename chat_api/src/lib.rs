//! Wire types shared by the health assistant server and its clients.
//!
//! Field names follow the JSON contract of the REST surface (camelCase), so
//! the same structs are used for serialising responses on the server and for
//! decoding them on the client.

use serde::{Deserialize, Serialize};

/// Title given to conversations created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Public view of an account. The credential hash never leaves the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SignupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Returned by signup, login and token refresh.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

/// A conversation without its turns, as shown in listings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub active: bool,
    pub chat_count: u32,
    pub last_message_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RenameConversationRequest {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationList {
    pub conversations: Vec<ConversationSummary>,
}

/// A conversation together with its turns in creation order.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationDetail {
    pub conversation: ConversationSummary,
    pub chats: Vec<ChatTurn>,
}

/// Whether a turn carries typed text or describes an uploaded file.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

/// Metadata about an uploaded file. The content itself is never stored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    pub size: u64,
    pub mimetype: String,
}

/// One exchange: the user's message and, once answered, the AI response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub id: String,
    pub message: String,
    pub response: Option<String>,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub file_info: Option<FileInfo>,
    pub is_processed: bool,
    pub processing_time: Option<u64>,
    #[serde(default)]
    pub version: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Recorded but no answer attached yet.
    Pending,
    Processed,
}

impl ChatTurn {
    /// Only `response == None && !is_processed` counts as awaiting an answer.
    pub fn status(&self) -> TurnStatus {
        if self.response.is_none() && !self.is_processed {
            TurnStatus::Pending
        } else {
            TurnStatus::Processed
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TurnStatus::Pending
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub file_info: Option<FileInfo>,
}

/// Body of the patch that attaches an AI answer to a pending turn.
///
/// `expected_version` is optional: without it a second patch silently
/// overwrites the first, with it a stale patch is rejected.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachResponseRequest {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub processing_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// A prior (message, response) pair sent to the AI relay as context.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub message: String,
    pub response: Option<String>,
}

impl From<&ChatTurn> for HistoryTurn {
    fn from(turn: &ChatTurn) -> Self {
        Self {
            message: turn.message.clone(),
            response: turn.response.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscribeResponse {
    pub message: String,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
