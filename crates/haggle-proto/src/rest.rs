//! REST response bodies consumed by the chat core.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, Message, PeerProfile};

/// Path of the last-chats endpoint.
pub const LAST_CHATS_PATH: &str = "/conversation/last-chats";

/// Path of the peer enrichment endpoint for a conversation.
pub fn peer_path(conversation_id: &ConversationId) -> String {
    format!("/conversation/peer/{conversation_id}")
}

/// One conversation as returned by the server: the active-chat projection
/// plus an optional tail of recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    /// Conversation id.
    pub id: ConversationId,
    /// The counterpart.
    pub peer_profile: PeerProfile,
    /// Most recent message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Unread count as computed by the server.
    #[serde(default, alias = "unreadChatCounts")]
    pub unread_count: u32,
    /// Recent history, oldest first. May be empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

/// `GET /conversation/last-chats` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastChatsResponse {
    /// Recent conversations.
    pub chats: Vec<ChatSnapshot>,
}

/// `GET /conversation/peer/{id}` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerResponse {
    /// Counterpart profile.
    pub peer: PeerProfile,
}
