//! Haggle wire protocol
//!
//! Types exchanged with the marketplace backend over two channels:
//!
//! - REST: `GET /conversation/last-chats` seeds the chat list once per
//!   session, `GET /conversation/peer/{id}` enriches shell conversations.
//! - Realtime: a persistent JSON connection carrying [`InboundEvent`]s from
//!   the server and [`OutboundFrame`]s from the client.
//!
//! All JSON uses camelCase field names. Realtime frames are adjacently
//! tagged: `{"event": "<kind>", "data": {...}}`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod errors;
mod ids;
mod message;
pub mod realtime;
pub mod rest;

pub use errors::{ProtocolError, Result};
pub use ids::{ConversationId, MessageId, PeerId};
pub use message::{Delivery, Message, PeerProfile};
pub use realtime::{EventKind, Handshake, InboundEvent, OutboundFrame};
pub use rest::{ChatSnapshot, LastChatsResponse, PeerResponse};
