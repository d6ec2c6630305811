//! Opaque identifiers assigned by the backend.
//!
//! Identifiers are strings on the wire (database object ids). They are wrapped
//! in newtypes so a message id can never be passed where a conversation id is
//! expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix marking a conversation id minted locally before the server assigned
/// one.
const PROVISIONAL_PREFIX: &str = "peer:";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    /// Identity of a chat counterpart (a marketplace user).
    PeerId
);

string_id!(
    /// Identity of a conversation thread.
    ConversationId
);

string_id!(
    /// Identity of a message, unique within its conversation.
    MessageId
);

impl ConversationId {
    /// Local id for a thread with `peer` that the server has not created yet.
    pub fn provisional(peer: &PeerId) -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{peer}"))
    }

    /// Whether this id was minted locally by [`ConversationId::provisional`].
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}
