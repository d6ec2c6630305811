//! Line commands read from stdin.
//!
//! ```text
//! /send <conversation> <text...>
//! /open <peer-id> [name...]
//! /read <conversation> [message]
//! /retry <conversation> <message>
//! /logout
//! /quit
//! ```

use std::time::Instant;

use haggle_app::{Command, DriverInput};
use haggle_proto::{ConversationId, MessageId, PeerId, PeerProfile};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};

/// Why a line did not parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Not a known command.
    #[error("unknown command: {0}")]
    Unknown(String),

    /// Known command, wrong arguments.
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    let command = match name {
        "/send" => {
            let (conversation, text) =
                rest.split_once(char::is_whitespace).ok_or(CommandError::Usage("/send <conversation> <text>"))?;
            let text = text.trim();
            if text.is_empty() {
                return Err(CommandError::Usage("/send <conversation> <text>"));
            }
            Command::Send { conversation_id: ConversationId::from(conversation), text: text.to_string() }
        },
        "/open" => {
            let peer = args.next().ok_or(CommandError::Usage("/open <peer-id> [name]"))?;
            let name: Vec<&str> = args.collect();
            let mut profile = PeerProfile::placeholder(PeerId::from(peer));
            if !name.is_empty() {
                profile.name = name.join(" ");
            }
            Command::OpenWithPeer(profile)
        },
        "/read" => {
            let conversation = args.next().ok_or(CommandError::Usage("/read <conversation> [message]"))?;
            Command::MarkRead {
                conversation_id: ConversationId::from(conversation),
                up_to: args.next().map(MessageId::from),
            }
        },
        "/retry" => {
            let (Some(conversation), Some(message)) = (args.next(), args.next()) else {
                return Err(CommandError::Usage("/retry <conversation> <message>"));
            };
            Command::Retry { conversation_id: ConversationId::from(conversation), message_id: MessageId::from(message) }
        },
        "/logout" => Command::Stop,
        "/quit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Forward stdin commands to the runtime until EOF, then quit.
pub async fn read_stdin(inputs: mpsc::UnboundedSender<DriverInput<Instant>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse(&line) {
                Ok(Some(command)) => {
                    if inputs.send(DriverInput::Command(command)).is_err() {
                        return;
                    }
                },
                Ok(None) => {},
                Err(error) => tracing::warn!(%error, "ignoring input"),
            },
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(%error, "stdin read failed");
                break;
            },
        }
    }
    let _ = inputs.send(DriverInput::Command(Command::Quit));
}
