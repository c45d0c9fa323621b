//! Server-to-server form of a relay.
//!
//! A locally accepted relay is re-announced to every peer as
//!
//! ```text
//! :<actor-or-server> ENCAP * RELAYMSG <channel> <nick> :<text>
//! ```
//!
//! Peers execute it as a remote-origin request and never forward it again;
//! that one rule is the whole loop-prevention story, since each server links
//! directly to every other server. Delivery is fire-and-forget.

use super::command::{Origin, RelayRequest};
use crate::irc::message::Message;

pub const ENCAP: &str = "ENCAP";
pub const RELAYMSG: &str = "RELAYMSG";

/// Dialect-level knobs for the relay line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    /// Text is sent as `:` + text inside the encapsulated parameter list.
    pub trailing_marker: bool,
    /// The acting local identity is sent as the line's source.
    pub forward_actor: bool,
}

/// The `(channel, nick, text)` triple travelling between servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireInstruction {
    pub channel: String,
    pub nick: String,
    pub text: String,
    /// Real sender, when the dialect forwards it.
    pub actor: Option<String>,
}

/// Why an inbound peer line is not a usable relay instruction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("not an ENCAP RELAYMSG line")]
    NotRelay,
    #[error("ENCAP target {0:?} is not broadcast")]
    Target(String),
    #[error("expected 3 RELAYMSG parameters, got {0}")]
    Arity(usize),
    #[error("relayed text is empty")]
    EmptyText,
}

/// Build the instruction for a validated local relay.
pub fn encode(channel: &str, nick: &str, text: &str) -> WireInstruction {
    WireInstruction {
        channel: channel.to_owned(),
        nick: nick.to_owned(),
        text: text.to_owned(),
        actor: None,
    }
}

/// Turn a received instruction into a request for the local orchestrator.
pub fn decode(instruction: WireInstruction) -> RelayRequest {
    RelayRequest {
        channel: instruction.channel,
        nick: instruction.nick,
        text: instruction.text,
        origin: Origin::Remote {
            actor: instruction.actor,
        },
    }
}

impl WireInstruction {
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Render as an IRC line sourced from `server_name` (or the actor).
    pub fn to_message(&self, server_name: &str, format: WireFormat) -> Message {
        let source = match (&self.actor, format.forward_actor) {
            (Some(actor), true) => actor.clone(),
            _ => server_name.to_owned(),
        };
        let text = if format.trailing_marker {
            format!(":{}", self.text)
        } else {
            self.text.clone()
        };
        Message::new(
            Some(source),
            ENCAP,
            vec![
                "*".into(),
                RELAYMSG.into(),
                self.channel.clone(),
                self.nick.clone(),
                text,
            ],
        )
    }

    /// Parse an inbound peer line.
    pub fn from_message(msg: &Message, format: WireFormat) -> Result<Self, DecodeError> {
        if !msg.command.eq_ignore_ascii_case(ENCAP)
            || !msg
                .params
                .get(1)
                .is_some_and(|c| c.eq_ignore_ascii_case(RELAYMSG))
        {
            return Err(DecodeError::NotRelay);
        }
        if msg.params[0] != "*" {
            return Err(DecodeError::Target(msg.params[0].clone()));
        }
        let args = &msg.params[2..];
        if args.len() != 3 {
            return Err(DecodeError::Arity(args.len()));
        }

        let raw_text = args[2].as_str();
        let text = if format.trailing_marker {
            raw_text.strip_prefix(':').unwrap_or(raw_text)
        } else {
            raw_text
        };
        if text.is_empty() {
            return Err(DecodeError::EmptyText);
        }

        // Server names always contain a dot; nicks never can, as long as
        // `server::is_valid_nick` keeps refusing `.`.
        let actor = msg
            .source_nick()
            .filter(|s| format.forward_actor && !s.contains('.'))
            .map(str::to_owned);

        Ok(Self {
            channel: args[0].clone(),
            nick: args[1].clone(),
            text: text.to_owned(),
            actor,
        })
    }
}
