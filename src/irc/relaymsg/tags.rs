//! Per-recipient decision on the `relaymsg` message tag.

use super::dialect::{Dialect, RELAYMSG_TAG};
use super::host::CapabilityOracle;
use crate::irc::message::Message;

/// Whether one recipient's copy of a relayed message carries the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagMarker {
    /// Attach `relaymsg=<actor>`.
    Attach(String),
    Omit,
}

impl TagMarker {
    /// Decide for `recipient`. Nothing is attached without a known actor.
    pub fn decide(
        dialect: &dyn Dialect,
        capabilities: &dyn CapabilityOracle,
        recipient: &str,
        actor: Option<&str>,
    ) -> Self {
        match actor {
            Some(actor) if dialect.tag_recipient(recipient, capabilities) => {
                Self::Attach(actor.to_owned())
            }
            _ => Self::Omit,
        }
    }

    pub fn apply(self, message: Message) -> Message {
        match self {
            Self::Attach(actor) => message.with_tag(RELAYMSG_TAG, Some(actor)),
            Self::Omit => message,
        }
    }
}
