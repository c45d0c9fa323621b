//! The RELAYMSG command itself.
//!
//! A request walks a fixed sequence of checks (permission, channel,
//! membership, collision, nick shape) and only then produces effects: local
//! delivery first, mesh propagation second. A rejected request has no
//! effects at all.

use std::sync::Arc;

use tracing::{debug, info};

use super::config::RelayConfig;
use super::host::{Actor, Collaborators};
use super::identity::{forge, ForgedIdentity};
use super::nick::NickError;
use super::propagation;
use super::tags::TagMarker;
use super::dialect::ErrorVocabulary;
use crate::irc::message::Message;

/// Where a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Issued by a client on this server.
    Local(Actor),
    /// Received from a peer; already authorized there.
    Remote {
        /// Real sender, when the peer's dialect forwards it.
        actor: Option<String>,
    },
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Nick that the `relaymsg` tag should carry.
    pub fn acting_nick(&self) -> Option<&str> {
        match self {
            Self::Local(actor) => Some(&actor.nick),
            Self::Remote { actor } => actor.as_deref(),
        }
    }
}

/// One relay invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub channel: String,
    pub nick: String,
    pub text: String,
    pub origin: Origin,
}

impl RelayRequest {
    /// Build a local request from `RELAYMSG` parameters.
    ///
    /// The text runs to the end of the line, so extra middle params are
    /// joined back into it.
    pub fn from_params(params: &[String], actor: Actor) -> Result<Self, RelayError> {
        let [channel, nick, rest @ ..] = params else {
            return Err(RelayError::NeedMoreParams);
        };
        if rest.is_empty() {
            return Err(RelayError::NeedMoreParams);
        }
        let text = rest.join(" ");
        if text.is_empty() {
            return Err(RelayError::NoTextToSend);
        }
        Ok(Self {
            channel: channel.clone(),
            nick: nick.clone(),
            text,
            origin: Origin::Local(actor),
        })
    }
}

/// Why a relay was refused. Every variant is terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("RELAYMSG takes <channel> <nick> <text>")]
    NeedMoreParams,
    #[error("no text to send")]
    NoTextToSend,
    #[error("permission denied")]
    PermissionDenied,
    #[error("no such channel {0}")]
    NoSuchChannel(String),
    #[error("cannot send to {0}: must be in channel")]
    CannotSendToChannel(String),
    #[error("spoofed nick {0} is already in use")]
    NickInUse(String),
    #[error("invalid spoofed nick {nick}: {reason}")]
    InvalidSpoofedNick { nick: String, reason: NickError },
}

impl RelayError {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NeedMoreParams => "arity",
            Self::NoTextToSend => "empty_text",
            Self::PermissionDenied => "permission",
            Self::NoSuchChannel(_) => "no_such_channel",
            Self::CannotSendToChannel(_) => "not_in_channel",
            Self::NickInUse(_) => "nick_in_use",
            Self::InvalidSpoofedNick { .. } => "invalid_nick",
        }
    }

    /// Numeric reply for the issuing client.
    pub fn to_reply(&self, server_name: &str, target: &str, vocab: ErrorVocabulary) -> Message {
        let (numeric, mut params): (&str, Vec<String>) = match self {
            Self::NeedMoreParams => (
                "461",
                vec!["RELAYMSG".into(), "Not enough parameters".into()],
            ),
            Self::NoTextToSend => ("412", vec!["No text to send".into()]),
            Self::PermissionDenied => (
                "481",
                vec!["Permission Denied - You do not have the required privileges".into()],
            ),
            Self::NoSuchChannel(channel) => {
                ("403", vec![channel.clone(), "No such channel".into()])
            }
            Self::CannotSendToChannel(channel) => (
                "404",
                vec![
                    channel.clone(),
                    "You must be in the channel to use this command.".into(),
                ],
            ),
            Self::NickInUse(nick) => (
                vocab.nick_in_use,
                vec![nick.clone(), "RELAYMSG spoofed nick is already in use".into()],
            ),
            Self::InvalidSpoofedNick { nick, reason } => {
                (vocab.invalid_nick, vec![nick.clone(), capitalize(&reason.to_string())])
            }
        };
        params.insert(0, target.to_owned());
        Message::new(Some(server_name.to_owned()), numeric, params)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// What a successful relay did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub source: ForgedIdentity,
    /// Local recipients the message was handed to.
    pub delivered: usize,
    pub propagated: bool,
}

/// Orchestrator bound to one configuration snapshot and one set of collaborators.
pub struct RelayCommand<'a> {
    config: Arc<RelayConfig>,
    host: Collaborators<'a>,
}

impl<'a> RelayCommand<'a> {
    pub fn new(config: Arc<RelayConfig>, host: Collaborators<'a>) -> Self {
        Self { config, host }
    }

    /// Run a request to completion.
    pub fn handle(&self, request: RelayRequest) -> Result<RelayOutcome, RelayError> {
        match self.run(&request) {
            Ok(outcome) => {
                debug!(
                    channel = %request.channel,
                    source = %outcome.source,
                    delivered = outcome.delivered,
                    propagated = outcome.propagated,
                    "relaymsg: relayed"
                );
                Ok(outcome)
            }
            Err(e) => {
                info!(
                    channel = %request.channel,
                    nick = %request.nick,
                    local = request.origin.is_local(),
                    kind = e.kind(),
                    "relaymsg: rejected: {e}"
                );
                Err(e)
            }
        }
    }

    fn run(&self, request: &RelayRequest) -> Result<RelayOutcome, RelayError> {
        let dialect = self.config.dialect();
        let host = &self.host;

        if request.text.is_empty() {
            return Err(RelayError::NoTextToSend);
        }

        // Authorization comes before any lookup so nothing leaks.
        if let Origin::Local(actor) = &request.origin {
            if !dialect.may_issue(actor, host.authorizer, host.capabilities) {
                return Err(RelayError::PermissionDenied);
            }
        }

        let channel = host
            .channels
            .resolve(&request.channel)
            .ok_or_else(|| RelayError::NoSuchChannel(request.channel.clone()))?;

        // Peers enforced membership on their side; our view may lag theirs.
        if let Origin::Local(actor) = &request.origin {
            if !host.channels.is_member(&channel, &actor.nick) {
                return Err(RelayError::CannotSendToChannel(channel));
            }
        }

        if host.identities.nick_in_use(&request.nick) {
            return Err(RelayError::NickInUse(request.nick.clone()));
        }

        dialect
            .validate_nick(self.config.validator(), &request.nick)
            .map_err(|reason| RelayError::InvalidSpoofedNick {
                nick: request.nick.clone(),
                reason,
            })?;

        let source = forge(&request.nick, self.config.ident(), self.config.host());

        let privmsg = Message::new(
            Some(source.mask()),
            "PRIVMSG",
            vec![channel.clone(), request.text.clone()],
        );
        let actor = request.origin.acting_nick();
        let recipients = host.channels.local_members(&channel);
        for recipient in &recipients {
            let marker = TagMarker::decide(dialect, host.capabilities, recipient, actor);
            host.broadcaster
                .deliver(recipient, marker.apply(privmsg.clone()));
        }

        // Instructions from the mesh are never fed back into it.
        let propagated = match &request.origin {
            Origin::Local(actor) => {
                let format = dialect.wire_format();
                let mut instruction = propagation::encode(&channel, &request.nick, &request.text);
                if format.forward_actor {
                    instruction = instruction.with_actor(actor.nick.clone());
                }
                host.mesh.propagate(&instruction, format);
                true
            }
            Origin::Remote { .. } => false,
        };

        Ok(RelayOutcome {
            source,
            delivered: recipients.len(),
            propagated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn from_params_requires_three_fields() {
        let actor = Actor::new("wings");
        assert_eq!(
            RelayRequest::from_params(&params(&["#chat", "a/b"]), actor.clone()),
            Err(RelayError::NeedMoreParams)
        );
        assert_eq!(
            RelayRequest::from_params(&[], actor.clone()),
            Err(RelayError::NeedMoreParams)
        );
        assert_eq!(
            RelayRequest::from_params(&params(&["#chat", "a/b", ""]), actor.clone()),
            Err(RelayError::NoTextToSend)
        );
        let req = RelayRequest::from_params(&params(&["#chat", "a/b", "hi all"]), actor).unwrap();
        assert_eq!(req.text, "hi all");
        assert!(req.origin.is_local());
    }

    #[test]
    fn text_without_colon_runs_to_end_of_line() {
        let msg = Message::parse("RELAYMSG #chat relay/alice hello wide world").unwrap();
        let req = RelayRequest::from_params(&msg.params, Actor::new("wings")).unwrap();
        assert_eq!(req.channel, "#chat");
        assert_eq!(req.nick, "relay/alice");
        assert_eq!(req.text, "hello wide world");
    }

    #[test]
    fn replies_use_dialect_vocabulary() {
        let cap = ErrorVocabulary {
            nick_in_use: "573",
            invalid_nick: "573",
        };
        let perm = ErrorVocabulary {
            nick_in_use: "433",
            invalid_nick: "432",
        };
        let err = RelayError::NickInUse("relay/bob".into());
        assert_eq!(
            err.to_reply("s.lagun.co", "wings", cap).to_wire(),
            ":s.lagun.co 573 wings relay/bob :RELAYMSG spoofed nick is already in use"
        );
        assert_eq!(err.to_reply("s.lagun.co", "wings", perm).command, "433");

        let err = RelayError::InvalidSpoofedNick {
            nick: "alice".into(),
            reason: NickError::MissingSeparator("/".into()),
        };
        assert_eq!(
            err.to_reply("s.lagun.co", "wings", cap).to_wire(),
            ":s.lagun.co 573 wings alice :Spoofed nick must include separator /"
        );
        assert_eq!(err.to_reply("s.lagun.co", "wings", perm).command, "432");
    }

    #[test]
    fn fixed_numerics() {
        let v = ErrorVocabulary {
            nick_in_use: "573",
            invalid_nick: "573",
        };
        let reply = |e: RelayError| e.to_reply("s.x", "me", v).command;
        assert_eq!(reply(RelayError::NeedMoreParams), "461");
        assert_eq!(reply(RelayError::NoTextToSend), "412");
        assert_eq!(reply(RelayError::PermissionDenied), "481");
        assert_eq!(reply(RelayError::NoSuchChannel("#x".into())), "403");
        assert_eq!(reply(RelayError::CannotSendToChannel("#x".into())), "404");
    }

    #[test]
    fn permission_reply_names_nothing() {
        let v = ErrorVocabulary {
            nick_in_use: "573",
            invalid_nick: "573",
        };
        let msg = RelayError::PermissionDenied.to_reply("s.x", "me", v);
        assert_eq!(msg.params.len(), 2);
        assert!(!msg.to_wire().contains('#'));
    }
}
