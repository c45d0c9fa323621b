//! Protocol dialects for RELAYMSG.
//!
//! Two historical variants of the command coexist on the network. They agree
//! on the command surface and differ in who may relay, which nick shape is
//! enforced, which numerics report failures, and how the relay line looks
//! between servers. One dialect is picked at configuration load and handed
//! to the orchestrator as a trait object.

use std::fmt;

use super::host::{Actor, Authorizer, CapabilityOracle};
use super::nick::{NickError, NickShape, NickValidator};
use super::propagation::WireFormat;

/// Capability that lets a client issue RELAYMSG and receive the relay tag.
pub const RELAYMSG_CAP: &str = "overdrivenetworks.com/relaymsg";

/// Message tag naming the real sender of a relayed message.
pub const RELAYMSG_TAG: &str = "relaymsg";

/// Numerics used to report the dialect-specific failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorVocabulary {
    /// Spoofed nick collides with a real identity.
    pub nick_in_use: &'static str,
    /// Spoofed nick fails the character or shape rules.
    pub invalid_nick: &'static str,
}

/// Strategy interface implemented by each dialect.
pub trait Dialect: fmt::Debug + Send + Sync {
    /// Name used in configuration and logs.
    fn name(&self) -> &'static str;

    fn nick_shape(&self) -> &NickShape;

    /// Full nick check under this dialect's shape policy.
    fn validate_nick(&self, validator: &NickValidator, nick: &str) -> Result<(), NickError> {
        validator.validate(nick, self.nick_shape())
    }

    /// Whether a local actor may issue RELAYMSG at all.
    fn may_issue(
        &self,
        actor: &Actor,
        authorizer: &dyn Authorizer,
        capabilities: &dyn CapabilityOracle,
    ) -> bool;

    /// Whether a local recipient gets the `relaymsg` tag.
    fn tag_recipient(&self, recipient: &str, capabilities: &dyn CapabilityOracle) -> bool;

    fn wire_format(&self) -> WireFormat;

    fn vocabulary(&self) -> ErrorVocabulary;

    /// Client capability advertised in `CAP LS`: `(name, value)`.
    fn capability(&self) -> Option<(&'static str, &str)> {
        None
    }

    /// `RPL_ISUPPORT` token announcing the command.
    fn isupport_token(&self) -> Option<String> {
        None
    }
}

/// Relaying is gated on the negotiated client capability.
///
/// The nick must contain a separator, recipients holding the capability see
/// who really sent the message, and the actor travels with the relay line so
/// peers can rebuild that tag.
#[derive(Debug, Clone)]
pub struct CapabilityGatedDialect {
    shape: NickShape,
    require_oper: bool,
}

impl CapabilityGatedDialect {
    pub const NAME: &'static str = "capability";

    pub fn new(separator: impl Into<String>, require_oper: bool) -> Self {
        Self {
            shape: NickShape::RequiredSeparator(separator.into()),
            require_oper,
        }
    }

    pub fn separator(&self) -> &str {
        self.shape.advertised()
    }
}

impl Dialect for CapabilityGatedDialect {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn nick_shape(&self) -> &NickShape {
        &self.shape
    }

    fn may_issue(
        &self,
        actor: &Actor,
        authorizer: &dyn Authorizer,
        capabilities: &dyn CapabilityOracle,
    ) -> bool {
        if self.require_oper && !authorizer.is_operator(actor) {
            return false;
        }
        capabilities.has_capability(&actor.nick, RELAYMSG_CAP)
    }

    fn tag_recipient(&self, recipient: &str, capabilities: &dyn CapabilityOracle) -> bool {
        capabilities.has_capability(recipient, RELAYMSG_CAP)
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat {
            trailing_marker: true,
            forward_actor: true,
        }
    }

    fn vocabulary(&self) -> ErrorVocabulary {
        // ERR_BADRELAYNICK covers both collision and bad syntax.
        ErrorVocabulary {
            nick_in_use: "573",
            invalid_nick: "573",
        }
    }

    fn capability(&self) -> Option<(&'static str, &str)> {
        Some((RELAYMSG_CAP, self.separator()))
    }
}

/// Relaying is an operator privilege; no client capability is involved.
#[derive(Debug, Clone)]
pub struct PermissionGatedDialect {
    shape: NickShape,
    privilege: String,
}

impl PermissionGatedDialect {
    pub const NAME: &'static str = "permission";

    pub fn new(nickglob: impl Into<String>, privilege: impl Into<String>) -> Self {
        Self {
            shape: NickShape::GlobPattern(nickglob.into()),
            privilege: privilege.into(),
        }
    }

    pub fn privilege(&self) -> &str {
        &self.privilege
    }
}

impl Dialect for PermissionGatedDialect {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn nick_shape(&self) -> &NickShape {
        &self.shape
    }

    fn may_issue(
        &self,
        actor: &Actor,
        authorizer: &dyn Authorizer,
        _capabilities: &dyn CapabilityOracle,
    ) -> bool {
        authorizer.is_operator(actor) && authorizer.has_privilege(actor, &self.privilege)
    }

    fn tag_recipient(&self, _recipient: &str, _capabilities: &dyn CapabilityOracle) -> bool {
        false
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat {
            trailing_marker: false,
            forward_actor: false,
        }
    }

    fn vocabulary(&self) -> ErrorVocabulary {
        // ERR_NICKNAMEINUSE / ERR_ERRONEUSNICKNAME.
        ErrorVocabulary {
            nick_in_use: "433",
            invalid_nick: "432",
        }
    }

    fn isupport_token(&self) -> Option<String> {
        Some("RELAYMSG".into())
    }
}
