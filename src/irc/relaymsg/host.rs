//! Narrow interfaces onto the server that hosts the relay command.
//!
//! The orchestrator only ever talks to the server through these traits.
//! All calls are synchronous, in-memory and must not block.

use super::propagation::{WireFormat, WireInstruction};
use crate::irc::message::Message;

/// Who issued a local relay command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub nick: String,
}

impl Actor {
    pub fn new(nick: impl Into<String>) -> Self {
        Self { nick: nick.into() }
    }
}

/// Channel existence and membership.
pub trait ChannelLookup {
    /// Canonical name of the channel, if it exists.
    fn resolve(&self, channel: &str) -> Option<String>;
    fn is_member(&self, channel: &str, nick: &str) -> bool;
    /// Nicks of local members that should receive channel traffic.
    fn local_members(&self, channel: &str) -> Vec<String>;
}

/// Live registry of real, session-backed identities.
pub trait IdentityRegistry {
    fn nick_in_use(&self, nick: &str) -> bool;
}

/// Fan-out to local sessions.
pub trait Broadcaster {
    fn deliver(&self, recipient: &str, message: Message);
}

/// Best-effort broadcast to every other server in the mesh.
///
/// There is no return value: a peer that misses the instruction is not the
/// issuer's problem.
pub trait MeshPropagator {
    fn propagate(&self, instruction: &WireInstruction, format: WireFormat);
}

/// Per-connection negotiated capabilities.
pub trait CapabilityOracle {
    fn has_capability(&self, nick: &str, capability: &str) -> bool;
}

/// Boolean authorization decisions.
pub trait Authorizer {
    /// Holds the operator-class flag.
    fn is_operator(&self, actor: &Actor) -> bool;
    /// Holds a named fine-grained privilege.
    fn has_privilege(&self, actor: &Actor, privilege: &str) -> bool;
}

/// Everything the orchestrator needs, borrowed for one request.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub channels: &'a dyn ChannelLookup,
    pub identities: &'a dyn IdentityRegistry,
    pub broadcaster: &'a dyn Broadcaster,
    pub mesh: &'a dyn MeshPropagator,
    pub capabilities: &'a dyn CapabilityOracle,
    pub authorizer: &'a dyn Authorizer,
}

impl<'a> Collaborators<'a> {
    /// Borrow every interface from a single host object.
    pub fn from_host<H>(host: &'a H) -> Self
    where
        H: ChannelLookup
            + IdentityRegistry
            + Broadcaster
            + MeshPropagator
            + CapabilityOracle
            + Authorizer,
    {
        Self {
            channels: host,
            identities: host,
            broadcaster: host,
            mesh: host,
            capabilities: host,
            authorizer: host,
        }
    }
}
