//! RELAYMSG: stateless relaying of channel messages under a synthetic nick.
//!
//! A trusted client (a bridge or a bot) asks the server to show a message in
//! a channel as if it came from `nick!ident@host`, where the nick belongs to
//! nobody connected. The command validates the request, delivers the message
//! locally and re-announces it to every other server in the mesh. Nothing is
//! stored: no session, no membership, no state survives the request.
//!
//! The orchestrator ([`RelayCommand`]) only talks to the hosting server
//! through the traits in [`host`], so it can be driven by the IRC server in
//! this crate or by test doubles.

pub mod command;
pub mod config;
pub mod dialect;
pub mod host;
pub mod identity;
pub mod nick;
pub mod propagation;
pub mod tags;

pub use command::{Origin, RelayCommand, RelayError, RelayOutcome, RelayRequest};
pub use config::{ConfigError, ConfigHandle, RawRelayConfig, RelayConfig};
pub use dialect::{
    CapabilityGatedDialect, Dialect, ErrorVocabulary, PermissionGatedDialect, RELAYMSG_CAP,
    RELAYMSG_TAG,
};
pub use host::{
    Actor, Authorizer, Broadcaster, CapabilityOracle, ChannelLookup, Collaborators,
    IdentityRegistry, MeshPropagator,
};
pub use identity::ForgedIdentity;
pub use nick::{NickError, NickShape, NickValidator};
pub use propagation::{WireFormat, WireInstruction};
