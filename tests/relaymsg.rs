/// RELAYMSG orchestrator against recording test doubles.
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lagoon_relaymsg::irc::message::Message;
use lagoon_relaymsg::irc::relaymsg::nick::NickError;
use lagoon_relaymsg::irc::relaymsg::{
    Actor, Authorizer, Broadcaster, CapabilityGatedDialect, CapabilityOracle, ChannelLookup,
    Collaborators, IdentityRegistry, MeshPropagator, Origin, PermissionGatedDialect,
    RelayCommand, RelayConfig, RelayError, RelayRequest, WireFormat, WireInstruction,
    RELAYMSG_CAP, RELAYMSG_TAG,
};
use pretty_assertions::assert_eq;

const HOST: &str = "bridge.lagun.co";

/// In-memory server that records every interaction.
#[derive(Default)]
struct Recorder {
    channels: HashMap<String, Vec<String>>,
    users: HashSet<String>,
    opers: HashSet<String>,
    privileges: HashSet<(String, String)>,
    caps: HashSet<(String, String)>,
    lookups: Cell<usize>,
    delivered: RefCell<Vec<(String, Message)>>,
    propagated: RefCell<Vec<(WireInstruction, WireFormat)>>,
}

impl Recorder {
    fn with_chat() -> Self {
        let mut r = Self::default();
        r.channels
            .insert("#chat".into(), vec!["wings".into(), "legacy".into(), "modern".into()]);
        for nick in ["wings", "legacy", "modern"] {
            r.users.insert(nick.into());
        }
        r.opers.insert("wings".into());
        r.caps.insert(("wings".into(), RELAYMSG_CAP.into()));
        r.caps.insert(("modern".into(), RELAYMSG_CAP.into()));
        r
    }

    fn delivered_to(&self, nick: &str) -> Option<Message> {
        self.delivered
            .borrow()
            .iter()
            .find(|(n, _)| n == nick)
            .map(|(_, m)| m.clone())
    }
}

impl ChannelLookup for Recorder {
    fn resolve(&self, channel: &str) -> Option<String> {
        self.lookups.set(self.lookups.get() + 1);
        self.channels
            .keys()
            .find(|c| c.eq_ignore_ascii_case(channel))
            .cloned()
    }

    fn is_member(&self, channel: &str, nick: &str) -> bool {
        self.lookups.set(self.lookups.get() + 1);
        self.channels
            .get(channel)
            .is_some_and(|m| m.iter().any(|n| n == nick))
    }

    fn local_members(&self, channel: &str) -> Vec<String> {
        self.channels.get(channel).cloned().unwrap_or_default()
    }
}

impl IdentityRegistry for Recorder {
    fn nick_in_use(&self, nick: &str) -> bool {
        self.users.iter().any(|u| u.eq_ignore_ascii_case(nick))
    }
}

impl Broadcaster for Recorder {
    fn deliver(&self, recipient: &str, message: Message) {
        self.delivered
            .borrow_mut()
            .push((recipient.to_owned(), message));
    }
}

impl MeshPropagator for Recorder {
    fn propagate(&self, instruction: &WireInstruction, format: WireFormat) {
        self.propagated
            .borrow_mut()
            .push((instruction.clone(), format));
    }
}

impl CapabilityOracle for Recorder {
    fn has_capability(&self, nick: &str, capability: &str) -> bool {
        self.caps.contains(&(nick.to_owned(), capability.to_owned()))
    }
}

impl Authorizer for Recorder {
    fn is_operator(&self, actor: &Actor) -> bool {
        self.opers.contains(&actor.nick)
    }

    fn has_privilege(&self, actor: &Actor, privilege: &str) -> bool {
        self.privileges
            .contains(&(actor.nick.clone(), privilege.to_owned()))
    }
}

fn capability_config() -> Arc<RelayConfig> {
    Arc::new(
        RelayConfig::new(Arc::new(CapabilityGatedDialect::new("/", true)), "relay", HOST)
            .unwrap(),
    )
}

fn permission_config() -> Arc<RelayConfig> {
    Arc::new(
        RelayConfig::new(
            Arc::new(PermissionGatedDialect::new("*/*", "relaymsg")),
            "relay",
            HOST,
        )
        .unwrap(),
    )
}

fn local(channel: &str, nick: &str, text: &str, actor: &str) -> RelayRequest {
    RelayRequest {
        channel: channel.into(),
        nick: nick.into(),
        text: text.into(),
        origin: Origin::Local(Actor::new(actor)),
    }
}

fn remote(channel: &str, nick: &str, text: &str) -> RelayRequest {
    RelayRequest {
        channel: channel.into(),
        nick: nick.into(),
        text: text.into(),
        origin: Origin::Remote { actor: None },
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[test]
fn scenario_a_relays_and_propagates() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    let outcome = cmd
        .handle(local("#chat", "relay/alice", "hello from the bridge", "wings"))
        .unwrap();
    assert_eq!(outcome.source.mask(), "relay/alice!relay@bridge.lagun.co");
    assert_eq!(outcome.delivered, 3);
    assert!(outcome.propagated);

    let legacy = host.delivered_to("legacy").unwrap();
    assert_eq!(
        legacy.to_wire(),
        ":relay/alice!relay@bridge.lagun.co PRIVMSG #chat :hello from the bridge"
    );

    let propagated = host.propagated.borrow();
    assert_eq!(propagated.len(), 1);
    let (ins, format) = &propagated[0];
    assert_eq!(ins.channel, "#chat");
    assert_eq!(ins.nick, "relay/alice");
    assert_eq!(ins.text, "hello from the bridge");
    assert_eq!(ins.actor.as_deref(), Some("wings"));
    assert!(format.trailing_marker);
}

#[test]
fn scenario_b_missing_separator_is_rejected() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    let err = cmd.handle(local("#chat", "alice", "hi", "wings")).unwrap_err();
    assert_eq!(
        err,
        RelayError::InvalidSpoofedNick {
            nick: "alice".into(),
            reason: NickError::MissingSeparator("/".into()),
        }
    );
    assert!(host.delivered.borrow().is_empty());
    assert!(host.propagated.borrow().is_empty());
}

#[test]
fn scenario_c_live_nick_is_in_use() {
    let mut host = Recorder::with_chat();
    host.users.insert("relay/bob".into());
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    let err = cmd.handle(local("#chat", "relay/bob", "hi", "wings")).unwrap_err();
    assert_eq!(err, RelayError::NickInUse("relay/bob".into()));
    assert!(host.delivered.borrow().is_empty());
    assert!(host.propagated.borrow().is_empty());
}

#[test]
fn scenario_d_denied_before_any_channel_lookup() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    // "legacy" is neither an operator nor holds the capability.
    let err = cmd.handle(local("#chat", "relay/x", "hi", "legacy")).unwrap_err();
    assert_eq!(err, RelayError::PermissionDenied);
    assert_eq!(host.lookups.get(), 0);

    // Same answer for a channel that does not exist.
    let err = cmd.handle(local("#nowhere", "relay/x", "hi", "legacy")).unwrap_err();
    assert_eq!(err, RelayError::PermissionDenied);
    assert_eq!(host.lookups.get(), 0);
    assert!(host.delivered.borrow().is_empty());
    assert!(host.propagated.borrow().is_empty());
}

#[test]
fn scenario_e_remote_skips_membership_and_is_not_forwarded() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    let outcome = cmd.handle(remote("#chat", "relay/carol", "hi")).unwrap();
    assert_eq!(outcome.delivered, 3);
    assert!(!outcome.propagated);
    // resolve only; membership is never asked.
    assert_eq!(host.lookups.get(), 1);
    assert!(host.propagated.borrow().is_empty());
    assert_eq!(
        host.delivered_to("modern").unwrap().to_wire(),
        ":relay/carol!relay@bridge.lagun.co PRIVMSG #chat :hi"
    );
}

// ── Ordering and side effects ───────────────────────────────────────

#[test]
fn unknown_channel_and_non_member() {
    let mut host = Recorder::with_chat();
    host.opers.insert("outsider".into());
    host.caps.insert(("outsider".into(), RELAYMSG_CAP.into()));
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    assert_eq!(
        cmd.handle(local("#nowhere", "relay/x", "hi", "wings")),
        Err(RelayError::NoSuchChannel("#nowhere".into()))
    );
    assert_eq!(
        cmd.handle(local("#chat", "relay/x", "hi", "outsider")),
        Err(RelayError::CannotSendToChannel("#chat".into()))
    );
    assert!(host.delivered.borrow().is_empty());
    assert!(host.propagated.borrow().is_empty());
}

#[test]
fn channel_name_is_canonicalized() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));
    cmd.handle(local("#CHAT", "relay/alice", "hi", "wings")).unwrap();
    assert_eq!(host.propagated.borrow()[0].0.channel, "#chat");
}

#[test]
fn remote_requests_still_check_collision_and_shape() {
    let mut host = Recorder::with_chat();
    host.users.insert("relay/bob".into());
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));

    assert_eq!(
        cmd.handle(remote("#chat", "relay/bob", "hi")),
        Err(RelayError::NickInUse("relay/bob".into()))
    );
    assert!(matches!(
        cmd.handle(remote("#chat", "carol", "hi")),
        Err(RelayError::InvalidSpoofedNick { .. })
    ));
    assert!(matches!(
        cmd.handle(remote("#chat", "re.lay/carol", "hi")),
        Err(RelayError::InvalidSpoofedNick {
            reason: NickError::ForbiddenChar('.'),
            ..
        })
    ));
    assert!(host.delivered.borrow().is_empty());
}

#[test]
fn empty_text_is_rejected() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));
    assert_eq!(
        cmd.handle(local("#chat", "relay/x", "", "wings")),
        Err(RelayError::NoTextToSend)
    );
    assert_eq!(host.lookups.get(), 0);
}

// ── Tags ────────────────────────────────────────────────────────────

#[test]
fn only_capable_recipients_see_the_actor() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));
    cmd.handle(local("#chat", "relay/alice", "hi", "wings")).unwrap();

    let modern = host.delivered_to("modern").unwrap();
    assert_eq!(modern.tag(RELAYMSG_TAG), Some(Some("wings")));
    let legacy = host.delivered_to("legacy").unwrap();
    assert_eq!(legacy.tag(RELAYMSG_TAG), None);
}

#[test]
fn remote_actor_is_used_for_tags() {
    let host = Recorder::with_chat();
    let cmd = RelayCommand::new(capability_config(), Collaborators::from_host(&host));
    let mut req = remote("#chat", "relay/carol", "hi");
    req.origin = Origin::Remote {
        actor: Some("farbot".into()),
    };
    cmd.handle(req).unwrap();
    assert_eq!(
        host.delivered_to("modern").unwrap().tag(RELAYMSG_TAG),
        Some(Some("farbot"))
    );
}

// ── Permission dialect ──────────────────────────────────────────────

#[test]
fn permission_dialect_needs_privilege_not_capability() {
    let mut host = Recorder::with_chat();
    {
        let cmd = RelayCommand::new(permission_config(), Collaborators::from_host(&host));
        // Operator with the capability but without the privilege.
        assert_eq!(
            cmd.handle(local("#chat", "relay/alice", "hi", "wings")),
            Err(RelayError::PermissionDenied)
        );
    }

    host.privileges.insert(("wings".into(), "relaymsg".into()));
    let cmd = RelayCommand::new(permission_config(), Collaborators::from_host(&host));
    cmd.handle(local("#chat", "relay/alice", "hi", "wings")).unwrap();

    // No tags under this dialect, and the actor stays home.
    assert_eq!(host.delivered_to("modern").unwrap().tag(RELAYMSG_TAG), None);
    let propagated = host.propagated.borrow();
    assert_eq!(propagated[0].0.actor, None);
    assert!(!propagated[0].1.trailing_marker);
}

#[test]
fn permission_dialect_enforces_glob() {
    let mut host = Recorder::with_chat();
    host.privileges.insert(("wings".into(), "relaymsg".into()));
    let cmd = RelayCommand::new(permission_config(), Collaborators::from_host(&host));
    assert_eq!(
        cmd.handle(local("#chat", "alice", "hi", "wings")),
        Err(RelayError::InvalidSpoofedNick {
            nick: "alice".into(),
            reason: NickError::PatternMismatch("*/*".into()),
        })
    );
}
