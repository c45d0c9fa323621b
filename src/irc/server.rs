/// IRC server core: client sessions, channels, peer links and the RELAYMSG host.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::IrcCodec;
use super::mesh::{self, MeshLinks, PEERS};
use super::message::Message;
use super::relaymsg::propagation::{self, DecodeError};
use super::relaymsg::{
    Actor, Authorizer, Broadcaster, CapabilityOracle, ChannelLookup, Collaborators,
    ConfigHandle, IdentityRegistry, MeshPropagator, RawRelayConfig, RelayCommand, RelayConfig,
    RelayRequest, WireFormat, WireInstruction,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server identity: `SERVER_NAME`, else the system hostname if it is fully
/// qualified, else `lagoon.lagun.co`.
pub static SERVER_NAME: LazyLock<String> = LazyLock::new(|| {
    std::env::var("SERVER_NAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .filter(|h| h.contains('.'))
        })
        .unwrap_or_else(|| "lagoon.lagun.co".into())
});

/// Listen addresses (`LAGOON_IRC_BIND`, comma-separated).
pub static BIND_ADDRS: LazyLock<Vec<String>> = LazyLock::new(|| {
    let addrs: Vec<String> = std::env::var("LAGOON_IRC_BIND")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if addrs.is_empty() {
        vec!["0.0.0.0:6667".into()]
    } else {
        addrs
    }
});

/// `OPER` password. Without one, nobody can become an operator.
pub static OPER_PASSWORD: LazyLock<Option<String>> = LazyLock::new(|| {
    std::env::var("LAGOON_OPER_PASSWORD")
        .ok()
        .filter(|s| !s.is_empty())
});

/// Privileges granted by a successful `OPER` (`LAGOON_OPER_PRIVILEGES`).
pub static OPER_PRIVILEGES: LazyLock<Vec<String>> = LazyLock::new(|| {
    let privileges: Vec<String> = std::env::var("LAGOON_OPER_PRIVILEGES")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if privileges.is_empty() {
        vec!["relaymsg".into()]
    } else {
        privileges
    }
});

pub const MESSAGE_TAGS_CAP: &str = "message-tags";

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    pub name: String,
    /// Registered clients: nick → handle.
    pub clients: HashMap<String, ClientHandle>,
    /// Channels: name → member nicks.
    pub channels: HashMap<String, HashSet<String>>,
    pub relay: ConfigHandle,
    /// Outbound links, one per peer.
    pub links: MeshLinks,
    /// Server names accepted in an inbound `SERVER` handshake.
    pub trusted_peers: HashSet<String>,
    /// Peers currently linked to us.
    pub inbound_peers: HashSet<String>,
    pub oper_password: Option<String>,
    pub oper_privileges: Vec<String>,
}

/// Handle to send messages to a connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub nick: String,
    pub user: String,
    pub addr: SocketAddr,
    /// Negotiated capabilities.
    pub caps: HashSet<String>,
    pub oper: bool,
    pub privileges: HashSet<String>,
    pub tx: mpsc::UnboundedSender<Message>,
}

impl ClientHandle {
    pub fn mask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.addr.ip())
    }
}

impl ServerState {
    pub fn new(name: impl Into<String>, relay: ConfigHandle) -> Self {
        Self {
            name: name.into(),
            clients: HashMap::new(),
            channels: HashMap::new(),
            relay,
            links: MeshLinks::new(),
            trusted_peers: HashSet::new(),
            inbound_peers: HashSet::new(),
            oper_password: None,
            oper_privileges: Vec::new(),
        }
    }

    /// Look up a client under rfc1459 casemapping.
    pub fn find_client(&self, nick: &str) -> Option<&ClientHandle> {
        self.clients
            .get(nick)
            .or_else(|| self.clients.values().find(|c| irc_eq(&c.nick, nick)))
    }

    /// Canonical name of a channel under rfc1459 casemapping.
    pub fn find_channel(&self, channel: &str) -> Option<&str> {
        self.channels
            .keys()
            .find(|c| irc_eq(c, channel))
            .map(String::as_str)
    }
}

/// rfc1459 lowercase: ASCII letters plus `[]\^` to `{}|~`.
fn irc_lower(b: u8) -> u8 {
    match b {
        b'[' => b'{',
        b']' => b'}',
        b'\\' => b'|',
        b'^' => b'~',
        _ => b.to_ascii_lowercase(),
    }
}

/// Compare two names under rfc1459 casemapping.
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .all(|(x, y)| irc_lower(x) == irc_lower(y))
}

/// Shared, thread-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

/// Read-only view of the server handed to the RELAYMSG command.
pub struct HostView<'a> {
    state: &'a ServerState,
}

impl<'a> HostView<'a> {
    pub fn new(state: &'a ServerState) -> Self {
        Self { state }
    }
}

impl ChannelLookup for HostView<'_> {
    fn resolve(&self, channel: &str) -> Option<String> {
        self.state.find_channel(channel).map(str::to_owned)
    }

    fn is_member(&self, channel: &str, nick: &str) -> bool {
        self.state
            .channels
            .get(channel)
            .is_some_and(|m| m.contains(nick))
    }

    fn local_members(&self, channel: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .state
            .channels
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }
}

impl IdentityRegistry for HostView<'_> {
    fn nick_in_use(&self, nick: &str) -> bool {
        self.state.find_client(nick).is_some()
    }
}

impl Broadcaster for HostView<'_> {
    fn deliver(&self, recipient: &str, message: Message) {
        if let Some(handle) = self.state.clients.get(recipient) {
            let _ = handle.tx.send(message);
        }
    }
}

impl MeshPropagator for HostView<'_> {
    fn propagate(&self, instruction: &WireInstruction, format: WireFormat) {
        let line = instruction.to_message(&self.state.name, format);
        self.state.links.broadcast(&line);
    }
}

impl CapabilityOracle for HostView<'_> {
    fn has_capability(&self, nick: &str, capability: &str) -> bool {
        self.state
            .clients
            .get(nick)
            .is_some_and(|c| c.caps.contains(capability))
    }
}

impl Authorizer for HostView<'_> {
    fn is_operator(&self, actor: &Actor) -> bool {
        self.state
            .clients
            .get(&actor.nick)
            .is_some_and(|c| c.oper)
    }

    fn has_privilege(&self, actor: &Actor, privilege: &str) -> bool {
        self.state
            .clients
            .get(&actor.nick)
            .is_some_and(|c| c.oper && c.privileges.contains(privilege))
    }
}

/// Run the IRC server on the given addresses with settings from the environment.
pub async fn run(addrs: &[String], relay: ConfigHandle) -> Result<(), BoxError> {
    let mut st = ServerState::new(SERVER_NAME.clone(), relay);
    st.oper_password = OPER_PASSWORD.clone();
    st.oper_privileges = OPER_PRIVILEGES.clone();
    st.trusted_peers = PEERS
        .iter()
        .map(|p| mesh::peer_host(p).to_owned())
        .collect();
    for peer in PEERS.iter() {
        st.links.connect(peer, &st.name);
    }
    let state: SharedState = Arc::new(RwLock::new(st));

    // Bind all listeners first, so we fail fast on port conflicts.
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = TcpListener::bind(addr).await?;
        info!("lagoon listening on {addr}");
        listeners.push(listener);
    }

    let mut handles = Vec::new();
    for listener in listeners {
        handles.push(tokio::spawn(serve(listener, Arc::clone(&state))));
    }

    let serving = async {
        for handle in handles {
            handle.await??;
        }
        Ok::<(), BoxError>(())
    };
    let result = tokio::select! {
        result = serving => result,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    let links = std::mem::take(&mut state.write().await.links);
    links.shutdown().await;
    result
}

/// Accept loop for a single listener.
pub async fn serve(listener: TcpListener, state: SharedState) -> Result<(), BoxError> {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "new connection");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, state).await {
                warn!(%addr, "client error: {e}");
            }
            info!(%addr, "disconnected");
        });
    }
}

/// Per-connection state during registration.
#[derive(Default)]
struct PendingRegistration {
    nick: Option<String>,
    user: Option<String>,
    caps: HashSet<String>,
    /// `CAP LS`/`REQ` seen without `CAP END`.
    negotiating: bool,
}

type ClientFramed = Framed<TcpStream, IrcCodec>;

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    state: SharedState,
) -> Result<(), BoxError> {
    let mut framed = Framed::new(socket, IrcCodec::default());
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let server_name = state.read().await.name.clone();

    let mut pending = PendingRegistration::default();
    let mut registered_nick: Option<String> = None;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(%addr, "read error: {e}");
                        break;
                    }
                    None => break,
                };

                match registered_nick {
                    None => {
                        if msg.command.eq_ignore_ascii_case("SERVER") {
                            return handle_peer(framed, &msg, addr, &state).await;
                        }
                        if handle_registration(&mut framed, &mut pending, &msg, &server_name, &state).await?
                            == CommandResult::Quit
                        {
                            break;
                        }

                        if pending.negotiating {
                            continue;
                        }
                        if let (Some(nick), Some(user)) = (&pending.nick, &pending.user) {
                            let nick = nick.clone();
                            {
                                let mut st = state.write().await;
                                if st.find_client(&nick).is_some() {
                                    drop(st);
                                    let err = Message::new(
                                        Some(server_name.clone()),
                                        "433",
                                        vec!["*".into(), nick.clone(), "Nickname is already in use".into()],
                                    );
                                    framed.send(err).await?;
                                    pending.nick = None;
                                    continue;
                                }
                                st.clients.insert(nick.clone(), ClientHandle {
                                    nick: nick.clone(),
                                    user: user.clone(),
                                    addr,
                                    caps: std::mem::take(&mut pending.caps),
                                    oper: false,
                                    privileges: HashSet::new(),
                                    tx: tx.clone(),
                                });
                            }
                            info!(%addr, nick, "registered");
                            let config = state.read().await.relay.snapshot();
                            send_welcome(&mut framed, &server_name, &nick, &config).await?;
                            registered_nick = Some(nick);
                        }
                    }
                    Some(ref nick) => {
                        match handle_command(&mut framed, nick, &msg, &server_name, &state).await? {
                            CommandResult::Ok => {}
                            CommandResult::Quit => break,
                            CommandResult::NickChanged(new_nick) => {
                                registered_nick = Some(new_nick);
                            }
                        }
                    }
                }
            }

            Some(msg) = rx.recv() => {
                framed.send(msg).await?;
            }
        }
    }

    if let Some(nick) = registered_nick {
        cleanup_client(&nick, &state).await;
    }

    Ok(())
}

/// Result of handling a command.
#[derive(Debug, PartialEq, Eq)]
enum CommandResult {
    Ok,
    Quit,
    NickChanged(String),
}

/// Nick syntax for real clients. `/` is allowed so bridges can reserve
/// names shaped like relayed ones.
fn is_valid_nick(nick: &str) -> bool {
    let Some(first) = nick.chars().next() else {
        return false;
    };
    nick.len() <= 30
        && !first.is_ascii_digit()
        && !matches!(first, '-' | '#' | '&' | ':')
        && !nick.chars().any(|c| {
            c.is_whitespace() || c.is_control() || matches!(c, ',' | '*' | '?' | '!' | '@' | '.')
        })
}

async fn handle_registration(
    framed: &mut ClientFramed,
    pending: &mut PendingRegistration,
    msg: &Message,
    server_name: &str,
    state: &SharedState,
) -> Result<CommandResult, BoxError> {
    match msg.command.to_uppercase().as_str() {
        "CAP" => {
            let sub = msg.params.first().map(|s| s.to_uppercase()).unwrap_or_default();
            match sub.as_str() {
                "LS" | "REQ" => pending.negotiating = true,
                "END" => pending.negotiating = false,
                _ => {}
            }
            let config = state.read().await.relay.snapshot();
            if let Some(reply) = cap_reply(server_name, "*", msg, &mut pending.caps, &config) {
                framed.send(reply).await?;
            }
        }
        "NICK" => match msg.params.first() {
            Some(nick) if is_valid_nick(nick) => pending.nick = Some(nick.clone()),
            Some(nick) => {
                let err = Message::new(
                    Some(server_name.to_owned()),
                    "432",
                    vec!["*".into(), nick.clone(), "Erroneous nickname".into()],
                );
                framed.send(err).await?;
            }
            None => {
                let err = Message::new(
                    Some(server_name.to_owned()),
                    "431",
                    vec!["*".into(), "No nickname given".into()],
                );
                framed.send(err).await?;
            }
        },
        "USER" => {
            if msg.params.len() >= 4 {
                pending.user = Some(msg.params[0].clone());
            } else {
                framed.send(need_more_params(server_name, "*", "USER")).await?;
            }
        }
        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            let pong = Message::new(
                Some(server_name.to_owned()),
                "PONG",
                vec![server_name.to_owned(), token],
            );
            framed.send(pong).await?;
        }
        "QUIT" => return Ok(CommandResult::Quit),
        _ => {
            let err = Message::new(
                Some(server_name.to_owned()),
                "451",
                vec!["*".into(), "You have not registered".into()],
            );
            framed.send(err).await?;
        }
    }
    Ok(CommandResult::Ok)
}

/// Capabilities offered in `CAP LS`, as `name[=value]`.
fn offered_caps(config: &RelayConfig) -> Vec<String> {
    let mut caps = vec![MESSAGE_TAGS_CAP.to_owned()];
    if let Some((name, value)) = config.dialect().capability() {
        caps.push(format!("{name}={value}"));
    }
    caps
}

/// Handle one `CAP` subcommand against `enabled`.
fn cap_reply(
    server_name: &str,
    target: &str,
    msg: &Message,
    enabled: &mut HashSet<String>,
    config: &RelayConfig,
) -> Option<Message> {
    let sub = msg.params.first().map(|s| s.to_uppercase()).unwrap_or_default();
    let reply = |sub: &str, body: String| {
        Some(Message::new(
            Some(server_name.to_owned()),
            "CAP",
            vec![target.to_owned(), sub.to_owned(), body],
        ))
    };
    match sub.as_str() {
        "LS" => reply("LS", offered_caps(config).join(" ")),
        "LIST" => {
            let mut caps: Vec<&str> = enabled.iter().map(String::as_str).collect();
            caps.sort_unstable();
            reply("LIST", caps.join(" "))
        }
        "REQ" => {
            let requested = msg.params.get(1).cloned().unwrap_or_default();
            let offered: Vec<String> = offered_caps(config)
                .into_iter()
                .map(|c| c.split('=').next().unwrap_or_default().to_owned())
                .collect();
            let known = requested
                .split_whitespace()
                .all(|c| offered.iter().any(|o| o == c.trim_start_matches('-')));
            if !known || requested.trim().is_empty() {
                return reply("NAK", requested);
            }
            for cap in requested.split_whitespace() {
                match cap.strip_prefix('-') {
                    Some(name) => {
                        enabled.remove(name);
                    }
                    None => {
                        enabled.insert(cap.to_owned());
                    }
                }
            }
            reply("ACK", requested)
        }
        "END" => None,
        _ => Some(Message::new(
            Some(server_name.to_owned()),
            "410",
            vec![target.to_owned(), sub, "Invalid CAP command".into()],
        )),
    }
}

fn need_more_params(server_name: &str, target: &str, command: &str) -> Message {
    Message::new(
        Some(server_name.to_owned()),
        "461",
        vec![target.to_owned(), command.to_owned(), "Not enough parameters".into()],
    )
}

/// Send the welcome sequence (001-005) and the MOTD.
async fn send_welcome(
    framed: &mut ClientFramed,
    server_name: &str,
    nick: &str,
    config: &RelayConfig,
) -> Result<(), BoxError> {
    let mut isupport = vec![
        nick.to_owned(),
        "CHANTYPES=#&".into(),
        "CASEMAPPING=rfc1459".into(),
        "NETWORK=Lagun".into(),
    ];
    if let Some(token) = config.dialect().isupport_token() {
        isupport.push(token);
    }
    isupport.push("are supported by this server".into());

    let welcome = [
        ("001", vec![nick.to_owned(), format!("Welcome to the Lagoon relay network, {nick}")]),
        ("002", vec![nick.to_owned(), format!("Your host is {server_name}, running Lagoon")]),
        ("003", vec![nick.to_owned(), "This server was created today".into()]),
        (
            "004",
            vec![
                nick.to_owned(),
                server_name.to_owned(),
                concat!("lagoon-", env!("CARGO_PKG_VERSION")).into(),
                "o".into(),
                "".into(),
            ],
        ),
        ("005", isupport),
        ("375", vec![nick.to_owned(), format!("- {server_name} Message of the Day -")]),
        ("372", vec![nick.to_owned(), "- Bridges welcome. Ask an operator for RELAYMSG.".into()]),
        ("376", vec![nick.to_owned(), "End of /MOTD command".into()]),
    ];
    for (numeric, params) in welcome {
        framed
            .send(Message::new(Some(server_name.to_owned()), numeric, params))
            .await?;
    }
    Ok(())
}

/// Handle commands from a registered client.
async fn handle_command(
    framed: &mut ClientFramed,
    nick: &str,
    msg: &Message,
    server_name: &str,
    state: &SharedState,
) -> Result<CommandResult, BoxError> {
    let numeric = |code: &str, mut params: Vec<String>| {
        params.insert(0, nick.to_owned());
        Message::new(Some(server_name.to_owned()), code, params)
    };

    match msg.command.to_uppercase().as_str() {
        "CAP" => {
            let reply = {
                let mut st = state.write().await;
                let config = st.relay.snapshot();
                match st.clients.get_mut(nick) {
                    Some(client) => cap_reply(server_name, nick, msg, &mut client.caps, &config),
                    None => None,
                }
            };
            if let Some(reply) = reply {
                framed.send(reply).await?;
            }
        }

        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            let pong = Message::new(
                Some(server_name.to_owned()),
                "PONG",
                vec![server_name.to_owned(), token],
            );
            framed.send(pong).await?;
        }

        "PONG" => {}

        "NICK" => {
            let Some(new_nick) = msg.params.first() else {
                framed.send(numeric("431", vec!["No nickname given".into()])).await?;
                return Ok(CommandResult::Ok);
            };
            if new_nick == nick {
                return Ok(CommandResult::Ok);
            }
            if !is_valid_nick(new_nick) {
                framed
                    .send(numeric("432", vec![new_nick.clone(), "Erroneous nickname".into()]))
                    .await?;
                return Ok(CommandResult::Ok);
            }

            let mut st = state.write().await;
            if st
                .find_client(new_nick)
                .is_some_and(|c| !c.nick.eq_ignore_ascii_case(nick))
            {
                drop(st);
                framed
                    .send(numeric(
                        "433",
                        vec![new_nick.clone(), "Nickname is already in use".into()],
                    ))
                    .await?;
                return Ok(CommandResult::Ok);
            }

            let Some(mut handle) = st.clients.remove(nick) else {
                return Ok(CommandResult::Ok);
            };
            let nick_msg = Message::new(Some(handle.mask()), "NICK", vec![new_nick.clone()]);

            let mut notify: HashSet<String> = HashSet::new();
            for members in st.channels.values_mut() {
                if members.remove(nick) {
                    notify.extend(members.iter().cloned());
                    members.insert(new_nick.clone());
                }
            }
            handle.nick = new_nick.clone();
            st.clients.insert(new_nick.clone(), handle);
            let notify: Vec<String> = notify.into_iter().collect();
            broadcast(&st, &notify, &nick_msg);
            drop(st);

            framed.send(nick_msg).await?;
            return Ok(CommandResult::NickChanged(new_nick.clone()));
        }

        "JOIN" => {
            let Some(channels_param) = msg.params.first() else {
                framed.send(need_more_params(server_name, nick, "JOIN")).await?;
                return Ok(CommandResult::Ok);
            };
            for channel in channels_param.split(',').filter(|c| !c.is_empty()) {
                if !(channel.starts_with('#') || channel.starts_with('&')) || channel.len() < 2 {
                    framed
                        .send(numeric("403", vec![channel.into(), "No such channel".into()]))
                        .await?;
                    continue;
                }

                let mut st = state.write().await;
                let canonical = st
                    .find_channel(channel)
                    .map(str::to_owned)
                    .unwrap_or_else(|| channel.to_owned());
                let Some(mask) = st.clients.get(nick).map(ClientHandle::mask) else {
                    continue;
                };
                let members = st.channels.entry(canonical.clone()).or_default();
                if !members.insert(nick.to_owned()) {
                    continue;
                }
                let mut names: Vec<String> = members.iter().cloned().collect();
                names.sort();
                let others: Vec<String> = names.iter().filter(|n| *n != nick).cloned().collect();

                let join_msg = Message::new(Some(mask), "JOIN", vec![canonical.clone()]);
                broadcast(&st, &others, &join_msg);
                drop(st);
                debug!(nick, channel = %canonical, "joined");

                framed.send(join_msg).await?;
                framed
                    .send(numeric("353", vec!["=".into(), canonical.clone(), names.join(" ")]))
                    .await?;
                framed
                    .send(numeric("366", vec![canonical, "End of /NAMES list".into()]))
                    .await?;
            }
        }

        "PART" => {
            let Some(channels_param) = msg.params.first() else {
                framed.send(need_more_params(server_name, nick, "PART")).await?;
                return Ok(CommandResult::Ok);
            };
            let reason = msg.params.get(1).cloned();
            for channel in channels_param.split(',').filter(|c| !c.is_empty()) {
                let mut st = state.write().await;
                let Some(canonical) = st.find_channel(channel).map(str::to_owned) else {
                    drop(st);
                    framed
                        .send(numeric("403", vec![channel.into(), "No such channel".into()]))
                        .await?;
                    continue;
                };
                let Some(mask) = st.clients.get(nick).map(ClientHandle::mask) else {
                    continue;
                };
                let mut params = vec![canonical.clone()];
                params.extend(reason.clone());
                let part_msg = Message::new(Some(mask), "PART", params);

                let Some(members) = st.channels.get_mut(&canonical) else {
                    continue;
                };
                if !members.remove(nick) {
                    drop(st);
                    framed
                        .send(numeric("442", vec![canonical, "You're not on that channel".into()]))
                        .await?;
                    continue;
                }
                let others: Vec<String> = members.iter().cloned().collect();
                if others.is_empty() {
                    st.channels.remove(&canonical);
                }
                broadcast(&st, &others, &part_msg);
                drop(st);
                framed.send(part_msg).await?;
            }
        }

        cmd @ ("PRIVMSG" | "NOTICE") => {
            let is_notice = cmd == "NOTICE";
            let (Some(target), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
                if !is_notice {
                    let err = if msg.params.is_empty() {
                        numeric("411", vec![format!("No recipient given ({cmd})")])
                    } else {
                        numeric("412", vec!["No text to send".into()])
                    };
                    framed.send(err).await?;
                }
                return Ok(CommandResult::Ok);
            };

            let st = state.read().await;
            let Some(mask) = st.clients.get(nick).map(ClientHandle::mask) else {
                return Ok(CommandResult::Ok);
            };
            if target.starts_with('#') || target.starts_with('&') {
                // (canonical name, other members if the sender is in it)
                let route = st.find_channel(target).and_then(|c| {
                    let members = st.channels.get(c)?;
                    let others = members.contains(nick).then(|| {
                        members.iter().filter(|n| *n != nick).cloned().collect::<Vec<_>>()
                    });
                    Some((c.to_owned(), others))
                });
                match route {
                    Some((canonical, Some(others))) => {
                        let out = Message::new(Some(mask), cmd, vec![canonical, text.clone()]);
                        broadcast(&st, &others, &out);
                    }
                    Some((canonical, None)) if !is_notice => {
                        drop(st);
                        framed
                            .send(numeric("404", vec![canonical, "Cannot send to channel".into()]))
                            .await?;
                    }
                    None if !is_notice => {
                        drop(st);
                        framed
                            .send(numeric("403", vec![target.clone(), "No such channel".into()]))
                            .await?;
                    }
                    _ => {}
                }
            } else {
                let recipient = st.find_client(target).map(|c| (c.nick.clone(), c.tx.clone()));
                drop(st);
                match recipient {
                    Some((recipient, tx)) => {
                        let _ = tx.send(Message::new(Some(mask), cmd, vec![recipient, text.clone()]));
                    }
                    None if !is_notice => {
                        framed
                            .send(numeric("401", vec![target.clone(), "No such nick/channel".into()]))
                            .await?;
                    }
                    None => {}
                }
            }
        }

        "OPER" => {
            if msg.params.len() < 2 {
                framed.send(need_more_params(server_name, nick, "OPER")).await?;
                return Ok(CommandResult::Ok);
            }
            let mut st = state.write().await;
            let accepted = st
                .oper_password
                .as_deref()
                .is_some_and(|p| p == msg.params[1]);
            let reply = if accepted {
                let privileges: HashSet<String> = st.oper_privileges.iter().cloned().collect();
                if let Some(client) = st.clients.get_mut(nick) {
                    client.oper = true;
                    client.privileges = privileges;
                }
                info!(nick, oper = %msg.params[0], "operator login");
                numeric("381", vec!["You are now an IRC operator".into()])
            } else {
                warn!(nick, oper = %msg.params[0], "failed operator login");
                numeric("464", vec!["Password incorrect".into()])
            };
            drop(st);
            framed.send(reply).await?;
        }

        "REHASH" => {
            let st = state.read().await;
            let reply = if !st.clients.get(nick).is_some_and(|c| c.oper) {
                numeric(
                    "481",
                    vec!["Permission Denied - You're not an IRC operator".into()],
                )
            } else {
                match st.relay.reload(&RawRelayConfig::from_env(), &st.name) {
                    Ok(_) => numeric("382", vec!["relaymsg".into(), "Rehashing".into()]),
                    Err(e) => Message::new(
                        Some(server_name.to_owned()),
                        "NOTICE",
                        vec![nick.to_owned(), format!("REHASH failed, keeping previous configuration: {e}")],
                    ),
                }
            };
            drop(st);
            framed.send(reply).await?;
        }

        "RELAYMSG" => {
            let st = state.read().await;
            let config = st.relay.snapshot();
            let vocabulary = config.dialect().vocabulary();
            let result = match RelayRequest::from_params(&msg.params, Actor::new(nick)) {
                Ok(request) => {
                    let host = HostView::new(&st);
                    RelayCommand::new(Arc::clone(&config), Collaborators::from_host(&host))
                        .handle(request)
                        .map(|_| ())
                }
                Err(e) => {
                    info!(nick, kind = e.kind(), "relaymsg: rejected: {e}");
                    Err(e)
                }
            };
            drop(st);
            if let Err(e) = result {
                framed.send(e.to_reply(server_name, nick, vocabulary)).await?;
            }
        }

        "QUIT" => return Ok(CommandResult::Quit),

        other => {
            framed
                .send(numeric("421", vec![other.to_owned(), "Unknown command".into()]))
                .await?;
        }
    }

    Ok(CommandResult::Ok)
}

/// Serve an inbound peer link. Peers only ever send relay instructions.
async fn handle_peer(
    mut framed: ClientFramed,
    hello: &Message,
    addr: SocketAddr,
    state: &SharedState,
) -> Result<(), BoxError> {
    let server_name = state.read().await.name.clone();
    let Some(peer) = hello.params.first().cloned() else {
        framed
            .send(Message::new(None, "ERROR", vec!["SERVER without a name".into()]))
            .await?;
        return Ok(());
    };

    {
        let mut st = state.write().await;
        if !st.trusted_peers.contains(&peer) {
            drop(st);
            warn!(%addr, peer, "mesh: rejected unknown server");
            framed
                .send(Message::new(None, "ERROR", vec![format!("Unknown server {peer}")]))
                .await?;
            return Ok(());
        }
        st.inbound_peers.insert(peer.clone());
    }
    info!(%addr, peer, "mesh: peer linked");

    while let Some(frame) = framed.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer, "mesh: read error: {e}");
                break;
            }
        };
        match msg.command.to_uppercase().as_str() {
            "PING" => {
                let token = msg.params.first().cloned().unwrap_or_default();
                let pong = Message::new(
                    Some(server_name.clone()),
                    "PONG",
                    vec![server_name.clone(), token],
                );
                framed.send(pong).await?;
            }
            "ENCAP" => handle_encap(&peer, &msg, state).await,
            "SQUIT" | "ERROR" => break,
            other => debug!(peer, command = other, "mesh: ignoring line"),
        }
    }

    state.write().await.inbound_peers.remove(&peer);
    info!(%addr, peer, "mesh: peer unlinked");
    Ok(())
}

/// Execute an `ENCAP * RELAYMSG` line as a remote request. Never forwarded.
async fn handle_encap(peer: &str, msg: &Message, state: &SharedState) {
    let st = state.read().await;
    let config = st.relay.snapshot();
    let format = config.dialect().wire_format();
    match WireInstruction::from_message(msg, format) {
        Ok(instruction) => {
            let host = HostView::new(&st);
            // Rejections are logged by the command; peers get no reply.
            let _ = RelayCommand::new(Arc::clone(&config), Collaborators::from_host(&host))
                .handle(propagation::decode(instruction));
        }
        Err(DecodeError::NotRelay) => debug!(peer, "mesh: ignoring ENCAP"),
        Err(e) => warn!(peer, "mesh: malformed relay line: {e}"),
    }
}

/// Broadcast a message to a list of nicks via their channel handles.
pub fn broadcast(state: &ServerState, nicks: &[String], msg: &Message) {
    for nick in nicks {
        if let Some(handle) = state.clients.get(nick) {
            let _ = handle.tx.send(msg.clone());
        }
    }
}

/// Clean up when a client disconnects.
async fn cleanup_client(nick: &str, state: &SharedState) {
    let mut st = state.write().await;
    let Some(handle) = st.clients.remove(nick) else {
        return;
    };
    let quit_msg = Message::new(Some(handle.mask()), "QUIT", vec!["Connection closed".into()]);

    let mut notified: HashSet<String> = HashSet::new();
    st.channels.retain(|_, members| {
        if members.remove(nick) {
            notified.extend(members.iter().cloned());
        }
        !members.is_empty()
    });
    let notified: Vec<String> = notified.into_iter().collect();
    broadcast(&st, &notified, &quit_msg);
    info!(nick, "cleaned up");
}
