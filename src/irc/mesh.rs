/// Server-to-server links for the relay mesh.
///
/// Every server dials every peer listed in `LAGOON_PEERS` and keeps one
/// outbound link per peer. Outbound links carry relay instructions only;
/// the peer's own outbound link to us carries its instructions the other
/// way. A link that is down drops whatever is sent to it, and reconnects
/// after [`RECONNECT_DELAY`].
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::IrcCodec;
use super::message::Message;
use super::server::SERVER_NAME;

/// Port assumed for peers listed without one.
pub const DEFAULT_PORT: u16 = 6667;

/// Pause between connection attempts to a peer.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long a stopping link may take to send its `SQUIT`.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Peer servers (from `LAGOON_PEERS`, comma-separated `host[:port]`).
///
/// The local server's own name is excluded.
pub static PEERS: LazyLock<Vec<String>> = LazyLock::new(|| {
    let peers = parse_peers(
        &std::env::var("LAGOON_PEERS").unwrap_or_default(),
        &SERVER_NAME,
    );
    if !peers.is_empty() {
        info!("mesh peers: {}", peers.join(", "));
    }
    peers
});

/// Split a peer list, dropping blanks and our own name.
pub fn parse_peers(list: &str, our_name: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && peer_host(s) != our_name)
        .collect()
}

/// Host part of a `host[:port]` peer entry.
pub fn peer_host(peer: &str) -> &str {
    match peer.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() && !host.ends_with(':') => host,
        _ => peer,
    }
}

fn peer_addr(peer: &str) -> String {
    if peer_host(peer) == peer {
        format!("{peer}:{DEFAULT_PORT}")
    } else {
        peer.to_owned()
    }
}

/// Commands sent from the server to a link task.
#[derive(Debug)]
pub enum LinkCommand {
    /// Forward a line to the peer, if connected.
    Send(Message),
    Shutdown,
}

/// Handle to a running outbound link.
#[derive(Debug)]
pub struct LinkHandle {
    pub peer: String,
    pub tx: mpsc::UnboundedSender<LinkCommand>,
    pub task: JoinHandle<()>,
}

/// All outbound links of this server.
#[derive(Debug, Default)]
pub struct MeshLinks {
    links: HashMap<String, LinkHandle>,
}

impl MeshLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a link to `peer` unless one is already running.
    pub fn connect(&mut self, peer: &str, our_name: &str) {
        if self.links.contains_key(peer) {
            return;
        }
        let (tx, task) = spawn_link(peer.to_owned(), our_name.to_owned());
        self.links.insert(
            peer.to_owned(),
            LinkHandle {
                peer: peer.to_owned(),
                tx,
                task,
            },
        );
    }

    /// Queue `msg` on every link. Never blocks, never fails.
    pub fn broadcast(&self, msg: &Message) {
        for link in self.links.values() {
            if link.tx.send(LinkCommand::Send(msg.clone())).is_err() {
                debug!(peer = %link.peer, "mesh: link task gone, dropping line");
            }
        }
    }

    /// Stop every link, giving each up to [`SHUTDOWN_GRACE`] to say `SQUIT`.
    pub async fn shutdown(self) {
        for link in self.links.values() {
            let _ = link.tx.send(LinkCommand::Shutdown);
        }
        for (peer, link) in self.links {
            match tokio::time::timeout(SHUTDOWN_GRACE, link.task).await {
                Ok(Ok(())) => debug!(peer, "mesh: link stopped"),
                Ok(Err(e)) => warn!(peer, "mesh: link task failed: {e}"),
                Err(_) => warn!(peer, "mesh: link did not stop in time"),
            }
        }
    }
}

/// Spawn an outbound link task.
pub fn spawn_link(
    peer: String,
    our_name: String,
) -> (mpsc::UnboundedSender<LinkCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(link_task(peer, our_name, rx));
    (tx, handle)
}

/// How a connected session ended.
enum SessionEnd {
    Lost,
    Shutdown,
}

async fn link_task(
    peer: String,
    our_name: String,
    mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let addr = peer_addr(&peer);
    loop {
        info!(peer, "mesh: connecting to {addr}");
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(peer, "mesh: connected");
                match session(&peer, &our_name, stream, &mut cmd_rx).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost => warn!(peer, "mesh: link lost"),
                }
            }
            Err(e) => warn!(peer, "mesh: failed to connect: {e}"),
        }

        // Down: drop traffic until the next attempt.
        let retry = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(LinkCommand::Send(msg)) => {
                        debug!(peer, command = %msg.command, "mesh: link down, dropping line");
                    }
                    Some(LinkCommand::Shutdown) | None => return,
                },
            }
        }
    }
}

async fn session(
    peer: &str,
    our_name: &str,
    stream: TcpStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<LinkCommand>,
) -> SessionEnd {
    let mut framed = Framed::new(stream, IrcCodec::default());

    let hello = Message::new(
        None,
        "SERVER",
        vec![our_name.to_owned(), format!("Lagoon relay mesh link from {our_name}")],
    );
    if framed.send(hello).await.is_err() {
        return SessionEnd::Lost;
    }

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(peer, "mesh: read error: {e}");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                };
                match msg.command.as_str() {
                    "PING" => {
                        let token = msg.params.first().cloned().unwrap_or_default();
                        let pong = Message::new(Some(our_name.to_owned()), "PONG", vec![our_name.to_owned(), token]);
                        if framed.send(pong).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    "ERROR" => {
                        warn!(peer, "mesh: peer closed link: {}", msg.params.first().map_or("", String::as_str));
                        return SessionEnd::Lost;
                    }
                    _ => {}
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(LinkCommand::Send(msg)) => {
                    if let Err(e) = framed.send(msg).await {
                        warn!(peer, "mesh: write failed: {e}");
                        return SessionEnd::Lost;
                    }
                }
                Some(LinkCommand::Shutdown) | None => {
                    let _ = framed.send(Message::new(None, "SQUIT", vec![our_name.to_owned(), "Shutting down".into()])).await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}
