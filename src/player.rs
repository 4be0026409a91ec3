use std::net::IpAddr;

use async_trait::async_trait;

/// Identity the player directory reported for one connected client.
///
/// The directory owns this data; the core keeps a snapshot per connection and
/// re-resolves on reconnect (most recent connection wins).
#[derive(Clone, Debug)]
pub struct Player {
    pub id: u64,
    pub login: String,
    pub ip: IpAddr,
    /// UDP port the client claims its game listens on.
    pub game_port: u16,
    /// Port the game bound on the LAN side, as reported by the client.
    pub local_port: u16,
}

/// Lookup capability provided by the external player service.
#[async_trait]
pub trait PlayerDirectory: Send + Sync {
    async fn lookup_by_ip(&self, ip: IpAddr) -> Option<Player>;
    async fn lookup_by_login(&self, login: &str) -> Option<Player>;
}

/// Sink for end-of-session outcome reports (army -> outcome/score lines).
/// Rating math lives behind this seam, outside the core.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn report(&self, session_id: u64, results: Vec<(u32, String)>);
}

/// User-facing notices (relay exhaustion, cancelled session, ...). Delivered
/// as display text, never as protocol error codes.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, login: &str, text: &str);
}

/// Notices and results go to the log when no richer collaborator is wired in.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, login: &str, text: &str) {
        log::info!("notice for {login}: {text}");
    }
}

pub struct LogResultSink;

#[async_trait]
impl ResultSink for LogResultSink {
    async fn report(&self, session_id: u64, results: Vec<(u32, String)>) {
        log::info!("session {session_id} results: {results:?}");
    }
}

/// A command path to one connected client, as far as NAT probing is
/// concerned. The protocol engine implements this by queueing a
/// `SendNatPacket` command; tests substitute sockets or counters.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn player(&self) -> &Player;
    /// Ask the client to emit one tagged NAT datagram to `dest`.
    async fn send_nat_packet(&self, dest: std::net::SocketAddr, message: &str);
}
