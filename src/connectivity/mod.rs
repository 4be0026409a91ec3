use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::player::PeerLink;
use crate::probe::grammar::ProbeText;
use crate::probe::NatProbeListener;

/// Reachability tier of one player's UDP endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    /// The claimed endpoint is reachable as-is.
    Public,
    /// Reachable at the NAT-translated address once the client has sent
    /// an outbound packet.
    Stun,
    /// Nothing got through; traffic must be relayed.
    Blocked,
}

/// Outcome of classification. Immutable; computed once per player per
/// session. `addr` is present exactly when the state is not [`Blocked`](ConnectivityState::Blocked).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectivityResult {
    state: ConnectivityState,
    addr: Option<SocketAddr>,
}

impl ConnectivityResult {
    pub fn public(addr: SocketAddr) -> Self {
        Self {
            state: ConnectivityState::Public,
            addr: Some(addr),
        }
    }
    pub fn stun(addr: SocketAddr) -> Self {
        Self {
            state: ConnectivityState::Stun,
            addr: Some(addr),
        }
    }
    pub fn blocked() -> Self {
        Self {
            state: ConnectivityState::Blocked,
            addr: None,
        }
    }
    pub fn state(&self) -> ConnectivityState {
        self.state
    }
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }
    pub fn is_blocked(&self) -> bool {
        self.state == ConnectivityState::Blocked
    }
}

/// Classify one player's UDP reachability.
///
/// Three terminal steps: probe the claimed endpoint directly, then fall back
/// to asking the client to volunteer an outbound packet at `relay_targets`,
/// then give up. Every wait is bounded; a player that never answers anything
/// classifies as `Blocked` instead of erroring.
pub async fn classify(
    listener: &NatProbeListener,
    link: &dyn PeerLink,
    relay_targets: &[SocketAddr],
    config: &ServerConfig,
) -> ConnectivityResult {
    let player = link.player();
    let claimed = SocketAddr::new(player.ip, player.game_port);
    let id = player.id;

    let text = ProbeText::AreYouPublic { id }.to_string();
    let observed = bounded_wait(config.public_probe_wait, listener.wait_for(&text), || async {
        for _ in 0..config.public_probe_count {
            listener.send(claimed, &text).await;
            tokio::time::sleep(config.public_probe_spacing).await;
        }
    })
    .await;
    if observed.is_some() {
        log::debug!("player {id} is public at {claimed}");
        return ConnectivityResult::public(claimed);
    }

    let text = ProbeText::Hello { id }.to_string();
    let observed = bounded_wait(config.stun_probe_wait, listener.wait_for(&text), || async {
        for _ in 0..config.stun_probe_count {
            for target in relay_targets {
                link.send_nat_packet(*target, &text).await;
            }
            tokio::time::sleep(config.stun_probe_spacing).await;
        }
    })
    .await;
    if let Some((addr, _)) = observed {
        // The address the server observed, not the one the client believes
        // it has.
        log::debug!("player {id} reaches us from {addr}");
        return ConnectivityResult::stun(addr);
    }

    log::debug!("player {id} is blocked");
    ConnectivityResult::blocked()
}

/// Await `pending` while running the paced `sends` alongside it, all under
/// one deadline. Elapsing the deadline yields `None`, never an error.
async fn bounded_wait<F, S, O>(
    wait: std::time::Duration,
    pending: crate::probe::PendingProbe,
    sends: F,
) -> Option<(SocketAddr, String)>
where
    F: FnOnce() -> S,
    S: std::future::Future<Output = O>,
{
    tokio::time::timeout(wait, async {
        tokio::select! {
            rs = pending => rs,
            _ = async { sends().await; futures::future::pending::<()>().await } => None,
        }
    })
    .await
    .ok()
    .flatten()
}
