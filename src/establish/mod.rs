use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::connectivity::{ConnectivityResult, ConnectivityState};
use crate::player::PeerLink;
use crate::probe::grammar::ProbeText;
use crate::probe::NatProbeListener;
use crate::relay::RelayPool;

/// One already-classified side of a pairing.
pub struct PeerEndpoint<'a> {
    pub link: &'a dyn PeerLink,
    pub result: ConnectivityResult,
}

impl PeerEndpoint<'_> {
    fn id(&self) -> u64 {
        self.link.player().id
    }
    fn login(&self) -> &str {
        &self.link.player().login
    }
}

/// How two players should reach each other.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionPlan {
    /// `a_uses` is the address side A dials to reach B, and vice versa.
    Direct {
        a_uses: SocketAddr,
        b_uses: SocketAddr,
    },
    /// Both sides connect to the shared relay slot.
    Relay { slot: u8 },
    /// No relay slot was free; skip this pairing for now.
    Unavailable,
}

/// Negotiate a connection between two classified players.
///
/// Tiers, cheapest first: both public needs no negotiation at all; a STUN
/// side gets a simultaneous probe exchange (with a second, learned-address
/// attempt to cover symmetric NAT remapping); everything else shares a relay
/// slot. Ordinary failure is never an error - the worst case is
/// [`ConnectionPlan::Unavailable`].
pub async fn establish(
    listener: &NatProbeListener,
    relay: &RelayPool,
    config: &ServerConfig,
    a: PeerEndpoint<'_>,
    b: PeerEndpoint<'_>,
) -> ConnectionPlan {
    match (a.result.state(), b.result.state()) {
        (ConnectivityState::Public, ConnectivityState::Public) => {
            // Zero-cost path: both claimed endpoints are reachable as-is.
            if let (Some(addr_a), Some(addr_b)) = (a.result.addr(), b.result.addr()) {
                return ConnectionPlan::Direct {
                    a_uses: addr_b,
                    b_uses: addr_a,
                };
            }
        }
        (ConnectivityState::Blocked, _) | (_, ConnectivityState::Blocked) => {}
        _ => {
            if let Some((addr_a, addr_b)) = exchange(listener, config, &a, &b).await {
                return ConnectionPlan::Direct {
                    a_uses: addr_b,
                    b_uses: addr_a,
                };
            }
            log::info!(
                "probe exchange {}<->{} failed, relaying",
                a.login(),
                b.login()
            );
        }
    }
    match relay.assign(a.login(), b.login()) {
        Some(slot) => ConnectionPlan::Relay { slot },
        None => ConnectionPlan::Unavailable,
    }
}

/// Simultaneous probe exchange. Returns the working addresses `(of_a, of_b)`
/// the sides learned for each other, or `None` when the pair needs relaying.
async fn exchange(
    listener: &NatProbeListener,
    config: &ServerConfig,
    a: &PeerEndpoint<'_>,
    b: &PeerEndpoint<'_>,
) -> Option<(SocketAddr, SocketAddr)> {
    let known_a = a.result.addr()?;
    let known_b = b.result.addr()?;
    let text_a = ProbeText::HelloFrom { id: a.id() }.to_string();
    let text_b = ProbeText::HelloFrom { id: b.id() }.to_string();

    let wait_a = listener.wait_for(&text_a);
    let wait_b = listener.wait_for(&text_b);
    a.link.send_nat_packet(known_b, &text_a).await;
    b.link.send_nat_packet(known_a, &text_b).await;

    // One shared deadline for both observations; neither wait blocks the
    // other from completing first.
    let deadline = tokio::time::Instant::now() + config.exchange_wait;
    let (observed_a, observed_b) = tokio::join!(
        tokio::time::timeout_at(deadline, wait_a),
        tokio::time::timeout_at(deadline, wait_b),
    );
    let observed_a = observed_a.ok().flatten().map(|(addr, _)| addr);
    let observed_b = observed_b.ok().flatten().map(|(addr, _)| addr);

    match (observed_a, observed_b) {
        (Some(addr_a), Some(addr_b)) => Some((addr_a, addr_b)),
        (Some(addr_a), None) => {
            // A's probe revealed a working address for A; retry B's probe
            // aimed there. A symmetric NAT that remapped the first attempt
            // may accept a send to the freshly learned port.
            let addr_b = second_attempt(listener, config, b, addr_a, &text_b).await?;
            Some((addr_a, addr_b))
        }
        (None, Some(addr_b)) => {
            let addr_a = second_attempt(listener, config, a, addr_b, &text_a).await?;
            Some((addr_a, addr_b))
        }
        (None, None) => None,
    }
}

async fn second_attempt(
    listener: &NatProbeListener,
    config: &ServerConfig,
    side: &PeerEndpoint<'_>,
    learned: SocketAddr,
    text: &str,
) -> Option<SocketAddr> {
    let wait = listener.wait_for(text);
    side.link.send_nat_packet(learned, text).await;
    tokio::time::timeout(config.exchange_wait, wait)
        .await
        .ok()
        .flatten()
        .map(|(addr, _)| addr)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::UdpSocket;

    use crate::config::ServerConfig;
    use crate::connectivity::ConnectivityResult;
    use crate::establish::{establish, ConnectionPlan, PeerEndpoint};
    use crate::player::{PeerLink, Player};
    use crate::probe::{NatProbeListener, PROBE_TAG};
    use crate::relay::RelayPool;

    fn player(id: u64, login: &str) -> Player {
        Player {
            id,
            login: login.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            game_port: 6112,
            local_port: 6112,
        }
    }

    /// Counts probe commands; optionally answers them from a real socket so
    /// the listener observes the text, and optionally only when the command
    /// targets one specific address.
    struct FakeLink {
        player: Player,
        sent: AtomicUsize,
        socket: Option<Arc<UdpSocket>>,
        server: Option<SocketAddr>,
        only_to: Option<SocketAddr>,
    }

    impl FakeLink {
        fn silent(id: u64, login: &str) -> Self {
            Self {
                player: player(id, login),
                sent: AtomicUsize::new(0),
                socket: None,
                server: None,
                only_to: None,
            }
        }
        async fn answering(id: u64, login: &str, server: SocketAddr) -> Self {
            let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            Self {
                player: player(id, login),
                sent: AtomicUsize::new(0),
                socket: Some(socket),
                server: Some(server),
                only_to: None,
            }
        }
        fn addr(&self) -> SocketAddr {
            self.socket.as_ref().unwrap().local_addr().unwrap()
        }
        fn sent(&self) -> usize {
            self.sent.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        fn player(&self) -> &Player {
            &self.player
        }
        async fn send_nat_packet(&self, dest: SocketAddr, message: &str) {
            self.sent.fetch_add(1, Ordering::Relaxed);
            if let Some(expected) = self.only_to {
                if dest != expected {
                    return;
                }
            }
            if let (Some(socket), Some(server)) = (&self.socket, self.server) {
                let mut buf = vec![PROBE_TAG];
                buf.extend_from_slice(message.as_bytes());
                let _ = socket.send_to(&buf, server).await;
            }
        }
    }

    async fn fixture() -> (NatProbeListener, RelayPool, ServerConfig) {
        let listener = NatProbeListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let config = ServerConfig::default().set_exchange_wait(Duration::from_millis(400));
        (listener, RelayPool::default(), config)
    }

    #[tokio::test]
    async fn public_pair_needs_no_probes() {
        let (listener, relay, config) = fixture().await;
        let link_a = FakeLink::silent(1, "ava");
        let link_b = FakeLink::silent(2, "ben");
        let addr_a: SocketAddr = "10.0.0.1:6112".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.2:6112".parse().unwrap();
        let plan = establish(
            &listener,
            &relay,
            &config,
            PeerEndpoint {
                link: &link_a,
                result: ConnectivityResult::public(addr_a),
            },
            PeerEndpoint {
                link: &link_b,
                result: ConnectivityResult::public(addr_b),
            },
        )
        .await;
        assert_eq!(
            plan,
            ConnectionPlan::Direct {
                a_uses: addr_b,
                b_uses: addr_a
            }
        );
        assert_eq!(link_a.sent() + link_b.sent(), 0);
        assert_eq!(listener.sent_count(), 0);
    }

    #[tokio::test]
    async fn blocked_pair_shares_a_relay_slot() {
        let (listener, relay, config) = fixture().await;
        let link_a = FakeLink::silent(1, "ava");
        let link_b = FakeLink::silent(2, "ben");
        let blocked = || PeerEndpoint {
            link: &link_a,
            result: ConnectivityResult::blocked(),
        };
        let blocked_b = || PeerEndpoint {
            link: &link_b,
            result: ConnectivityResult::blocked(),
        };
        let plan = establish(&listener, &relay, &config, blocked(), blocked_b()).await;
        assert_eq!(plan, ConnectionPlan::Relay { slot: 0 });
        // Same tier and same slot regardless of argument order.
        let swapped = establish(&listener, &relay, &config, blocked_b(), blocked()).await;
        assert_eq!(swapped, ConnectionPlan::Relay { slot: 0 });
    }

    #[tokio::test]
    async fn stun_exchange_learns_both_addresses() {
        let (listener, relay, config) = fixture().await;
        let server = listener.local_addr().unwrap();
        let link_a = FakeLink::answering(1, "ava", server).await;
        let link_b = FakeLink::answering(2, "ben", server).await;
        let plan = establish(
            &listener,
            &relay,
            &config,
            PeerEndpoint {
                link: &link_a,
                result: ConnectivityResult::stun("127.0.0.1:50001".parse().unwrap()),
            },
            PeerEndpoint {
                link: &link_b,
                result: ConnectivityResult::public("127.0.0.1:50002".parse().unwrap()),
            },
        )
        .await;
        assert_eq!(
            plan,
            ConnectionPlan::Direct {
                a_uses: link_b.addr(),
                b_uses: link_a.addr(),
            }
        );
    }

    #[tokio::test]
    async fn one_sided_exchange_retries_with_learned_address() {
        let (listener, relay, config) = fixture().await;
        let server = listener.local_addr().unwrap();
        let link_a = FakeLink::answering(1, "ava", server).await;
        let mut link_b = FakeLink::answering(2, "ben", server).await;
        // B answers only once commanded to aim at A's learned address, as a
        // remapping symmetric NAT would behave.
        link_b.only_to = Some(link_a.addr());
        let plan = establish(
            &listener,
            &relay,
            &config,
            PeerEndpoint {
                link: &link_a,
                result: ConnectivityResult::stun("127.0.0.1:50001".parse().unwrap()),
            },
            PeerEndpoint {
                link: &link_b,
                result: ConnectivityResult::stun("127.0.0.1:50002".parse().unwrap()),
            },
        )
        .await;
        assert_eq!(
            plan,
            ConnectionPlan::Direct {
                a_uses: link_b.addr(),
                b_uses: link_a.addr(),
            }
        );
        // First attempt plus the retry.
        assert_eq!(link_b.sent(), 2);
    }

    #[tokio::test]
    async fn failed_exchange_falls_back_to_relay() {
        let (listener, relay, config) = fixture().await;
        let link_a = FakeLink::silent(1, "ava");
        let link_b = FakeLink::silent(2, "ben");
        let plan = establish(
            &listener,
            &relay,
            &config,
            PeerEndpoint {
                link: &link_a,
                result: ConnectivityResult::stun("127.0.0.1:50001".parse().unwrap()),
            },
            PeerEndpoint {
                link: &link_b,
                result: ConnectivityResult::stun("127.0.0.1:50002".parse().unwrap()),
            },
        )
        .await;
        assert_eq!(plan, ConnectionPlan::Relay { slot: 0 });
    }

    #[tokio::test]
    async fn exhausted_pool_reports_unavailable() {
        let (listener, _, config) = fixture().await;
        let relay = RelayPool::new(0);
        let link_a = FakeLink::silent(1, "ava");
        let link_b = FakeLink::silent(2, "ben");
        let plan = establish(
            &listener,
            &relay,
            &config,
            PeerEndpoint {
                link: &link_a,
                result: ConnectivityResult::blocked(),
            },
            PeerEndpoint {
                link: &link_b,
                result: ConnectivityResult::blocked(),
            },
        )
        .await;
        assert_eq!(plan, ConnectionPlan::Unavailable);
    }
}
