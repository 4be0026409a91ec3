use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const RELAY_SLOT_COUNT: u8 = 11;

/// Server-wide configuration for the session coordination core.
///
/// Timings default to the values the legacy clients were tuned against;
/// override them with the `set_*` chain when testing against loopback.
pub struct ServerConfig {
    pub lobby_bind: SocketAddr,
    pub probe_bind: SocketAddr,
    /// Address clients are told to aim their STUN-style probes at.
    pub advertised_ip: IpAddr,
    /// Well-known ports the clients are told to target for the STUN-style test.
    pub relay_ports: Vec<u16>,
    /// Number of "Are you public?" probes and the spacing between them.
    pub public_probe_count: usize,
    pub public_probe_spacing: Duration,
    /// Total wait for the public test before falling through.
    pub public_probe_wait: Duration,
    /// Number of `SendNatPacket` requests for the STUN test and their spacing.
    pub stun_probe_count: usize,
    pub stun_probe_spacing: Duration,
    /// Total wait for the STUN test before classifying as blocked.
    pub stun_probe_wait: Duration,
    /// Shared deadline for one simultaneous peer probe exchange.
    pub exchange_wait: Duration,
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before the connection is aborted.
    pub heartbeat_miss: u32,
    pub relay_slots: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lobby_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8000)),
            probe_bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 30351)),
            advertised_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            relay_ports: vec![30351],
            public_probe_count: 3,
            public_probe_spacing: Duration::from_millis(200),
            public_probe_wait: Duration::from_secs(1),
            stun_probe_count: 3,
            stun_probe_spacing: Duration::from_millis(100),
            stun_probe_wait: Duration::from_millis(2500),
            exchange_wait: Duration::from_secs(3),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_miss: 3,
            relay_slots: RELAY_SLOT_COUNT,
        }
    }
}

impl ServerConfig {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn set_lobby_bind(mut self, addr: SocketAddr) -> Self {
        self.lobby_bind = addr;
        self
    }
    pub fn set_probe_bind(mut self, addr: SocketAddr) -> Self {
        self.probe_bind = addr;
        self
    }
    pub fn set_relay_ports(mut self, ports: Vec<u16>) -> Self {
        self.relay_ports = ports;
        self
    }
    pub fn set_public_probe_wait(mut self, wait: Duration) -> Self {
        self.public_probe_wait = wait;
        self
    }
    pub fn set_stun_probe_wait(mut self, wait: Duration) -> Self {
        self.stun_probe_wait = wait;
        self
    }
    pub fn set_exchange_wait(mut self, wait: Duration) -> Self {
        self.exchange_wait = wait;
        self
    }
    pub fn set_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
    pub fn set_heartbeat_miss(mut self, miss: u32) -> Self {
        self.heartbeat_miss = miss;
        self
    }
    pub fn set_probe_spacing(mut self, public: Duration, stun: Duration) -> Self {
        self.public_probe_spacing = public;
        self.stun_probe_spacing = stun;
        self
    }
    pub fn set_advertised_ip(mut self, ip: IpAddr) -> Self {
        self.advertised_ip = ip;
        self
    }

    /// Upper bound for waiting on a peer's in-flight classification: both
    /// test phases plus scheduling slack.
    pub fn classification_wait(&self) -> Duration {
        self.public_probe_wait + self.stun_probe_wait + Duration::from_millis(500)
    }
}
