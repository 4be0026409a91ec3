use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use crate::OwnedJoinHandle;

pub mod grammar;

/// First byte of every NAT probe datagram; anything else is game data and
/// none of our business.
pub const PROBE_TAG: u8 = 0x08;

const MAX_PROBE_LEN: usize = 512;

struct Waiter {
    token: u64,
    from: Option<SocketAddr>,
    tx: oneshot::Sender<(SocketAddr, String)>,
}

type WaiterTable = Arc<DashMap<String, Vec<Waiter>>>;

/// One shared UDP socket per server process, demultiplexing tagged probe
/// datagrams to whoever registered for their exact text.
pub struct NatProbeListener {
    socket: Arc<UdpSocket>,
    waiters: WaiterTable,
    token: AtomicU64,
    sent: AtomicUsize,
    _recv: OwnedJoinHandle,
}

impl NatProbeListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<NatProbeListener> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let waiters: WaiterTable = Arc::new(DashMap::new());
        let handle = tokio::spawn(recv_loop(socket.clone(), waiters.clone()));
        Ok(Self {
            socket,
            waiters,
            token: AtomicU64::new(0),
            sent: AtomicUsize::new(0),
            _recv: OwnedJoinHandle::new(handle),
        })
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Fire-and-forget tagged write. Send failures are logged, never raised;
    /// a lost probe just lets the bounded wait elapse.
    pub async fn send(&self, addr: SocketAddr, message: &str) {
        let mut buf = Vec::with_capacity(message.len() + 1);
        buf.push(PROBE_TAG);
        buf.extend_from_slice(message.as_bytes());
        self.sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.socket.send_to(&buf, addr).await {
            log::warn!("probe send {addr},{e:?}");
        }
    }

    /// Number of probes sent since bind. Observable for tests.
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Register for the next datagram carrying exactly `message`.
    ///
    /// The returned future resolves with the sender address at most once;
    /// dropping it removes the registration. The caller wraps it in its own
    /// timeout - there is no automatic expiry here.
    pub fn wait_for(&self, message: &str) -> PendingProbe {
        self.register(message, None)
    }

    /// Like [`wait_for`](Self::wait_for) but only accepts a specific sender.
    pub fn wait_for_from(&self, message: &str, from: SocketAddr) -> PendingProbe {
        self.register(message, Some(from))
    }

    fn register(&self, message: &str, from: Option<SocketAddr>) -> PendingProbe {
        let token = self.token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(message.to_string())
            .or_default()
            .push(Waiter { token, from, tx });
        PendingProbe {
            rx,
            key: message.to_string(),
            token,
            waiters: self.waiters.clone(),
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, waiters: WaiterTable) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(rs) => rs,
            Err(e) => {
                log::warn!("probe recv,{e:?}");
                continue;
            }
        };
        if len < 2 || len > MAX_PROBE_LEN + 1 || buf[0] != PROBE_TAG {
            continue;
        }
        let Ok(text) = std::str::from_utf8(&buf[1..len]) else {
            continue;
        };
        dispatch(&waiters, addr, text);
    }
}

fn dispatch(waiters: &WaiterTable, addr: SocketAddr, text: &str) {
    let Some(mut entry) = waiters.get_mut(text) else {
        // Legacy clients also aim identity announcements at us; those carry
        // no registration, only the known grammar.
        match grammar::ProbeText::parse(text) {
            Some(probe) => log::debug!("unclaimed {probe} from {addr}"),
            None => log::debug!("unrecognized probe from {addr}: {text:?}"),
        }
        return;
    };
    // Every matching registration is fulfilled by this datagram; each one
    // resolves at most once and is dropped from the table here.
    let list = entry.value_mut();
    let mut kept = Vec::with_capacity(list.len());
    for waiter in list.drain(..) {
        match waiter.from {
            Some(expected) if expected != addr => kept.push(waiter),
            _ => {
                let _ = waiter.tx.send((addr, text.to_string()));
            }
        }
    }
    *list = kept;
}

/// A named NAT packet awaited as a future. Resolves to `None` if the listener
/// shut down before the packet arrived.
pub struct PendingProbe {
    rx: oneshot::Receiver<(SocketAddr, String)>,
    key: String,
    token: u64,
    waiters: WaiterTable,
}

impl Future for PendingProbe {
    type Output = Option<(SocketAddr, String)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|rs| rs.ok())
    }
}

impl Drop for PendingProbe {
    fn drop(&mut self) {
        if let Some(mut entry) = self.waiters.get_mut(&self.key) {
            entry.value_mut().retain(|w| w.token != self.token);
        }
        self.waiters.remove_if(&self.key, |_, list| list.is_empty());
    }
}
