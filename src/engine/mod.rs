use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};

use crate::config::ServerConfig;
use crate::connectivity::{classify, ConnectivityResult};
use crate::error::{Error, Result};
use crate::establish::{establish, ConnectionPlan, PeerEndpoint};
use crate::player::{Notifier, PeerLink, Player, ResultSink};
use crate::probe::NatProbeListener;
use crate::protocol;
use crate::protocol::frame::{framed, FramedReader};
use crate::protocol::Envelope;
use crate::relay::RelayPool;
use crate::session::{Intent, RemoveOutcome, Session, SessionMap};
use crate::OwnedJoinHandle;

mod heartbeat;
use heartbeat::Heartbeat;

const MAX_PROXIES_NOTICE: &str =
    "Connection failed: all relay slots are in use. The pairing will be retried.";
const HOST_LEFT_NOTICE: &str = "The host has left; the game was cancelled.";
const LAUNCH_REJECTED_NOTICE: &str = "The game could not start; the lobby was closed.";

/// Per-connection protocol state. Monotonic; `Ended` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    ConnectedToHost,
    Ended,
}

/// Shared collaborators every engine needs; one per server process.
#[derive(Clone)]
pub struct CoreContext {
    pub listener: Arc<NatProbeListener>,
    pub relay: RelayPool,
    pub sessions: Arc<SessionMap>,
    pub config: Arc<ServerConfig>,
    pub notifier: Arc<dyn Notifier>,
    pub results: Arc<dyn ResultSink>,
}

/// Cheap cloneable face of one engine: the command queue, the published
/// connectivity classification, and the "already connected to" set other
/// engines consult when building the mesh.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    player: Arc<Player>,
    outbound: mpsc::UnboundedSender<Envelope>,
    state: Arc<AtomicCell<ConnectionState>>,
    connectivity: watch::Receiver<Option<ConnectivityResult>>,
    connected_to: Arc<Mutex<HashSet<u64>>>,
    closed: Arc<Notify>,
}

impl EngineHandle {
    fn new(
        player: Arc<Player>,
        outbound: mpsc::UnboundedSender<Envelope>,
        connectivity: watch::Receiver<Option<ConnectivityResult>>,
        closed: Arc<Notify>,
    ) -> EngineHandle {
        Self {
            player,
            outbound,
            state: Arc::new(AtomicCell::new(ConnectionState::Initializing)),
            connectivity,
            connected_to: Arc::new(Mutex::new(HashSet::new())),
            closed,
        }
    }

    pub fn player(&self) -> &Player {
        &self.player
    }
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }
    pub(crate) fn set_state(&self, state: ConnectionState) {
        // Ended is terminal.
        if self.state.load() != ConnectionState::Ended {
            self.state.store(state);
        }
    }

    /// Queue a command for the client. A full teardown race just drops it.
    pub fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).is_err() {
            log::debug!("{}: send after close", self.player.login);
        }
    }

    /// Ask the engine's run loop to shut the connection down.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// This player's classification, waiting up to `wait` for an in-flight
    /// one. No classification within the bound reads as blocked.
    pub async fn connectivity(&self, wait: Duration) -> ConnectivityResult {
        let mut rx = self.connectivity.clone();
        let watched = async {
            loop {
                let current = *rx.borrow();
                if let Some(rs) = current {
                    return rs;
                }
                if rx.changed().await.is_err() {
                    return ConnectivityResult::blocked();
                }
            }
        };
        tokio::time::timeout(wait, watched)
            .await
            .unwrap_or_else(|_| ConnectivityResult::blocked())
    }

    pub(crate) fn mark_connected(&self, peer: u64) -> bool {
        self.connected_to.lock().insert(peer)
    }
    pub(crate) fn unmark_connected(&self, peer: u64) {
        self.connected_to.lock().remove(&peer);
    }
    pub fn is_connected_to(&self, peer: u64) -> bool {
        self.connected_to.lock().contains(&peer)
    }

    #[cfg(test)]
    pub(crate) fn detached(player: Player) -> EngineHandle {
        Self::test_pair(player).0
    }

    #[cfg(test)]
    pub(crate) fn test_pair(
        player: Player,
    ) -> (
        EngineHandle,
        mpsc::UnboundedReceiver<Envelope>,
        watch::Sender<Option<ConnectivityResult>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = watch::channel(None);
        let handle = Self::new(Arc::new(player), tx, watch_rx, Arc::new(Notify::new()));
        (handle, rx, watch_tx)
    }
}

#[async_trait]
impl PeerLink for EngineHandle {
    fn player(&self) -> &Player {
        &self.player
    }
    async fn send_nat_packet(&self, dest: SocketAddr, message: &str) {
        self.send(protocol::send_nat_packet(dest, message));
    }
}

/// The per-client protocol state machine. Owns the framed connection, drives
/// classification and mesh construction, and is the single catch-and-abort
/// boundary for everything this client does.
pub struct ConnectionEngine {
    player: Arc<Player>,
    context: CoreContext,
    handle: EngineHandle,
    reader: FramedReader,
    session: Option<Arc<Session>>,
    relay_targets: Vec<SocketAddr>,
    connectivity_tx: watch::Sender<Option<ConnectivityResult>>,
    heartbeat: Heartbeat,
    classify_task: Option<OwnedJoinHandle>,
    mesh_task: Option<OwnedJoinHandle>,
    writer_task: OwnedJoinHandle,
}

impl ConnectionEngine {
    pub fn new(stream: TcpStream, player: Player, context: CoreContext) -> ConnectionEngine {
        let player = Arc::new(player);
        let (reader, mut writer) = framed(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (connectivity_tx, connectivity_rx) = watch::channel(None);
        let closed = Arc::new(Notify::new());
        let handle = EngineHandle::new(
            player.clone(),
            outbound_tx,
            connectivity_rx,
            closed.clone(),
        );
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(e) = writer.write_envelope(&envelope).await {
                    log::debug!("writer stopped: {e}");
                    closed.notify_one();
                    break;
                }
            }
        });
        let relay_targets = context
            .config
            .relay_ports
            .iter()
            .map(|port| SocketAddr::new(context.config.advertised_ip, *port))
            .collect();
        let heartbeat = Heartbeat::new(
            context.config.heartbeat_interval,
            context.config.heartbeat_miss,
        );
        Self {
            player,
            context,
            handle,
            reader,
            session: None,
            relay_targets,
            connectivity_tx,
            heartbeat,
            classify_task: None,
            mesh_task: None,
            writer_task: OwnedJoinHandle::new(writer_task),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub async fn run(mut self) {
        log::info!("{}: connection started", self.player.login);
        let mut ping = tokio::time::interval(self.context.config.heartbeat_interval);
        let closed = self.handle.closed.clone();
        loop {
            tokio::select! {
                rs = self.reader.read_envelope() => match rs {
                    Ok(envelope) => {
                        let command = envelope.command.clone();
                        if let Err(e) = self.dispatch(envelope).await {
                            log::warn!(
                                "{}: {command} failed: {e}, aborting connection",
                                self.player.login
                            );
                            break;
                        }
                        if self.handle.state() == ConnectionState::Ended {
                            break;
                        }
                    }
                    Err(Error::Closed) => {
                        log::debug!("{}: client hung up", self.player.login);
                        break;
                    }
                    // The frame was fully consumed before decoding, so the
                    // stream is still in sync: drop the envelope, keep going.
                    Err(e @ (Error::Protocol(_) | Error::Json(_))) => {
                        log::warn!("{}: bad envelope dropped: {e}", self.player.login);
                    }
                    Err(e) => {
                        log::warn!("{}: read failed: {e}", self.player.login);
                        break;
                    }
                },
                _ = ping.tick() => {
                    if self.heartbeat.expired() {
                        log::warn!("{}: heartbeat lost", self.player.login);
                        break;
                    }
                    self.handle.send(protocol::ping());
                }
                _ = closed.notified() => break,
            }
        }
        self.abort().await;
    }

    /// Route one inbound envelope. Malformed or unauthorized envelopes are
    /// dropped with a log line; an `Err` from here aborts this connection
    /// and nothing else.
    async fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.command.as_str() {
            "GameState" => {
                let Ok(state) = envelope.arg_str(0) else {
                    log::warn!("{}: GameState without a state", self.player.login);
                    return Ok(());
                };
                let state = state.to_string();
                self.on_game_state(&state).await?;
            }
            "GameOption" => {
                if let Some(session) = self.host_session("GameOption") {
                    if let Ok(key) = envelope.arg_str(0) {
                        session.set_game_option(key, arg_value(&envelope, 1));
                    }
                }
            }
            "PlayerOption" => {
                if let Some(session) = self.host_session("PlayerOption") {
                    if let (Ok(player), Ok(key)) = (envelope.arg_str(0), envelope.arg_str(1)) {
                        session.set_player_option(player, key, arg_value(&envelope, 2));
                    }
                }
            }
            "AIOption" => {
                if let Some(session) = self.host_session("AIOption") {
                    if let (Ok(name), Ok(key)) = (envelope.arg_str(0), envelope.arg_str(1)) {
                        session.set_ai_option(name, key, arg_value(&envelope, 2));
                    }
                }
            }
            "ClearSlot" => {
                if let Some(session) = self.host_session("ClearSlot") {
                    if let Ok(slot) = envelope.arg_u64(0) {
                        session.clear_slot(slot);
                    }
                }
            }
            "GameResult" => {
                if let Some(session) = &self.session {
                    match (envelope.arg_u64(0), envelope.arg_str(1)) {
                        (Ok(army), Ok(report)) if army <= u64::from(u32::MAX) => {
                            session.add_result(army as u32, report)
                        }
                        _ => log::info!("{}: garbled GameResult", self.player.login),
                    }
                }
            }
            "Desync" => {
                if let Some(session) = &self.session {
                    session.record_desync();
                }
            }
            "Bottleneck" | "BottleneckCleared" | "Chat" | "Stats" => {
                log::debug!("{}: {} recorded", self.player.login, envelope.command);
            }
            "pong" => self.heartbeat.pong(),
            "ping" => self.handle.send(protocol::pong()),
            other => {
                // Forward compatibility: newer clients may speak commands we
                // don't know yet.
                log::warn!("{}: unknown command {other:?} ignored", self.player.login);
            }
        }
        Ok(())
    }

    async fn on_game_state(&mut self, state: &str) -> Result<()> {
        log::debug!("{}: game state {state}", self.player.login);
        match state {
            "Idle" => self.on_idle(),
            "Lobby" => self.on_lobby(),
            "Launching" => {
                self.on_launching().await;
                Ok(())
            }
            "Ended" => {
                self.handle.set_state(ConnectionState::Ended);
                Ok(())
            }
            other => {
                log::warn!("{}: unknown game state {other:?}", self.player.login);
                Ok(())
            }
        }
    }

    /// The game process started: bind the connection to its session.
    fn on_idle(&mut self) -> Result<()> {
        let intent = self
            .context
            .sessions
            .take_intent(self.player.id)
            .ok_or_else(|| {
                Error::Protocol(format!("no pending action for {}", self.player.login))
            })?;
        let session = match intent {
            Intent::Host { map } => {
                let session = self.context.sessions.create(self.handle.clone(), map);
                log::info!("{} hosts session {}", self.player.login, session.id());
                session
            }
            Intent::Join { session: id } => {
                let session = self.context.sessions.get(id).ok_or_else(|| {
                    Error::InvalidArgument(format!("session {id} does not exist"))
                })?;
                if !session.add_player(self.handle.clone()) {
                    return Err(Error::InvalidArgument(format!("session {id} not joinable")));
                }
                log::info!("{} joins session {id}", self.player.login);
                session
            }
        };
        self.session = Some(session);
        self.handle.send(protocol::create_lobby(
            self.player.id,
            &self.player.login,
            self.player.local_port,
        ));
        Ok(())
    }

    /// The game is listening on its local port: classify, then open hosting
    /// or start working through the mesh.
    fn on_lobby(&mut self) -> Result<()> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| Error::Protocol("Lobby before Idle".into()))?;
        self.start_classification();
        if session.is_host(&self.player.login) {
            session.open_lobby();
            self.handle.set_state(ConnectionState::ConnectedToHost);
            self.handle.send(protocol::host_game(&session.map()));
        } else {
            let task = tokio::spawn(build_mesh(
                self.context.clone(),
                session,
                self.handle.clone(),
            ));
            self.mesh_task = Some(OwnedJoinHandle::new(task));
        }
        Ok(())
    }

    async fn on_launching(&mut self) {
        let Some(session) = self.session.clone() else {
            log::warn!("{}: Launching without a session", self.player.login);
            return;
        };
        if !session.is_host(&self.player.login) {
            log::warn!("{}: Launching from a non-host, dropped", self.player.login);
            return;
        }
        match session.launch() {
            Ok(()) => log::info!("session {} is live", session.id()),
            Err(reason) => {
                log::warn!("session {} rejected at launch: {reason}", session.id());
                for peer in session.roster() {
                    peer.send(protocol::notice(LAUNCH_REJECTED_NOTICE));
                    self.context
                        .notifier
                        .notify(&peer.player().login, LAUNCH_REJECTED_NOTICE)
                        .await;
                    peer.close();
                }
                self.context.sessions.remove(session.id());
            }
        }
    }

    /// Classification runs once per connection; re-entering the lobby state
    /// does not restart it.
    fn start_classification(&mut self) {
        if self.classify_task.is_some() {
            return;
        }
        let listener = self.context.listener.clone();
        let link = self.handle.clone();
        let config = self.context.config.clone();
        let targets = self.relay_targets.clone();
        let tx = self.connectivity_tx.clone();
        let task = tokio::spawn(async move {
            let rs = classify(&listener, &link, &targets, &config).await;
            let _ = tx.send(Some(rs));
        });
        self.classify_task = Some(OwnedJoinHandle::new(task));
    }

    fn host_session(&self, command: &str) -> Option<Arc<Session>> {
        let session = self.session.clone()?;
        if session.is_host(&self.player.login) {
            Some(session)
        } else {
            log::warn!("{}: {command} from a non-host, dropped", self.player.login);
            None
        }
    }

    /// The one teardown path. Dropping the task handles cancels in-flight
    /// classification and mesh work; session cleanup cascades from here.
    async fn abort(mut self) {
        self.teardown().await;
        // Last-queued notices must still reach the wire: drop our sender and
        // let the writer drain before its handle aborts the task.
        let Self {
            handle,
            writer_task,
            ..
        } = self;
        drop(handle);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer_task.join()).await;
    }

    async fn teardown(&mut self) {
        self.handle.set_state(ConnectionState::Ended);
        self.classify_task.take();
        self.mesh_task.take();
        self.context.relay.release(&self.player.login);
        let Some(session) = self.session.take() else {
            log::info!("{}: connection ended", self.player.login);
            return;
        };
        match session.remove_player(&self.player.login) {
            RemoveOutcome::Removed => {}
            RemoveOutcome::Destroyed => {
                self.context.sessions.remove(session.id());
            }
            RemoveOutcome::HostLeft { peers } => {
                for peer in peers {
                    peer.send(protocol::disconnect_from_peer(self.player.id));
                    peer.send(protocol::notice(HOST_LEFT_NOTICE));
                    self.context
                        .notifier
                        .notify(&peer.player().login, HOST_LEFT_NOTICE)
                        .await;
                    peer.close();
                }
                self.context.sessions.remove(session.id());
            }
            RemoveOutcome::Finished { results } => {
                self.context.results.report(session.id(), results).await;
                self.context.sessions.remove(session.id());
            }
        }
        log::info!("{}: connection ended", self.player.login);
    }
}

fn arg_value(envelope: &Envelope, index: usize) -> Value {
    envelope.args.get(index).cloned().unwrap_or(Value::Null)
}

/// Mesh construction for a joiner: host first, then every already-connected
/// peer in join order. No host connection, no mesh.
async fn build_mesh(context: CoreContext, session: Arc<Session>, me: EngineHandle) {
    let Some(host) = session.host_handle() else {
        return;
    };
    if !connect_pair(&context, &me, &host, true).await {
        return;
    }
    me.set_state(ConnectionState::ConnectedToHost);
    for peer in session.connected_peers(me.player().id) {
        connect_pair(&context, &me, &peer, false).await;
    }
}

/// Negotiate one pair and tell both sides about each other. Idempotent per
/// unordered pair via the "connected to" sets. Returns false only when the
/// pairing could not be made this round.
async fn connect_pair(
    context: &CoreContext,
    a: &EngineHandle,
    b: &EngineHandle,
    a_joins_b: bool,
) -> bool {
    if !a.mark_connected(b.player().id) {
        return true;
    }
    b.mark_connected(a.player().id);
    let wait = context.config.classification_wait();
    let result_a = a.connectivity(wait).await;
    let result_b = b.connectivity(wait).await;
    let plan = establish(
        &context.listener,
        &context.relay,
        &context.config,
        PeerEndpoint {
            link: a,
            result: result_a,
        },
        PeerEndpoint {
            link: b,
            result: result_b,
        },
    )
    .await;
    let (player_a, player_b) = (a.player(), b.player());
    match plan {
        ConnectionPlan::Direct { a_uses, b_uses } => {
            let to_b = if a_joins_b {
                protocol::join_game(a_uses, &player_b.login, player_b.id)
            } else {
                protocol::connect_to_peer(a_uses, &player_b.login, player_b.id)
            };
            a.send(to_b);
            b.send(protocol::connect_to_peer(b_uses, &player_a.login, player_a.id));
            true
        }
        ConnectionPlan::Relay { slot } => {
            a.send(protocol::connect_to_proxy(slot, &player_b.login, player_b.id));
            b.send(protocol::connect_to_proxy(slot, &player_a.login, player_a.id));
            true
        }
        ConnectionPlan::Unavailable => {
            a.unmark_connected(player_b.id);
            b.unmark_connected(player_a.id);
            a.send(protocol::notice(MAX_PROXIES_NOTICE));
            b.send(protocol::notice(MAX_PROXIES_NOTICE));
            context.notifier.notify(&player_a.login, MAX_PROXIES_NOTICE).await;
            context.notifier.notify(&player_b.login, MAX_PROXIES_NOTICE).await;
            false
        }
    }
}
