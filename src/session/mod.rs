use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::engine::EngineHandle;

/// Lifecycle of one match, terminal at `Ended`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Initializing,
    Lobby,
    Live,
    Ended,
}

/// What a client intends to do once its game process reports `Idle`.
/// Set by the outer lobby surface before the game launches.
#[derive(Clone, Debug)]
pub enum Intent {
    Host { map: String },
    Join { session: u64 },
}

/// What removing a player did to the session.
#[derive(Debug)]
pub enum RemoveOutcome {
    /// Player gone, session carries on.
    Removed,
    /// Last player left before launch; the session is gone.
    Destroyed,
    /// The host left before launch: session cancelled, these peers must be
    /// told to drop their connections to the host.
    HostLeft { peers: Vec<EngineHandle> },
    /// The live roster emptied; accumulated results are ready to report.
    Finished { results: Vec<(u32, String)> },
}

struct SessionInner {
    state: SessionState,
    map: String,
    roster: Vec<EngineHandle>,
    game_options: HashMap<String, Value>,
    player_options: HashMap<String, HashMap<String, Value>>,
    ai_options: HashMap<String, HashMap<String, Value>>,
    results: HashMap<u32, String>,
    desyncs: u32,
    live_roster: usize,
}

/// One match: roster in join order, host first, plus the lobby-scoped
/// configuration the host pushes down and the outcome reports the clients
/// push up.
pub struct Session {
    id: u64,
    host_id: u64,
    host_login: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: u64, host: EngineHandle, map: String) -> Arc<Session> {
        let host_id = host.player().id;
        let host_login = host.player().login.clone();
        Arc::new(Session {
            id,
            host_id,
            host_login,
            inner: Mutex::new(SessionInner {
                state: SessionState::Initializing,
                map,
                roster: vec![host],
                game_options: HashMap::new(),
                player_options: HashMap::new(),
                ai_options: HashMap::new(),
                results: HashMap::new(),
                desyncs: 0,
                live_roster: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn host_id(&self) -> u64 {
        self.host_id
    }
    pub fn host_login(&self) -> &str {
        &self.host_login
    }
    pub fn is_host(&self, login: &str) -> bool {
        self.host_login == login
    }
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }
    pub fn map(&self) -> String {
        self.inner.lock().map.clone()
    }

    pub fn host_handle(&self) -> Option<EngineHandle> {
        let inner = self.inner.lock();
        inner
            .roster
            .iter()
            .find(|h| h.player().id == self.host_id)
            .cloned()
    }

    /// The host opened its lobby; joiners are admitted from here on.
    pub fn open_lobby(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Initializing {
            inner.state = SessionState::Lobby;
        }
    }

    /// Admit a joiner. Only a session sitting in its lobby takes players.
    pub fn add_player(&self, handle: EngineHandle) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Lobby {
            return false;
        }
        if inner
            .roster
            .iter()
            .any(|h| h.player().id == handle.player().id)
        {
            return false;
        }
        inner.roster.push(handle);
        true
    }

    /// Peers already meshed to the host, in join order, excluding `exclude`.
    /// This is the order a new joiner works through after the host.
    pub fn connected_peers(&self, exclude: u64) -> Vec<EngineHandle> {
        use crate::engine::ConnectionState;
        let inner = self.inner.lock();
        inner
            .roster
            .iter()
            .filter(|h| {
                h.player().id != exclude
                    && h.player().id != self.host_id
                    && h.state() == ConnectionState::ConnectedToHost
            })
            .cloned()
            .collect()
    }

    pub fn roster(&self) -> Vec<EngineHandle> {
        self.inner.lock().roster.clone()
    }

    /// Freeze the roster and go live. A repeated launch of a live session is
    /// a no-op; launching a session whose lobby never formed fails.
    pub fn launch(&self) -> Result<(), &'static str> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Live => Ok(()),
            SessionState::Lobby => {
                if inner.roster.is_empty() {
                    return Err("empty roster");
                }
                inner.state = SessionState::Live;
                inner.live_roster = inner.roster.len();
                Ok(())
            }
            _ => Err("not in lobby"),
        }
    }

    pub fn remove_player(&self, login: &str) -> RemoveOutcome {
        let mut inner = self.inner.lock();
        let departed = inner
            .roster
            .iter()
            .find(|h| h.player().login == login)
            .map(|h| h.player().id);
        inner.roster.retain(|h| h.player().login != login);
        let removed = departed.is_some();
        // Remaining peers forget the departed id so a rejoin renegotiates.
        if let Some(id) = departed {
            for handle in &inner.roster {
                handle.unmark_connected(id);
            }
        }
        match inner.state {
            SessionState::Ended => RemoveOutcome::Removed,
            SessionState::Live => {
                if !removed {
                    return RemoveOutcome::Removed;
                }
                inner.live_roster = inner.live_roster.saturating_sub(1);
                if inner.live_roster == 0 {
                    inner.state = SessionState::Ended;
                    let mut results: Vec<(u32, String)> =
                        inner.results.iter().map(|(a, r)| (*a, r.clone())).collect();
                    results.sort_by_key(|(army, _)| *army);
                    RemoveOutcome::Finished { results }
                } else {
                    RemoveOutcome::Removed
                }
            }
            _ if login == self.host_login => {
                inner.state = SessionState::Ended;
                RemoveOutcome::HostLeft {
                    peers: inner.roster.drain(..).collect(),
                }
            }
            _ if inner.roster.is_empty() => {
                inner.state = SessionState::Ended;
                RemoveOutcome::Destroyed
            }
            _ => RemoveOutcome::Removed,
        }
    }

    pub fn set_game_option(&self, key: &str, value: Value) {
        self.inner.lock().game_options.insert(key.to_string(), value);
    }
    pub fn game_option(&self, key: &str) -> Option<Value> {
        self.inner.lock().game_options.get(key).cloned()
    }
    pub fn set_player_option(&self, player: &str, key: &str, value: Value) {
        self.inner
            .lock()
            .player_options
            .entry(player.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
    pub fn player_option(&self, player: &str, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .player_options
            .get(player)
            .and_then(|m| m.get(key).cloned())
    }
    pub fn set_ai_option(&self, name: &str, key: &str, value: Value) {
        self.inner
            .lock()
            .ai_options
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Vacate a start spot: any player or AI option block whose `StartSpot`
    /// matches is dropped.
    pub fn clear_slot(&self, slot: u64) {
        let mut inner = self.inner.lock();
        let spot = Value::from(slot);
        inner
            .player_options
            .retain(|_, opts| opts.get("StartSpot") != Some(&spot));
        inner
            .ai_options
            .retain(|_, opts| opts.get("StartSpot") != Some(&spot));
    }

    /// Accumulate one client's outcome report for an army. The first
    /// well-formed report per army wins; duplicates and garbage are logged
    /// and dropped, never errors.
    pub fn add_result(&self, army: u32, report: &str) {
        if !valid_report(report) {
            log::info!("session {}: garbled result for army {army}: {report:?}", self.id);
            return;
        }
        let mut inner = self.inner.lock();
        match inner.results.get(&army) {
            None => {
                inner.results.insert(army, report.to_string());
            }
            Some(existing) if existing == report => {}
            Some(existing) => {
                log::info!(
                    "session {}: conflicting result for army {army}: kept {existing:?}, dropped {report:?}",
                    self.id
                );
            }
        }
    }

    pub fn record_desync(&self) {
        let mut inner = self.inner.lock();
        inner.desyncs += 1;
        log::debug!("session {}: desync #{}", self.id, inner.desyncs);
    }
    pub fn desyncs(&self) -> u32 {
        self.inner.lock().desyncs
    }
}

/// `"<outcome> <score>"`, e.g. `"victory 10"`.
fn valid_report(report: &str) -> bool {
    let mut parts = report.split_whitespace();
    let outcome = matches!(
        parts.next(),
        Some("victory" | "defeat" | "draw" | "mutual_draw" | "score")
    );
    outcome && parts.next().map(|s| s.parse::<i64>().is_ok()).unwrap_or(false)
        && parts.next().is_none()
}

/// All sessions of one server process plus the pending host/join intents the
/// outer lobby surface registered for players about to start their game.
pub struct SessionMap {
    sessions: DashMap<u64, Arc<Session>>,
    intents: DashMap<u64, Intent>,
    next_id: AtomicU64,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
            intents: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl SessionMap {
    pub fn set_intent(&self, player_id: u64, intent: Intent) {
        self.intents.insert(player_id, intent);
    }
    pub fn take_intent(&self, player_id: u64) -> Option<Intent> {
        self.intents.remove(&player_id).map(|(_, intent)| intent)
    }

    pub fn create(&self, host: EngineHandle, map: String) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, host, map);
        self.sessions.insert(id, session.clone());
        session
    }
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }
    pub fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::EngineHandle;
    use crate::session::{Intent, RemoveOutcome, SessionMap, SessionState};

    fn handle(id: u64, login: &str) -> EngineHandle {
        EngineHandle::detached(crate::player::Player {
            id,
            login: login.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            game_port: 6112,
            local_port: 6112,
        })
    }

    fn lobby() -> (std::sync::Arc<crate::session::Session>, SessionMap) {
        let sessions = SessionMap::default();
        let session = sessions.create(handle(1, "host"), "canis".to_string());
        session.open_lobby();
        (session, sessions)
    }

    #[test]
    fn lifecycle_reaches_live() {
        let (session, _) = lobby();
        assert_eq!(session.state(), SessionState::Lobby);
        assert!(session.add_player(handle(2, "ava")));
        session.launch().unwrap();
        assert_eq!(session.state(), SessionState::Live);
        // Roster is frozen once live.
        assert!(!session.add_player(handle(3, "ben")));
    }

    #[test]
    fn duplicate_launch_is_a_no_op() {
        let (session, _) = lobby();
        session.add_player(handle(2, "ava"));
        session.launch().unwrap();
        // A repeated Launching from the host must not tear anything down.
        session.launch().unwrap();
        assert_eq!(session.state(), SessionState::Live);
        assert_eq!(session.roster().len(), 2);
    }

    #[test]
    fn launch_needs_an_open_lobby() {
        let sessions = SessionMap::default();
        let session = sessions.create(handle(1, "host"), "canis".to_string());
        assert!(session.launch().is_err());
    }

    #[test]
    fn departed_player_is_forgotten_by_peers() {
        let (session, _) = lobby();
        let host = session.host_handle().unwrap();
        let ava = handle(2, "ava");
        session.add_player(ava.clone());
        host.mark_connected(2);
        ava.mark_connected(1);
        session.remove_player("ava");
        assert!(!host.is_connected_to(2));
    }

    #[test]
    fn outcomes_carry_debug_for_log_lines() {
        let (session, _) = lobby();
        session.add_player(handle(2, "ava"));
        let outcome = session.remove_player("host");
        let rendered = format!("{outcome:?}");
        assert!(rendered.contains("HostLeft"), "{rendered}");
    }

    #[test]
    fn host_leave_before_launch_cancels() {
        let (session, _) = lobby();
        session.add_player(handle(2, "ava"));
        match session.remove_player("host") {
            RemoveOutcome::HostLeft { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].player().login, "ava");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn last_leaver_empties_the_session() {
        let (session, _) = lobby();
        session.add_player(handle(2, "ava"));
        assert!(matches!(
            session.remove_player("ava"),
            RemoveOutcome::Removed
        ));
        match session.remove_player("host") {
            RemoveOutcome::HostLeft { peers } => assert!(peers.is_empty()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn live_session_finishes_with_results() {
        let (session, _) = lobby();
        session.add_player(handle(2, "ava"));
        session.launch().unwrap();
        session.add_result(1, "victory 10");
        session.add_result(2, "defeat -5");
        // Duplicate and garbled reports change nothing.
        session.add_result(1, "victory 10");
        session.add_result(1, "defeat 0");
        session.add_result(3, "banana");
        assert!(matches!(
            session.remove_player("host"),
            RemoveOutcome::Removed
        ));
        match session.remove_player("ava") {
            RemoveOutcome::Finished { results } => {
                assert_eq!(
                    results,
                    vec![(1, "victory 10".to_string()), (2, "defeat -5".to_string())]
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn clear_slot_drops_matching_option_blocks() {
        let (session, _) = lobby();
        session.set_player_option("ava", "StartSpot", 2.into());
        session.set_player_option("ava", "Faction", 1.into());
        session.set_ai_option("easy ai", "StartSpot", 3.into());
        session.clear_slot(2);
        assert_eq!(session.player_option("ava", "Faction"), None);
        session.clear_slot(3);
        // Only the matching spot was vacated each time.
        assert_eq!(session.game_option("x"), None);
    }

    #[test]
    fn intents_are_taken_once() {
        let sessions = SessionMap::default();
        sessions.set_intent(7, Intent::Join { session: 3 });
        assert!(sessions.take_intent(7).is_some());
        assert!(sessions.take_intent(7).is_none());
    }
}
