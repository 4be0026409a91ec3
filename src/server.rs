use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::engine::{ConnectionEngine, CoreContext};
use crate::error::Result;
use crate::player::{LogNotifier, LogResultSink, Notifier, PlayerDirectory, ResultSink};
use crate::probe::NatProbeListener;
use crate::relay::RelayPool;
use crate::session::SessionMap;

/// Accepts game-client connections and spawns one protocol engine each.
/// Everything stateful lives in the shared [`CoreContext`]; the server is
/// just the accept loop plus the player-directory handshake.
pub struct LobbyServer {
    context: CoreContext,
    directory: Arc<dyn PlayerDirectory>,
}

impl LobbyServer {
    pub async fn new(
        config: ServerConfig,
        directory: Arc<dyn PlayerDirectory>,
    ) -> Result<LobbyServer> {
        Self::with_collaborators(config, directory, Arc::new(LogNotifier), Arc::new(LogResultSink))
            .await
    }

    pub async fn with_collaborators(
        config: ServerConfig,
        directory: Arc<dyn PlayerDirectory>,
        notifier: Arc<dyn Notifier>,
        results: Arc<dyn ResultSink>,
    ) -> Result<LobbyServer> {
        let listener = Arc::new(NatProbeListener::bind(config.probe_bind).await?);
        let context = CoreContext {
            listener,
            relay: RelayPool::new(config.relay_slots),
            sessions: Arc::new(SessionMap::default()),
            config: Arc::new(config),
            notifier,
            results,
        };
        Ok(Self { context, directory })
    }

    pub fn context(&self) -> CoreContext {
        self.context.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.context.config.lobby_bind).await?;
        log::info!("lobby listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(rs) => rs,
                Err(e) => {
                    log::warn!("accept failed,{e:?}");
                    continue;
                }
            };
            let Some(player) = self.directory.lookup_by_ip(addr.ip()).await else {
                log::warn!("connection from unknown address {addr}, dropped");
                continue;
            };
            log::debug!("{} connected from {addr}", player.login);
            let engine = ConnectionEngine::new(stream, player, self.context.clone());
            tokio::spawn(engine.run());
        }
    }
}
