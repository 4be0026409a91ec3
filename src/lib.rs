//! # relaymesh - Session Coordination for Game Relays
//!
//! `relaymesh` is the connectivity core of a multiplayer game relay service.
//! For every pair of players in a match it decides how their clients exchange
//! real-time UDP traffic - directly, via simultaneous hole punching, or
//! through a bounded pool of relay slots - and it drives the per-client
//! protocol state machine from "game process started" to "fully connected
//! peer mesh".
//!
//! ## Architecture
//!
//! - [`probe`] - shared UDP listener demultiplexing tagged NAT probes
//! - [`connectivity`] - per-player reachability classification
//!   (public / STUN-like / blocked)
//! - [`establish`] - pairwise connection negotiation with relay fallback
//! - [`relay`] - the shared relay slot pool
//! - [`engine`] - per-client protocol state machine over the framed channel
//! - [`session`] - per-match lifecycle and roster
//! - [`server`] - the accept loop tying it together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaymesh::config::ServerConfig;
//! use relaymesh::server::LobbyServer;
//! # use relaymesh::player::{Player, PlayerDirectory};
//! # use async_trait::async_trait;
//! # struct Directory;
//! # #[async_trait]
//! # impl PlayerDirectory for Directory {
//! #     async fn lookup_by_ip(&self, _: std::net::IpAddr) -> Option<Player> { None }
//! #     async fn lookup_by_login(&self, _: &str) -> Option<Player> { None }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() -> relaymesh::error::Result<()> {
//! let server = LobbyServer::new(ServerConfig::default(), Arc::new(Directory)).await?;
//! server.run().await
//! # }
//! ```
//!
//! ## Failure model
//!
//! Network trouble never propagates as an error: a player that answers
//! nothing classifies as blocked, a failed punch falls back to a relay slot,
//! and an exhausted pool skips the pairing with a user-facing notice. Only a
//! genuine per-connection fault aborts - and it aborts exactly that one
//! connection.

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod establish;
pub mod player;
pub mod probe;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

use tokio::task::JoinHandle;

/// Background task whose lifetime is tied to its owner.
pub(crate) struct OwnedJoinHandle {
    handle: JoinHandle<()>,
}

impl OwnedJoinHandle {
    pub(crate) fn new(handle: JoinHandle<()>) -> OwnedJoinHandle {
        Self { handle }
    }

    /// Wait for the task to finish on its own instead of aborting it.
    pub(crate) async fn join(mut self) {
        let _ = (&mut self.handle).await;
    }
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
