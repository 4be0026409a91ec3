/*
  Wire envelope spoken with the game clients over the framed channel:

    [4-byte little-endian length][UTF-8 JSON payload]
    payload = {"command": <string>, "args": [...]}

  Legacy clients send {"key": <string>, "commands": [...]} instead; both
  decode into the same [`Envelope`]. Encoding always uses the modern form.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

use crate::error::{Error, Result};

pub mod frame;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Deserialize)]
struct LegacyEnvelope {
    key: String,
    #[serde(default)]
    commands: Vec<Value>,
}

impl Envelope {
    pub fn new<C: Into<String>>(command: C, args: Vec<Value>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
    pub fn decode(payload: &[u8]) -> Result<Envelope> {
        if let Ok(envelope) = serde_json::from_slice::<Envelope>(payload) {
            if !envelope.command.is_empty() {
                return Ok(envelope);
            }
        }
        let legacy: LegacyEnvelope = serde_json::from_slice(payload)
            .map_err(|_| Error::Protocol("unrecognized envelope".into()))?;
        Ok(Envelope {
            command: legacy.key,
            args: legacy.commands,
        })
    }
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn arg_str(&self, index: usize) -> Result<&str> {
        self.args
            .get(index)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol(format!("{}: arg {index} is not a string", self.command)))
    }
    pub fn arg_u64(&self, index: usize) -> Result<u64> {
        self.args
            .get(index)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Protocol(format!("{}: arg {index} is not an integer", self.command)))
    }
}

/// Commands the engine issues to the game client.
pub fn create_lobby(player_id: u64, login: &str, local_port: u16) -> Envelope {
    Envelope::new(
        "CreateLobby",
        vec![local_port.into(), player_id.into(), login.into()],
    )
}
pub fn host_game(map: &str) -> Envelope {
    Envelope::new("HostGame", vec![map.into()])
}
pub fn join_game(addr: SocketAddr, login: &str, peer_id: u64) -> Envelope {
    Envelope::new(
        "JoinGame",
        vec![addr.to_string().into(), login.into(), peer_id.into()],
    )
}
pub fn connect_to_peer(addr: SocketAddr, login: &str, peer_id: u64) -> Envelope {
    Envelope::new(
        "ConnectToPeer",
        vec![addr.to_string().into(), login.into(), peer_id.into()],
    )
}
pub fn connect_to_proxy(slot: u8, login: &str, peer_id: u64) -> Envelope {
    Envelope::new(
        "ConnectToProxy",
        vec![slot.into(), login.into(), peer_id.into()],
    )
}
pub fn disconnect_from_peer(peer_id: u64) -> Envelope {
    Envelope::new("DisconnectFromPeer", vec![peer_id.into()])
}
pub fn send_nat_packet(dest: SocketAddr, message: &str) -> Envelope {
    Envelope::new(
        "SendNatPacket",
        vec![dest.to_string().into(), message.into()],
    )
}
pub fn ping() -> Envelope {
    Envelope::new("ping", vec![])
}
pub fn pong() -> Envelope {
    Envelope::new("pong", vec![])
}
pub fn notice(text: &str) -> Envelope {
    Envelope::new("Notice", vec![text.into()])
}

#[cfg(test)]
mod test {
    use super::Envelope;

    #[test]
    fn test_decode_modern() {
        let envelope =
            Envelope::decode(br#"{"command":"GameState","args":["Lobby"]}"#).unwrap();
        assert_eq!(envelope.command, "GameState");
        assert_eq!(envelope.arg_str(0).unwrap(), "Lobby");
    }

    #[test]
    fn test_decode_legacy() {
        let envelope =
            Envelope::decode(br#"{"key":"GameState","commands":["Idle"]}"#).unwrap();
        assert_eq!(envelope.command, "GameState");
        assert_eq!(envelope.arg_str(0).unwrap(), "Idle");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"foo":1}"#).is_err());
    }

    #[test]
    fn test_missing_args() {
        let envelope = Envelope::decode(br#"{"command":"GameState"}"#).unwrap();
        assert!(envelope.args.is_empty());
        assert!(envelope.arg_str(0).is_err());
    }
}
