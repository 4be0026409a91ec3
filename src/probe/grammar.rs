//! The fixed probe texts the legacy clients understand. Every probe embeds a
//! player id or login so concurrent registrations on the shared listener
//! never collide across sessions.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeText {
    /// `"Are you public? <id>"` - reachability test for a claimed endpoint.
    AreYouPublic { id: u64 },
    /// `"Hello <id>"` - STUN-style probe sent by the client to a relay port.
    Hello { id: u64 },
    /// `"Hello from <id>"` - simultaneous peer exchange probe.
    HelloFrom { id: u64 },
    /// `"/PLAYERID <uid> <login>"` - legacy peer identity announcement.
    PlayerId { uid: u64, login: String },
    /// `"/ASKREPLY <login>"` - legacy peer identity request.
    AskReply { login: String },
}

impl ProbeText {
    pub fn parse(text: &str) -> Option<ProbeText> {
        if let Some(rest) = text.strip_prefix("Are you public? ") {
            return rest.parse().ok().map(|id| ProbeText::AreYouPublic { id });
        }
        if let Some(rest) = text.strip_prefix("Hello from ") {
            return rest.parse().ok().map(|id| ProbeText::HelloFrom { id });
        }
        if let Some(rest) = text.strip_prefix("Hello ") {
            return rest.parse().ok().map(|id| ProbeText::Hello { id });
        }
        if let Some(rest) = text.strip_prefix("/PLAYERID ") {
            let (uid, login) = rest.split_once(' ')?;
            let uid = uid.parse().ok()?;
            return Some(ProbeText::PlayerId {
                uid,
                login: login.to_string(),
            });
        }
        if let Some(rest) = text.strip_prefix("/ASKREPLY ") {
            return Some(ProbeText::AskReply {
                login: rest.to_string(),
            });
        }
        None
    }
}

impl fmt::Display for ProbeText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeText::AreYouPublic { id } => write!(f, "Are you public? {id}"),
            ProbeText::Hello { id } => write!(f, "Hello {id}"),
            ProbeText::HelloFrom { id } => write!(f, "Hello from {id}"),
            ProbeText::PlayerId { uid, login } => write!(f, "/PLAYERID {uid} {login}"),
            ProbeText::AskReply { login } => write!(f, "/ASKREPLY {login}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::ProbeText;

    #[test]
    fn test_parse_round_trip() {
        let texts = [
            ProbeText::AreYouPublic { id: 42 },
            ProbeText::Hello { id: 7 },
            ProbeText::HelloFrom { id: 31000 },
            ProbeText::PlayerId {
                uid: 5,
                login: "crio".to_string(),
            },
            ProbeText::AskReply {
                login: "crio".to_string(),
            },
        ];
        for text in texts {
            assert_eq!(ProbeText::parse(&text.to_string()), Some(text));
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(ProbeText::parse("Goodbye 42"), None);
        assert_eq!(ProbeText::parse("Hello from x"), None);
        assert_eq!(ProbeText::parse("/PLAYERID 5"), None);
    }

    #[test]
    fn test_hello_not_confused_with_hello_from() {
        assert_eq!(
            ProbeText::parse("Hello from 9"),
            Some(ProbeText::HelloFrom { id: 9 })
        );
        assert_eq!(ProbeText::parse("Hello 9"), Some(ProbeText::Hello { id: 9 }));
    }
}
