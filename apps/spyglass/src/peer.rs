use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerParseError {
    #[error("peer id is empty")]
    Empty,
    #[error("peer id {0:?} has no session id")]
    MissingSessionId(String),
}

/// The compound identifier a client presents at connect time:
/// `projectKey:sessionId[:tabId]`. Clients that predate multi-tab support
/// omit the tab part and get a synthesized one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub project_key: String,
    pub session_id: String,
    pub tab_id: String,
}

impl PeerAddr {
    pub fn parse(raw: &str) -> Result<Self, PeerParseError> {
        let mut parts = raw.splitn(3, ':');
        let project_key = parts.next().unwrap_or_default();
        if project_key.is_empty() {
            return Err(PeerParseError::Empty);
        }
        let session_id = parts
            .next()
            .filter(|part| !part.is_empty())
            .ok_or_else(|| PeerParseError::MissingSessionId(raw.to_string()))?;
        let tab_id = match parts.next().filter(|part| !part.is_empty()) {
            Some(tab) => tab.to_string(),
            None => synth_tab_id(),
        };
        Ok(Self {
            project_key: project_key.to_string(),
            session_id: session_id.to_string(),
            tab_id,
        })
    }

    pub fn room_id(&self) -> RoomId {
        RoomId::of(&self.project_key, &self.session_id)
    }
}

/// Room identifier, a pure function of `(projectKey, sessionId)`. Every
/// connection sharing one belongs to the same live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn of(project_key: &str, session_id: &str) -> Self {
        RoomId(format!("{project_key}:{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Re-parse into `(projectKey, sessionId)`. `None` when either half is
    /// empty, which keeps malformed ids out of discovery results.
    pub fn split(&self) -> Option<(&str, &str)> {
        let (project_key, session_id) = self.0.split_once(':')?;
        if project_key.is_empty() || session_id.is_empty() {
            return None;
        }
        Some((project_key, session_id))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tab id fallback for legacy clients that only send `projectKey:sessionId`.
pub fn synth_tab_id() -> String {
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_guard::timeout]
    fn parses_full_triple() {
        let peer = PeerAddr::parse("p1:s1:t1").unwrap();
        assert_eq!(peer.project_key, "p1");
        assert_eq!(peer.session_id, "s1");
        assert_eq!(peer.tab_id, "t1");
    }

    #[test_guard::timeout]
    fn synthesizes_missing_tab_id() {
        let first = PeerAddr::parse("p1:s1").unwrap();
        let second = PeerAddr::parse("p1:s1").unwrap();
        assert!(!first.tab_id.is_empty());
        assert_ne!(first.tab_id, second.tab_id);
    }

    #[test_guard::timeout]
    fn rejects_unparseable_peer_ids() {
        assert_eq!(PeerAddr::parse(""), Err(PeerParseError::Empty));
        assert!(matches!(
            PeerAddr::parse("orphan"),
            Err(PeerParseError::MissingSessionId(_))
        ));
        assert!(matches!(
            PeerAddr::parse("p1:"),
            Err(PeerParseError::MissingSessionId(_))
        ));
    }

    #[test_guard::timeout]
    fn room_id_ignores_tab() {
        let a = PeerAddr::parse("p1:s1:t1").unwrap();
        let b = PeerAddr::parse("p1:s1:t2").unwrap();
        assert_eq!(a.room_id(), b.room_id());
        assert_eq!(a.room_id().split(), Some(("p1", "s1")));
    }
}
