use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::peer::{PeerAddr, RoomId};
use crate::protocol::{Frame, Identity};

/// One live transport link and the metadata attached at admission.
pub struct Connection {
    pub id: String,
    pub identity: Identity,
    pub peer: PeerAddr,
    pub room_id: RoomId,
    pub agent_info: Option<Map<String, Value>>,
    pub connected_at: DateTime<Utc>,
    session_info: RwLock<Option<Map<String, Value>>>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Connection {
    pub fn new(
        id: String,
        identity: Identity,
        peer: PeerAddr,
        session_info: Option<Map<String, Value>>,
        agent_info: Option<Map<String, Value>>,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Self> {
        let room_id = peer.room_id();
        Arc::new(Self {
            id,
            identity,
            peer,
            room_id,
            agent_info,
            connected_at: Utc::now(),
            session_info: RwLock::new(session_info),
            tx,
        })
    }

    /// Best-effort delivery. A receiver that already went away is a silent
    /// no-op, never an error surfaced to the sender.
    pub fn send(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    pub async fn session_info(&self) -> Option<Map<String, Value>> {
        self.session_info.read().await.clone()
    }

    /// Sender-side merge: initializes the bag when the session connected
    /// without one.
    pub async fn merge_session_info(&self, data: &Value, tab_id: Option<&str>) {
        let mut guard = self.session_info.write().await;
        apply_update(guard.get_or_insert_with(Map::new), data, tab_id);
    }

    /// Sibling replication: last write wins per attribute. Skipped for
    /// connections that never carried a bag.
    pub async fn replicate_session_info(&self, data: &Value, tab_id: Option<&str>) {
        let mut guard = self.session_info.write().await;
        if let Some(info) = guard.as_mut() {
            apply_update(info, data, tab_id);
        }
    }
}

fn apply_update(info: &mut Map<String, Value>, data: &Value, tab_id: Option<&str>) {
    if let Value::Object(fields) = data {
        for (key, value) in fields {
            info.insert(key.clone(), value.clone());
        }
    }
    if let Some(tab) = tab_id {
        info.insert("tabId".to_string(), Value::String(tab.to_string()));
    }
}

/// Presence counts for one room. `ABSENT` distinguishes a room the registry
/// does not know about from one that exists but has none of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub sessions: i64,
    pub agents: i64,
}

impl Presence {
    pub const ABSENT: Presence = Presence {
        sessions: -1,
        agents: -1,
    };
}

/// In-process room membership directory: who is in which room, and how to
/// reach them. The protocol and query layers depend on this, never on
/// ambient global state.
pub struct Registry {
    rooms: DashMap<RoomId, DashMap<String, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
        })
    }

    pub fn join(&self, conn: Arc<Connection>) {
        let members = self.rooms.entry(conn.room_id.clone()).or_default();
        members.insert(conn.id.clone(), conn);
    }

    /// Rooms exist only through their members; the last one out removes the
    /// room itself.
    pub fn leave(&self, room_id: &RoomId, connection_id: &str) {
        let mut drop_room = false;
        if let Some(members) = self.rooms.get(room_id) {
            members.remove(connection_id);
            drop_room = members.is_empty();
        }
        if drop_room {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<Arc<Connection>> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn presence(&self, room_id: &RoomId) -> Presence {
        let Some(members) = self.rooms.get(room_id) else {
            return Presence::ABSENT;
        };
        let mut sessions = 0;
        let mut agents = 0;
        for entry in members.iter() {
            match entry.value().identity {
                Identity::Session => sessions += 1,
                Identity::Agent => agents += 1,
            }
        }
        Presence { sessions, agents }
    }

    pub fn broadcast(&self, room_id: &RoomId, except: &str, frame: &Frame) {
        if let Some(members) = self.rooms.get(room_id) {
            for entry in members.iter() {
                if entry.key() != except {
                    entry.value().send(frame.clone());
                }
            }
        }
    }

    /// Observational room sweep, logged on a fixed interval. No behavioral
    /// effect.
    pub fn spawn_diagnostics(self: &Arc<Self>, every: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let rooms = registry.room_ids();
                let parseable = rooms.iter().filter(|room| room.split().is_some()).count();
                info!(rooms = rooms.len(), parseable, "room sweep");
            }
        });
    }
}
