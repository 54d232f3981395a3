use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::peer::{PeerAddr, RoomId};
use crate::protocol::{self, events, Envelope, Frame, Identity, AUDITED_EVENTS};
use crate::registry::{Connection, Presence, Registry};

/// Everything a transport-level connect carries into admission. `agent_info`
/// stays raw here; parsing it is part of the admission step.
pub struct ConnectRequest {
    pub connection_id: String,
    pub identity: Identity,
    pub peer_id: String,
    pub session_info: Option<Map<String, Value>>,
    pub agent_info: Option<String>,
    pub tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Another connection under the same project already owns this tab.
    DuplicateTab,
    /// `agentInfo` was present but not a JSON object.
    BadAgentInfo,
}

pub enum Admission {
    /// The connection joined its room and may exchange events.
    Admitted(Arc<Connection>),
    /// Notified and must be closed by the transport; never joined a room.
    Refused(Refusal),
    /// Unparseable peer id: kept out of every room and every presence
    /// count. A defensive no-op path, not an error.
    Unrouted,
}

/// Admit a new connection: validate, dedupe, emit presence notifications,
/// join the room.
pub fn admit(registry: &Registry, request: ConnectRequest) -> Admission {
    let ConnectRequest {
        connection_id,
        identity,
        peer_id,
        session_info,
        agent_info,
        tx,
    } = request;

    let peer = match PeerAddr::parse(&peer_id) {
        Ok(peer) => peer,
        Err(err) => {
            debug!(%connection_id, %err, "connect with unroutable peer id");
            return Admission::Unrouted;
        }
    };
    let room_id = peer.room_id();
    let presence = registry.presence(&room_id);

    // Duplicate-tab guard. Check-then-act: two racing connects for the same
    // tab can both pass the scan; best effort, not hard exclusivity.
    if identity.is_session() && presence.sessions > 0 {
        if find_tab(registry, &peer.project_key, &peer.tab_id).is_some() {
            debug!(%connection_id, tab = %peer.tab_id, "tab already connected, refusing");
            let _ = tx.send(Frame::notice(events::ALREADY_CONNECTED));
            return Admission::Refused(Refusal::DuplicateTab);
        }
    }

    let agent_info = match (identity, agent_info) {
        (Identity::Agent, Some(raw)) => match protocol::parse_object(&raw) {
            Some(info) => Some(info),
            None => {
                warn!(%connection_id, "refusing connect with malformed agentInfo");
                let _ = tx.send(Frame::with_payload(
                    events::ERROR,
                    Value::String("malformed agentInfo".to_string()),
                ));
                return Admission::Refused(Refusal::BadAgentInfo);
            }
        },
        _ => None,
    };

    let conn = Connection::new(connection_id, identity, peer, session_info, agent_info, tx);

    match identity {
        Identity::Session => {
            if presence.agents > 0 {
                let agents: Vec<String> = registry
                    .members(&room_id)
                    .iter()
                    .filter(|member| member.identity == Identity::Agent)
                    .map(|member| member.id.clone())
                    .collect();
                conn.send(Frame::with_payload(events::AGENTS_CONNECTED, json!(agents)));
                registry.broadcast(
                    &room_id,
                    &conn.id,
                    &Frame::with_payload(events::SESSION_RECONNECTED, json!(conn.id)),
                );
            }
        }
        Identity::Agent => {
            if presence.sessions <= 0 {
                conn.send(Frame::notice(events::NO_SESSIONS));
            }
        }
    }

    registry.join(conn.clone());
    debug!(id = %conn.id, room = %conn.room_id, identity = ?conn.identity, "joined room");

    if conn.identity == Identity::Agent {
        let info = conn
            .agent_info
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Null);
        registry.broadcast(
            &room_id,
            &conn.id,
            &Frame::with_payload(events::NEW_AGENT, json!({"id": conn.id, "agentInfo": info})),
        );
    }

    Admission::Admitted(conn)
}

/// Retire a disconnected connection and tell the room what changed.
pub fn retire(registry: &Registry, conn: &Connection) {
    registry.leave(&conn.room_id, &conn.id);
    debug!(
        id = %conn.id,
        room = %conn.room_id,
        connected_for = ?(chrono::Utc::now() - conn.connected_at),
        "left room"
    );

    if conn.identity == Identity::Agent {
        registry.broadcast(
            &conn.room_id,
            &conn.id,
            &Frame::with_payload(events::AGENT_DISCONNECT, json!(conn.id)),
        );
    }

    let presence = registry.presence(&conn.room_id);
    if presence == Presence::ABSENT {
        debug!(room = %conn.room_id, "room emptied");
        return;
    }
    if presence.sessions == 0 {
        registry.broadcast(&conn.room_id, &conn.id, &Frame::notice(events::NO_SESSIONS));
    }
    if presence.agents == 0 {
        registry.broadcast(&conn.room_id, &conn.id, &Frame::notice(events::NO_AGENTS));
    }
}

/// Session metadata update: merge into the sender's bag, fan out to the
/// room, then converge sibling tabs' copies. Last write wins per attribute;
/// convergence is best effort, not atomic.
pub async fn handle_update(registry: &Registry, sender: &Arc<Connection>, payload: Value) {
    if !sender.identity.is_session() {
        debug!(id = %sender.id, "dropping update event from non-session");
        return;
    }

    let envelope = Envelope::ensure(payload, &sender.peer.tab_id);
    let tab_id = envelope.meta.tab_id.clone();
    sender
        .merge_session_info(&envelope.data, tab_id.as_deref())
        .await;

    let frame = Frame::with_payload(
        events::UPDATE_EVENT,
        serde_json::to_value(&envelope).unwrap_or(Value::Null),
    );
    registry.broadcast(&sender.room_id, &sender.id, &frame);

    for member in registry.members(&sender.room_id) {
        if member.id != sender.id && member.identity.is_session() {
            member
                .replicate_session_info(&envelope.data, tab_id.as_deref())
                .await;
        }
    }
}

/// Catch-all relay for application-defined events. Sessions fan out to the
/// whole room; agents reach exactly one session connection.
pub fn relay(registry: &Registry, sender: &Arc<Connection>, event: &str, payload: Value) {
    if events::is_reserved(event) {
        debug!(id = %sender.id, event, "reserved event reached the relay, ignoring");
        return;
    }

    match sender.identity {
        Identity::Session => {
            let envelope = Envelope::ensure(payload, &sender.peer.tab_id);
            let frame = Frame::with_payload(
                event,
                serde_json::to_value(&envelope).unwrap_or(Value::Null),
            );
            registry.broadcast(&sender.room_id, &sender.id, &frame);
        }
        Identity::Agent => {
            audit(sender, event, &payload);
            let target_tab = protocol::meta_tab_id(&payload).map(str::to_string);
            match find_session(registry, &sender.room_id, target_tab.as_deref()) {
                Some(session) => session.send(Frame::relayed(event, &sender.id, payload)),
                None => sender.send(Frame::notice(events::NO_SESSIONS)),
            }
        }
    }
}

/// Scan every room under the project for a connection already on this tab.
fn find_tab(registry: &Registry, project_key: &str, tab_id: &str) -> Option<Arc<Connection>> {
    for room_id in registry.room_ids() {
        let Some((room_project, _)) = room_id.split() else {
            continue;
        };
        if room_project != project_key {
            continue;
        }
        for member in registry.members(&room_id) {
            if member.peer.tab_id == tab_id {
                return Some(member);
            }
        }
    }
    None
}

/// The session connection an agent event should land on: the tab named in
/// the envelope when present, otherwise the first session found.
fn find_session(
    registry: &Registry,
    room_id: &RoomId,
    tab_id: Option<&str>,
) -> Option<Arc<Connection>> {
    registry.members(room_id).into_iter().find(|member| {
        member.identity.is_session() && tab_id.map_or(true, |tab| member.peer.tab_id == tab)
    })
}

fn audit(sender: &Connection, event: &str, payload: &Value) {
    if AUDITED_EVENTS.contains(&event) {
        info!(event, agent = %payload, session = %sender.peer.session_id, "assist activity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn request(peer_id: &str, identity: Identity) -> (ConnectRequest, UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_info = identity.is_session().then(Map::new);
        (
            ConnectRequest {
                connection_id: protocol::generate_connection_id(),
                identity,
                peer_id: peer_id.to_string(),
                session_info,
                agent_info: None,
                tx,
            },
            rx,
        )
    }

    fn admitted(registry: &Registry, peer_id: &str, identity: Identity) -> (Arc<Connection>, UnboundedReceiver<Frame>) {
        let (req, rx) = request(peer_id, identity);
        match admit(registry, req) {
            Admission::Admitted(conn) => (conn, rx),
            _ => panic!("expected admission for {peer_id}"),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test_guard::timeout]
    fn duplicate_tab_is_refused() {
        let registry = Registry::new();
        let (first, _rx) = admitted(&registry, "p1:s1:t1", Identity::Session);

        let (req, mut rx) = request("p1:s1:t1", Identity::Session);
        assert!(matches!(
            admit(&registry, req),
            Admission::Refused(Refusal::DuplicateTab)
        ));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::ALREADY_CONNECTED);
        assert_eq!(registry.members(&first.room_id).len(), 1);

        // A different tab of the same session lives alongside the first.
        let (second, _rx2) = admitted(&registry, "p1:s1:t2", Identity::Session);
        assert_eq!(registry.members(&second.room_id).len(), 2);
    }

    #[test_guard::timeout]
    fn duplicate_tab_scan_covers_sibling_rooms() {
        let registry = Registry::new();
        let (_conn, _rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (_conn2, _rx2) = admitted(&registry, "p1:s2:t9", Identity::Session);

        // Same project, different session, colliding tab.
        let (req, _rx3) = request("p1:s2:t1", Identity::Session);
        assert!(matches!(
            admit(&registry, req),
            Admission::Refused(Refusal::DuplicateTab)
        ));

        // Other projects are out of scope for the scan.
        let (req, _rx4) = request("p2:s1:t1", Identity::Session);
        assert!(matches!(admit(&registry, req), Admission::Admitted(_)));
    }

    #[test_guard::timeout]
    fn unroutable_peer_joins_nothing() {
        let registry = Registry::new();
        let (req, _rx) = request("orphan", Identity::Session);
        assert!(matches!(admit(&registry, req), Admission::Unrouted));
        assert!(registry.room_ids().is_empty());
    }

    #[test_guard::timeout]
    fn malformed_agent_info_is_refused() {
        let registry = Registry::new();
        let (mut req, mut rx) = request("p1:s1:a1", Identity::Agent);
        req.agent_info = Some("not json".to_string());
        assert!(matches!(
            admit(&registry, req),
            Admission::Refused(Refusal::BadAgentInfo)
        ));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::ERROR);
        assert!(registry.room_ids().is_empty());
    }

    #[test_guard::timeout]
    fn lone_agent_is_told_about_missing_sessions() {
        let registry = Registry::new();
        let (_agent, mut rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::NO_SESSIONS);
    }

    #[test_guard::timeout]
    fn first_agent_emits_exactly_one_new_agent() {
        let registry = Registry::new();
        let (session, mut session_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);

        let (mut req, mut agent_rx) = request("p1:s1:a1", Identity::Agent);
        req.agent_info = Some(r#"{"id": "agent-7", "name": "Dana"}"#.to_string());
        let Admission::Admitted(agent) = admit(&registry, req) else {
            panic!("agent not admitted");
        };

        let session_frames = drain(&mut session_rx);
        assert_eq!(session_frames.len(), 1);
        assert_eq!(session_frames[0].event, events::NEW_AGENT);
        assert_eq!(session_frames[0].payload["id"], json!(agent.id));
        assert_eq!(session_frames[0].payload["agentInfo"]["name"], json!("Dana"));
        assert!(drain(&mut agent_rx).is_empty());

        // Dropping the last agent leaves one no_agents and nothing else.
        retire(&registry, &agent);
        let after = drain(&mut session_rx);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].event, events::AGENT_DISCONNECT);
        assert_eq!(after[1].event, events::NO_AGENTS);
        assert_eq!(registry.presence(&session.room_id), Presence { sessions: 1, agents: 0 });
    }

    #[test_guard::timeout]
    fn reconnecting_session_learns_about_agents() {
        let registry = Registry::new();
        let (_session, mut s_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut s_rx);
        drain(&mut a_rx);

        let (second, mut second_rx) = admitted(&registry, "p1:s1:t2", Identity::Session);
        let own = drain(&mut second_rx);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].event, events::AGENTS_CONNECTED);
        assert_eq!(own[0].payload, json!([agent.id]));

        let agent_frames = drain(&mut a_rx);
        assert_eq!(agent_frames.len(), 1);
        assert_eq!(agent_frames[0].event, events::SESSION_RECONNECTED);
        assert_eq!(agent_frames[0].payload, json!(second.id));
    }

    #[test_guard::timeout]
    fn last_session_out_emits_no_sessions_only() {
        let registry = Registry::new();
        let (session, mut s_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (_agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut s_rx);
        drain(&mut a_rx);

        retire(&registry, &session);
        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::NO_SESSIONS);
    }

    #[test_guard::tokio_timeout]
    async fn update_event_is_rewrapped_and_replicated() {
        let registry = Registry::new();
        let (sender, mut sender_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (sibling, mut sibling_rx) = admitted(&registry, "p1:s1:t2", Identity::Session);
        let (_agent, mut agent_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut sender_rx);
        drain(&mut sibling_rx);
        drain(&mut agent_rx);

        handle_update(&registry, &sender, json!({"pageTitle": "checkout"})).await;

        let relayed = drain(&mut agent_rx);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].event, events::UPDATE_EVENT);
        assert_eq!(relayed[0].payload["meta"]["tabId"], json!("t1"));
        assert_eq!(relayed[0].payload["meta"]["version"], json!(1));
        assert_eq!(relayed[0].payload["data"]["pageTitle"], json!("checkout"));

        let sender_bag = sender.session_info().await.unwrap();
        assert_eq!(sender_bag.get("pageTitle"), Some(&json!("checkout")));
        let sibling_bag = sibling.session_info().await.unwrap();
        assert_eq!(sibling_bag.get("pageTitle"), Some(&json!("checkout")));
        assert_eq!(sibling_bag.get("tabId"), Some(&json!("t1")));
    }

    #[test_guard::tokio_timeout]
    async fn update_events_from_agents_are_dropped() {
        let registry = Registry::new();
        let (session, mut s_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut s_rx);
        drain(&mut a_rx);

        handle_update(&registry, &agent, json!({"spoofed": true})).await;
        assert!(drain(&mut s_rx).is_empty());
        assert!(session.session_info().await.unwrap().is_empty());
    }

    #[test_guard::timeout]
    fn session_events_fan_out_to_the_room() {
        let registry = Registry::new();
        let (session, mut s_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (_agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        let (_other, mut o_rx) = admitted(&registry, "p1:s1:a2", Identity::Agent);
        drain(&mut s_rx);
        drain(&mut a_rx);
        drain(&mut o_rx);

        relay(&registry, &session, "mouse_move", json!({"x": 10}));
        for rx in [&mut a_rx, &mut o_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].event, "mouse_move");
            assert_eq!(frames[0].payload["meta"]["tabId"], json!("t1"));
            assert_eq!(frames[0].payload["data"]["x"], json!(10));
        }
        assert!(drain(&mut s_rx).is_empty());
    }

    #[test_guard::timeout]
    fn agent_events_reach_only_the_named_tab() {
        let registry = Registry::new();
        let (_t1, mut t1_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (_t2, mut t2_rx) = admitted(&registry, "p1:s1:t2", Identity::Session);
        let (agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut t1_rx);
        drain(&mut t2_rx);
        drain(&mut a_rx);

        let payload = json!({"meta": {"tabId": "t2"}, "data": {"cmd": "scroll"}});
        relay(&registry, &agent, "request_control", payload.clone());

        assert!(drain(&mut t1_rx).is_empty());
        let frames = drain(&mut t2_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "request_control");
        assert_eq!(frames[0].from.as_deref(), Some(agent.id.as_str()));
        assert_eq!(frames[0].payload, payload);
    }

    #[test_guard::timeout]
    fn agent_without_target_session_gets_no_sessions() {
        let registry = Registry::new();
        let (agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut a_rx);

        relay(&registry, &agent, "request_control", json!({}));
        let frames = drain(&mut a_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, events::NO_SESSIONS);
    }

    #[test_guard::timeout]
    fn reserved_events_are_not_relayed() {
        let registry = Registry::new();
        let (session, mut s_rx) = admitted(&registry, "p1:s1:t1", Identity::Session);
        let (_agent, mut a_rx) = admitted(&registry, "p1:s1:a1", Identity::Agent);
        drain(&mut s_rx);
        drain(&mut a_rx);

        relay(&registry, &session, events::UPDATE_EVENT, json!({}));
        assert!(drain(&mut a_rx).is_empty());
    }
}
