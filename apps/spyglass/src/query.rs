use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::filters::{self, FilterMap};
use crate::peer::RoomId;
use crate::protocol::Identity;
use crate::registry::{Connection, Registry};

/// A connection counts toward a filtered result only when it is a session
/// and its bag passes; agents and bagless sessions never match.
async fn session_matches(conn: &Connection, filter: &FilterMap) -> bool {
    if conn.identity != Identity::Session {
        return false;
    }
    match conn.session_info().await {
        Some(bag) => filters::matches(&bag, filter),
        None => false,
    }
}

/// projectKey -> live sessionIds across every room. Without a filter every
/// parseable room contributes, regardless of role composition.
pub async fn sessions_by_project(
    registry: &Registry,
    filter: Option<&FilterMap>,
) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for room_id in registry.room_ids() {
        let Some((project_key, session_id)) = room_id.split() else {
            continue;
        };
        let (project_key, session_id) = (project_key.to_string(), session_id.to_string());
        let include = match filter {
            None => true,
            Some(filter) => room_has_match(registry, &room_id, filter).await,
        };
        let sessions = out.entry(project_key).or_default();
        if include {
            sessions.push(session_id);
        }
    }
    out
}

async fn room_has_match(registry: &Registry, room_id: &RoomId, filter: &FilterMap) -> bool {
    for member in registry.members(room_id) {
        if session_matches(&member, filter).await {
            return true;
        }
    }
    false
}

/// Live sessionIds for one project, optionally narrowed to one session.
/// Callers answering "is this session live" take the first element.
pub async fn sessions_for_project(
    registry: &Registry,
    project_key: &str,
    session_id: Option<&str>,
    filter: Option<&FilterMap>,
) -> Vec<String> {
    let mut out = Vec::new();
    for room_id in registry.room_ids() {
        let Some((room_project, room_session)) = room_id.split() else {
            continue;
        };
        if room_project != project_key {
            continue;
        }
        if let Some(wanted) = session_id {
            if wanted != room_session {
                continue;
            }
        }
        let include = match filter {
            None => true,
            Some(filter) => room_has_match(registry, &room_id, filter).await,
        };
        if include {
            out.push(room_session.to_string());
        }
    }
    out
}

/// projectKey -> full sessionInfo bags of live session connections,
/// deduplicated by owning sessionId so a multi-tab session contributes one
/// entry.
pub async fn live_sessions_by_project(
    registry: &Registry,
    filter: Option<&FilterMap>,
) -> HashMap<String, Vec<Value>> {
    let mut out: HashMap<String, Vec<Value>> = HashMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for room_id in registry.room_ids() {
        let Some((project_key, _)) = room_id.split() else {
            continue;
        };
        let project_key = project_key.to_string();
        for member in registry.members(&room_id) {
            if member.identity != Identity::Session {
                continue;
            }
            let Some(bag) = member.session_info().await else {
                continue;
            };
            let sessions = out.entry(project_key.clone()).or_default();
            if let Some(filter) = filter {
                if !filters::matches(&bag, filter) {
                    continue;
                }
            }
            if seen.insert((project_key.clone(), member.peer.session_id.clone())) {
                sessions.push(Value::Object(bag));
            }
        }
    }
    out
}

/// Live sessionInfo bags for one project, optionally narrowed to one
/// session, deduplicated by sessionId.
pub async fn live_sessions_for_project(
    registry: &Registry,
    project_key: &str,
    session_id: Option<&str>,
    filter: Option<&FilterMap>,
) -> Vec<Value> {
    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for room_id in registry.room_ids() {
        let Some((room_project, room_session)) = room_id.split() else {
            continue;
        };
        if room_project != project_key {
            continue;
        }
        if let Some(wanted) = session_id {
            if wanted != room_session {
                continue;
            }
        }
        for member in registry.members(&room_id) {
            if member.identity != Identity::Session {
                continue;
            }
            let Some(bag) = member.session_info().await else {
                continue;
            };
            if let Some(filter) = filter {
                if !filters::matches(&bag, filter) {
                    continue;
                }
            }
            if seen.insert(member.peer.session_id.clone()) {
                out.push(Value::Object(bag));
            }
        }
    }
    out
}

/// Union of leaf values matching the autocomplete query across one
/// project's session connections, deduplicated in discovery order.
pub async fn autocomplete(
    registry: &Registry,
    project_key: &str,
    query: &HashMap<String, String>,
) -> Vec<String> {
    if query.is_empty() {
        return Vec::new();
    }
    let mut results = Vec::new();
    for room_id in registry.room_ids() {
        let Some((room_project, _)) = room_id.split() else {
            continue;
        };
        if room_project != project_key {
            continue;
        }
        for member in registry.members(&room_id) {
            if member.identity != Identity::Session {
                continue;
            }
            if let Some(bag) = member.session_info().await {
                results.extend(filters::extract_values(&bag, query));
            }
        }
    }
    filters::unique(results)
}
