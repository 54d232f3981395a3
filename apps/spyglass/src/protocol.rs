use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Role of a connection inside a room: the recorded end user, or a support
/// operator watching them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Session,
    Agent,
}

impl Identity {
    /// Strict parse of the connect-time `identity` parameter. Anything else
    /// is refused at the boundary rather than defaulted.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "session" => Some(Identity::Session),
            "agent" => Some(Identity::Agent),
            _ => None,
        }
    }

    pub fn is_session(self) -> bool {
        matches!(self, Identity::Session)
    }
}

/// Generate a connection id for a freshly accepted socket.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

pub mod events {
    //! The closed set of protocol event names. Anything outside it is an
    //! application-defined event and goes through the generic relay.

    pub const ALREADY_CONNECTED: &str = "already_connected";
    pub const AGENTS_CONNECTED: &str = "agents_connected";
    pub const SESSION_RECONNECTED: &str = "session_reconnected";
    pub const NO_SESSIONS: &str = "no_sessions";
    pub const NEW_AGENT: &str = "new_agent";
    pub const AGENT_DISCONNECT: &str = "agent_disconnect";
    pub const NO_AGENTS: &str = "no_agents";
    pub const UPDATE_EVENT: &str = "update_event";
    pub const ERROR: &str = "error";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const CONNECT_FAILED: &str = "connect_failed";

    /// Inbound names owned by a dedicated handler; the catch-all relay must
    /// not re-route these.
    pub const RESERVED: &[&str] = &[UPDATE_EVENT, ERROR, CONNECT_ERROR, CONNECT_FAILED];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }
}

/// Agent actions that get an audit log line in addition to normal relay.
/// Names are the ones assist clients already send.
pub const AUDITED_EVENTS: &[&str] = &[
    "s_call_started",
    "s_call_ended",
    "s_control_started",
    "s_control_ended",
    "s_recording_started",
    "s_recording_ended",
];

/// One wire message. Server-to-client frames carry `from` when an agent
/// event is relayed to a single session connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn notice(event: &str) -> Self {
        Self {
            event: event.to_string(),
            from: None,
            payload: Value::Null,
        }
    }

    pub fn with_payload(event: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            from: None,
            payload,
        }
    }

    pub fn relayed(event: &str, from: &str, payload: Value) -> Self {
        Self {
            event: event.to_string(),
            from: Some(from.to_string()),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// The legacy `{meta, data}` envelope. Session clients that predate it send
/// bare payloads, which get wrapped on their way through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: Meta,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Pass an already-enveloped payload through untouched; wrap anything
    /// else with the sender's tab id.
    pub fn ensure(payload: Value, sender_tab: &str) -> Self {
        if payload.get("meta").is_some() {
            if let Ok(envelope) = serde_json::from_value::<Envelope>(payload.clone()) {
                return envelope;
            }
        }
        Envelope {
            meta: Meta {
                tab_id: Some(sender_tab.to_string()),
                version: 1,
            },
            data: payload,
        }
    }
}

/// Tab id named inside a raw payload's envelope, if any. Used to target
/// agent events at one tab of a multi-tab session.
pub fn meta_tab_id(payload: &Value) -> Option<&str> {
    payload.get("meta")?.get("tabId")?.as_str()
}

/// Parse a connect-time JSON bag (`sessionInfo` / `agentInfo` query
/// parameters). Only a JSON object qualifies.
pub fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
