//! Newline-delimited JSON envelope exchanged with the controller.
//!
//! Every frame is a single JSON object `{"type", "data", "timestamp"}`
//! followed by `\n`. Inbound frames are matched on their type string and
//! their payload is decoded into one of the [`InboundMessage`] variants.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use super::ProtocolError;
use crate::kiosk::apps::{AllowedApp, AllowedAppsPayload};

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "object_or_null")]
    pub data: Map<String, Value>,
    /// Seconds since the Unix epoch, fractional
    #[serde(default)]
    pub timestamp: f64,
}

fn object_or_null<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    pub fn new(kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: epoch_seconds(Utc::now()),
        }
    }

    /// Serialize as one frame, trailing newline included
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parse one frame; surrounding whitespace and the newline are ignored
    pub fn decode(line: &[u8]) -> Result<Self, ProtocolError> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Ok(serde_json::from_slice(trimmed)?)
    }
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Longest session or single extension accepted from the controller
pub const MAX_SESSION_HOURS: f64 = 24.0 * 366.0;

/// Message types the agent understands from the controller
pub const INBOUND_TYPES: [&str; 10] = [
    "start_session",
    "end_session",
    "extend_session",
    "pause_session",
    "resume_session",
    "lock_computer",
    "shutdown_computer",
    "maintenance_mode",
    "computer_removed",
    "allowed_apps_update",
];

/// Typed controller command
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StartSession { session_id: String, duration_hours: f64 },
    EndSession { force_end: bool },
    /// Non-positive minutes are accepted here and ignored by the coordinator
    ExtendSession { minutes: f64 },
    PauseSession,
    ResumeSession,
    LockComputer,
    ShutdownComputer,
    MaintenanceMode,
    ComputerRemoved,
    AllowedAppsUpdate { apps: Vec<AllowedApp> },
}

impl InboundMessage {
    /// Interpret an envelope. Unknown types yield `Ok(None)`.
    pub fn from_message(message: &Message) -> Result<Option<Self>, ProtocolError> {
        let data = &message.data;
        let parsed = match message.kind.as_str() {
            "start_session" => {
                let session_id = session_id_field(data)?;
                let duration_hours = number_field(data, "duration")?;
                if !(duration_hours > 0.0 && duration_hours <= MAX_SESSION_HOURS) {
                    return Err(ProtocolError::InvalidField {
                        field: "duration",
                        reason: format!(
                            "expected between 0 and {MAX_SESSION_HOURS} hours, got {duration_hours}"
                        ),
                    });
                }
                Self::StartSession {
                    session_id,
                    duration_hours,
                }
            }
            "end_session" => Self::EndSession {
                force_end: data
                    .get("force_end")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            "extend_session" => {
                let minutes = match data.get("minutes") {
                    None | Some(Value::Null) => 0.0,
                    Some(_) => number_field(data, "minutes")?,
                };
                if !(minutes.abs() <= MAX_SESSION_HOURS * 60.0) {
                    return Err(ProtocolError::InvalidField {
                        field: "minutes",
                        reason: format!("{minutes} is out of range"),
                    });
                }
                Self::ExtendSession { minutes }
            }
            "pause_session" => Self::PauseSession,
            "resume_session" => Self::ResumeSession,
            "lock_computer" => Self::LockComputer,
            "shutdown_computer" => Self::ShutdownComputer,
            "maintenance_mode" => Self::MaintenanceMode,
            "computer_removed" => Self::ComputerRemoved,
            "allowed_apps_update" => {
                let raw = data
                    .get("allowed_apps")
                    .cloned()
                    .ok_or(ProtocolError::MissingField("allowed_apps"))?;
                let payload: AllowedAppsPayload =
                    serde_json::from_value(raw).map_err(|e| ProtocolError::InvalidField {
                        field: "allowed_apps",
                        reason: e.to_string(),
                    })?;
                Self::AllowedAppsUpdate {
                    apps: payload.into_apps(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

fn session_id_field(data: &Map<String, Value>) -> Result<String, ProtocolError> {
    match data.get("session_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        Some(Value::Null) | None => Err(ProtocolError::MissingField("session_id")),
        Some(other) => Err(ProtocolError::InvalidField {
            field: "session_id",
            reason: format!("unexpected value {other}"),
        }),
    }
}

fn number_field(data: &Map<String, Value>, field: &'static str) -> Result<f64, ProtocolError> {
    let value = data.get(field).ok_or(ProtocolError::MissingField(field))?;
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| ProtocolError::InvalidField {
            field,
            reason: format!("{n} is not representable"),
        }),
        // Some controllers send numbers as strings
        Value::String(s) => s.trim().parse().map_err(|_| ProtocolError::InvalidField {
            field,
            reason: format!("{s:?} is not a number"),
        }),
        Value::Null => Err(ProtocolError::MissingField(field)),
        other => Err(ProtocolError::InvalidField {
            field,
            reason: format!("unexpected value {other}"),
        }),
    }
}

/// Messages the agent originates
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Heartbeat,
    StatusUpdate { online: bool },
    ClientReady {
        end_time: Option<DateTime<Utc>>,
        is_paused: bool,
    },
    SessionEnd { session_id: String, duration_hours: f64 },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::StatusUpdate { .. } => "status_update",
            Self::ClientReady { .. } => "client_ready",
            Self::SessionEnd { .. } => "session_end",
        }
    }

    pub fn into_message(self) -> Message {
        let data = match &self {
            Self::Heartbeat => Map::new(),
            Self::StatusUpdate { online } => object(json!({
                "status": if *online { "online" } else { "offline" },
            })),
            Self::ClientReady {
                end_time,
                is_paused,
            } => object(json!({
                "end_time": end_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
                "is_paused": is_paused,
            })),
            Self::SessionEnd {
                session_id,
                duration_hours,
            } => object(json!({
                "session_id": session_id,
                "duration": duration_hours,
                "amount": Value::Null,
            })),
        };
        Message::new(self.kind(), data)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
