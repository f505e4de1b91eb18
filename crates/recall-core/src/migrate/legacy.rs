//! Parsers for legacy flat-file coordination state.
//!
//! Three historical layouts are recognised:
//!
//! | format              | shape                                                        |
//! |---------------------|--------------------------------------------------------------|
//! | agent registry (v1) | `{"agents": {"<agent id>": {...}}}`                          |
//! | state snapshot (v2) | `{"version": "2", "agent_states": [...], "coordination_log": [...], "system": {...}}` |
//! | coordination log    | `.jsonl`, one legacy event per line                          |
//!
//! Records are mapped one at a time from `serde_json::Value`, so a bad
//! record never hides its well-formed neighbours.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use recall_state::{AgentState, AgentStatus, CoordinationEvent, EventType, SystemState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Session assigned to registry entries, which predate sessions.
pub const LEGACY_SESSION: &str = "legacy";
/// Agent type used when a legacy event does not name one.
pub const UNKNOWN_AGENT_TYPE: &str = "unknown";

const EVENT_ID_LEN: usize = 32;
const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyFormat {
    AgentRegistryV1,
    StateSnapshotV2,
    CoordinationLog,
}

impl LegacyFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyFormat::AgentRegistryV1 => "agent_registry_v1",
            LegacyFormat::StateSnapshotV2 => "state_snapshot_v2",
            LegacyFormat::CoordinationLog => "coordination_log",
        }
    }

    /// Recognise a whole-file JSON document.
    pub fn detect(document: &Value) -> Option<Self> {
        let object = document.as_object()?;
        if object.get("agents").is_some_and(Value::is_object) {
            return Some(LegacyFormat::AgentRegistryV1);
        }
        let version_two = match object.get("version") {
            Some(Value::String(v)) => v.trim() == "2" || v.trim().starts_with("2."),
            Some(Value::Number(n)) => n.as_f64() == Some(2.0),
            _ => false,
        };
        if version_two
            || object.contains_key("agent_states")
            || object.contains_key("coordination_log")
        {
            return Some(LegacyFormat::StateSnapshotV2);
        }
        None
    }

    /// Line-oriented files are recognised by extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| ext.eq_ignore_ascii_case("jsonl"))
            .map(|_| LegacyFormat::CoordinationLog)
    }
}

impl fmt::Display for LegacyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A legacy record mapped into the current schema.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedRecord {
    Agent(AgentState),
    Event(CoordinationEvent),
    System(SystemState),
}

/// One source record: where it came from and what it mapped to.
#[derive(Debug, Clone)]
pub struct LegacyRecord {
    /// Location inside the source, e.g. `agents.planner` or `line 3`.
    pub label: String,
    pub mapped: Result<MappedRecord, String>,
}

impl LegacyRecord {
    fn new(label: impl Into<String>, mapped: Result<MappedRecord, String>) -> Self {
        Self {
            label: label.into(),
            mapped,
        }
    }
}

/// Map every record of a whole-file JSON document of `format`.
pub fn parse_document(format: LegacyFormat, document: &Value, now: DateTime<Utc>) -> Vec<LegacyRecord> {
    match format {
        LegacyFormat::AgentRegistryV1 => parse_registry(document, now),
        LegacyFormat::StateSnapshotV2 => parse_snapshot(document, now),
        LegacyFormat::CoordinationLog => Vec::new(),
    }
}

/// Map a JSON Lines coordination log. Blank lines are skipped.
pub fn parse_event_lines(contents: &str) -> Vec<LegacyRecord> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let label = format!("line {}", index + 1);
            let mapped = serde_json::from_str::<Value>(line)
                .map_err(|e| format!("invalid JSON: {e}"))
                .and_then(|value| map_event(&value))
                .map(MappedRecord::Event);
            LegacyRecord::new(label, mapped)
        })
        .collect()
}

fn parse_registry(document: &Value, now: DateTime<Utc>) -> Vec<LegacyRecord> {
    let Some(agents) = document.get("agents").and_then(Value::as_object) else {
        return Vec::new();
    };
    agents
        .iter()
        .map(|(agent_id, entry)| {
            let mapped = map_agent(entry, Some(agent_id), Some(LEGACY_SESSION), now)
                .map(MappedRecord::Agent);
            LegacyRecord::new(format!("agents.{agent_id}"), mapped)
        })
        .collect()
}

fn parse_snapshot(document: &Value, now: DateTime<Utc>) -> Vec<LegacyRecord> {
    let mut records = Vec::new();

    for (index, entry) in array_items(document, "agent_states") {
        let mapped = map_agent(entry, None, None, now).map(MappedRecord::Agent);
        records.push(LegacyRecord::new(format!("agent_states[{index}]"), mapped));
    }
    for (index, entry) in array_items(document, "coordination_log") {
        let mapped = map_event(entry).map(MappedRecord::Event);
        records.push(LegacyRecord::new(format!("coordination_log[{index}]"), mapped));
    }
    if let Some(system) = document.get("system").filter(|v| !v.is_null()) {
        let mapped = map_system(system, now).map(MappedRecord::System);
        records.push(LegacyRecord::new("system", mapped));
    }
    records
}

fn array_items<'a>(document: &'a Value, field: &str) -> impl Iterator<Item = (usize, &'a Value)> {
    document
        .get(field)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
}

// ---------------------------------------------------------------------------
// Record mapping
// ---------------------------------------------------------------------------

/// Map a legacy agent entry. Registry entries supply the id and session
/// from their surroundings.
pub fn map_agent(
    entry: &Value,
    agent_id: Option<&str>,
    default_session: Option<&str>,
    now: DateTime<Utc>,
) -> Result<AgentState, String> {
    let object = entry.as_object().ok_or("agent entry is not an object")?;

    let agent_id = match text(object, &["agent_id", "id"]).or(agent_id) {
        Some(id) => id.to_string(),
        None => return Err("missing agent_id".into()),
    };
    let agent_type = text(object, &["agent_type", "type", "role"])
        .ok_or("missing agent_type")?
        .to_string();
    let session_id = text(object, &["session_id", "session"])
        .or(default_session)
        .ok_or("missing session_id")?
        .to_string();
    let raw_status = text(object, &["status", "state"]).ok_or("missing status")?;
    let status =
        map_status(raw_status).ok_or_else(|| format!("unknown status {raw_status:?}"))?;

    let created_at = timestamp(object, &["created_at", "created"])?;
    let last_updated = timestamp(object, &["last_updated", "updated_at", "updated"])?;
    let last_active = timestamp(object, &["last_active", "last_seen"])?;
    let fallback = created_at.or(last_updated).or(last_active).unwrap_or(now);

    let mut state = AgentState::new(agent_id, agent_type, session_id).with_status(status);
    state.memory_context = json_map(object, &["memory_context", "context"])?;
    state.task_history = history(object)?;
    state.performance_metrics = metrics(object)?;
    state.created_at = created_at.unwrap_or(fallback);
    state.last_updated = last_updated.unwrap_or(fallback);
    state.last_active = last_active.unwrap_or(state.last_updated);
    state.validate().map_err(|e| e.to_string())?;
    Ok(state)
}

/// Map a legacy event. Events without an id get one derived from their
/// content, so the same line always maps to the same document.
pub fn map_event(entry: &Value) -> Result<CoordinationEvent, String> {
    let object = entry.as_object().ok_or("event is not an object")?;

    let raw_type = text(object, &["event_type", "type", "kind"]).ok_or("missing event_type")?;
    let event_type =
        map_event_type(raw_type).ok_or_else(|| format!("unknown event type {raw_type:?}"))?;
    let source_agent_id = text(object, &["source_agent_id", "source", "from", "agent_id"])
        .ok_or("missing source_agent_id")?;
    let source_agent_type =
        text(object, &["source_agent_type", "source_type", "agent_type"]).unwrap_or(UNKNOWN_AGENT_TYPE);
    let timestamp = timestamp(object, &["timestamp", "time", "ts"])?.ok_or("missing timestamp")?;

    let mut event = CoordinationEvent::new(event_type, source_agent_id, source_agent_type);
    event.event_id = match text(object, &["event_id", "id"]) {
        Some(id) => id.to_string(),
        None => content_event_id(entry),
    };
    event.timestamp = timestamp;
    event.target_agent_id = text(object, &["target_agent_id", "target", "to"]).map(str::to_string);
    event.context = json_map(object, &["context"])?;
    event.task_context = json_map(object, &["task_context", "task"])?;
    event.success = match object.get("success") {
        None | Some(Value::Null) => event_type != EventType::Failure,
        Some(Value::Bool(ok)) => *ok,
        Some(other) => return Err(format!("success is not a boolean: {other}")),
    };
    event.validate().map_err(|e| e.to_string())?;
    Ok(event)
}

/// Map a legacy system section.
pub fn map_system(entry: &Value, now: DateTime<Utc>) -> Result<SystemState, String> {
    let object = entry.as_object().ok_or("system section is not an object")?;

    let version = text(object, &["system_version", "version"]).unwrap_or("legacy");
    let mut state = SystemState::new(version);
    state.last_updated = timestamp(object, &["last_updated", "updated"])?.unwrap_or(now);
    state.total_agents_spawned = counter(object, &["total_agents_spawned", "agents_spawned"])?;
    state.current_agent_count = counter(object, &["current_agent_count", "agent_count"])?;
    state.system_metrics = json_map(object, &["system_metrics", "metrics"])?;
    state.emergency_stop = match object.get("emergency_stop") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(stop)) => *stop,
        Some(other) => return Err(format!("emergency_stop is not a boolean: {other}")),
    };

    if let Some(sessions) = object.get("active_sessions") {
        let sessions = sessions.as_array().ok_or("active_sessions is not an array")?;
        state.active_sessions = sessions
            .iter()
            .map(|s| s.as_str().map(str::to_string).ok_or("session id is not a string"))
            .collect::<Result<BTreeSet<_>, _>>()?;
    }
    if let Some(flags) = object.get("feature_flags") {
        let flags = flags.as_object().ok_or("feature_flags is not an object")?;
        state.feature_flags = flags
            .iter()
            .map(|(name, v)| {
                v.as_bool()
                    .map(|enabled| (name.clone(), enabled))
                    .ok_or_else(|| format!("feature flag {name} is not a boolean"))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
    }
    Ok(state)
}

/// Map a legacy status name onto the lifecycle.
pub fn map_status(raw: &str) -> Option<AgentStatus> {
    let status = match raw.trim().to_ascii_lowercase().as_str() {
        "new" | "pending" | "created" | "uninitialized" => AgentStatus::Uninitialized,
        "active" | "started" | "ready" => AgentStatus::Active,
        "idle" | "waiting" => AgentStatus::Idle,
        "running" | "working" | "busy" => AgentStatus::Working,
        "done" | "complete" | "completed" | "finished" | "success" => AgentStatus::Completed,
        "error" | "errored" | "failed" | "failure" | "crashed" => AgentStatus::Failed,
        "stopped" | "killed" | "cancelled" | "canceled" | "terminated" => AgentStatus::Stopped,
        _ => return None,
    };
    Some(status)
}

pub fn map_event_type(raw: &str) -> Option<EventType> {
    let event_type = match raw.trim().to_ascii_lowercase().as_str() {
        "spawn" | "spawned" | "start_agent" => EventType::Spawn,
        "handoff" | "hand_off" | "delegate" | "delegated" => EventType::Handoff,
        "collaboration" | "collaborate" | "collab" => EventType::Collaboration,
        "completion" | "complete" | "completed" | "done" => EventType::Completion,
        "failure" | "fail" | "failed" | "error" => EventType::Failure,
        _ => return None,
    };
    Some(event_type)
}

/// First 32 hex chars of the SHA-256 of the record's canonical JSON.
///
/// `serde_json` objects keep keys sorted, so serialization is canonical.
pub fn content_event_id(entry: &Value) -> String {
    let canonical = entry.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(EVENT_ID_LEN);
    id
}

/// RFC 3339, naive date-times (taken as UTC) or epoch seconds/milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Ok(parsed.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| format!("unparseable timestamp {raw:?}"))
        }
        Value::Number(number) => {
            let seconds = number
                .as_f64()
                .ok_or_else(|| format!("unparseable timestamp {number}"))?;
            // Values this large are milliseconds.
            let millis = if seconds.abs() >= 1e11 { seconds } else { seconds * 1000.0 };
            Utc.timestamp_millis_opt(millis.round() as i64)
                .single()
                .ok_or_else(|| format!("timestamp {number} out of range"))
        }
        other => Err(format!("timestamp is not a string or number: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// First non-empty string among `names`.
fn text<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn first<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<(&'a str, &'a Value)> {
    names.iter().find_map(|name| {
        object
            .get_key_value(*name)
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.as_str(), v))
    })
}

fn timestamp(object: &Map<String, Value>, names: &[&str]) -> Result<Option<DateTime<Utc>>, String> {
    first(object, names)
        .map(|(name, value)| parse_timestamp(value).map_err(|e| format!("{name}: {e}")))
        .transpose()
}

fn json_map(
    object: &Map<String, Value>,
    names: &[&str],
) -> Result<BTreeMap<String, Value>, String> {
    match first(object, names) {
        None => Ok(BTreeMap::new()),
        Some((_, Value::Object(map))) => Ok(map.clone().into_iter().collect()),
        Some((name, _)) => Err(format!("{name} is not an object")),
    }
}

fn counter(object: &Map<String, Value>, names: &[&str]) -> Result<u64, String> {
    match first(object, names) {
        None => Ok(0),
        Some((name, value)) => value
            .as_u64()
            .ok_or_else(|| format!("{name} is not a non-negative integer")),
    }
}

fn metrics(object: &Map<String, Value>) -> Result<BTreeMap<String, f64>, String> {
    match first(object, &["performance_metrics", "metrics"]) {
        None => Ok(BTreeMap::new()),
        Some((_, Value::Object(map))) => map
            .iter()
            .map(|(name, v)| {
                v.as_f64()
                    .map(|n| (name.clone(), n))
                    .ok_or_else(|| format!("metric {name} is not a number"))
            })
            .collect(),
        Some((name, _)) => Err(format!("{name} is not an object")),
    }
}

/// Task history entries are strings, or objects carrying a summary.
fn history(object: &Map<String, Value>) -> Result<Vec<String>, String> {
    match first(object, &["task_history", "history", "tasks"]) {
        None => Ok(Vec::new()),
        Some((_, Value::Array(items))) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Object(entry) => text(entry, &["summary", "result", "task"])
                    .map(str::to_string)
                    .unwrap_or_else(|| item.to_string()),
                other => other.to_string(),
            })
            .collect()),
        Some((name, _)) => Err(format!("{name} is not an array")),
    }
}
