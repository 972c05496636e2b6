//! Data models for the Submarine Console backend.
//!
//! Record types mirror the DuckDB tables one-to-one; the `*Payload` structs are
//! the JSON request bodies accepted by the REST API. Everything that leaves the
//! process goes through serde, so field names here are the wire contract.

use std::fmt;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp layout used for every stored timestamp.
///
/// Fixed width (microsecond precision, no offset) so that lexical order in the
/// database equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current UTC time formatted with [`TIMESTAMP_FORMAT`].
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now().naive_utc())
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

// ============================================================================
// OPEN STRING ENUMS
// ============================================================================

/// Declares a string-backed enum with known variants plus an `Other` escape
/// hatch, so values written by older or newer clients still round-trip.
macro_rules! open_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? } default $default:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Other(s) => s.as_str(),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(s) => s,
                    known => known.as_str().to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

open_enum! {
    /// Lifecycle status of a mission.
    MissionStatus {
        Planned => "planned",
        Active => "active",
        Completed => "completed",
        Aborted => "aborted",
    } default Planned
}

open_enum! {
    /// Piloting mode a mission was planned for.
    MissionMode {
        Manual => "manual",
        Auto => "auto",
    } default Manual
}

open_enum! {
    /// Severity of an event log entry.
    EventLevel {
        Info => "info",
        Warn => "warn",
        Critical => "critical",
    } default Info
}

open_enum! {
    /// Phase of the autonomy controller, as driven by the operator console.
    AutonomyPhase {
        Idle => "idle",
        Armed => "armed",
        Running => "running",
        Paused => "paused",
        Aborted => "aborted",
    } default Idle
}

open_enum! {
    /// Task the autonomy controller is set to perform.
    AutonomyTask {
        Inspect => "inspect",
        Survey => "survey",
    } default Inspect
}

/// Match status of a target image. Only `Pending -> Matched` is ever written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    #[default]
    Pending,
    Matched,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Matched => "matched",
        }
    }

    /// Parse the stored column value; anything that is not `matched` is pending.
    pub fn from_column(value: &str) -> Self {
        if value == "matched" {
            TargetStatus::Matched
        } else {
            TargetStatus::Pending
        }
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// A logical operation session that other records can be attached to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: i64,
    pub name: String,
    pub status: MissionStatus,
    pub mode: MissionMode,
    pub created_at: String,
}

/// Values of a single telemetry sample, without identity.
///
/// Used both for samples synthesised by the simulator and for manual ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub yaw: Option<f64>,
    pub pitch: Option<f64>,
    pub roll: Option<f64>,
    pub battery_v: Option<f64>,
    pub battery_i: Option<f64>,
    pub water_temp: Option<f64>,
    pub turbidity: Option<f64>,
    #[serde(default)]
    pub leak: bool,
    pub internal_temp: Option<f64>,
}

/// Stored telemetry sample (immutable once written)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub id: i64,
    pub mission_id: Option<i64>,
    pub timestamp: String,
    #[serde(flatten)]
    pub point: TelemetryPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub level: EventLevel,
    pub message: String,
    pub mission_id: Option<i64>,
}

/// Event projection served by `/api/logs`
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: EventLevel,
    pub message: String,
}

impl From<EventLogEntry> for LogLine {
    fn from(entry: EventLogEntry) -> Self {
        Self {
            timestamp: entry.timestamp,
            level: entry.level,
            message: entry.message,
        }
    }
}

/// Event about to be appended to the log
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub mission_id: Option<i64>,
    pub level: EventLevel,
    pub message: String,
}

impl NewEvent {
    pub fn info(mission_id: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            mission_id,
            level: EventLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(mission_id: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            mission_id,
            level: EventLevel::Warn,
            message: message.into(),
        }
    }

    pub fn critical(mission_id: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            mission_id,
            level: EventLevel::Critical,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoClip {
    pub id: i64,
    pub timestamp: String,
    pub label: String,
    pub url: String,
    pub mission_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetImage {
    pub id: i64,
    pub mission_id: Option<i64>,
    pub label: String,
    #[serde(skip_serializing, default)]
    pub filename: String,
    pub url: String,
    pub status: TargetStatus,
    pub created_at: String,
    pub matched_at: Option<String>,
}

/// Metadata for a freshly uploaded target image
#[derive(Debug, Clone)]
pub struct NewTargetImage {
    pub mission_id: Option<i64>,
    pub label: String,
    pub filename: String,
    pub url: String,
}

/// The singleton autonomy record.
///
/// `updated_at` is `None` only for the synthetic default returned before the
/// first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomyState {
    pub is_enabled: bool,
    pub phase: AutonomyPhase,
    pub task: AutonomyTask,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Default for AutonomyState {
    fn default() -> Self {
        Self {
            is_enabled: false,
            phase: AutonomyPhase::Idle,
            task: AutonomyTask::Inspect,
            note: String::new(),
            updated_at: None,
        }
    }
}

impl AutonomyState {
    /// Merge a partial update: omitted fields keep their current value.
    pub fn merged(&self, update: &AutonomyStateUpdate) -> Self {
        Self {
            is_enabled: update.is_enabled.unwrap_or(self.is_enabled),
            phase: update.phase.clone().unwrap_or_else(|| self.phase.clone()),
            task: update.task.clone().unwrap_or_else(|| self.task.clone()),
            note: update.note.clone().unwrap_or_else(|| self.note.clone()),
            updated_at: Some(now_timestamp()),
        }
    }
}

/// Raw operator command kept for audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualCommand {
    pub id: i64,
    pub timestamp: String,
    pub command: String,
    pub payload: serde_json::Value,
}

// ============================================================================
// REQUEST PAYLOADS
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateMissionPayload {
    pub name: Option<String>,
    pub status: Option<MissionStatus>,
    pub mode: Option<MissionMode>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestTelemetryPayload {
    /// Absent or null attaches the sample to the default mission.
    pub mission_id: Option<i64>,
    #[serde(flatten)]
    pub point: TelemetryPoint,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateEventPayload {
    pub mission_id: Option<i64>,
    pub level: Option<EventLevel>,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateVideoClipPayload {
    pub mission_id: Option<i64>,
    pub label: Option<String>,
    pub url: Option<String>,
}

/// Partial autonomy update; `null` is treated the same as an omitted field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutonomyStateUpdate {
    #[serde(alias = "enabled")]
    pub is_enabled: Option<bool>,
    pub phase: Option<AutonomyPhase>,
    pub task: Option<AutonomyTask>,
    pub note: Option<String>,
    pub mission_id: Option<i64>,
}
