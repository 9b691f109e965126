//! Per-stage status tracking for one converter run.
//!
//! Every run reports against the same seven stages. Records accumulate
//! timestamped messages and are snapshotted into a [`StatusReport`] whose
//! JSON shape (stage number keys, integer status codes, `statustext`) is a
//! stable contract with report consumers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The seven pipeline stages, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ArchiveIntegrity = 1,
    PackagePresence = 2,
    FeatureValidation = 3,
    Reprojection = 4,
    Simplification = 5,
    Conversion = 6,
    Performance = 7,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::ArchiveIntegrity,
        Stage::PackagePresence,
        Stage::FeatureValidation,
        Stage::Reprojection,
        Stage::Simplification,
        Stage::Conversion,
        Stage::Performance,
    ];

    /// Stage number used as the report key.
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::ArchiveIntegrity => "archive integrity",
            Stage::PackagePresence => "package presence",
            Stage::FeatureValidation => "feature validation",
            Stage::Reprojection => "reprojection",
            Stage::Simplification => "simplification",
            Stage::Conversion => "conversion",
            Stage::Performance => "performance",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage outcome codes. The integer values are a stable contract with
/// report consumers and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StageStatus {
    Error = 0,
    Success = 1,
    Warning = 2,
    NotStarted = 3,
    Information = 4,
}

impl StageStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<StageStatus> for u8 {
    fn from(status: StageStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for StageStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        match code {
            0 => Ok(StageStatus::Error),
            1 => Ok(StageStatus::Success),
            2 => Ok(StageStatus::Warning),
            3 => Ok(StageStatus::NotStarted),
            4 => Ok(StageStatus::Information),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

/// One timestamped report entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedMessage {
    pub msg: String,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

impl TimedMessage {
    fn now(msg: String) -> Self {
        Self {
            msg,
            time: Utc::now().timestamp_millis(),
        }
    }
}

/// Aggregated record for one stage.
///
/// The message lists are append-only: a stage can fail after earlier
/// successes without losing the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(rename = "statustext")]
    pub status_text: String,
    pub errors: Vec<TimedMessage>,
    pub warnings: Vec<TimedMessage>,
    pub info: Vec<TimedMessage>,
    pub success: Vec<TimedMessage>,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            status: StageStatus::NotStarted,
            status_text: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            info: Vec::new(),
            success: Vec::new(),
        }
    }
}

/// Mutable per-run aggregation of all seven stage records.
#[derive(Debug)]
pub struct StatusTracker {
    records: BTreeMap<u8, StageRecord>,
}

impl StatusTracker {
    /// All stages start `NotStarted` with empty message lists.
    pub fn new() -> Self {
        let records = Stage::ALL
            .iter()
            .map(|stage| (stage.number(), StageRecord::default()))
            .collect();
        Self { records }
    }

    pub fn add_error(&mut self, stage: Stage, msg: impl Into<String>) {
        self.record_mut(stage).errors.push(TimedMessage::now(msg.into()));
    }

    pub fn add_warning(&mut self, stage: Stage, msg: impl Into<String>) {
        self.record_mut(stage).warnings.push(TimedMessage::now(msg.into()));
    }

    pub fn add_info(&mut self, stage: Stage, msg: impl Into<String>) {
        self.record_mut(stage).info.push(TimedMessage::now(msg.into()));
    }

    pub fn add_success(&mut self, stage: Stage, msg: impl Into<String>) {
        self.record_mut(stage).success.push(TimedMessage::now(msg.into()));
    }

    /// Overwrites the stage status. Message lists are untouched.
    pub fn set_status(&mut self, stage: Stage, status: StageStatus) {
        self.record_mut(stage).status = status;
    }

    /// Overwrites the short status text shown next to the status code.
    pub fn set_status_text(&mut self, stage: Stage, text: impl Into<String>) {
        self.record_mut(stage).status_text = text.into();
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.record(stage).status
    }

    pub fn record(&self, stage: Stage) -> &StageRecord {
        &self.records[&stage.number()]
    }

    /// True when any stage has recorded an `Error` status.
    pub fn has_error(&self) -> bool {
        self.records
            .values()
            .any(|record| record.status == StageStatus::Error)
    }

    /// Snapshot of every stage record.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            stages: self.records.clone(),
        }
    }

    fn record_mut(&mut self, stage: Stage) -> &mut StageRecord {
        self.records.entry(stage.number()).or_default()
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable snapshot of a run, keyed by stage number ("1" through "7" in
/// JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusReport {
    stages: BTreeMap<u8, StageRecord>,
}

impl StatusReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage.number())
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stage(stage).map(|record| record.status)
    }

    pub fn has_error(&self) -> bool {
        self.stages
            .values()
            .any(|record| record.status == StageStatus::Error)
    }
}
