//! Typed payloads for events the coordination core publishes or consumes.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::EventType;

/// A payload bound to exactly one event type.
pub trait EventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: EventType;
}

macro_rules! event_payload {
    ($ty:ty => $event:ident) => {
        impl EventPayload for $ty {
            const EVENT_TYPE: EventType = EventType::$event;
        }
    };
}

/// Why a lock stopped being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnlockReason {
    Released,
    TtlExpired,
    Forced,
    OwnerDead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocked {
    pub resource_key: String,
    pub holder: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    pub expires_at: DateTime<Utc>,
}
event_payload!(FileLocked => FileLocked);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUnlocked {
    pub resource_key: String,
    pub holder: String,
    /// Milliseconds between grant and release.
    pub held_ms: i64,
    pub reason: UnlockReason,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub released_by: Option<String>,
}
event_payload!(FileUnlocked => FileUnlocked);

/// Published by a loop (or merge tooling) when two owners touched the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub resource_key: String,
    pub owners: Vec<String>,
}
event_payload!(FileConflict => FileConflict);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckDetected {
    pub owner: String,
    pub work_item_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}
event_payload!(StuckDetected => StuckDetected);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceRelease {
    pub victim: String,
    pub cycle: Vec<String>,
    pub held_locks: Vec<String>,
    pub must_rollback: bool,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    pub victim_priority: i64,
}
event_payload!(ForceRelease => ForceRelease);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCreated {
    pub checkpoint_id: String,
    pub owner: String,
    pub label: String,
    pub snapshot_ref: String,
}
event_payload!(CheckpointCreated => CheckpointCreated);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRolledBack {
    pub checkpoint_id: String,
    pub owner: String,
    /// Later checkpoints of the same owner that were deactivated.
    pub superseded: Vec<String>,
}
event_payload!(CheckpointRolledBack => CheckpointRolledBack);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionDetected {
    pub regression_id: i64,
    /// The work item whose verification failed.
    pub work_item_id: String,
    /// The previously-passing work item that regressed.
    pub blamed_test: String,
    #[serde(default)]
    pub blamed_loop: Option<String>,
    pub passing_commit: String,
    pub failing_commit: String,
    pub suspects: Vec<String>,
    pub auto_rolled_back: bool,
}
event_payload!(RegressionDetected => RegressionDetected);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackTriggered {
    pub target: String,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub work_item_id: Option<String>,
}
event_payload!(RollbackTriggered => RollbackTriggered);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStarted {
    pub component: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub restarted: bool,
}
event_payload!(ComponentStarted => ComponentStarted);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDegraded {
    pub component: String,
    pub last_heartbeat: DateTime<Utc>,
    pub silent_ms: i64,
    #[serde(default)]
    pub detail: Option<String>,
}
event_payload!(ComponentDegraded => ComponentDegraded);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    HeartbeatTimeout,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStopped {
    pub component: String,
    pub reason: StopReason,
    pub last_heartbeat: DateTime<Utc>,
}
event_payload!(ComponentStopped => ComponentStopped);

/// A resource a dead owner locked and never released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialWrite {
    pub owner: String,
    pub resource_key: String,
    pub locked_at: DateTime<Utc>,
}
event_payload!(PartialWrite => PartialWrite);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionNeeded {
    pub decision_id: String,
    pub kind: String,
    pub summary: String,
    pub options: Vec<String>,
    pub default_option: String,
    pub timeout_at: DateTime<Utc>,
}
event_payload!(DecisionNeeded => DecisionNeeded);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResolved {
    pub decision_id: String,
    pub chosen_option: String,
    pub resolved_by: String,
    pub timed_out: bool,
}
event_payload!(DecisionResolved => DecisionResolved);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityChanged {
    pub owner: String,
    pub priority: i64,
    pub previous: i64,
    pub changed_by: String,
}
event_payload!(PriorityChanged => PriorityChanged);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseRequested {
    pub target: String,
    pub reason: String,
    #[serde(default)]
    pub blocked_on: Option<String>,
    #[serde(default)]
    pub resource_key: Option<String>,
}
event_payload!(PauseRequested => PauseRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequested {
    pub target: String,
    pub reason: String,
}
event_payload!(ResumeRequested => ResumeRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRequested {
    pub target: String,
    pub work_item_id: String,
    pub reason: String,
}
event_payload!(SkipRequested => SkipRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStarted {
    pub work_item_id: String,
    pub owner: String,
    pub checkpoint_id: String,
}
event_payload!(TestStarted => TestStarted);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPassed {
    pub work_item_id: String,
    pub owner: String,
    pub commit: String,
}
event_payload!(TestPassed => TestPassed);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailed {
    pub work_item_id: String,
    pub owner: String,
    pub commit: String,
    pub reason: String,
}
event_payload!(TestFailed => TestFailed);
