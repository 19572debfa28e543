//! RECLAIM Core - Entity Types
//!
//! Pure data structures with no behavior. All other crates depend on this.
//! This crate contains ONLY data types - no business logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Identifier of a coordinating agent.
pub type AgentId = Uuid;

/// Identifier of a snapshot artifact.
pub type SnapshotId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Compute the hex-encoded SHA-256 hash of a serialized payload.
pub fn compute_payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

// ============================================================================
// CHECK IDENTIFIERS
// ============================================================================

/// Stable identifiers for the consistency checks, in declaration order.
pub mod check_ids {
    pub const REGISTRY_CONSISTENCY: &str = "registry-consistency";
    pub const MEMORY_BANK_INTEGRITY: &str = "memory-bank-integrity";
    pub const TIMESTAMP_CONSISTENCY: &str = "timestamp-consistency";
    pub const CROSS_REFERENCE_VALIDATION: &str = "cross-reference-validation";
    pub const HEARTBEAT_FRESHNESS: &str = "heartbeat-freshness";
}

// ============================================================================
// ENUMS
// ============================================================================

/// Severity attached to a failure scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Health status derived from a consistency report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// State is fully consistent
    Healthy,
    /// Inconsistencies found, none critical
    Degraded,
    /// A critical check failed or the score collapsed
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// The five recoverable failure classes. Closed set - scenario
/// classification matches exhaustively and is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// A single agent's record is stale or damaged
    AgentFailure,
    /// The session registry disagrees with queues/channels
    SessionCorruption,
    /// Memory bank entries are structurally malformed
    MemoryCorruption,
    /// Several agents are stale or missing
    PartialLoss,
    /// Storage is unreachable or empty
    CompleteLoss,
}

impl FailureKind {
    /// All kinds, in classification precedence order (most severe first).
    pub const ALL: [FailureKind; 5] = [
        FailureKind::CompleteLoss,
        FailureKind::PartialLoss,
        FailureKind::SessionCorruption,
        FailureKind::MemoryCorruption,
        FailureKind::AgentFailure,
    ];

    /// Convert to stable string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            FailureKind::AgentFailure => "AgentFailure",
            FailureKind::SessionCorruption => "SessionCorruption",
            FailureKind::MemoryCorruption => "MemoryCorruption",
            FailureKind::PartialLoss => "PartialLoss",
            FailureKind::CompleteLoss => "CompleteLoss",
        }
    }

    /// Parse from stable string representation.
    pub fn from_db_str(s: &str) -> Result<Self, FailureKindParseError> {
        match s.to_lowercase().replace('_', "").as_str() {
            "agentfailure" => Ok(FailureKind::AgentFailure),
            "sessioncorruption" => Ok(FailureKind::SessionCorruption),
            "memorycorruption" => Ok(FailureKind::MemoryCorruption),
            "partialloss" => Ok(FailureKind::PartialLoss),
            "completeloss" => Ok(FailureKind::CompleteLoss),
            _ => Err(FailureKindParseError(s.to_string())),
        }
    }

    /// Expected wall-clock budget for recovering from this kind of failure.
    /// Seeds default step timeouts; not an SLA.
    pub fn expected_recovery_time(&self) -> Duration {
        match self {
            FailureKind::AgentFailure => Duration::from_secs(15),
            FailureKind::SessionCorruption => Duration::from_secs(30),
            FailureKind::MemoryCorruption => Duration::from_secs(120),
            FailureKind::PartialLoss => Duration::from_secs(60),
            FailureKind::CompleteLoss => Duration::from_secs(180),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for FailureKind {
    type Err = FailureKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid failure kind string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureKindParseError(pub String);

impl fmt::Display for FailureKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid failure kind: {}", self.0)
    }
}

impl std::error::Error for FailureKindParseError {}

/// Action performed by a recovery step. Closed set interpreted by the
/// step executor - there is no open handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Backup,
    Restore,
    Validate,
    Reinitialize,
    Repair,
    Notify,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryAction::Backup => "backup",
            RecoveryAction::Restore => "restore",
            RecoveryAction::Validate => "validate",
            RecoveryAction::Reinitialize => "reinitialize",
            RecoveryAction::Repair => "repair",
            RecoveryAction::Notify => "notify",
        };
        write!(f, "{s}")
    }
}

/// What the executor does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Record the failure and proceed to the next step
    Continue,
    /// Abort forward execution and run rollback steps in reverse
    #[default]
    Rollback,
    /// Abort immediately without rollback; fatal to the caller
    Escalate,
}

/// Category of a post-recovery validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationCheckType {
    Integrity,
    Consistency,
    Performance,
    Functionality,
}

/// Lifecycle phase of one recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPhase {
    Detecting,
    PlanSelected,
    Executing,
    Validating,
    RollingBack,
    Succeeded,
    /// Terminal without success (rollback finished, or nothing to do failed)
    Terminal,
}

/// Status of one executed recovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Dependency failed or forward execution was aborted before this step
    Skipped,
}

// ============================================================================
// AGENT RECORD
// ============================================================================

/// Capability/role descriptor for an agent. Opaque to this subsystem
/// beyond equality - it is retained verbatim through reinitialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Agent type, e.g. "researcher", "coder"
    pub agent_type: String,
    /// Declared capabilities
    pub capabilities: Vec<String>,
}

impl RoleSpec {
    pub fn new(agent_type: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities,
        }
    }
}

/// Declared schema version for memory bank entries this subsystem knows
/// how to validate and repair.
pub const MEMORY_SCHEMA_VERSION: u32 = 1;

/// Expected shape of one memory bank value.
///
/// The bank itself stores raw `serde_json::Value`s so that corruption
/// (junk written by a crashing agent) is representable; a well-formed
/// entry is a value that parses into this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Declared schema version of this entry
    pub schema_version: u32,
    /// The agent's serialized working value
    pub value: serde_json::Value,
    /// When the entry was written
    pub written_at: Timestamp,
}

impl MemoryEntry {
    /// Create a new entry under the current schema version.
    pub fn new(value: serde_json::Value, written_at: Timestamp) -> Self {
        Self {
            schema_version: MEMORY_SCHEMA_VERSION,
            value,
            written_at,
        }
    }

    /// Parse a raw bank value into a structurally valid entry.
    ///
    /// Returns a description of the defect when the value is malformed:
    /// not an entry object, an unknown schema version, or a null payload.
    pub fn parse(raw: &serde_json::Value) -> Result<MemoryEntry, String> {
        let entry: MemoryEntry = serde_json::from_value(raw.clone())
            .map_err(|e| format!("not a memory entry: {e}"))?;
        if entry.schema_version != MEMORY_SCHEMA_VERSION {
            return Err(format!(
                "unknown schema version {} (expected {})",
                entry.schema_version, MEMORY_SCHEMA_VERSION
            ));
        }
        if entry.value.is_null() {
            return Err("entry value is null".to_string());
        }
        Ok(entry)
    }
}

/// In-flight exchange with a peer agent, tracked per coordination partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeState {
    /// What the exchange is about, opaque to this subsystem
    pub topic: String,
    /// When the exchange last progressed
    pub last_activity: Timestamp,
}

/// Durable state of one coordinating agent.
///
/// Owned by the agent during normal operation; owned by the recovery
/// subsystem only while a restore/validate pass holds the recovery lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub role_spec: RoleSpec,
    /// Ordered key -> raw serialized value
    pub memory_bank: BTreeMap<String, serde_json::Value>,
    pub last_heartbeat: Timestamp,
    /// Peer agent id -> in-flight exchange
    pub coordination_state: BTreeMap<AgentId, ExchangeState>,
}

impl AgentRecord {
    /// Create a freshly registered agent record.
    pub fn new(role_spec: RoleSpec, now: Timestamp) -> Self {
        Self {
            agent_id: new_entity_id(),
            role_spec,
            memory_bank: BTreeMap::new(),
            last_heartbeat: now,
            coordination_state: BTreeMap::new(),
        }
    }

    /// Record a heartbeat.
    pub fn heartbeat(&mut self, now: Timestamp) {
        self.last_heartbeat = now;
    }

    /// Write a memory bank entry under the current schema version.
    pub fn write_memory(&mut self, key: impl Into<String>, value: serde_json::Value, now: Timestamp) {
        let entry = MemoryEntry::new(value, now);
        self.memory_bank.insert(
            key.into(),
            serde_json::to_value(entry).unwrap_or(serde_json::Value::Null),
        );
    }

    /// Baseline record for reinitialization: same identity and role spec,
    /// memory bank and coordination state cleared, heartbeat reset.
    pub fn reinitialized(&self, now: Timestamp) -> Self {
        Self {
            agent_id: self.agent_id,
            role_spec: self.role_spec.clone(),
            memory_bank: BTreeMap::new(),
            last_heartbeat: now,
            coordination_state: BTreeMap::new(),
        }
    }

    /// Keys whose values fail to parse as memory entries.
    pub fn malformed_bank_keys(&self) -> Vec<(String, String)> {
        self.memory_bank
            .iter()
            .filter_map(|(k, v)| MemoryEntry::parse(v).err().map(|e| (k.clone(), e)))
            .collect()
    }

    /// Whether the agent is stale relative to the given threshold.
    pub fn is_stale(&self, now: Timestamp, threshold: Duration) -> bool {
        match (now - self.last_heartbeat).to_std() {
            Ok(age) => age > threshold,
            // Heartbeat in the future; staleness is judged separately
            Err(_) => false,
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: EntityId,
    pub description: String,
    pub assigned_to: Option<AgentId>,
    pub created_at: Timestamp,
}

impl TaskDescriptor {
    pub fn new(description: impl Into<String>, now: Timestamp) -> Self {
        Self {
            task_id: new_entity_id(),
            description: description.into(),
            assigned_to: None,
            created_at: now,
        }
    }

    pub fn with_assignee(mut self, agent_id: AgentId) -> Self {
        self.assigned_to = Some(agent_id);
        self
    }
}

/// The four disjoint task queues. A task belongs to exactly one queue
/// at a time; duplicates across queues are a consistency defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskQueues {
    pub pending: Vec<TaskDescriptor>,
    pub active: Vec<TaskDescriptor>,
    pub completed: Vec<TaskDescriptor>,
    pub blocked: Vec<TaskDescriptor>,
}

impl TaskQueues {
    /// Iterate over every task in every queue.
    pub fn all_tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.pending
            .iter()
            .chain(self.active.iter())
            .chain(self.completed.iter())
            .chain(self.blocked.iter())
    }

    /// Total number of queued tasks.
    pub fn total_len(&self) -> usize {
        self.pending.len() + self.active.len() + self.completed.len() + self.blocked.len()
    }

    /// Task ids that appear in more than one queue.
    pub fn duplicate_task_ids(&self) -> Vec<EntityId> {
        let mut seen = BTreeSet::new();
        let mut dupes = Vec::new();
        for task in self.all_tasks() {
            if !seen.insert(task.task_id) && !dupes.contains(&task.task_id) {
                dupes.push(task.task_id);
            }
        }
        dupes
    }

    /// Agent ids referenced by task assignments.
    pub fn assignee_ids(&self) -> BTreeSet<AgentId> {
        self.all_tasks().filter_map(|t| t.assigned_to).collect()
    }
}

/// A coordination channel between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationChannel {
    pub participants: BTreeSet<AgentId>,
    pub last_activity: Timestamp,
}

/// Singleton state of one coordination session.
///
/// Invariant: every agent id referenced by `coordination_channels` or
/// `task_queues` must also appear in `registry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionState {
    /// Agent id -> declared role spec of agents believed active
    pub registry: BTreeMap<AgentId, RoleSpec>,
    pub task_queues: TaskQueues,
    /// Numeric counters
    pub performance_metrics: BTreeMap<String, f64>,
    /// Channel id -> channel
    pub coordination_channels: BTreeMap<String, CoordinationChannel>,
}

impl SessionState {
    /// Agent ids referenced by channels, in deterministic order.
    pub fn channel_participant_ids(&self) -> BTreeSet<AgentId> {
        self.coordination_channels
            .values()
            .flat_map(|c| c.participants.iter().copied())
            .collect()
    }

    /// All agent ids referenced outside the registry (channels + tasks).
    pub fn referenced_agent_ids(&self) -> BTreeSet<AgentId> {
        let mut ids = self.channel_participant_ids();
        ids.extend(self.task_queues.assignee_ids());
        ids
    }
}

/// Shared knowledge plus system configuration. Append-mostly; no history
/// beyond what snapshots capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GlobalMemory {
    pub knowledge: BTreeMap<String, serde_json::Value>,
    pub system_config: BTreeMap<String, serde_json::Value>,
}

/// The full tracked state as of a single instant: the unit of snapshot
/// and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateImage {
    pub agents: BTreeMap<AgentId, AgentRecord>,
    pub session: SessionState,
    pub global_memory: GlobalMemory,
}

impl StateImage {
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }
}

// ============================================================================
// CONSISTENCY & HEALTH REPORTS
// ============================================================================

/// Result of one consistency check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub passed: bool,
    /// Fraction of examined items that passed, in [0, 1]
    pub pass_ratio: f64,
    pub critical: bool,
    pub detail: String,
    /// Component refs that failed this check, e.g. "agent:<id>", "session"
    pub failing: Vec<String>,
}

/// Output of the Consistency Analyzer. Ephemeral - recomputed on demand,
/// never persisted as its own entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Per-check results in declaration order
    pub per_check_results: Vec<CheckResult>,
    /// Weighted score in [0, 1]; any critical failure forces < 0.5
    pub overall_score: f64,
    pub issues: Vec<String>,
    pub generated_at: Timestamp,
}

impl ConsistencyReport {
    /// Whether any critical check failed.
    pub fn has_critical_failure(&self) -> bool {
        self.per_check_results
            .iter()
            .any(|c| c.critical && !c.passed)
    }

    /// Ids of the checks that failed.
    pub fn failed_check_ids(&self) -> Vec<&str> {
        self.per_check_results
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.check_id.as_str())
            .collect()
    }

    /// Look up one check result by id.
    pub fn check(&self, check_id: &str) -> Option<&CheckResult> {
        self.per_check_results.iter().find(|c| c.check_id == check_id)
    }
}

/// Pass/fail view over a consistency report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Periodic health report derived from a consistency report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: Timestamp,
    pub status: HealthStatus,
    pub consistency: ConsistencyReport,
    pub auto_recovery_triggered: bool,
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Immutable, integrity-checked, point-in-time copy of all tracked state.
/// Never mutated after creation; retained until explicitly pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub timestamp: Timestamp,
    /// Free text, e.g. "pre-deployment-backup"
    pub reason: String,
    /// Serialized StateImage bytes
    pub payload: Vec<u8>,
    /// Hex-encoded SHA-256 over `payload`
    pub integrity_hash: String,
    pub schema_version: u32,
}

// ============================================================================
// FAILURE SCENARIO
// ============================================================================

/// A classified failure with its blast radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureScenario {
    pub kind: FailureKind,
    pub severity: Severity,
    /// Component names affected, e.g. "agent:<id>", "session", "storage"
    pub affected_components: BTreeSet<String>,
}

impl FailureScenario {
    /// Construct a scenario with the default severity for its kind.
    pub fn new(kind: FailureKind, affected_components: BTreeSet<String>) -> Self {
        let severity = match kind {
            FailureKind::AgentFailure => Severity::Medium,
            FailureKind::SessionCorruption => Severity::High,
            FailureKind::MemoryCorruption => Severity::High,
            FailureKind::PartialLoss => Severity::High,
            FailureKind::CompleteLoss => Severity::Critical,
        };
        Self {
            kind,
            severity,
            affected_components,
        }
    }
}

// ============================================================================
// RECOVERY PLAN TYPES
// ============================================================================

/// One scripted step of a recovery plan. Steps are data, interpreted by
/// the step executor; rollback steps reuse the same shape and executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub id: String,
    pub action: RecoveryAction,
    /// Opaque bag interpreted by the action handler
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub timeout: Duration,
    /// Additional attempts after the first, with identical parameters
    pub retry_count: u32,
    /// Ids of steps that must have already succeeded
    pub dependencies: Vec<String>,
    pub failure_mode: FailureMode,
}

impl RecoveryStep {
    pub fn new(id: impl Into<String>, action: RecoveryAction) -> Self {
        Self {
            id: id.into(),
            action,
            parameters: serde_json::Map::new(),
            timeout: Duration::from_secs(30),
            retry_count: 0,
            dependencies: Vec::new(),
            failure_mode: FailureMode::Rollback,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Read a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Post-execution validation check. A failed critical check forces a
/// rollback regardless of the steps' own failure modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub id: String,
    pub check_type: ValidationCheckType,
    /// Named check routine resolved by the executor
    pub routine: String,
    /// Predicate evaluated against the check routine's output
    pub pass_criteria: String,
    pub critical: bool,
}

/// Fixed script for repairing one failure kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub scenario_kind: FailureKind,
    pub steps: Vec<RecoveryStep>,
    /// Run in reverse order when forward execution rolls back
    pub rollback_steps: Vec<RecoveryStep>,
    pub validation_checks: Vec<ValidationCheck>,
    /// Predicates evaluated against the post-run health report
    pub success_criteria: Vec<String>,
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub action: RecoveryAction,
    pub status: StepStatus,
    /// Attempts made, including the first
    pub attempts: u32,
    pub detail: String,
}

/// Outcome of one post-execution validation check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub check_id: String,
    pub passed: bool,
    pub critical: bool,
    pub detail: String,
}

/// Result of a snapshot restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub snapshot_id: Option<SnapshotId>,
    /// Agents present in the restored image
    pub restored_agents: usize,
    pub errors: Vec<String>,
}

impl RestoreResult {
    /// Create a successful restore result.
    pub fn success(snapshot_id: SnapshotId, restored_agents: usize) -> Self {
        Self {
            success: true,
            snapshot_id: Some(snapshot_id),
            restored_agents,
            errors: Vec::new(),
        }
    }

    /// Create a failed restore result. No partial write occurred.
    pub fn failure(snapshot_id: Option<SnapshotId>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            snapshot_id,
            restored_agents: 0,
            errors,
        }
    }
}

/// Result of one recovery run, structured enough to act on without
/// re-running diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub scenario: Option<FailureScenario>,
    /// Phase the run terminated in (Succeeded or Terminal)
    pub final_phase: RunPhase,
    pub success: bool,
    pub step_outcomes: Vec<StepOutcome>,
    pub validation_outcomes: Vec<ValidationOutcome>,
    /// Success criteria that did not hold
    pub unmet_criteria: Vec<String>,
    pub issues: Vec<String>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl RecoveryResult {
    /// Result for a run that found nothing to recover.
    pub fn nothing_to_do(now: Timestamp) -> Self {
        Self {
            scenario: None,
            final_phase: RunPhase::Succeeded,
            success: true,
            step_outcomes: Vec::new(),
            validation_outcomes: Vec::new(),
            unmet_criteria: Vec::new(),
            issues: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Storage accessor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage accessor unavailable: {reason}")]
    AccessorUnavailable { reason: String },

    #[error("Record not found: {kind} {id}")]
    RecordNotFound { kind: String, id: String },

    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Snapshot integrity and compatibility errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Integrity violation: payload hash {actual} does not match recorded {expected}")]
    IntegrityViolation { expected: String, actual: String },

    #[error("Schema incompatible: snapshot version {found}, supported version {supported}")]
    SchemaIncompatible { found: u32, supported: u32 },

    #[error("No snapshot available to restore")]
    NoSnapshotAvailable,

    #[error("Snapshot encoding failed: {reason}")]
    EncodingFailed { reason: String },
}

/// Recovery orchestration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("Recovery already in progress")]
    AlreadyInProgress,

    #[error("Step {step_id} timed out after {timeout:?}")]
    StepTimeout { step_id: String, timeout: Duration },

    #[error("Step {step_id} failed: {reason}")]
    StepFailed { step_id: String, reason: String },

    #[error("Critical validation check {check_id} failed")]
    CriticalValidationFailed { check_id: String },

    #[error("No recovery plan registered for {kind}")]
    UnknownPlan { kind: FailureKind },

    #[error("Invalid recovery plan: {reason}")]
    InvalidPlan { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all RECLAIM errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReclaimError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for RECLAIM operations.
pub type ReclaimResult<T> = Result<T, ReclaimError>;

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Hashing is stable and collision-sensitive to single-byte flips.
        #[test]
        fn prop_payload_hash_detects_mutation(
            payload in prop::collection::vec(any::<u8>(), 1..256),
            flip_index in 0usize..256,
        ) {
            let original = compute_payload_hash(&payload);

            let mut corrupted = payload.clone();
            let idx = flip_index % corrupted.len();
            corrupted[idx] ^= 0xFF;

            prop_assert_ne!(original, compute_payload_hash(&corrupted));
        }

        /// Reinitialization always preserves identity and clears state.
        #[test]
        fn prop_reinitialized_clears_bank(
            keys in prop::collection::vec("[a-z]{1,8}", 0..10),
        ) {
            let now = Utc::now();
            let mut agent = AgentRecord::new(RoleSpec::new("worker", vec![]), now);
            for key in &keys {
                agent.write_memory(key.clone(), serde_json::json!({"k": key}), now);
            }

            let fresh = agent.reinitialized(now);
            prop_assert_eq!(fresh.agent_id, agent.agent_id);
            prop_assert!(fresh.memory_bank.is_empty());
        }

        /// Entries written through write_memory always parse back.
        #[test]
        fn prop_written_entries_are_well_formed(
            key in "[a-z]{1,12}",
            number in any::<i64>(),
        ) {
            let now = Utc::now();
            let mut agent = AgentRecord::new(RoleSpec::new("worker", vec![]), now);
            agent.write_memory(key.clone(), serde_json::json!({"n": number}), now);

            prop_assert!(agent.malformed_bank_keys().is_empty());
        }
    }
}
