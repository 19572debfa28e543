//! RECLAIM Recovery - Scripted Recovery Orchestration
//!
//! Classifies detected failures into one of five fixed scenarios, selects
//! the matching recovery plan, and interprets the plan's steps against the
//! storage accessor and snapshot manager. Rollback is data, not handler
//! code: forward and rollback step lists share one execution engine, so
//! failure semantics (timeouts, retries, failure modes) are identical on
//! both paths.
//!
//! At most one recovery run is active at a time system-wide. A concurrent
//! call is rejected immediately with `RecoveryError::AlreadyInProgress`
//! rather than queued; the caller decides whether to retry.

use ::async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use reclaim_analyzer::ConsistencyAnalyzer;
use reclaim_core::{
    check_ids, AgentId, ConfigError, ConsistencyReport, FailureKind, FailureMode,
    FailureScenario, HealthReport, HealthStatus, MemoryEntry, ReclaimError, ReclaimResult,
    RecoveryAction, RecoveryError, RecoveryPlan, RecoveryResult, RecoveryStep, RunPhase,
    SnapshotId, StepOutcome, StepStatus, ValidationCheck, ValidationCheckType, ValidationOutcome,
};
use reclaim_snapshot::{SnapshotManager, SnapshotRef};
use reclaim_storage::StorageAccessor;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the recovery orchestrator.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Stale-or-missing agents at or above this count classify as PartialLoss
    pub partial_loss_agent_threshold: usize,

    /// Minimum overall score for a post-recovery state to count as healthy
    pub healthy_score_threshold: f64,

    /// Recovery results retained for diagnostics
    pub max_history: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            partial_loss_agent_threshold: 2,
            healthy_score_threshold: 0.9,
            max_history: 16,
        }
    }
}

impl RecoveryConfig {
    /// Create a RecoveryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `RECLAIM_PARTIAL_LOSS_AGENT_THRESHOLD` (default: 2)
    /// - `RECLAIM_HEALTHY_SCORE_THRESHOLD` (default: 0.9)
    /// - `RECLAIM_RECOVERY_MAX_HISTORY` (default: 16)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            partial_loss_agent_threshold: std::env::var("RECLAIM_PARTIAL_LOSS_AGENT_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.partial_loss_agent_threshold),
            healthy_score_threshold: std::env::var("RECLAIM_HEALTHY_SCORE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.healthy_score_threshold),
            max_history: std::env::var("RECLAIM_RECOVERY_MAX_HISTORY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_history),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partial_loss_agent_threshold < 2 {
            return Err(ConfigError::InvalidValue {
                field: "partial_loss_agent_threshold".to_string(),
                value: self.partial_loss_agent_threshold.to_string(),
                reason: "a single failed agent is AgentFailure, so the threshold must be at least 2"
                    .to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.healthy_score_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "healthy_score_threshold".to_string(),
                value: self.healthy_score_threshold.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// NOTIFIER COLLABORATOR
// ============================================================================

/// External notification collaborator invoked by `notify` steps.
///
/// Notification is best-effort: a delivery failure is recorded in the step
/// detail but never fails the recovery run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), String>;
}

/// Notifier that only logs. Default collaborator when none is injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), String> {
        tracing::debug!(subject, body, "Notification (noop)");
        Ok(())
    }
}

// ============================================================================
// HEALTH DERIVATION
// ============================================================================

/// Derive a health status from a consistency report.
///
/// Any critical check failure (or a score under 0.5, which critical
/// failures force by construction) is critical; a score at or above the
/// healthy threshold is healthy; everything between is degraded.
pub fn derive_health_status(report: &ConsistencyReport, healthy_threshold: f64) -> HealthStatus {
    if report.has_critical_failure() || report.overall_score < 0.5 {
        HealthStatus::Critical
    } else if report.overall_score >= healthy_threshold {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

/// Assemble a health report around a consistency report.
pub fn derive_health_report(
    report: ConsistencyReport,
    healthy_threshold: f64,
    auto_recovery_triggered: bool,
) -> HealthReport {
    HealthReport {
        timestamp: report.generated_at,
        status: derive_health_status(&report, healthy_threshold),
        consistency: report,
        auto_recovery_triggered,
    }
}

// ============================================================================
// SUCCESS CRITERIA
// ============================================================================

static SCORE_CRITERION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^overall_score\s*>=\s*([0-9]*\.?[0-9]+)$").expect("valid regex"));
static STATUS_CRITERION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^status\s*==\s*(healthy|degraded|critical)$").expect("valid regex"));

/// Parsed success-criterion predicate.
#[derive(Debug, Clone, PartialEq)]
enum Criterion {
    ScoreGte(f64),
    StatusIs(HealthStatus),
    NoCriticalFailures,
}

fn parse_criterion(text: &str) -> Option<Criterion> {
    let text = text.trim();
    if text == "no_critical_failures" {
        return Some(Criterion::NoCriticalFailures);
    }
    if let Some(caps) = SCORE_CRITERION.captures(text) {
        return caps[1].parse().ok().map(Criterion::ScoreGte);
    }
    if let Some(caps) = STATUS_CRITERION.captures(text) {
        let status = match &caps[1] {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            _ => HealthStatus::Critical,
        };
        return Some(Criterion::StatusIs(status));
    }
    None
}

fn criterion_holds(criterion: &Criterion, health: &HealthReport) -> bool {
    match criterion {
        Criterion::ScoreGte(min) => health.consistency.overall_score >= *min,
        Criterion::StatusIs(status) => health.status == *status,
        Criterion::NoCriticalFailures => !health.consistency.has_critical_failure(),
    }
}

// ============================================================================
// BUILT-IN RECOVERY PLANS
// ============================================================================

/// Build the fixed plan for one failure kind. Step timeouts are seeded
/// from the kind's expected recovery time.
pub fn builtin_plan(kind: FailureKind) -> RecoveryPlan {
    let budget = kind.expected_recovery_time();
    match kind {
        FailureKind::AgentFailure => RecoveryPlan {
            scenario_kind: kind,
            steps: vec![
                RecoveryStep::new("backup-live", RecoveryAction::Backup)
                    .with_param("reason", serde_json::json!("pre-recovery-backup"))
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Escalate),
                RecoveryStep::new("reinitialize-failed-agents", RecoveryAction::Reinitialize)
                    .with_dependency("backup-live")
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("notify-operators", RecoveryAction::Notify)
                    .with_param("subject", serde_json::json!("agent reinitialized"))
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: vec![RecoveryStep::new(
                "restore-pre-recovery",
                RecoveryAction::Restore,
            )
            .with_timeout(budget)],
            validation_checks: vec![
                ValidationCheck {
                    id: "post-consistency".into(),
                    check_type: ValidationCheckType::Consistency,
                    routine: "analyze".into(),
                    pass_criteria: "no_critical_failures".into(),
                    critical: true,
                },
                ValidationCheck {
                    id: "storage-reachable".into(),
                    check_type: ValidationCheckType::Functionality,
                    routine: "storage-health".into(),
                    pass_criteria: "reachable".into(),
                    critical: false,
                },
            ],
            success_criteria: vec!["no_critical_failures".into(), "overall_score >= 0.8".into()],
        },

        FailureKind::SessionCorruption => RecoveryPlan {
            scenario_kind: kind,
            steps: vec![
                RecoveryStep::new("backup-live", RecoveryAction::Backup)
                    .with_param("reason", serde_json::json!("pre-recovery-backup"))
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Escalate),
                RecoveryStep::new("repair-session", RecoveryAction::Repair)
                    .with_param("target", serde_json::json!("session"))
                    .with_dependency("backup-live")
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("verify-session", RecoveryAction::Validate)
                    .with_param("min_score", serde_json::json!(0.9))
                    .with_dependency("repair-session")
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("notify-operators", RecoveryAction::Notify)
                    .with_param("subject", serde_json::json!("session registry repaired"))
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: vec![RecoveryStep::new(
                "restore-pre-recovery",
                RecoveryAction::Restore,
            )
            .with_timeout(budget)],
            validation_checks: vec![
                ValidationCheck {
                    id: "post-consistency".into(),
                    check_type: ValidationCheckType::Consistency,
                    routine: "analyze".into(),
                    pass_criteria: "overall_score >= 0.9".into(),
                    critical: true,
                },
                ValidationCheck {
                    id: "storage-reachable".into(),
                    check_type: ValidationCheckType::Functionality,
                    routine: "storage-health".into(),
                    pass_criteria: "reachable".into(),
                    critical: false,
                },
            ],
            success_criteria: vec!["no_critical_failures".into(), "overall_score >= 0.9".into()],
        },

        FailureKind::MemoryCorruption => RecoveryPlan {
            scenario_kind: kind,
            steps: vec![
                RecoveryStep::new("backup-live", RecoveryAction::Backup)
                    .with_param("reason", serde_json::json!("pre-recovery-backup"))
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Escalate),
                RecoveryStep::new("repair-memory-banks", RecoveryAction::Repair)
                    .with_param("target", serde_json::json!("memory"))
                    .with_dependency("backup-live")
                    .with_timeout(budget)
                    .with_retries(1)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("verify-banks", RecoveryAction::Validate)
                    .with_param("min_score", serde_json::json!(0.8))
                    .with_dependency("repair-memory-banks")
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("notify-operators", RecoveryAction::Notify)
                    .with_param("subject", serde_json::json!("memory banks repaired"))
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: vec![RecoveryStep::new(
                "restore-pre-recovery",
                RecoveryAction::Restore,
            )
            .with_timeout(budget)],
            validation_checks: vec![
                ValidationCheck {
                    id: "post-consistency".into(),
                    check_type: ValidationCheckType::Consistency,
                    routine: "analyze".into(),
                    pass_criteria: "no_critical_failures".into(),
                    critical: true,
                },
                ValidationCheck {
                    id: "snapshot-chain-intact".into(),
                    check_type: ValidationCheckType::Integrity,
                    routine: "snapshot-integrity".into(),
                    pass_criteria: "hash_matches".into(),
                    critical: false,
                },
                ValidationCheck {
                    id: "analysis-responsive".into(),
                    check_type: ValidationCheckType::Performance,
                    routine: "analysis-latency".into(),
                    pass_criteria: "under_5s".into(),
                    critical: false,
                },
            ],
            success_criteria: vec!["no_critical_failures".into(), "overall_score >= 0.8".into()],
        },

        FailureKind::PartialLoss => RecoveryPlan {
            scenario_kind: kind,
            steps: vec![
                RecoveryStep::new("backup-remnants", RecoveryAction::Backup)
                    .with_param("reason", serde_json::json!("partial-loss-remnants"))
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Continue),
                // "pre-run": the remnants backup above must not become the
                // restore source
                RecoveryStep::new("restore-latest", RecoveryAction::Restore)
                    .with_param("which", serde_json::json!("pre-run"))
                    .with_timeout(budget)
                    .with_retries(1)
                    .with_failure_mode(FailureMode::Escalate),
                RecoveryStep::new("verify-restored", RecoveryAction::Validate)
                    .with_param("min_score", serde_json::json!(0.9))
                    .with_dependency("restore-latest")
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("notify-operators", RecoveryAction::Notify)
                    .with_param("subject", serde_json::json!("partial loss restored"))
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: Vec::new(),
            validation_checks: vec![
                ValidationCheck {
                    id: "post-consistency".into(),
                    check_type: ValidationCheckType::Consistency,
                    routine: "analyze".into(),
                    pass_criteria: "overall_score >= 0.9".into(),
                    critical: true,
                },
                ValidationCheck {
                    id: "storage-reachable".into(),
                    check_type: ValidationCheckType::Functionality,
                    routine: "storage-health".into(),
                    pass_criteria: "reachable".into(),
                    critical: false,
                },
            ],
            success_criteria: vec!["no_critical_failures".into(), "overall_score >= 0.9".into()],
        },

        FailureKind::CompleteLoss => RecoveryPlan {
            scenario_kind: kind,
            steps: vec![
                // Storage is usually unreadable here; capturing remnants is
                // best-effort and must not block the restore.
                RecoveryStep::new("backup-remnants", RecoveryAction::Backup)
                    .with_param("reason", serde_json::json!("complete-loss-remnants"))
                    .with_timeout(Duration::from_secs(30))
                    .with_failure_mode(FailureMode::Continue),
                RecoveryStep::new("restore-latest", RecoveryAction::Restore)
                    .with_param("which", serde_json::json!("pre-run"))
                    .with_timeout(budget)
                    .with_retries(2)
                    .with_failure_mode(FailureMode::Escalate),
                RecoveryStep::new("verify-restored", RecoveryAction::Validate)
                    .with_param("min_score", serde_json::json!(0.9))
                    .with_dependency("restore-latest")
                    .with_timeout(budget)
                    .with_failure_mode(FailureMode::Rollback),
                RecoveryStep::new("notify-operators", RecoveryAction::Notify)
                    .with_param("subject", serde_json::json!("complete loss restored"))
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: Vec::new(),
            validation_checks: vec![
                ValidationCheck {
                    id: "post-consistency".into(),
                    check_type: ValidationCheckType::Consistency,
                    routine: "analyze".into(),
                    pass_criteria: "overall_score >= 0.9".into(),
                    critical: true,
                },
                ValidationCheck {
                    id: "snapshot-chain-intact".into(),
                    check_type: ValidationCheckType::Integrity,
                    routine: "snapshot-integrity".into(),
                    pass_criteria: "hash_matches".into(),
                    critical: false,
                },
                ValidationCheck {
                    id: "storage-reachable".into(),
                    check_type: ValidationCheckType::Functionality,
                    routine: "storage-health".into(),
                    pass_criteria: "reachable".into(),
                    critical: false,
                },
            ],
            success_criteria: vec!["no_critical_failures".into(), "status == healthy".into()],
        },
    }
}

// ============================================================================
// STEP ORDERING
// ============================================================================

/// Topologically order steps by their dependencies.
///
/// Stable: among steps whose dependencies are satisfied, declaration order
/// wins, so execution is deterministic. Unknown dependencies and cycles
/// are plan configuration errors.
pub fn topological_order(steps: &[RecoveryStep]) -> Result<Vec<usize>, RecoveryError> {
    let index_by_id: BTreeMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    for step in steps {
        for dep in &step.dependencies {
            if !index_by_id.contains_key(dep.as_str()) {
                return Err(RecoveryError::InvalidPlan {
                    reason: format!("step {} depends on unknown step {dep}", step.id),
                });
            }
        }
    }

    let mut placed: HashSet<usize> = HashSet::new();
    let mut order = Vec::with_capacity(steps.len());

    while order.len() < steps.len() {
        let next = steps.iter().enumerate().position(|(i, step)| {
            !placed.contains(&i)
                && step
                    .dependencies
                    .iter()
                    .all(|dep| placed.contains(&index_by_id[dep.as_str()]))
        });
        match next {
            Some(i) => {
                placed.insert(i);
                order.push(i);
            }
            None => {
                return Err(RecoveryError::InvalidPlan {
                    reason: "dependency cycle among recovery steps".to_string(),
                })
            }
        }
    }

    Ok(order)
}

// ============================================================================
// WORKFLOW REGISTRY
// ============================================================================

/// Registry of recovery plans keyed by failure kind.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    plans: BTreeMap<FailureKind, RecoveryPlan>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the five built-in plans. Idempotent: calling twice leaves
    /// exactly five plans, re-registering overwrites in place.
    pub fn initialize_builtin_plans(&mut self) {
        for kind in FailureKind::ALL {
            self.plans.insert(kind, builtin_plan(kind));
        }
    }

    /// Replace the plan for one failure kind.
    pub fn register(&mut self, plan: RecoveryPlan) {
        self.plans.insert(plan.scenario_kind, plan);
    }

    pub fn plan_for(&self, kind: FailureKind) -> Option<&RecoveryPlan> {
        self.plans.get(&kind)
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Executes recovery runs: classify, plan, interpret steps, validate,
/// roll back on failure.
pub struct RecoveryOrchestrator {
    accessor: Arc<dyn StorageAccessor>,
    analyzer: Arc<ConsistencyAnalyzer>,
    snapshots: SnapshotManager,
    notifier: Arc<dyn Notifier>,
    config: RecoveryConfig,
    registry: std::sync::RwLock<WorkflowRegistry>,
    run_lock: tokio::sync::Mutex<()>,
    history: std::sync::Mutex<Vec<RecoveryResult>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        accessor: Arc<dyn StorageAccessor>,
        analyzer: Arc<ConsistencyAnalyzer>,
        snapshots: SnapshotManager,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            accessor,
            analyzer,
            snapshots,
            notifier: Arc::new(NoopNotifier),
            config,
            registry: std::sync::RwLock::new(WorkflowRegistry::new()),
            run_lock: tokio::sync::Mutex::new(()),
            history: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Inject a notification collaborator.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register the five built-in recovery plans. Idempotent.
    pub fn initialize_recovery_workflows(&self) {
        let mut registry = match self.registry.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.initialize_builtin_plans();
        tracing::info!(plans = registry.plan_count(), "Recovery workflows registered");
    }

    /// Number of registered plans.
    pub fn registered_plan_count(&self) -> usize {
        match self.registry.read() {
            Ok(registry) => registry.plan_count(),
            Err(poisoned) => poisoned.into_inner().plan_count(),
        }
    }

    /// Replace one plan (used by deployments with custom workflows).
    pub fn register_plan(&self, plan: RecoveryPlan) {
        let mut registry = match self.registry.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.register(plan);
    }

    /// Restore a snapshot under the recovery lock.
    ///
    /// Manual restores share the mutual-exclusion domain of recovery runs:
    /// two restores can never interleave writes, and a restore cannot run
    /// underneath an active recovery. Rejects with `AlreadyInProgress`.
    pub async fn restore_snapshot(
        &self,
        reference: Option<SnapshotRef>,
    ) -> ReclaimResult<reclaim_core::RestoreResult> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| ReclaimError::Recovery(RecoveryError::AlreadyInProgress))?;
        let result = self.snapshots.restore_snapshot(reference).await?;
        if result.success {
            self.analyzer.reset_watermarks();
        }
        Ok(result)
    }

    /// Results of recent recovery runs, most recent last.
    pub fn recent_runs(&self) -> Vec<RecoveryResult> {
        match self.history.lock() {
            Ok(history) => history.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Classify the current state into a failure scenario, if any.
    ///
    /// Deterministic precedence: CompleteLoss, then PartialLoss, then
    /// SessionCorruption, then MemoryCorruption, then AgentFailure. A clean
    /// report classifies as no scenario.
    pub async fn classify(&self, report: &ConsistencyReport) -> Option<FailureScenario> {
        // Accessor unreachable: the analyzer degrades to an empty report
        // with score zero.
        if report.per_check_results.is_empty() && report.overall_score == 0.0 {
            return Some(FailureScenario::new(
                FailureKind::CompleteLoss,
                ["storage".to_string()].into(),
            ));
        }

        // Empty live state with prior snapshots is the complete-loss
        // signature: state existed and is gone.
        if let Ok(stats) = self.accessor.statistics().await {
            if stats.agent_count == 0 && stats.snapshot_count > 0 {
                return Some(FailureScenario::new(
                    FailureKind::CompleteLoss,
                    ["storage".to_string(), "agents".to_string()].into(),
                ));
            }
        }

        let stale: BTreeSet<String> = report
            .check(check_ids::HEARTBEAT_FRESHNESS)
            .map(|c| c.failing.iter().cloned().collect())
            .unwrap_or_default();
        if stale.len() >= self.config.partial_loss_agent_threshold {
            return Some(FailureScenario::new(FailureKind::PartialLoss, stale));
        }

        if let Some(registry) = report.check(check_ids::REGISTRY_CONSISTENCY) {
            if !registry.passed {
                return Some(FailureScenario::new(
                    FailureKind::SessionCorruption,
                    registry.failing.iter().cloned().collect(),
                ));
            }
        }

        if let Some(banks) = report.check(check_ids::MEMORY_BANK_INTEGRITY) {
            if !banks.passed {
                return Some(FailureScenario::new(
                    FailureKind::MemoryCorruption,
                    banks.failing.iter().cloned().collect(),
                ));
            }
        }

        let failed: BTreeSet<String> = report
            .per_check_results
            .iter()
            .filter(|c| !c.passed)
            .flat_map(|c| c.failing.iter().cloned())
            .collect();
        if !failed.is_empty() {
            return Some(FailureScenario::new(FailureKind::AgentFailure, failed));
        }

        None
    }

    /// Execute one recovery run.
    ///
    /// With no scenario supplied, the current state is analyzed and
    /// classified first; a clean state yields a successful no-op result.
    /// Rejects immediately with `AlreadyInProgress` while another run is
    /// active.
    pub async fn execute_recovery(
        &self,
        scenario: Option<FailureScenario>,
    ) -> ReclaimResult<RecoveryResult> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| ReclaimError::Recovery(RecoveryError::AlreadyInProgress))?;

        let started_at = Utc::now();
        let mut phase = RunPhase::Detecting;
        tracing::info!(?phase, "Recovery run started");

        let scenario = match scenario {
            Some(scenario) => scenario,
            None => {
                let report = self.analyzer.analyze().await;
                match self.classify(&report).await {
                    Some(scenario) => scenario,
                    None => {
                        tracing::info!("Recovery run found nothing to recover");
                        let result = RecoveryResult::nothing_to_do(started_at);
                        self.push_history(result.clone());
                        return Ok(result);
                    }
                }
            }
        };

        tracing::warn!(
            kind = %scenario.kind,
            severity = ?scenario.severity,
            affected = ?scenario.affected_components,
            "Failure scenario selected for recovery"
        );

        let plan = {
            let registry = match self.registry.read() {
                Ok(registry) => registry,
                Err(poisoned) => poisoned.into_inner(),
            };
            registry
                .plan_for(scenario.kind)
                .cloned()
                .ok_or(ReclaimError::Recovery(RecoveryError::UnknownPlan {
                    kind: scenario.kind,
                }))?
        };
        phase = RunPhase::PlanSelected;
        tracing::debug!(?phase, steps = plan.steps.len(), "Recovery plan resolved");

        // Snapshot reference frozen before any step runs, so in-run backups
        // never become the restore source for this run's restore steps
        let pre_run_latest = match self.accessor.snapshot_latest().await {
            Ok(Some(snapshot)) => Some(snapshot.snapshot_id),
            _ => None,
        };

        let order = topological_order(&plan.steps).map_err(ReclaimError::Recovery)?;
        phase = RunPhase::Executing;
        tracing::debug!(?phase, "Executing recovery steps");

        let mut step_outcomes: Vec<StepOutcome> = Vec::with_capacity(plan.steps.len());
        let mut issues: Vec<String> = Vec::new();
        let mut succeeded_steps: HashSet<String> = HashSet::new();
        let mut rolled_back = false;

        for (position, &index) in order.iter().enumerate() {
            let step = &plan.steps[index];

            if !step.dependencies.iter().all(|d| succeeded_steps.contains(d)) {
                step_outcomes.push(StepOutcome {
                    step_id: step.id.clone(),
                    action: step.action,
                    status: StepStatus::Skipped,
                    attempts: 0,
                    detail: "unmet dependency".to_string(),
                });
                continue;
            }

            let outcome = self.run_step(step, &scenario, pre_run_latest).await;
            let failed = outcome.status != StepStatus::Succeeded;
            if !failed {
                succeeded_steps.insert(step.id.clone());
            }
            step_outcomes.push(outcome.clone());

            if failed {
                issues.push(format!("step {} failed: {}", step.id, outcome.detail));
                match step.failure_mode {
                    FailureMode::Continue => {
                        tracing::warn!(step = %step.id, "Step failed, continuing per failure mode");
                    }
                    FailureMode::Rollback => {
                        phase = RunPhase::RollingBack;
                        tracing::warn!(step = %step.id, ?phase, "Step failed, rolling back");
                        // Steps never reached are recorded as skipped
                        for &rest in &order[position + 1..] {
                            let rest = &plan.steps[rest];
                            step_outcomes.push(StepOutcome {
                                step_id: rest.id.clone(),
                                action: rest.action,
                                status: StepStatus::Skipped,
                                attempts: 0,
                                detail: "forward execution aborted".to_string(),
                            });
                        }
                        self.run_rollback(&plan, &scenario, pre_run_latest, &mut step_outcomes, &mut issues)
                            .await;
                        rolled_back = true;
                        break;
                    }
                    FailureMode::Escalate => {
                        tracing::error!(step = %step.id, detail = %outcome.detail, "Step escalated");
                        let error = if outcome.status == StepStatus::TimedOut {
                            RecoveryError::StepTimeout {
                                step_id: step.id.clone(),
                                timeout: step.timeout,
                            }
                        } else {
                            RecoveryError::StepFailed {
                                step_id: step.id.clone(),
                                reason: outcome.detail,
                            }
                        };
                        return Err(ReclaimError::Recovery(error));
                    }
                }
            }
        }

        let mut validation_outcomes = Vec::new();
        if !rolled_back {
            phase = RunPhase::Validating;
            tracing::debug!(?phase, checks = plan.validation_checks.len(), "Running validation checks");
            for check in &plan.validation_checks {
                let outcome = self.run_validation_check(check).await;
                let critical_failure = check.critical && !outcome.passed;
                validation_outcomes.push(outcome);
                if critical_failure {
                    // Success of steps does not imply success of the plan: a
                    // failed critical check always forces a rollback.
                    issues.push(
                        RecoveryError::CriticalValidationFailed {
                            check_id: check.id.clone(),
                        }
                        .to_string(),
                    );
                    phase = RunPhase::RollingBack;
                    tracing::debug!(?phase, check = %check.id, "Critical validation failure");
                    self.run_rollback(&plan, &scenario, pre_run_latest, &mut step_outcomes, &mut issues)
                        .await;
                    rolled_back = true;
                    break;
                }
            }
        }

        let mut unmet_criteria = Vec::new();
        let success = if rolled_back {
            false
        } else {
            let health = derive_health_report(
                self.analyzer.analyze().await,
                self.config.healthy_score_threshold,
                false,
            );
            for text in &plan.success_criteria {
                match parse_criterion(text) {
                    Some(criterion) if criterion_holds(&criterion, &health) => {}
                    Some(_) => unmet_criteria.push(text.clone()),
                    None => {
                        issues.push(format!("unparseable success criterion: {text}"));
                        unmet_criteria.push(text.clone());
                    }
                }
            }
            unmet_criteria.is_empty()
        };

        let final_phase = if success {
            RunPhase::Succeeded
        } else {
            RunPhase::Terminal
        };
        tracing::info!(kind = %scenario.kind, success, ?final_phase, "Recovery run finished");

        let result = RecoveryResult {
            scenario: Some(scenario),
            final_phase,
            success,
            step_outcomes,
            validation_outcomes,
            unmet_criteria,
            issues,
            started_at,
            finished_at: Utc::now(),
        };
        self.push_history(result.clone());
        Ok(result)
    }

    fn push_history(&self, result: RecoveryResult) {
        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push(result);
        let excess = history.len().saturating_sub(self.config.max_history);
        if excess > 0 {
            history.drain(..excess);
        }
    }

    /// Run rollback steps in reverse order through the same step engine.
    /// Rollback failures are recorded but never cascade into a second
    /// rollback.
    async fn run_rollback(
        &self,
        plan: &RecoveryPlan,
        scenario: &FailureScenario,
        pre_run_latest: Option<SnapshotId>,
        step_outcomes: &mut Vec<StepOutcome>,
        issues: &mut Vec<String>,
    ) {
        for step in plan.rollback_steps.iter().rev() {
            let outcome = self.run_step(step, scenario, pre_run_latest).await;
            if outcome.status != StepStatus::Succeeded {
                issues.push(format!(
                    "rollback step {} failed: {}",
                    step.id, outcome.detail
                ));
            }
            step_outcomes.push(outcome);
        }
    }

    /// Execute one step with its timeout and retry budget. Retries reuse
    /// identical parameters and never start before the previous attempt
    /// has completed.
    async fn run_step(
        &self,
        step: &RecoveryStep,
        scenario: &FailureScenario,
        pre_run_latest: Option<SnapshotId>,
    ) -> StepOutcome {
        let max_attempts = step.retry_count + 1;
        let mut last_detail = String::new();
        let mut last_status = StepStatus::Failed;

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(
                step.timeout,
                self.apply_action(step, scenario, pre_run_latest),
            )
            .await
            {
                Ok(Ok(detail)) => {
                    return StepOutcome {
                        step_id: step.id.clone(),
                        action: step.action,
                        status: StepStatus::Succeeded,
                        attempts: attempt,
                        detail,
                    };
                }
                Ok(Err(reason)) => {
                    tracing::warn!(step = %step.id, attempt, reason = %reason, "Step attempt failed");
                    last_detail = reason;
                    last_status = StepStatus::Failed;
                }
                Err(_) => {
                    tracing::warn!(step = %step.id, attempt, timeout = ?step.timeout, "Step attempt timed out");
                    last_detail = format!("timed out after {:?}", step.timeout);
                    last_status = StepStatus::TimedOut;
                }
            }
        }

        StepOutcome {
            step_id: step.id.clone(),
            action: step.action,
            status: last_status,
            attempts: max_attempts,
            detail: last_detail,
        }
    }

    /// Interpret one step action. The action set is closed; the match is
    /// exhaustive.
    async fn apply_action(
        &self,
        step: &RecoveryStep,
        scenario: &FailureScenario,
        pre_run_latest: Option<SnapshotId>,
    ) -> Result<String, String> {
        match step.action {
            RecoveryAction::Backup => {
                let reason = step.param_str("reason").unwrap_or("pre-recovery-backup");
                let snapshot = self
                    .snapshots
                    .create_snapshot(reason)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("snapshot {} created", snapshot.snapshot_id))
            }

            RecoveryAction::Restore => {
                let reference = if let Some(raw) = step.param_str("snapshot_ref") {
                    Some(SnapshotRef::Id(
                        Uuid::from_str(raw).map_err(|e| format!("bad snapshot_ref: {e}"))?,
                    ))
                } else if step.param_str("which") == Some("pre-run") {
                    match pre_run_latest {
                        Some(id) => Some(SnapshotRef::Id(id)),
                        None => return Err("no pre-run snapshot available".to_string()),
                    }
                } else {
                    None
                };
                let result = self
                    .snapshots
                    .restore_snapshot(reference)
                    .await
                    .map_err(|e| e.to_string())?;
                if result.success {
                    // Restored heartbeats may legitimately predate the
                    // analyzer's observed high-water marks.
                    self.analyzer.reset_watermarks();
                    Ok(format!(
                        "restored {} agents from snapshot {}",
                        result.restored_agents,
                        result
                            .snapshot_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                    ))
                } else {
                    Err(result.errors.join("; "))
                }
            }

            RecoveryAction::Validate => {
                let min_score = step
                    .parameters
                    .get("min_score")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(self.config.healthy_score_threshold);
                let report = self.analyzer.analyze().await;
                if report.has_critical_failure() {
                    Err(format!(
                        "critical checks failing: {:?}",
                        report.failed_check_ids()
                    ))
                } else if report.overall_score < min_score {
                    Err(format!(
                        "score {:.3} below required {min_score:.3}",
                        report.overall_score
                    ))
                } else {
                    Ok(format!("score {:.3}", report.overall_score))
                }
            }

            RecoveryAction::Reinitialize => self.reinitialize_agents(step, scenario).await,

            RecoveryAction::Repair => match step.param_str("target") {
                Some("session") => self.repair_session().await,
                Some("memory") => self.repair_memory_banks().await,
                other => Err(format!("unknown repair target: {other:?}")),
            },

            RecoveryAction::Notify => {
                let subject = step.param_str("subject").unwrap_or("recovery event");
                let body = format!(
                    "scenario {} affecting {:?}",
                    scenario.kind, scenario.affected_components
                );
                match self.notifier.notify(subject, &body).await {
                    Ok(()) => Ok("notification sent".to_string()),
                    // Best-effort: delivery failure never fails the run
                    Err(e) => Ok(format!("notification delivery failed: {e}")),
                }
            }
        }
    }

    /// Re-register baseline records for the targeted agents: role spec
    /// retained, memory bank and coordination state cleared.
    async fn reinitialize_agents(
        &self,
        step: &RecoveryStep,
        scenario: &FailureScenario,
    ) -> Result<String, String> {
        let now = Utc::now();
        let mut targets: Vec<AgentId> = Vec::new();

        if let Some(raw) = step.param_str("agent_id") {
            targets.push(Uuid::from_str(raw).map_err(|e| format!("bad agent_id: {e}"))?);
        } else {
            for component in &scenario.affected_components {
                if let Some(raw) = component.strip_prefix("agent:") {
                    if let Ok(id) = Uuid::from_str(raw) {
                        targets.push(id);
                    }
                }
            }
        }

        if targets.is_empty() {
            return Ok("no agents required reinitialization".to_string());
        }

        let mut reinitialized = 0usize;
        let mut session = self.accessor.session_get().await.map_err(|e| e.to_string())?;
        let mut session_dirty = false;

        for id in &targets {
            match self.accessor.agent_get(*id).await.map_err(|e| e.to_string())? {
                Some(record) => {
                    let fresh = record.reinitialized(now);
                    if session.registry.get(id) != Some(&fresh.role_spec) {
                        session.registry.insert(*id, fresh.role_spec.clone());
                        session_dirty = true;
                    }
                    self.accessor
                        .agent_upsert(&fresh)
                        .await
                        .map_err(|e| e.to_string())?;
                    reinitialized += 1;
                }
                None => {
                    return Err(format!("agent {id} has no record to reinitialize"));
                }
            }
        }

        if session_dirty {
            self.accessor
                .session_put(&session)
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok(format!("reinitialized {reinitialized} agents"))
    }

    /// Structurally repair the session: re-register agents whose records
    /// survive, drop channel participants and task assignments that
    /// reference agents with no record, and deduplicate task queues.
    async fn repair_session(&self) -> Result<String, String> {
        let mut session = self.accessor.session_get().await.map_err(|e| e.to_string())?;
        let mut repairs = 0usize;

        let dangling: Vec<AgentId> = session
            .referenced_agent_ids()
            .into_iter()
            .filter(|id| !session.registry.contains_key(id))
            .collect();

        for id in dangling {
            match self.accessor.agent_get(id).await.map_err(|e| e.to_string())? {
                // The record survives; only the registry entry was lost
                Some(record) => {
                    session.registry.insert(id, record.role_spec.clone());
                    repairs += 1;
                }
                // No record anywhere: remove every reference
                None => {
                    for channel in session.coordination_channels.values_mut() {
                        if channel.participants.remove(&id) {
                            repairs += 1;
                        }
                    }
                    for queue in [
                        &mut session.task_queues.pending,
                        &mut session.task_queues.active,
                        &mut session.task_queues.completed,
                        &mut session.task_queues.blocked,
                    ] {
                        for task in queue.iter_mut() {
                            if task.assigned_to == Some(id) {
                                task.assigned_to = None;
                                repairs += 1;
                            }
                        }
                    }
                }
            }
        }

        // A task must live in exactly one queue; keep the first occurrence
        let mut seen: BTreeSet<Uuid> = BTreeSet::new();
        for queue in [
            &mut session.task_queues.pending,
            &mut session.task_queues.active,
            &mut session.task_queues.completed,
            &mut session.task_queues.blocked,
        ] {
            let before = queue.len();
            queue.retain(|task| seen.insert(task.task_id));
            repairs += before - queue.len();
        }

        self.accessor
            .session_put(&session)
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("session repaired: {repairs} corrections"))
    }

    /// Schema-guided in-place repair of malformed memory bank entries:
    /// parseable-but-misversioned entries are rewrapped under the current
    /// schema, bare values are wrapped, null or hopeless entries dropped.
    async fn repair_memory_banks(&self) -> Result<String, String> {
        let now = Utc::now();
        let agents = self.accessor.agent_list().await.map_err(|e| e.to_string())?;
        let mut rewrapped = 0usize;
        let mut dropped = 0usize;

        for mut agent in agents {
            let bad = agent.malformed_bank_keys();
            if bad.is_empty() {
                continue;
            }
            for (key, _) in bad {
                let Some(raw) = agent.memory_bank.get(&key).cloned() else {
                    continue;
                };
                let salvage = match raw {
                    serde_json::Value::Null => None,
                    serde_json::Value::Object(ref fields) => {
                        // A misversioned or partially-shaped entry keeps its
                        // inner value when one is present
                        match fields.get("value") {
                            Some(value) if !value.is_null() => Some(value.clone()),
                            Some(_) => None,
                            None => Some(raw.clone()),
                        }
                    }
                    other => Some(other),
                };
                match salvage {
                    Some(value) => {
                        agent.memory_bank.insert(
                            key,
                            serde_json::to_value(MemoryEntry::new(value, now))
                                .map_err(|e| e.to_string())?,
                        );
                        rewrapped += 1;
                    }
                    None => {
                        agent.memory_bank.remove(&key);
                        dropped += 1;
                    }
                }
            }
            self.accessor
                .agent_upsert(&agent)
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok(format!(
            "memory banks repaired: {rewrapped} entries rewrapped, {dropped} dropped"
        ))
    }

    /// Run one post-execution validation check routine.
    async fn run_validation_check(&self, check: &ValidationCheck) -> ValidationOutcome {
        let (passed, detail) = match check.routine.as_str() {
            "analyze" => {
                let health = derive_health_report(
                    self.analyzer.analyze().await,
                    self.config.healthy_score_threshold,
                    false,
                );
                match parse_criterion(&check.pass_criteria) {
                    Some(criterion) => (
                        criterion_holds(&criterion, &health),
                        format!(
                            "score {:.3}, status {}",
                            health.consistency.overall_score, health.status
                        ),
                    ),
                    None => (false, format!("unparseable criteria: {}", check.pass_criteria)),
                }
            }
            "storage-health" => match self.accessor.health_check().await {
                Ok(reachable) => (reachable, format!("storage reachable: {reachable}")),
                Err(e) => (false, e.to_string()),
            },
            "snapshot-integrity" => match self.accessor.snapshot_latest().await {
                Ok(Some(snapshot)) => {
                    let ok = reclaim_core::compute_payload_hash(&snapshot.payload)
                        == snapshot.integrity_hash;
                    (ok, format!("latest snapshot hash verified: {ok}"))
                }
                Ok(None) => (true, "no snapshot to verify".to_string()),
                Err(e) => (false, e.to_string()),
            },
            "analysis-latency" => {
                let start = std::time::Instant::now();
                let _ = self.analyzer.analyze().await;
                let elapsed = start.elapsed();
                (
                    elapsed < Duration::from_secs(5),
                    format!("analysis completed in {elapsed:?}"),
                )
            }
            other => (false, format!("unknown validation routine: {other}")),
        };

        ValidationOutcome {
            check_id: check.id.clone(),
            passed,
            critical: check.critical,
            detail,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_analyzer::AnalyzerConfig;
    use reclaim_core::{
        AgentRecord, CoordinationChannel, RoleSpec, SessionState, TaskDescriptor,
    };
    use reclaim_storage::InMemoryAccessor;

    fn orchestrator(accessor: &InMemoryAccessor) -> RecoveryOrchestrator {
        let shared: Arc<dyn StorageAccessor> = Arc::new(accessor.clone());
        let analyzer = Arc::new(ConsistencyAnalyzer::new(
            shared.clone(),
            AnalyzerConfig::default(),
        ));
        let orchestrator = RecoveryOrchestrator::new(
            shared.clone(),
            analyzer,
            SnapshotManager::new(shared),
            RecoveryConfig::default(),
        );
        orchestrator.initialize_recovery_workflows();
        orchestrator
    }

    async fn seed_pair(accessor: &InMemoryAccessor) -> (AgentRecord, AgentRecord) {
        let now = Utc::now();
        let mut a = AgentRecord::new(RoleSpec::new("coder", vec![]), now);
        a.write_memory("focus", serde_json::json!({"task": "T1"}), now);
        let b = AgentRecord::new(RoleSpec::new("reviewer", vec![]), now);

        let mut session = SessionState::default();
        session.registry.insert(a.agent_id, a.role_spec.clone());
        session.registry.insert(b.agent_id, b.role_spec.clone());
        session
            .task_queues
            .active
            .push(TaskDescriptor::new("T1", now).with_assignee(a.agent_id));
        session.coordination_channels.insert(
            "ch-main".into(),
            CoordinationChannel {
                participants: [a.agent_id, b.agent_id].into_iter().collect(),
                last_activity: now,
            },
        );

        accessor.agent_upsert(&a).await.unwrap();
        accessor.agent_upsert(&b).await.unwrap();
        accessor.session_put(&session).await.unwrap();
        (a, b)
    }

    #[test]
    fn test_topological_order_is_declaration_order_when_possible() {
        let steps = vec![
            RecoveryStep::new("a", RecoveryAction::Backup),
            RecoveryStep::new("b", RecoveryAction::Repair).with_dependency("a"),
            RecoveryStep::new("c", RecoveryAction::Notify),
        ];
        assert_eq!(topological_order(&steps).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let steps = vec![
            RecoveryStep::new("validate", RecoveryAction::Validate).with_dependency("restore"),
            RecoveryStep::new("restore", RecoveryAction::Restore),
        ];
        assert_eq!(topological_order(&steps).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_topological_order_rejects_cycles_and_unknowns() {
        let cyclic = vec![
            RecoveryStep::new("a", RecoveryAction::Backup).with_dependency("b"),
            RecoveryStep::new("b", RecoveryAction::Repair).with_dependency("a"),
        ];
        assert!(matches!(
            topological_order(&cyclic),
            Err(RecoveryError::InvalidPlan { .. })
        ));

        let unknown = vec![RecoveryStep::new("a", RecoveryAction::Backup).with_dependency("ghost")];
        assert!(matches!(
            topological_order(&unknown),
            Err(RecoveryError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_criterion_parsing() {
        assert_eq!(
            parse_criterion("overall_score >= 0.9"),
            Some(Criterion::ScoreGte(0.9))
        );
        assert_eq!(
            parse_criterion("status == healthy"),
            Some(Criterion::StatusIs(HealthStatus::Healthy))
        );
        assert_eq!(
            parse_criterion("no_critical_failures"),
            Some(Criterion::NoCriticalFailures)
        );
        assert_eq!(parse_criterion("score is nice"), None);
    }

    #[tokio::test]
    async fn test_initialize_recovery_workflows_is_idempotent() {
        let accessor = InMemoryAccessor::new();
        let orchestrator = orchestrator(&accessor);

        assert_eq!(orchestrator.registered_plan_count(), 5);
        orchestrator.initialize_recovery_workflows();
        assert_eq!(orchestrator.registered_plan_count(), 5);
    }

    #[tokio::test]
    async fn test_every_builtin_plan_has_a_valid_step_graph() {
        for kind in FailureKind::ALL {
            let plan = builtin_plan(kind);
            assert_eq!(plan.scenario_kind, kind);
            assert!(topological_order(&plan.steps).is_ok(), "{kind}");
            assert!(!plan.success_criteria.is_empty(), "{kind}");
            for criterion in &plan.success_criteria {
                assert!(parse_criterion(criterion).is_some(), "{kind}: {criterion}");
            }
        }
    }

    #[tokio::test]
    async fn test_clean_state_classifies_as_no_scenario() {
        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);

        let report = ConsistencyAnalyzer::new(
            Arc::new(accessor.clone()),
            AnalyzerConfig::default(),
        )
        .analyze()
        .await;
        assert!(orchestrator.classify(&report).await.is_none());

        let result = orchestrator.execute_recovery(None).await.unwrap();
        assert!(result.success);
        assert!(result.scenario.is_none());
        assert!(result.step_outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_dangling_registry_entry_classifies_as_session_corruption() {
        let accessor = InMemoryAccessor::new();
        let (_, b) = seed_pair(&accessor).await;

        let mut session = accessor.session_get().await.unwrap();
        session.registry.remove(&b.agent_id);
        accessor.session_put(&session).await.unwrap();

        let orchestrator = orchestrator(&accessor);
        let report = ConsistencyAnalyzer::new(
            Arc::new(accessor.clone()),
            AnalyzerConfig::default(),
        )
        .analyze()
        .await;
        let scenario = orchestrator.classify(&report).await.unwrap();
        assert_eq!(scenario.kind, FailureKind::SessionCorruption);
        assert!(scenario
            .affected_components
            .contains(&format!("agent:{}", b.agent_id)));
    }

    #[tokio::test]
    async fn test_end_to_end_session_corruption_recovery() {
        let accessor = InMemoryAccessor::new();
        let (_, b) = seed_pair(&accessor).await;

        // Simulate corruption: B vanishes from the registry while the
        // channel still lists it
        let mut session = accessor.session_get().await.unwrap();
        session.registry.remove(&b.agent_id);
        accessor.session_put(&session).await.unwrap();

        let orchestrator = orchestrator(&accessor);
        let before = orchestrator.analyzer.analyze().await;
        assert!(before.overall_score < 0.5);
        assert!(before
            .issues
            .iter()
            .any(|i| i.contains("registry consistency violation")));

        let result = orchestrator.execute_recovery(None).await.unwrap();
        assert!(result.success, "issues: {:?}", result.issues);
        assert_eq!(
            result.scenario.as_ref().unwrap().kind,
            FailureKind::SessionCorruption
        );
        assert_eq!(result.final_phase, RunPhase::Succeeded);

        let after = orchestrator.analyzer.analyze().await;
        assert!(after.overall_score >= 0.9, "score {}", after.overall_score);

        // No dangling reference: B's record survived, so the repair put it
        // back into the registry
        let session = accessor.session_get().await.unwrap();
        assert!(session.registry.contains_key(&b.agent_id));
    }

    #[tokio::test]
    async fn test_session_repair_removes_references_to_lost_agents() {
        let accessor = InMemoryAccessor::new();
        let now = Utc::now();
        let a = AgentRecord::new(RoleSpec::new("coder", vec![]), now);
        let ghost = reclaim_core::new_entity_id();

        let mut session = SessionState::default();
        session.registry.insert(a.agent_id, a.role_spec.clone());
        session
            .task_queues
            .pending
            .push(TaskDescriptor::new("T-ghost", now).with_assignee(ghost));
        session.coordination_channels.insert(
            "ch".into(),
            CoordinationChannel {
                participants: [a.agent_id, ghost].into_iter().collect(),
                last_activity: now,
            },
        );
        accessor.agent_upsert(&a).await.unwrap();
        accessor.session_put(&session).await.unwrap();

        let orchestrator = orchestrator(&accessor);
        let result = orchestrator.execute_recovery(None).await.unwrap();
        assert!(result.success, "issues: {:?}", result.issues);

        let session = accessor.session_get().await.unwrap();
        assert!(!session.registry.contains_key(&ghost));
        assert!(session.referenced_agent_ids().iter().all(|id| *id != ghost));
    }

    #[tokio::test]
    async fn test_memory_corruption_is_repaired_in_place() {
        let accessor = InMemoryAccessor::new();
        let (a, _) = seed_pair(&accessor).await;

        let mut damaged = accessor.agent_get(a.agent_id).await.unwrap().unwrap();
        damaged
            .memory_bank
            .insert("junk".into(), serde_json::json!("bare crash residue"));
        damaged.memory_bank.insert("gone".into(), serde_json::Value::Null);
        accessor.agent_upsert(&damaged).await.unwrap();

        let orchestrator = orchestrator(&accessor);
        let result = orchestrator.execute_recovery(None).await.unwrap();
        assert!(result.success, "issues: {:?}", result.issues);
        assert_eq!(
            result.scenario.as_ref().unwrap().kind,
            FailureKind::MemoryCorruption
        );

        let repaired = accessor.agent_get(a.agent_id).await.unwrap().unwrap();
        assert!(repaired.malformed_bank_keys().is_empty());
        // The bare value was rewrapped, the null entry dropped
        assert!(repaired.memory_bank.contains_key("junk"));
        assert!(!repaired.memory_bank.contains_key("gone"));
    }

    #[tokio::test]
    async fn test_end_to_end_complete_loss_recovery() {
        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);

        orchestrator
            .snapshots
            .create_snapshot("pre-change")
            .await
            .unwrap();

        // Storage returns empty for all reads
        accessor.clear_all();

        let result = orchestrator.execute_recovery(None).await.unwrap();
        assert!(result.success, "issues: {:?}", result.issues);
        assert_eq!(
            result.scenario.as_ref().unwrap().kind,
            FailureKind::CompleteLoss
        );

        let health = derive_health_report(
            orchestrator.analyzer.analyze().await,
            orchestrator.config.healthy_score_threshold,
            false,
        );
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(accessor.load_state().await.unwrap().agent_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_accessor_escalates_complete_loss() {
        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);
        orchestrator.snapshots.create_snapshot("last-good").await.unwrap();
        accessor.set_unavailable(true);

        // Classified as CompleteLoss; the restore step cannot reach
        // storage and escalates
        let err = orchestrator.execute_recovery(None).await.unwrap_err();
        assert!(matches!(
            err,
            ReclaimError::Recovery(
                RecoveryError::StepFailed { .. } | RecoveryError::StepTimeout { .. }
            )
        ));
    }

    #[tokio::test]
    async fn test_critical_validation_failure_forces_rollback() {
        let accessor = InMemoryAccessor::new();
        let (a, _) = seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);

        // Stale agent so classification lands on AgentFailure, with a plan
        // whose critical validation can never pass
        let mut stale = accessor.agent_get(a.agent_id).await.unwrap().unwrap();
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(30);
        accessor.agent_upsert(&stale).await.unwrap();

        let mut plan = builtin_plan(FailureKind::AgentFailure);
        plan.validation_checks = vec![ValidationCheck {
            id: "impossible".into(),
            check_type: ValidationCheckType::Consistency,
            routine: "analyze".into(),
            pass_criteria: "overall_score >= 2.0".into(),
            critical: true,
        }];
        orchestrator.register_plan(plan);

        let result = orchestrator.execute_recovery(None).await.unwrap();
        assert!(!result.success);
        assert!(result
            .issues
            .iter()
            .any(|i| i.contains("Critical validation check")));
        // The rollback restore ran
        assert!(result
            .step_outcomes
            .iter()
            .any(|o| o.step_id == "restore-pre-recovery" && o.status == StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_continue_mode_records_failure_and_proceeds() {
        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);

        // Restore with no snapshot fails; continue mode must not abort
        let plan = RecoveryPlan {
            scenario_kind: FailureKind::AgentFailure,
            steps: vec![
                RecoveryStep::new("doomed-restore", RecoveryAction::Restore)
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
                RecoveryStep::new("still-runs", RecoveryAction::Validate)
                    .with_param("min_score", serde_json::json!(0.5))
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: Vec::new(),
            validation_checks: Vec::new(),
            success_criteria: vec!["no_critical_failures".into()],
        };
        orchestrator.register_plan(plan);

        let scenario = FailureScenario::new(FailureKind::AgentFailure, BTreeSet::new());
        let result = orchestrator.execute_recovery(Some(scenario)).await.unwrap();

        assert_eq!(result.step_outcomes.len(), 2);
        assert_eq!(result.step_outcomes[0].status, StepStatus::Failed);
        assert_eq!(result.step_outcomes[1].status, StepStatus::Succeeded);
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_unmet_dependency_skips_step() {
        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);

        let plan = RecoveryPlan {
            scenario_kind: FailureKind::AgentFailure,
            steps: vec![
                RecoveryStep::new("doomed-restore", RecoveryAction::Restore)
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
                RecoveryStep::new("needs-restore", RecoveryAction::Validate)
                    .with_dependency("doomed-restore")
                    .with_timeout(Duration::from_secs(5))
                    .with_failure_mode(FailureMode::Continue),
            ],
            rollback_steps: Vec::new(),
            validation_checks: Vec::new(),
            success_criteria: vec!["no_critical_failures".into()],
        };
        orchestrator.register_plan(plan);

        let scenario = FailureScenario::new(FailureKind::AgentFailure, BTreeSet::new());
        let result = orchestrator.execute_recovery(Some(scenario)).await.unwrap();
        assert_eq!(result.step_outcomes[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_step_timeout_counts_attempts() {
        struct SlowNotifier;

        #[async_trait]
        impl Notifier for SlowNotifier {
            async fn notify(&self, _subject: &str, _body: &str) -> Result<(), String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let shared: Arc<dyn StorageAccessor> = Arc::new(accessor.clone());
        let analyzer = Arc::new(ConsistencyAnalyzer::new(
            shared.clone(),
            AnalyzerConfig::default(),
        ));
        let orchestrator = RecoveryOrchestrator::new(
            shared.clone(),
            analyzer,
            SnapshotManager::new(shared),
            RecoveryConfig::default(),
        )
        .with_notifier(Arc::new(SlowNotifier));
        orchestrator.initialize_recovery_workflows();

        let plan = RecoveryPlan {
            scenario_kind: FailureKind::AgentFailure,
            steps: vec![RecoveryStep::new("slow-notify", RecoveryAction::Notify)
                .with_timeout(Duration::from_millis(50))
                .with_retries(1)
                .with_failure_mode(FailureMode::Continue)],
            rollback_steps: Vec::new(),
            validation_checks: Vec::new(),
            success_criteria: vec!["no_critical_failures".into()],
        };
        orchestrator.register_plan(plan);

        let scenario = FailureScenario::new(FailureKind::AgentFailure, BTreeSet::new());
        let result = orchestrator.execute_recovery(Some(scenario)).await.unwrap();
        assert_eq!(result.step_outcomes[0].status, StepStatus::TimedOut);
        assert_eq!(result.step_outcomes[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_concurrent_execute_recovery_is_rejected() {
        struct BlockingNotifier(tokio::sync::Semaphore);

        #[async_trait]
        impl Notifier for BlockingNotifier {
            async fn notify(&self, _subject: &str, _body: &str) -> Result<(), String> {
                // Parked until the test releases a permit
                let _permit = self.0.acquire().await.map_err(|e| e.to_string())?;
                Ok(())
            }
        }

        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let notifier = Arc::new(BlockingNotifier(tokio::sync::Semaphore::new(0)));

        let shared: Arc<dyn StorageAccessor> = Arc::new(accessor.clone());
        let analyzer = Arc::new(ConsistencyAnalyzer::new(
            shared.clone(),
            AnalyzerConfig::default(),
        ));
        let orchestrator = Arc::new(
            RecoveryOrchestrator::new(
                shared.clone(),
                analyzer,
                SnapshotManager::new(shared),
                RecoveryConfig::default(),
            )
            .with_notifier(notifier.clone()),
        );
        orchestrator.initialize_recovery_workflows();

        let plan = RecoveryPlan {
            scenario_kind: FailureKind::AgentFailure,
            steps: vec![RecoveryStep::new("hold", RecoveryAction::Notify)
                .with_timeout(Duration::from_secs(30))
                .with_failure_mode(FailureMode::Continue)],
            rollback_steps: Vec::new(),
            validation_checks: Vec::new(),
            success_criteria: vec!["no_critical_failures".into()],
        };
        orchestrator.register_plan(plan);

        let scenario = FailureScenario::new(FailureKind::AgentFailure, BTreeSet::new());
        let first = {
            let orchestrator = orchestrator.clone();
            let scenario = scenario.clone();
            tokio::spawn(async move { orchestrator.execute_recovery(Some(scenario)).await })
        };

        // Let the first run take the lock and park inside its notify step
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = orchestrator.execute_recovery(Some(scenario)).await;
        assert!(matches!(
            second,
            Err(ReclaimError::Recovery(RecoveryError::AlreadyInProgress))
        ));

        notifier.0.add_permits(1);
        assert!(first.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn test_history_is_retained_and_bounded() {
        let accessor = InMemoryAccessor::new();
        seed_pair(&accessor).await;
        let orchestrator = orchestrator(&accessor);

        for _ in 0..3 {
            orchestrator.execute_recovery(None).await.unwrap();
        }
        let runs = orchestrator.recent_runs();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.success));
    }

    #[test]
    fn test_config_validation() {
        assert!(RecoveryConfig::default().validate().is_ok());
        let bad = RecoveryConfig {
            partial_loss_agent_threshold: 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
