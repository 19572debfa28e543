//! RECLAIM Analyzer - Consistency Analysis
//!
//! Reads raw structures through the storage accessor, builds an in-memory
//! model, and computes a weighted consistency report. Analysis is a pure
//! read: missing or malformed records become reported issues, never errors,
//! because health reporting must stay available even when the system it
//! reports on is unhealthy.

use chrono::Utc;
use reclaim_core::{
    check_ids, AgentId, CheckResult, ConfigError, ConsistencyReport, StateImage, Timestamp,
    ValidationSummary,
};
use reclaim_storage::StorageAccessor;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ============================================================================
// SCORING CONSTANTS
// ============================================================================

/// Weight of a critical check in the overall score (>= 3x non-critical).
pub const CRITICAL_CHECK_WEIGHT: f64 = 3.0;

/// Weight of a non-critical check in the overall score.
pub const NON_CRITICAL_CHECK_WEIGHT: f64 = 1.0;

/// Upper bound on the overall score when any critical check failed.
/// Keeps the constructed invariant "critical failure implies score < 0.5"
/// independent of the weighted-mean arithmetic.
pub const CRITICAL_FAILURE_SCORE_CAP: f64 = 0.45;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the consistency analyzer.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Tolerated clock skew before a timestamp counts as "in the future"
    pub clock_skew_tolerance: Duration,

    /// Age past which an agent heartbeat counts as stale
    pub heartbeat_stale_threshold: Duration,

    /// Minimum overall score for `validate()` to report valid
    pub validation_pass_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(5),
            heartbeat_stale_threshold: Duration::from_secs(60),
            validation_pass_threshold: 0.8,
        }
    }
}

impl AnalyzerConfig {
    /// Create an AnalyzerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `RECLAIM_CLOCK_SKEW_TOLERANCE_SECS` (default: 5)
    /// - `RECLAIM_HEARTBEAT_STALE_THRESHOLD_SECS` (default: 60)
    /// - `RECLAIM_VALIDATION_PASS_THRESHOLD` (default: 0.8)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let clock_skew_tolerance = std::env::var("RECLAIM_CLOCK_SKEW_TOLERANCE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.clock_skew_tolerance);

        let heartbeat_stale_threshold = std::env::var("RECLAIM_HEARTBEAT_STALE_THRESHOLD_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_stale_threshold);

        let validation_pass_threshold = std::env::var("RECLAIM_VALIDATION_PASS_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.validation_pass_threshold);

        Self {
            clock_skew_tolerance,
            heartbeat_stale_threshold,
            validation_pass_threshold,
        }
    }

    /// Create a configuration for development/testing with tight thresholds.
    pub fn development() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(1),
            heartbeat_stale_threshold: Duration::from_secs(5),
            validation_pass_threshold: 0.8,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.validation_pass_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "validation_pass_threshold".to_string(),
                value: self.validation_pass_threshold.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.heartbeat_stale_threshold.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_stale_threshold".to_string(),
                value: format!("{:?}", self.heartbeat_stale_threshold),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

/// The consistency analysis engine.
///
/// Holds a high-water mark of observed heartbeats per agent so that
/// monotonicity regressions are detectable across runs. The mark is
/// analyzer-internal state, not persisted state - `analyze` never writes
/// through the accessor.
pub struct ConsistencyAnalyzer {
    accessor: Arc<dyn StorageAccessor>,
    config: AnalyzerConfig,
    heartbeat_watermarks: RwLock<BTreeMap<AgentId, Timestamp>>,
}

impl ConsistencyAnalyzer {
    pub fn new(accessor: Arc<dyn StorageAccessor>, config: AnalyzerConfig) -> Self {
        Self {
            accessor,
            config,
            heartbeat_watermarks: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Forget observed heartbeat high-water marks.
    ///
    /// Must be called after a snapshot restore: restored heartbeats
    /// legitimately predate previously observed ones.
    pub fn reset_watermarks(&self) {
        if let Ok(mut marks) = self.heartbeat_watermarks.write() {
            marks.clear();
        }
    }

    /// Run all consistency checks against the current persisted state.
    pub async fn analyze(&self) -> ConsistencyReport {
        self.analyze_at(Utc::now()).await
    }

    /// Run all consistency checks, judging time-sensitive checks against
    /// the supplied instant.
    pub async fn analyze_at(&self, now: Timestamp) -> ConsistencyReport {
        let image = match self.accessor.load_state().await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "Consistency analysis could not reach storage");
                return ConsistencyReport {
                    per_check_results: Vec::new(),
                    overall_score: 0.0,
                    issues: vec![format!("storage accessor unreachable: {e}")],
                    generated_at: now,
                };
            }
        };

        let snapshot_timestamps: Vec<Timestamp> = match self.accessor.snapshot_list().await {
            Ok(snapshots) => snapshots.iter().map(|s| s.timestamp).collect(),
            Err(_) => Vec::new(),
        };

        let mut issues = Vec::new();
        let per_check_results = vec![
            self.check_registry_consistency(&image, &mut issues),
            self.check_memory_bank_integrity(&image, &mut issues),
            self.check_timestamp_consistency(&image, &snapshot_timestamps, now, &mut issues),
            self.check_cross_references(&image, &mut issues),
            self.check_heartbeat_freshness(&image, now, &mut issues),
        ];

        let overall_score = score_checks(&per_check_results);
        tracing::debug!(
            overall_score,
            issue_count = issues.len(),
            "Consistency analysis completed"
        );

        ConsistencyReport {
            per_check_results,
            overall_score,
            issues,
            generated_at: now,
        }
    }

    /// Thin pass/fail wrapper over `analyze`.
    pub async fn validate(&self) -> ValidationSummary {
        let report = self.analyze().await;
        ValidationSummary {
            valid: !report.has_critical_failure()
                && report.overall_score >= self.config.validation_pass_threshold,
            issues: report.issues,
        }
    }

    /// Check 1: every agent referenced by queues or channels exists in
    /// the registry. Critical.
    fn check_registry_consistency(
        &self,
        image: &StateImage,
        issues: &mut Vec<String>,
    ) -> CheckResult {
        let referenced = image.session.referenced_agent_ids();
        let mut failing = Vec::new();

        for id in &referenced {
            if !image.session.registry.contains_key(id) {
                issues.push(format!(
                    "registry consistency violation: agent {id} is referenced by task queues or coordination channels but missing from registry"
                ));
                failing.push(format!("agent:{id}"));
            }
        }

        let total = referenced.len();
        let missing = failing.len();
        let passed = missing == 0;
        if !passed {
            failing.push("session".to_string());
        }

        CheckResult {
            check_id: check_ids::REGISTRY_CONSISTENCY.to_string(),
            passed,
            pass_ratio: ratio(total - missing, total),
            critical: true,
            detail: format!("{} of {total} referenced agents registered", total - missing),
            failing,
        }
    }

    /// Check 2: each memory bank entry parses under its declared schema
    /// version. Critical.
    fn check_memory_bank_integrity(
        &self,
        image: &StateImage,
        issues: &mut Vec<String>,
    ) -> CheckResult {
        let mut total = 0usize;
        let mut malformed = 0usize;
        let mut failing = Vec::new();

        for agent in image.agents.values() {
            total += agent.memory_bank.len();
            let bad = agent.malformed_bank_keys();
            if !bad.is_empty() {
                malformed += bad.len();
                failing.push(format!("agent:{}", agent.agent_id));
                for (key, defect) in bad {
                    issues.push(format!(
                        "malformed memory bank entry {key} on agent {}: {defect}",
                        agent.agent_id
                    ));
                }
            }
        }

        CheckResult {
            check_id: check_ids::MEMORY_BANK_INTEGRITY.to_string(),
            passed: malformed == 0,
            pass_ratio: ratio(total - malformed, total),
            critical: true,
            detail: format!("{malformed} of {total} memory bank entries malformed"),
            failing,
        }
    }

    /// Check 3: no timestamp beyond clock skew, heartbeats monotonically
    /// non-decreasing per agent across runs.
    fn check_timestamp_consistency(
        &self,
        image: &StateImage,
        snapshot_timestamps: &[Timestamp],
        now: Timestamp,
        issues: &mut Vec<String>,
    ) -> CheckResult {
        let horizon = now
            + chrono::Duration::from_std(self.config.clock_skew_tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut failing = Vec::new();

        let mut marks = match self.heartbeat_watermarks.write() {
            Ok(marks) => marks,
            Err(poisoned) => poisoned.into_inner(),
        };

        for agent in image.agents.values() {
            let mut ok = true;
            if agent.last_heartbeat > horizon {
                issues.push(format!(
                    "heartbeat for agent {} is in the future ({})",
                    agent.agent_id, agent.last_heartbeat
                ));
                ok = false;
            }
            if let Some(prev) = marks.get(&agent.agent_id) {
                if agent.last_heartbeat < *prev {
                    issues.push(format!(
                        "heartbeat for agent {} regressed from {} to {}",
                        agent.agent_id, prev, agent.last_heartbeat
                    ));
                    ok = false;
                }
            }
            if ok {
                let entry = marks.entry(agent.agent_id).or_insert(agent.last_heartbeat);
                if agent.last_heartbeat > *entry {
                    *entry = agent.last_heartbeat;
                }
            } else {
                failing.push(format!("agent:{}", agent.agent_id));
            }
        }

        let mut future_snapshots = 0usize;
        for ts in snapshot_timestamps {
            if *ts > horizon {
                issues.push(format!("snapshot timestamp {ts} is in the future"));
                future_snapshots += 1;
            }
        }
        if future_snapshots > 0 {
            failing.push("snapshots".to_string());
        }

        let total = image.agents.len() + snapshot_timestamps.len();
        let failed = failing
            .iter()
            .filter(|f| f.starts_with("agent:"))
            .count()
            + future_snapshots;

        CheckResult {
            check_id: check_ids::TIMESTAMP_CONSISTENCY.to_string(),
            passed: failing.is_empty(),
            pass_ratio: ratio(total - failed, total),
            critical: false,
            detail: format!("{failed} of {total} timestamps inconsistent"),
            failing,
        }
    }

    /// Check 4: task descriptors reference only registered agents, and no
    /// task appears in more than one queue.
    fn check_cross_references(&self, image: &StateImage, issues: &mut Vec<String>) -> CheckResult {
        let mut total = 0usize;
        let mut failed = 0usize;
        let mut failing = Vec::new();

        for task in image.session.task_queues.all_tasks() {
            if let Some(assignee) = task.assigned_to {
                total += 1;
                if !image.session.registry.contains_key(&assignee) {
                    issues.push(format!(
                        "task {} is assigned to unregistered agent {assignee}",
                        task.task_id
                    ));
                    failing.push(format!("task:{}", task.task_id));
                    failed += 1;
                }
            }
        }

        let duplicates = image.session.task_queues.duplicate_task_ids();
        for dup in &duplicates {
            issues.push(format!("task {dup} appears in more than one queue"));
            failing.push(format!("task:{dup}"));
        }
        total += duplicates.len();
        failed += duplicates.len();

        CheckResult {
            check_id: check_ids::CROSS_REFERENCE_VALIDATION.to_string(),
            passed: failed == 0,
            pass_ratio: ratio(total - failed, total),
            critical: false,
            detail: format!("{failed} of {total} task references invalid"),
            failing,
        }
    }

    /// Check 5: heartbeat freshness. Staleness lowers the score but is
    /// never by itself critical.
    fn check_heartbeat_freshness(
        &self,
        image: &StateImage,
        now: Timestamp,
        issues: &mut Vec<String>,
    ) -> CheckResult {
        let mut failing = Vec::new();

        for agent in image.agents.values() {
            if agent.is_stale(now, self.config.heartbeat_stale_threshold) {
                issues.push(format!(
                    "agent {} is stale: no heartbeat for longer than {:?}",
                    agent.agent_id, self.config.heartbeat_stale_threshold
                ));
                failing.push(format!("agent:{}", agent.agent_id));
            }
        }

        let total = image.agents.len();
        CheckResult {
            check_id: check_ids::HEARTBEAT_FRESHNESS.to_string(),
            passed: failing.is_empty(),
            pass_ratio: ratio(total - failing.len(), total),
            critical: false,
            detail: format!("{} of {total} agents stale", failing.len()),
            failing,
        }
    }
}

/// Weighted mean of per-check pass ratios, with the critical-failure cap.
fn score_checks(checks: &[CheckResult]) -> f64 {
    if checks.is_empty() {
        return 0.0;
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut critical_failed = false;

    for check in checks {
        let weight = if check.critical {
            CRITICAL_CHECK_WEIGHT
        } else {
            NON_CRITICAL_CHECK_WEIGHT
        };
        weighted_sum += check.pass_ratio.clamp(0.0, 1.0) * weight;
        weight_total += weight;
        if check.critical && !check.passed {
            critical_failed = true;
        }
    }

    let mean = weighted_sum / weight_total;
    if critical_failed {
        mean.min(CRITICAL_FAILURE_SCORE_CAP)
    } else {
        mean
    }
}

fn ratio(passed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        passed as f64 / total as f64
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
