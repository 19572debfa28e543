//! RECLAIM Engine - Public Facade and Health Monitoring
//!
//! `RecoveryEngine` wires the storage accessor, consistency analyzer,
//! snapshot manager, and recovery orchestrator into the surface the
//! CLI/automation layer calls. The health monitor is a single periodic
//! background task that analyzes state every tick and triggers recovery
//! exactly once per transition into critical health. Transitions happen
//! when:
//!
//! - An agent crash corrupts its memory bank between ticks
//! - The session registry loses entries under concurrent writes
//! - The storage backend drops offline entirely
//!
//! `stop_health_monitoring` is cooperative: it signals the loop and waits
//! for any in-flight tick to finish, never interrupting mid-step.

use reclaim_analyzer::{AnalyzerConfig, ConsistencyAnalyzer};
use reclaim_core::{
    ConfigError, ConsistencyReport, FailureScenario, HealthReport, HealthStatus, ReclaimError,
    ReclaimResult, RecoveryError, RecoveryResult, RestoreResult, Snapshot, ValidationSummary,
};
use reclaim_recovery::{
    derive_health_report, Notifier, RecoveryConfig, RecoveryOrchestrator,
};
use reclaim_snapshot::{SnapshotManager, SnapshotRef};
use reclaim_storage::StorageAccessor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the health monitor background task.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the monitor analyzes state (default: 30 seconds)
    pub check_interval: Duration,

    /// Whether a transition into critical health triggers recovery
    /// automatically (default: true)
    pub auto_recovery: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            auto_recovery: true,
        }
    }
}

impl MonitorConfig {
    /// Create a MonitorConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `RECLAIM_MONITOR_CHECK_INTERVAL_MS` (default: 30000)
    /// - `RECLAIM_MONITOR_AUTO_RECOVERY` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let check_interval = std::env::var("RECLAIM_MONITOR_CHECK_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.check_interval);

        let auto_recovery = std::env::var("RECLAIM_MONITOR_AUTO_RECOVERY")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.auto_recovery);

        Self {
            check_interval,
            auto_recovery,
        }
    }

    /// Create a configuration for development/testing with a fast tick.
    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_millis(50),
            auto_recovery: true,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "check_interval".to_string(),
                value: format!("{:?}", self.check_interval),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub analyzer: AnalyzerConfig,
    pub recovery: RecoveryConfig,
    pub monitor: MonitorConfig,
}

impl EngineConfig {
    /// Load every section from environment variables.
    pub fn from_env() -> Self {
        Self {
            analyzer: AnalyzerConfig::from_env(),
            recovery: RecoveryConfig::from_env(),
            monitor: MonitorConfig::from_env(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.analyzer.validate()?;
        self.recovery.validate()?;
        self.monitor.validate()
    }
}

// ============================================================================
// MONITOR METRICS
// ============================================================================

/// Metrics for the health monitor task.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    /// Ticks completed since startup
    pub ticks: AtomicU64,

    /// Ticks that observed healthy state
    pub healthy_observed: AtomicU64,

    /// Ticks that observed degraded state
    pub degraded_observed: AtomicU64,

    /// Ticks that observed critical state
    pub critical_observed: AtomicU64,

    /// Automatic recovery runs triggered
    pub auto_recoveries_triggered: AtomicU64,

    /// Errors encountered (failed or rejected recovery triggers)
    pub errors: AtomicU64,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            healthy_observed: self.healthy_observed.load(Ordering::Relaxed),
            degraded_observed: self.degraded_observed.load(Ordering::Relaxed),
            critical_observed: self.critical_observed.load(Ordering::Relaxed),
            auto_recoveries_triggered: self.auto_recoveries_triggered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of monitor metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub ticks: u64,
    pub healthy_observed: u64,
    pub degraded_observed: u64,
    pub critical_observed: u64,
    pub auto_recoveries_triggered: u64,
    pub errors: u64,
}

// ============================================================================
// HEALTH MONITOR TASK
// ============================================================================

struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One monitor tick: analyze, derive health, maybe trigger recovery.
///
/// `was_critical` carries the edge detector between ticks: recovery fires
/// only on the transition into critical, never again while critical
/// persists, and a rejected trigger (a run already active) counts as
/// handled rather than as a new attempt.
async fn monitor_tick(
    analyzer: &ConsistencyAnalyzer,
    orchestrator: &RecoveryOrchestrator,
    config: &MonitorConfig,
    metrics: &MonitorMetrics,
    healthy_threshold: f64,
    was_critical: &mut bool,
    last_health: &std::sync::Mutex<Option<HealthReport>>,
) {
    metrics.ticks.fetch_add(1, Ordering::Relaxed);

    let report = analyzer.analyze().await;
    let mut health = derive_health_report(report, healthy_threshold, false);

    match health.status {
        HealthStatus::Healthy => {
            metrics.healthy_observed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(score = health.consistency.overall_score, "Health tick: healthy");
        }
        HealthStatus::Degraded => {
            metrics.degraded_observed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                score = health.consistency.overall_score,
                issues = health.consistency.issues.len(),
                "Health tick: degraded"
            );
        }
        HealthStatus::Critical => {
            metrics.critical_observed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                score = health.consistency.overall_score,
                issues = health.consistency.issues.len(),
                "Health tick: critical"
            );

            if config.auto_recovery && !*was_critical {
                match orchestrator.execute_recovery(None).await {
                    Ok(result) => {
                        health.auto_recovery_triggered = true;
                        metrics
                            .auto_recoveries_triggered
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            success = result.success,
                            "Automatic recovery completed"
                        );
                        if !result.success {
                            metrics.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(ReclaimError::Recovery(RecoveryError::AlreadyInProgress)) => {
                        // A manual or previous run already holds the lock
                        tracing::debug!("Recovery already in progress, not re-triggering");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Automatic recovery failed");
                        metrics.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    *was_critical = health.status == HealthStatus::Critical;
    if let Ok(mut slot) = last_health.lock() {
        *slot = Some(health);
    }
}

/// Background task that periodically analyzes state health.
async fn health_monitor_task(
    analyzer: Arc<ConsistencyAnalyzer>,
    orchestrator: Arc<RecoveryOrchestrator>,
    config: MonitorConfig,
    metrics: Arc<MonitorMetrics>,
    healthy_threshold: f64,
    last_health: Arc<std::sync::Mutex<Option<HealthReport>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut check_interval = interval(config.check_interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_ms = config.check_interval.as_millis() as u64,
        auto_recovery = config.auto_recovery,
        "Health monitor started"
    );

    let mut was_critical = false;

    loop {
        tokio::select! {
            // Check for shutdown signal
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Health monitor shutting down");
                    break;
                }
            }

            // Regular health tick
            _ = check_interval.tick() => {
                monitor_tick(
                    &analyzer,
                    &orchestrator,
                    &config,
                    &metrics,
                    healthy_threshold,
                    &mut was_critical,
                    &last_health,
                ).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        ticks = snapshot.ticks,
        critical_observed = snapshot.critical_observed,
        auto_recoveries_triggered = snapshot.auto_recoveries_triggered,
        errors = snapshot.errors,
        "Health monitor stopped"
    );
}

// ============================================================================
// RECOVERY ENGINE
// ============================================================================

/// The context restoration and recovery core, assembled.
///
/// External callers (CLIs, automation) talk to this facade; everything
/// else in the workspace is plumbing behind it.
pub struct RecoveryEngine {
    accessor: Arc<dyn StorageAccessor>,
    analyzer: Arc<ConsistencyAnalyzer>,
    snapshots: SnapshotManager,
    orchestrator: Arc<RecoveryOrchestrator>,
    config: EngineConfig,
    metrics: Arc<MonitorMetrics>,
    last_health: Arc<std::sync::Mutex<Option<HealthReport>>>,
    monitor: tokio::sync::Mutex<Option<MonitorHandle>>,
}

impl RecoveryEngine {
    /// Assemble an engine with default configuration.
    pub fn new(accessor: Arc<dyn StorageAccessor>) -> Self {
        Self::with_config(accessor, EngineConfig::default())
    }

    /// Assemble an engine with explicit configuration.
    pub fn with_config(accessor: Arc<dyn StorageAccessor>, config: EngineConfig) -> Self {
        let analyzer = Arc::new(ConsistencyAnalyzer::new(
            accessor.clone(),
            config.analyzer.clone(),
        ));
        let snapshots = SnapshotManager::new(accessor.clone());
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            accessor.clone(),
            analyzer.clone(),
            snapshots.clone(),
            config.recovery.clone(),
        ));

        Self {
            accessor,
            analyzer,
            snapshots,
            orchestrator,
            config,
            metrics: Arc::new(MonitorMetrics::new()),
            last_health: Arc::new(std::sync::Mutex::new(None)),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Inject a notification collaborator for recovery `notify` steps.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        let orchestrator = RecoveryOrchestrator::new(
            self.accessor.clone(),
            self.analyzer.clone(),
            self.snapshots.clone(),
            self.config.recovery.clone(),
        )
        .with_notifier(notifier);
        self.orchestrator = Arc::new(orchestrator);
        self
    }

    // ========================================================================
    // ANALYSIS SURFACE
    // ========================================================================

    /// Run consistency analysis. Read-only; never fails.
    pub async fn analyze(&self) -> ConsistencyReport {
        self.analyzer.analyze().await
    }

    /// Pass/fail wrapper over `analyze`.
    pub async fn validate(&self) -> ValidationSummary {
        self.analyzer.validate().await
    }

    /// Derive a fresh health report right now.
    pub async fn current_health(&self) -> HealthReport {
        derive_health_report(
            self.analyzer.analyze().await,
            self.config.recovery.healthy_score_threshold,
            false,
        )
    }

    /// The last health report observed by the monitor, if any.
    pub fn latest_monitored_health(&self) -> Option<HealthReport> {
        self.last_health.lock().ok().and_then(|slot| slot.clone())
    }

    // ========================================================================
    // SNAPSHOT SURFACE
    // ========================================================================

    /// Capture all tracked state into a new snapshot.
    pub async fn create_snapshot(&self, reason: impl Into<String>) -> ReclaimResult<Snapshot> {
        self.snapshots.create_snapshot(reason).await
    }

    /// Restore a snapshot (defaults to the most recent), under the
    /// recovery lock so restores never interleave with recovery runs.
    pub async fn restore_snapshot(
        &self,
        reference: Option<SnapshotRef>,
    ) -> ReclaimResult<RestoreResult> {
        self.orchestrator.restore_snapshot(reference).await
    }

    /// Human-readable description of a snapshot (defaults to the latest).
    pub async fn generate_summary(&self, snapshot: Option<&Snapshot>) -> String {
        self.snapshots.generate_summary(snapshot).await
    }

    // ========================================================================
    // RECOVERY SURFACE
    // ========================================================================

    /// Register the five built-in recovery plans. Idempotent.
    pub fn initialize_recovery_workflows(&self) {
        self.orchestrator.initialize_recovery_workflows();
    }

    /// Execute a recovery run; auto-classifies when no scenario is given.
    pub async fn execute_recovery(
        &self,
        scenario: Option<FailureScenario>,
    ) -> ReclaimResult<RecoveryResult> {
        self.orchestrator.execute_recovery(scenario).await
    }

    /// Results of recent recovery runs.
    pub fn recent_recovery_runs(&self) -> Vec<RecoveryResult> {
        self.orchestrator.recent_runs()
    }

    // ========================================================================
    // HEALTH MONITOR LIFECYCLE
    // ========================================================================

    /// Start the periodic health monitor. Returns false if it is already
    /// running.
    pub async fn start_health_monitoring(&self, check_interval: Duration) -> bool {
        let mut slot = self.monitor.lock().await;
        if slot.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = MonitorConfig {
            check_interval,
            ..self.config.monitor.clone()
        };
        let handle = tokio::spawn(health_monitor_task(
            self.analyzer.clone(),
            self.orchestrator.clone(),
            config,
            self.metrics.clone(),
            self.config.recovery.healthy_score_threshold,
            self.last_health.clone(),
            shutdown_rx,
        ));

        *slot = Some(MonitorHandle {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the health monitor, waiting for any in-flight tick to finish.
    /// Returns false if it was not running.
    pub async fn stop_health_monitoring(&self) -> bool {
        let handle = {
            let mut slot = self.monitor.lock().await;
            slot.take()
        };
        match handle {
            Some(MonitorHandle {
                shutdown_tx,
                handle,
            }) => {
                let _ = shutdown_tx.send(true);
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Health monitor task panicked");
                }
                true
            }
            None => false,
        }
    }

    /// Whether the monitor loop is currently running.
    pub async fn is_monitoring(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Current monitor metrics.
    pub fn monitor_metrics(&self) -> MonitorSnapshot {
        self.metrics.snapshot()
    }

    /// Storage health and counts, for diagnostics.
    pub async fn storage_statistics(&self) -> ReclaimResult<reclaim_storage::StorageStatistics> {
        self.accessor.statistics().await
    }
}

// ============================================================================
// TESTS
// ============================================================================
