//! RECLAIM Test Utilities
//!
//! Centralized test infrastructure for the RECLAIM workspace:
//! - Fixtures for common coordination states (healthy, corrupted, lossy)
//! - Proptest generators for entity types
//! - Instrumented doubles (interleave-guarding accessor, collecting
//!   notifier) for concurrency and notification assertions

// Re-export the in-memory accessor from its source crate
pub use reclaim_storage::InMemoryAccessor;

// Re-export core types for convenience
pub use reclaim_core::{
    new_entity_id, AgentId, AgentRecord, CoordinationChannel, FailureKind, FailureScenario,
    GlobalMemory, MemoryEntry, ReclaimResult, RoleSpec, SessionState, Snapshot, SnapshotId,
    StateImage, TaskDescriptor, Timestamp,
};

use ::async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use reclaim_recovery::Notifier;
use reclaim_storage::{StorageAccessor, StorageStatistics};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// FIXTURES
// ============================================================================

/// A healthy state image: `agent_count` registered agents with fresh
/// heartbeats, one active task assigned to the first agent, and one
/// channel containing everyone.
pub fn healthy_state(agent_count: usize) -> StateImage {
    let now = Utc::now();
    let mut image = StateImage::default();

    let mut ids = Vec::with_capacity(agent_count);
    for i in 0..agent_count {
        let mut agent = AgentRecord::new(RoleSpec::new(format!("worker-{i}"), vec![]), now);
        agent.write_memory("progress", serde_json::json!({"step": i}), now);
        ids.push(agent.agent_id);
        image
            .session
            .registry
            .insert(agent.agent_id, agent.role_spec.clone());
        image.agents.insert(agent.agent_id, agent);
    }

    if let Some(first) = ids.first() {
        image
            .session
            .task_queues
            .active
            .push(TaskDescriptor::new("T1", now).with_assignee(*first));
    }
    image.session.coordination_channels.insert(
        "ch-main".to_string(),
        CoordinationChannel {
            participants: ids.iter().copied().collect(),
            last_activity: now,
        },
    );
    image
        .global_memory
        .knowledge
        .insert("project".to_string(), serde_json::json!("reclaim"));

    image
}

/// An accessor seeded with a healthy state.
pub fn seeded_accessor(agent_count: usize) -> InMemoryAccessor {
    InMemoryAccessor::with_state(healthy_state(agent_count))
}

/// Remove one registered agent from the registry while its channel and
/// queue references stay behind, returning the dangling id. Mirrors a
/// torn concurrent write to the session record.
pub fn corrupt_registry(image: &mut StateImage) -> AgentId {
    let victim = *image
        .session
        .registry
        .keys()
        .last()
        .expect("fixture needs at least one registered agent");
    image.session.registry.remove(&victim);
    victim
}

// ============================================================================
// INSTRUMENTED DOUBLES
// ============================================================================

/// Accessor wrapper that fails the test when two `replace_state` calls
/// overlap in time. Restores hold the write window open briefly so a
/// second writer would be caught in the act.
pub struct InterleaveGuardAccessor {
    inner: InMemoryAccessor,
    restore_in_flight: AtomicBool,
    pub replace_calls: AtomicU64,
    write_window: Duration,
}

impl InterleaveGuardAccessor {
    pub fn new(inner: InMemoryAccessor) -> Self {
        Self {
            inner,
            restore_in_flight: AtomicBool::new(false),
            replace_calls: AtomicU64::new(0),
            write_window: Duration::from_millis(25),
        }
    }
}

#[async_trait]
impl StorageAccessor for InterleaveGuardAccessor {
    async fn agent_upsert(&self, record: &AgentRecord) -> ReclaimResult<()> {
        self.inner.agent_upsert(record).await
    }

    async fn agent_get(&self, id: AgentId) -> ReclaimResult<Option<AgentRecord>> {
        self.inner.agent_get(id).await
    }

    async fn agent_list(&self) -> ReclaimResult<Vec<AgentRecord>> {
        self.inner.agent_list().await
    }

    async fn session_get(&self) -> ReclaimResult<SessionState> {
        self.inner.session_get().await
    }

    async fn session_put(&self, session: &SessionState) -> ReclaimResult<()> {
        self.inner.session_put(session).await
    }

    async fn global_memory_get(&self) -> ReclaimResult<GlobalMemory> {
        self.inner.global_memory_get().await
    }

    async fn global_memory_put(&self, memory: &GlobalMemory) -> ReclaimResult<()> {
        self.inner.global_memory_put(memory).await
    }

    async fn load_state(&self) -> ReclaimResult<StateImage> {
        self.inner.load_state().await
    }

    async fn replace_state(&self, image: &StateImage) -> ReclaimResult<()> {
        if self.restore_in_flight.swap(true, Ordering::SeqCst) {
            panic!("two replace_state calls interleaved");
        }
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.write_window).await;
        let result = self.inner.replace_state(image).await;
        self.restore_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn snapshot_append(&self, snapshot: &Snapshot) -> ReclaimResult<()> {
        self.inner.snapshot_append(snapshot).await
    }

    async fn snapshot_get(&self, id: SnapshotId) -> ReclaimResult<Option<Snapshot>> {
        self.inner.snapshot_get(id).await
    }

    async fn snapshot_latest(&self) -> ReclaimResult<Option<Snapshot>> {
        self.inner.snapshot_latest().await
    }

    async fn snapshot_list(&self) -> ReclaimResult<Vec<Snapshot>> {
        self.inner.snapshot_list().await
    }

    async fn health_check(&self) -> ReclaimResult<bool> {
        self.inner.health_check().await
    }

    async fn statistics(&self) -> ReclaimResult<StorageStatistics> {
        self.inner.statistics().await
    }
}

/// Notifier that records every notification for assertions.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl CollectingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), String> {
        self.sent
            .lock()
            .expect("notifier lock poisoned")
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Notifier that always fails delivery, for best-effort assertions.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _subject: &str, _body: &str) -> Result<(), String> {
        Err("notification endpoint unreachable".to_string())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

/// Strategy producing role specs.
pub fn arb_role_spec() -> impl Strategy<Value = RoleSpec> {
    (
        "[a-z]{3,10}",
        prop::collection::vec("[a-z]{2,8}", 0..4),
    )
        .prop_map(|(agent_type, capabilities)| RoleSpec::new(agent_type, capabilities))
}

/// Strategy producing agent records with well-formed memory banks.
pub fn arb_agent_record() -> impl Strategy<Value = AgentRecord> {
    (
        arb_role_spec(),
        prop::collection::btree_map("[a-z]{1,10}", any::<i64>(), 0..6),
    )
        .prop_map(|(role_spec, bank)| {
            let now = Utc::now();
            let mut agent = AgentRecord::new(role_spec, now);
            for (key, value) in bank {
                agent.write_memory(key, serde_json::json!({ "v": value }), now);
            }
            agent
        })
}

/// Strategy producing internally consistent state images: every
/// referenced agent id is registered.
pub fn arb_state_image() -> impl Strategy<Value = StateImage> {
    prop::collection::vec(arb_agent_record(), 1..5).prop_map(|agents| {
        let now = Utc::now();
        let mut image = StateImage::default();
        for agent in &agents {
            image
                .session
                .registry
                .insert(agent.agent_id, agent.role_spec.clone());
            image.agents.insert(agent.agent_id, agent.clone());
        }
        let first = agents[0].agent_id;
        image
            .session
            .task_queues
            .pending
            .push(TaskDescriptor::new("generated", now).with_assignee(first));
        image.session.coordination_channels.insert(
            "ch-gen".to_string(),
            CoordinationChannel {
                participants: agents.iter().map(|a| a.agent_id).collect(),
                last_activity: now,
            },
        );
        image
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_snapshot::SnapshotManager;

    #[test]
    fn test_healthy_state_fixture_is_consistent() {
        let image = healthy_state(3);
        assert_eq!(image.agent_count(), 3);
        assert!(image
            .session
            .referenced_agent_ids()
            .iter()
            .all(|id| image.session.registry.contains_key(id)));
    }

    #[test]
    fn test_corrupt_registry_leaves_dangling_reference() {
        let mut image = healthy_state(2);
        let victim = corrupt_registry(&mut image);
        assert!(!image.session.registry.contains_key(&victim));
        assert!(image.session.referenced_agent_ids().contains(&victim));
    }

    #[tokio::test]
    async fn test_interleave_guard_counts_restores() {
        let guard = Arc::new(InterleaveGuardAccessor::new(seeded_accessor(2)));
        let manager = SnapshotManager::new(guard.clone() as Arc<dyn StorageAccessor>);

        manager.create_snapshot("guarded").await.unwrap();
        let result = manager.restore_snapshot(None).await.unwrap();
        assert!(result.success);
        assert_eq!(guard.replace_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_collecting_notifier_records() {
        let notifier = CollectingNotifier::new();
        notifier.notify("subject", "body").await.unwrap();
        assert_eq!(notifier.sent(), vec![("subject".to_string(), "body".to_string())]);

        assert!(FailingNotifier.notify("s", "b").await.is_err());
    }
}
