//! RECLAIM Storage - Storage Accessor Trait and In-Memory Implementation
//!
//! Defines the storage abstraction through which every other component reads
//! and writes agent records, session state, global memory, and snapshot
//! artifacts. Production deployments back this with a document store; the
//! in-memory implementation here is the reference used by tests and by
//! embedded deployments.

use ::async_trait::async_trait;
use reclaim_core::{
    AgentId, AgentRecord, GlobalMemory, ReclaimResult, SessionState, Snapshot, SnapshotId,
    StateImage, StorageError,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// STORAGE ACCESSOR TRAIT
// ============================================================================

/// Async storage accessor for RECLAIM state.
///
/// One addressable location per agent record, one for the session state, one
/// for global memory, and an append-only collection of snapshot artifacts.
///
/// `load_state` and `replace_state` are required to be atomic: a load
/// observes every record as of a single instant (never a half-written
/// record), and a replace is a total overwrite of all three structures.
#[async_trait]
pub trait StorageAccessor: Send + Sync {
    // ========================================================================
    // AGENT RECORD OPERATIONS
    // ========================================================================

    /// Insert or overwrite an agent record.
    async fn agent_upsert(&self, record: &AgentRecord) -> ReclaimResult<()>;

    /// Get an agent record by id.
    async fn agent_get(&self, id: AgentId) -> ReclaimResult<Option<AgentRecord>>;

    /// List all agent records.
    async fn agent_list(&self) -> ReclaimResult<Vec<AgentRecord>>;

    // ========================================================================
    // SESSION & GLOBAL MEMORY OPERATIONS
    // ========================================================================

    /// Get the session state singleton.
    async fn session_get(&self) -> ReclaimResult<SessionState>;

    /// Overwrite the session state singleton.
    async fn session_put(&self, session: &SessionState) -> ReclaimResult<()>;

    /// Get the global shared memory.
    async fn global_memory_get(&self) -> ReclaimResult<GlobalMemory>;

    /// Overwrite the global shared memory.
    async fn global_memory_put(&self, memory: &GlobalMemory) -> ReclaimResult<()>;

    // ========================================================================
    // WHOLE-STATE OPERATIONS
    // ========================================================================

    /// Consistent read of all tracked state as of a single instant.
    async fn load_state(&self) -> ReclaimResult<StateImage>;

    /// Total replacement of all tracked state. Never a merge.
    async fn replace_state(&self, image: &StateImage) -> ReclaimResult<()>;

    // ========================================================================
    // SNAPSHOT ARTIFACT OPERATIONS
    // ========================================================================

    /// Append a snapshot artifact. Snapshots are immutable once appended.
    async fn snapshot_append(&self, snapshot: &Snapshot) -> ReclaimResult<()>;

    /// Get a snapshot by id.
    async fn snapshot_get(&self, id: SnapshotId) -> ReclaimResult<Option<Snapshot>>;

    /// Get the most recently appended snapshot.
    async fn snapshot_latest(&self) -> ReclaimResult<Option<Snapshot>>;

    /// List all snapshots in append order.
    async fn snapshot_list(&self) -> ReclaimResult<Vec<Snapshot>>;

    // ========================================================================
    // HEALTH & DIAGNOSTICS
    // ========================================================================

    /// Check if the storage backend is reachable.
    async fn health_check(&self) -> ReclaimResult<bool>;

    /// Get storage statistics (counts).
    async fn statistics(&self) -> ReclaimResult<StorageStatistics>;
}

/// Storage statistics for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStatistics {
    pub agent_count: usize,
    pub snapshot_count: usize,
    pub queued_task_count: usize,
    pub channel_count: usize,
}

// ============================================================================
// IN-MEMORY ACCESSOR
// ============================================================================

/// All tracked state behind one lock, so whole-state reads and writes are
/// single-instant atomic.
#[derive(Debug, Default)]
struct InMemoryInner {
    agents: BTreeMap<AgentId, AgentRecord>,
    session: SessionState,
    global_memory: GlobalMemory,
    snapshots: Vec<Snapshot>,
    unavailable: bool,
}

/// In-memory storage accessor.
///
/// Reference implementation for tests and embedded use. Supports failure
/// injection (`set_unavailable`) and state wiping (`clear_all`) so callers
/// can exercise the AccessorUnavailable and CompleteLoss paths.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccessor {
    inner: Arc<RwLock<InMemoryInner>>,
}

impl InMemoryAccessor {
    /// Create an empty accessor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an accessor seeded with an initial state image.
    pub fn with_state(image: StateImage) -> Self {
        let accessor = Self::new();
        {
            let mut inner = accessor.inner.write().expect("storage lock poisoned");
            inner.agents = image.agents;
            inner.session = image.session;
            inner.global_memory = image.global_memory;
        }
        accessor
    }

    /// Toggle simulated unavailability. While unavailable, every operation
    /// returns `StorageError::AccessorUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().expect("storage lock poisoned").unavailable = unavailable;
    }

    /// Wipe agent records, session state, and global memory, keeping the
    /// snapshot collection. Simulates complete loss of live state.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        inner.agents.clear();
        inner.session = SessionState::default();
        inner.global_memory = GlobalMemory::default();
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, InMemoryInner>, StorageError> {
        self.inner.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, InMemoryInner>, StorageError> {
        self.inner.write().map_err(|_| StorageError::LockPoisoned)
    }

    fn ensure_available(inner: &InMemoryInner) -> Result<(), StorageError> {
        if inner.unavailable {
            Err(StorageError::AccessorUnavailable {
                reason: "in-memory accessor marked unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAccessor for InMemoryAccessor {
    async fn agent_upsert(&self, record: &AgentRecord) -> ReclaimResult<()> {
        let mut inner = self.write()?;
        Self::ensure_available(&inner)?;
        inner.agents.insert(record.agent_id, record.clone());
        Ok(())
    }

    async fn agent_get(&self, id: AgentId) -> ReclaimResult<Option<AgentRecord>> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.agents.get(&id).cloned())
    }

    async fn agent_list(&self) -> ReclaimResult<Vec<AgentRecord>> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.agents.values().cloned().collect())
    }

    async fn session_get(&self) -> ReclaimResult<SessionState> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.session.clone())
    }

    async fn session_put(&self, session: &SessionState) -> ReclaimResult<()> {
        let mut inner = self.write()?;
        Self::ensure_available(&inner)?;
        inner.session = session.clone();
        Ok(())
    }

    async fn global_memory_get(&self) -> ReclaimResult<GlobalMemory> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.global_memory.clone())
    }

    async fn global_memory_put(&self, memory: &GlobalMemory) -> ReclaimResult<()> {
        let mut inner = self.write()?;
        Self::ensure_available(&inner)?;
        inner.global_memory = memory.clone();
        Ok(())
    }

    async fn load_state(&self) -> ReclaimResult<StateImage> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(StateImage {
            agents: inner.agents.clone(),
            session: inner.session.clone(),
            global_memory: inner.global_memory.clone(),
        })
    }

    async fn replace_state(&self, image: &StateImage) -> ReclaimResult<()> {
        let mut inner = self.write()?;
        Self::ensure_available(&inner)?;
        inner.agents = image.agents.clone();
        inner.session = image.session.clone();
        inner.global_memory = image.global_memory.clone();
        Ok(())
    }

    async fn snapshot_append(&self, snapshot: &Snapshot) -> ReclaimResult<()> {
        let mut inner = self.write()?;
        Self::ensure_available(&inner)?;
        inner.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn snapshot_get(&self, id: SnapshotId) -> ReclaimResult<Option<Snapshot>> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.snapshots.iter().find(|s| s.snapshot_id == id).cloned())
    }

    async fn snapshot_latest(&self) -> ReclaimResult<Option<Snapshot>> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.snapshots.last().cloned())
    }

    async fn snapshot_list(&self) -> ReclaimResult<Vec<Snapshot>> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(inner.snapshots.clone())
    }

    async fn health_check(&self) -> ReclaimResult<bool> {
        let inner = self.read()?;
        Ok(!inner.unavailable)
    }

    async fn statistics(&self) -> ReclaimResult<StorageStatistics> {
        let inner = self.read()?;
        Self::ensure_available(&inner)?;
        Ok(StorageStatistics {
            agent_count: inner.agents.len(),
            snapshot_count: inner.snapshots.len(),
            queued_task_count: inner.session.task_queues.total_len(),
            channel_count: inner.session.coordination_channels.len(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reclaim_core::{compute_payload_hash, new_entity_id, ReclaimError, RoleSpec};

    fn make_agent() -> AgentRecord {
        AgentRecord::new(RoleSpec::new("coder", vec!["rust".into()]), Utc::now())
    }

    fn make_snapshot(reason: &str) -> Snapshot {
        let payload = b"{}".to_vec();
        Snapshot {
            snapshot_id: new_entity_id(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            integrity_hash: compute_payload_hash(&payload),
            payload,
            schema_version: 1,
        }
    }

    #[tokio::test]
    async fn test_agent_upsert_and_get() {
        let accessor = InMemoryAccessor::new();
        let agent = make_agent();

        accessor.agent_upsert(&agent).await.unwrap();
        let loaded = accessor.agent_get(agent.agent_id).await.unwrap().unwrap();
        assert_eq!(loaded, agent);

        assert!(accessor.agent_get(new_entity_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_and_replace_state() {
        let accessor = InMemoryAccessor::new();
        let agent = make_agent();
        accessor.agent_upsert(&agent).await.unwrap();

        let image = accessor.load_state().await.unwrap();
        assert_eq!(image.agent_count(), 1);

        // Replacement is total: an empty image wipes the agent
        accessor.replace_state(&StateImage::default()).await.unwrap();
        assert!(accessor.agent_list().await.unwrap().is_empty());

        // And a restore puts it back wholesale
        accessor.replace_state(&image).await.unwrap();
        assert_eq!(accessor.agent_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshots_are_append_only_and_ordered() {
        let accessor = InMemoryAccessor::new();
        let first = make_snapshot("first");
        let second = make_snapshot("second");

        accessor.snapshot_append(&first).await.unwrap();
        accessor.snapshot_append(&second).await.unwrap();

        let latest = accessor.snapshot_latest().await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, second.snapshot_id);
        assert_eq!(accessor.snapshot_list().await.unwrap().len(), 2);
        assert_eq!(
            accessor.snapshot_get(first.snapshot_id).await.unwrap().unwrap().reason,
            "first"
        );
    }

    #[tokio::test]
    async fn test_unavailable_accessor_fails_every_operation() {
        let accessor = InMemoryAccessor::new();
        accessor.set_unavailable(true);

        let err = accessor.load_state().await.unwrap_err();
        assert!(matches!(
            err,
            ReclaimError::Storage(StorageError::AccessorUnavailable { .. })
        ));
        assert!(!accessor.health_check().await.unwrap());

        accessor.set_unavailable(false);
        assert!(accessor.health_check().await.unwrap());
        assert!(accessor.load_state().await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_snapshots() {
        let accessor = InMemoryAccessor::new();
        accessor.agent_upsert(&make_agent()).await.unwrap();
        accessor.snapshot_append(&make_snapshot("kept")).await.unwrap();

        accessor.clear_all();

        assert!(accessor.agent_list().await.unwrap().is_empty());
        assert_eq!(accessor.snapshot_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_statistics() {
        let accessor = InMemoryAccessor::new();
        accessor.agent_upsert(&make_agent()).await.unwrap();
        accessor.snapshot_append(&make_snapshot("s")).await.unwrap();

        let stats = accessor.statistics().await.unwrap();
        assert_eq!(stats.agent_count, 1);
        assert_eq!(stats.snapshot_count, 1);
        assert_eq!(stats.queued_task_count, 0);
    }
}
