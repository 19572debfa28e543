//! RECLAIM Snapshot - Snapshot Manager
//!
//! Serializes the full tracked state to an immutable, integrity-checked
//! artifact and materializes artifacts back into live state. Restore
//! verification is mandatory and ordered: integrity hash, then schema
//! version compatibility, and only then state replacement. A failed
//! verification is fail-closed - live state is never partially written.

use chrono::Utc;
use reclaim_core::{
    compute_payload_hash, new_entity_id, ReclaimError, ReclaimResult, RestoreResult, Snapshot,
    SnapshotError, SnapshotId, StateImage,
};
use reclaim_storage::StorageAccessor;
use std::sync::Arc;

/// Serialization schema version for snapshot payloads. The payload
/// encoding is stable within a version; restore against any other
/// version fails closed.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// SNAPSHOT REFERENCE
// ============================================================================

/// How a caller names the snapshot to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRef {
    /// The most recently created snapshot
    Latest,
    /// A specific snapshot by id
    Id(SnapshotId),
}

impl Default for SnapshotRef {
    fn default() -> Self {
        SnapshotRef::Latest
    }
}

// ============================================================================
// SNAPSHOT MANAGER
// ============================================================================

/// Creates, verifies, and restores snapshot artifacts.
#[derive(Clone)]
pub struct SnapshotManager {
    accessor: Arc<dyn StorageAccessor>,
}

impl SnapshotManager {
    pub fn new(accessor: Arc<dyn StorageAccessor>) -> Self {
        Self { accessor }
    }

    /// Capture all tracked state into a new immutable snapshot.
    ///
    /// The state read is atomic: concurrent agent writes are either fully
    /// included or fully excluded per record, never half-updated (the
    /// accessor contract for `load_state`).
    pub async fn create_snapshot(&self, reason: impl Into<String>) -> ReclaimResult<Snapshot> {
        let reason = reason.into();
        let image = self.accessor.load_state().await?;

        let payload = serde_json::to_vec(&image).map_err(|e| {
            ReclaimError::Snapshot(SnapshotError::EncodingFailed {
                reason: e.to_string(),
            })
        })?;

        let snapshot = Snapshot {
            snapshot_id: new_entity_id(),
            timestamp: Utc::now(),
            reason: reason.clone(),
            integrity_hash: compute_payload_hash(&payload),
            payload,
            schema_version: SNAPSHOT_SCHEMA_VERSION,
        };

        self.accessor.snapshot_append(&snapshot).await?;
        tracing::info!(
            snapshot_id = %snapshot.snapshot_id,
            reason = %reason,
            agents = image.agent_count(),
            "Snapshot created"
        );
        Ok(snapshot)
    }

    /// Restore live state from a snapshot, defaulting to the most recent.
    ///
    /// Verification order is hash, then schema version, then replacement;
    /// any verification failure leaves live state completely unchanged.
    pub async fn restore_snapshot(&self, reference: Option<SnapshotRef>) -> ReclaimResult<RestoreResult> {
        let snapshot = match self.resolve(reference.unwrap_or_default()).await? {
            Some(snapshot) => snapshot,
            None => {
                return Ok(RestoreResult::failure(
                    None,
                    vec![SnapshotError::NoSnapshotAvailable.to_string()],
                ))
            }
        };

        // 1. Integrity gate
        let actual = compute_payload_hash(&snapshot.payload);
        if actual != snapshot.integrity_hash {
            let err = SnapshotError::IntegrityViolation {
                expected: snapshot.integrity_hash.clone(),
                actual,
            };
            tracing::error!(snapshot_id = %snapshot.snapshot_id, error = %err, "Snapshot rejected");
            return Ok(RestoreResult::failure(
                Some(snapshot.snapshot_id),
                vec![err.to_string()],
            ));
        }

        // 2. Schema compatibility gate
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            let err = SnapshotError::SchemaIncompatible {
                found: snapshot.schema_version,
                supported: SNAPSHOT_SCHEMA_VERSION,
            };
            tracing::error!(snapshot_id = %snapshot.snapshot_id, error = %err, "Snapshot rejected");
            return Ok(RestoreResult::failure(
                Some(snapshot.snapshot_id),
                vec![err.to_string()],
            ));
        }

        // 3. Decode, then total replacement
        let image: StateImage = match serde_json::from_slice(&snapshot.payload) {
            Ok(image) => image,
            Err(e) => {
                return Ok(RestoreResult::failure(
                    Some(snapshot.snapshot_id),
                    vec![format!("snapshot payload undecodable: {e}")],
                ))
            }
        };

        self.accessor.replace_state(&image).await?;
        tracing::info!(
            snapshot_id = %snapshot.snapshot_id,
            agents = image.agent_count(),
            "State restored from snapshot"
        );
        Ok(RestoreResult::success(snapshot.snapshot_id, image.agent_count()))
    }

    /// Human-readable description of a snapshot's contents.
    ///
    /// Read-only and never fails hard: malformed input degrades to a
    /// "summary unavailable" message.
    pub async fn generate_summary(&self, snapshot: Option<&Snapshot>) -> String {
        let owned;
        let snapshot = match snapshot {
            Some(s) => s,
            None => match self.accessor.snapshot_latest().await {
                Ok(Some(latest)) => {
                    owned = latest;
                    &owned
                }
                Ok(None) => return "summary unavailable: no snapshot exists".to_string(),
                Err(e) => return format!("summary unavailable: {e}"),
            },
        };

        let image: StateImage = match serde_json::from_slice(&snapshot.payload) {
            Ok(image) => image,
            Err(_) => {
                return format!(
                    "summary unavailable: snapshot {} has an undecodable payload",
                    snapshot.snapshot_id
                )
            }
        };

        let queues = &image.session.task_queues;
        let hash_ok = compute_payload_hash(&snapshot.payload) == snapshot.integrity_hash;
        format!(
            "snapshot {} ({}) captured {}: {} agents, {} registered, tasks {}/{}/{}/{} (pending/active/completed/blocked), {} channels, integrity {}",
            snapshot.snapshot_id,
            snapshot.reason,
            snapshot.timestamp.to_rfc3339(),
            image.agent_count(),
            image.session.registry.len(),
            queues.pending.len(),
            queues.active.len(),
            queues.completed.len(),
            queues.blocked.len(),
            image.session.coordination_channels.len(),
            if hash_ok { "verified" } else { "MISMATCH" },
        )
    }

    async fn resolve(&self, reference: SnapshotRef) -> ReclaimResult<Option<Snapshot>> {
        match reference {
            SnapshotRef::Latest => self.accessor.snapshot_latest().await,
            SnapshotRef::Id(id) => self.accessor.snapshot_get(id).await,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_core::{AgentRecord, RoleSpec, SessionState, StorageError};
    use reclaim_storage::InMemoryAccessor;

    async fn seeded_accessor() -> InMemoryAccessor {
        let accessor = InMemoryAccessor::new();
        let now = Utc::now();
        let mut agent = AgentRecord::new(RoleSpec::new("coder", vec!["rust".into()]), now);
        agent.write_memory("notes", serde_json::json!({"current": "T1"}), now);

        let mut session = SessionState::default();
        session.registry.insert(agent.agent_id, agent.role_spec.clone());

        accessor.agent_upsert(&agent).await.unwrap();
        accessor.session_put(&session).await.unwrap();
        accessor
    }

    fn manager(accessor: &InMemoryAccessor) -> SnapshotManager {
        SnapshotManager::new(Arc::new(accessor.clone()))
    }

    #[tokio::test]
    async fn test_create_then_restore_round_trip() {
        let accessor = seeded_accessor().await;
        let manager = manager(&accessor);
        let before = accessor.load_state().await.unwrap();

        let snapshot = manager.create_snapshot("pre-change").await.unwrap();
        assert_eq!(snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(snapshot.integrity_hash, compute_payload_hash(&snapshot.payload));

        // Wreck live state, then restore
        accessor.clear_all();
        assert_eq!(accessor.load_state().await.unwrap().agent_count(), 0);

        let result = manager.restore_snapshot(None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.snapshot_id, Some(snapshot.snapshot_id));
        assert_eq!(result.restored_agents, 1);

        let after = accessor.load_state().await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_restore_specific_snapshot_by_id() {
        let accessor = seeded_accessor().await;
        let manager = manager(&accessor);

        let first = manager.create_snapshot("first").await.unwrap();
        accessor.clear_all();
        manager.create_snapshot("empty").await.unwrap();

        let result = manager
            .restore_snapshot(Some(SnapshotRef::Id(first.snapshot_id)))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(accessor.load_state().await.unwrap().agent_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_payload_fails_closed() {
        let accessor = seeded_accessor().await;
        let manager = manager(&accessor);
        manager.create_snapshot("pre-corruption").await.unwrap();

        // Corrupt one byte of the persisted payload
        let mut snapshot = accessor.snapshot_latest().await.unwrap().unwrap();
        snapshot.payload[0] ^= 0xFF;
        // Re-append under a fresh id so the corrupted copy is the latest
        snapshot.snapshot_id = new_entity_id();
        accessor.snapshot_append(&snapshot).await.unwrap();

        let live_before = accessor.load_state().await.unwrap();
        let result = manager.restore_snapshot(None).await.unwrap();

        assert!(!result.success);
        assert!(result.errors[0].contains("Integrity violation"));
        // Live state completely unchanged
        assert_eq!(accessor.load_state().await.unwrap(), live_before);
    }

    #[tokio::test]
    async fn test_incompatible_schema_version_fails_closed() {
        let accessor = seeded_accessor().await;
        let manager = manager(&accessor);
        let mut snapshot = manager.create_snapshot("future-version").await.unwrap();

        snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;
        snapshot.snapshot_id = new_entity_id();
        accessor.snapshot_append(&snapshot).await.unwrap();

        let live_before = accessor.load_state().await.unwrap();
        let result = manager.restore_snapshot(None).await.unwrap();

        assert!(!result.success);
        assert!(result.errors[0].contains("Schema incompatible"));
        assert_eq!(accessor.load_state().await.unwrap(), live_before);
    }

    #[tokio::test]
    async fn test_hash_gate_runs_before_schema_gate() {
        let accessor = seeded_accessor().await;
        let manager = manager(&accessor);
        let mut snapshot = manager.create_snapshot("doubly-bad").await.unwrap();

        // Both defects present: the integrity error must win (ordering)
        snapshot.payload[0] ^= 0xFF;
        snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 7;
        snapshot.snapshot_id = new_entity_id();
        accessor.snapshot_append(&snapshot).await.unwrap();

        let result = manager.restore_snapshot(None).await.unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("Integrity violation"));
    }

    #[tokio::test]
    async fn test_restore_with_no_snapshot() {
        let accessor = InMemoryAccessor::new();
        let result = manager(&accessor).restore_snapshot(None).await.unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("No snapshot available"));
    }

    #[tokio::test]
    async fn test_create_snapshot_fails_when_accessor_down() {
        let accessor = seeded_accessor().await;
        accessor.set_unavailable(true);

        let err = manager(&accessor).create_snapshot("doomed").await.unwrap_err();
        assert!(matches!(
            err,
            ReclaimError::Storage(StorageError::AccessorUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_summary_describes_contents() {
        let accessor = seeded_accessor().await;
        let manager = manager(&accessor);
        let snapshot = manager.create_snapshot("pre-deployment-backup").await.unwrap();

        let summary = manager.generate_summary(Some(&snapshot)).await;
        assert!(summary.contains("pre-deployment-backup"));
        assert!(summary.contains("1 agents"));
        assert!(summary.contains("integrity verified"));

        // Defaults to the latest snapshot
        let summary = manager.generate_summary(None).await;
        assert!(summary.contains("pre-deployment-backup"));
    }

    #[tokio::test]
    async fn test_summary_degrades_on_malformed_input() {
        let accessor = InMemoryAccessor::new();
        let manager = manager(&accessor);

        // No snapshot at all
        let summary = manager.generate_summary(None).await;
        assert!(summary.contains("summary unavailable"));

        // Undecodable payload
        let garbled = Snapshot {
            snapshot_id: new_entity_id(),
            timestamp: Utc::now(),
            reason: "garbled".into(),
            payload: b"not json".to_vec(),
            integrity_hash: compute_payload_hash(b"not json"),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
        };
        let summary = manager.generate_summary(Some(&garbled)).await;
        assert!(summary.contains("summary unavailable"));
    }
}
