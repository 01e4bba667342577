//! StateStore: redb-backed persistence for Stagecraft.
//!
//! Typed operations over runs, approvals, abort requests, releases and
//! scaling state. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use stagecraft_core::Fleet;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [RUNS, APPROVALS, ABORTS, RELEASES, SCALING] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert or update a run record.
    pub fn put_run(&self, run: &RunRecord) -> StateResult<()> {
        self.put_json(RUNS, &run.run_id, run)?;
        debug!(run_id = %run.run_id, status = ?run.status, "run stored");
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> StateResult<Option<RunRecord>> {
        self.get_json(RUNS, run_id)
    }

    /// List all runs, oldest first.
    pub fn list_runs(&self) -> StateResult<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self.list_json(RUNS, "")?;
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    /// Non-terminal runs of the named pipeline.
    pub fn active_runs_for_pipeline(&self, pipeline: &str) -> StateResult<Vec<RunRecord>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|r| r.pipeline.name() == pipeline && !r.status.is_terminal())
            .collect())
    }

    /// Persist a run whose attempt just turned `Healthy` together with the
    /// stage's new last-known-good release, in one transaction.
    pub fn put_run_with_release(&self, run: &RunRecord, release: &StageRelease) -> StateResult<()> {
        let run_bytes = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let release_bytes = serde_json::to_vec(release).map_err(map_err!(Serialize))?;
        let release_key = release.table_key();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            runs.insert(run.run_id.as_str(), run_bytes.as_slice())
                .map_err(map_err!(Write))?;
            let mut releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            releases
                .insert(release_key.as_str(), release_bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(run_id = %run.run_id, key = %release_key, "run and release stored");
        Ok(())
    }

    // ── Approvals ──────────────────────────────────────────────────

    pub fn put_approval(&self, approval: &ApprovalRecord) -> StateResult<()> {
        self.put_json(APPROVALS, &approval.table_key(), approval)
    }

    /// Approval for exactly this `(run, stage)` pair.
    pub fn get_approval(&self, run_id: &str, stage: &str) -> StateResult<Option<ApprovalRecord>> {
        self.get_json(APPROVALS, &approval_key(run_id, stage))
    }

    pub fn delete_approval(&self, run_id: &str, stage: &str) -> StateResult<bool> {
        self.remove(APPROVALS, &approval_key(run_id, stage))
    }

    // ── Abort requests ─────────────────────────────────────────────

    pub fn put_abort(&self, request: &AbortRequest) -> StateResult<()> {
        self.put_json(ABORTS, &request.run_id, request)
    }

    pub fn get_abort(&self, run_id: &str) -> StateResult<Option<AbortRequest>> {
        self.get_json(ABORTS, run_id)
    }

    pub fn clear_abort(&self, run_id: &str) -> StateResult<bool> {
        self.remove(ABORTS, run_id)
    }

    // ── Releases ───────────────────────────────────────────────────

    pub fn put_release(&self, release: &StageRelease) -> StateResult<()> {
        self.put_json(RELEASES, &release.table_key(), release)
    }

    /// Last known-good artifact for a stage.
    pub fn get_release(&self, pipeline: &str, stage: &str) -> StateResult<Option<StageRelease>> {
        self.get_json(RELEASES, &release_key(pipeline, stage))
    }

    // ── Scaling ────────────────────────────────────────────────────

    pub fn put_scaling(&self, state: &ScalingState) -> StateResult<()> {
        self.put_json(SCALING, &state.table_key(), state)
    }

    pub fn get_scaling(
        &self,
        pipeline: &str,
        stage: &str,
        fleet: Fleet,
    ) -> StateResult<Option<ScalingState>> {
        self.get_json(SCALING, &scaling_key(pipeline, stage, fleet))
    }

    /// Every persisted fleet, across all pipelines.
    pub fn list_scaling(&self) -> StateResult<Vec<ScalingState>> {
        self.list_json(SCALING, "")
    }

    pub fn list_scaling_for_stage(&self, pipeline: &str, stage: &str) -> StateResult<Vec<ScalingState>> {
        let states: Vec<ScalingState> = self.list_json(SCALING, &format!("{}:", release_key(pipeline, stage)))?;
        Ok(states
            .into_iter()
            .filter(|s| s.pipeline == pipeline && s.stage == stage)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecraft_core::{
        ArtifactReference, CapacityBounds, ContentDigest, Environment, HealthEndpoint, Pipeline,
        SourceRevision, StageDescriptor,
    };
    use stagecraft_rollout::DeploymentAttempt;

    fn test_pipeline(name: &str) -> Pipeline {
        let stage = |n: &str, production| StageDescriptor {
            name: n.to_string(),
            environment: Environment {
                region: "us-east-1".to_string(),
                account: "1234".to_string(),
            },
            production,
            compute_capacity: CapacityBounds::new(1, 2),
            task_capacity: CapacityBounds::new(1, 2),
            secret_ref: "secret".to_string(),
            health_endpoint: HealthEndpoint {
                address: "127.0.0.1:1".to_string(),
                path: "/health".to_string(),
            },
        };
        Pipeline::new(name, vec![stage("dev", false), stage("prod", true)]).unwrap()
    }

    fn artifact(digest: &str) -> ArtifactReference {
        ArtifactReference::new("registry/app", ContentDigest::parse(digest).unwrap())
    }

    fn test_run(run_id: &str, pipeline: &str, created_at: u64) -> RunRecord {
        RunRecord::new(
            run_id.to_string(),
            test_pipeline(pipeline),
            SourceRevision::new("org/app", "main", "abc"),
            created_at,
        )
    }

    // ── Runs ───────────────────────────────────────────────────────

    #[test]
    fn run_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let mut run = test_run("run-1", "svc", 1000);
        run.artifact = Some(artifact("sha256:abc"));
        run.attempts.push(DeploymentAttempt::new("dev", artifact("sha256:abc"), None, 1000));

        store.put_run(&run).unwrap();
        assert_eq!(store.get_run("run-1").unwrap(), Some(run));
        assert!(store.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn list_runs_sorted_by_creation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_run(&test_run("b", "svc", 2000)).unwrap();
        store.put_run(&test_run("a", "svc", 3000)).unwrap();
        store.put_run(&test_run("c", "svc", 1000)).unwrap();

        let ids: Vec<_> = store.list_runs().unwrap().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn active_runs_exclude_terminal_and_other_pipelines() {
        let store = StateStore::open_in_memory().unwrap();
        let mut done = test_run("done", "svc", 1);
        done.status = RunStatus::Completed;
        store.put_run(&done).unwrap();
        store.put_run(&test_run("live", "svc", 2)).unwrap();
        store.put_run(&test_run("other", "other-svc", 3)).unwrap();

        let active = store.active_runs_for_pipeline("svc").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, "live");
    }

    #[test]
    fn run_with_release_is_atomic_pair() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run("run-1", "svc", 1);
        let release = StageRelease {
            pipeline: "svc".to_string(),
            stage: "dev".to_string(),
            artifact: artifact("sha256:abc"),
            run_id: "run-1".to_string(),
            released_at: 5,
        };

        store.put_run_with_release(&run, &release).unwrap();
        assert!(store.get_run("run-1").unwrap().is_some());
        assert_eq!(store.get_release("svc", "dev").unwrap(), Some(release));
        assert!(store.get_release("svc", "prod").unwrap().is_none());
    }

    // ── Approvals & aborts ─────────────────────────────────────────

    #[test]
    fn approvals_are_scoped_to_run_and_stage() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_approval(&ApprovalRecord {
                run_id: "run-1".to_string(),
                stage: "prod".to_string(),
                approved_by: Some("alice".to_string()),
                approved_at: 10,
            })
            .unwrap();

        assert!(store.get_approval("run-1", "prod").unwrap().is_some());
        assert!(store.get_approval("run-2", "prod").unwrap().is_none());
        assert!(store.get_approval("run-1", "beta").unwrap().is_none());

        assert!(store.delete_approval("run-1", "prod").unwrap());
        assert!(store.get_approval("run-1", "prod").unwrap().is_none());
    }

    #[test]
    fn abort_requests() {
        let store = StateStore::open_in_memory().unwrap();
        let req = AbortRequest {
            run_id: "run-1".to_string(),
            reason: "operator".to_string(),
            requested_at: 7,
        };
        store.put_abort(&req).unwrap();
        assert_eq!(store.get_abort("run-1").unwrap(), Some(req));
        assert!(store.clear_abort("run-1").unwrap());
        assert!(!store.clear_abort("run-1").unwrap());
    }

    // ── Scaling ────────────────────────────────────────────────────

    #[test]
    fn scaling_state_per_fleet() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_scaling(&ScalingState::new("svc", "dev", Fleet::Compute, 1)).unwrap();
        store.put_scaling(&ScalingState::new("svc", "dev", Fleet::Task, 2)).unwrap();
        store.put_scaling(&ScalingState::new("svc", "dev-2", Fleet::Task, 5)).unwrap();

        let task = store.get_scaling("svc", "dev", Fleet::Task).unwrap().unwrap();
        assert_eq!(task.current_count, 2);
        assert_eq!(store.list_scaling_for_stage("svc", "dev").unwrap().len(), 2);
    }

    #[test]
    fn scaling_for_stage_matches_exact_stage() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_scaling(&ScalingState::new("svc", "dev", Fleet::Compute, 1)).unwrap();
        store.put_scaling(&ScalingState::new("svc", "dev:x", Fleet::Compute, 4)).unwrap();

        let states = store.list_scaling_for_stage("svc", "dev").unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].current_count, 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let mut run = test_run("run-1", "svc", 1);
            run.status = RunStatus::AwaitingApproval;
            store.put_run(&run).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let run = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::AwaitingApproval);
        assert_eq!(run.pipeline.stages().len(), 2);
    }
}
