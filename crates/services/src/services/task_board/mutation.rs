use std::sync::Arc;

use dashmap::DashSet;
use thiserror::Error;
use uuid::Uuid;

use super::{
    client::{DeleteScope, TaskService, TaskServiceError},
    identity::Identity,
    model::{NewTask, TaskPatch, TaskRecord},
    store::SharedWorkingSet,
};

/// What happened to the local copy after the service refused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// The pre-change value was put back.
    Restored,
    /// The local copy cannot be trusted; a full retrieval must run.
    ResyncRequired,
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("task `{0}` already has a pending change")]
    Pending(String),
    #[error("task `{0}` is not in the working set")]
    NotFound(String),
    #[error("invalid task: {0}")]
    Invalid(&'static str),
    #[error("task service rejected the change: {source}")]
    Rejected {
        #[source]
        source: TaskServiceError,
        rollback: Rollback,
    },
}

impl MutationError {
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            MutationError::Rejected {
                rollback: Rollback::ResyncRequired,
                ..
            }
        )
    }
}

/// Clears the pending flag for an id when dropped, whatever the outcome.
struct PendingGuard<'a> {
    pending: &'a DashSet<String>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

type ChangeHook = Box<dyn Fn() + Send + Sync>;

/// Optimistic edits with at most one change in flight per task id.
pub struct MutationCoordinator {
    service: Arc<dyn TaskService>,
    pending: DashSet<String>,
    on_change: Option<ChangeHook>,
}

impl MutationCoordinator {
    pub fn new(service: Arc<dyn TaskService>) -> Self {
        Self {
            service,
            pending: DashSet::new(),
            on_change: None,
        }
    }

    /// Run `hook` after every local change to the working set.
    pub fn with_change_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_change = Some(Box::new(hook));
        self
    }

    fn changed(&self) {
        if let Some(hook) = &self.on_change {
            hook();
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    fn acquire(&self, id: &str) -> Result<PendingGuard<'_>, MutationError> {
        if !self.pending.insert(id.to_string()) {
            tracing::debug!(task_id = %id, "rejecting change; another is pending");
            return Err(MutationError::Pending(id.to_string()));
        }
        Ok(PendingGuard {
            pending: &self.pending,
            id: id.to_string(),
        })
    }

    /// Apply `patch` locally, confirm it remotely, and reconcile or roll back.
    pub async fn mutate(
        &self,
        store: &SharedWorkingSet,
        id: &str,
        patch: TaskPatch,
    ) -> Result<TaskRecord, MutationError> {
        let _guard = self.acquire(id)?;
        if patch.is_empty() {
            return Err(MutationError::Invalid("empty patch"));
        }

        let (previous, revision) = {
            let mut working_set = store.write().await;
            let previous = working_set
                .apply_local_mutation(id, &patch)
                .ok_or_else(|| MutationError::NotFound(id.to_string()))?;
            (previous, working_set.revision())
        };
        self.changed();

        match self.service.update(id, &patch).await {
            Ok(confirmed) => {
                store.write().await.reconcile(id, confirmed.clone());
                self.changed();
                tracing::debug!(task_id = %id, "task change confirmed");
                Ok(confirmed)
            }
            Err(source) => {
                let mut working_set = store.write().await;
                // A replacement ingest while we were waiting makes `previous` stale.
                let rollback = if working_set.revision() == revision && working_set.contains(id) {
                    working_set.upsert(previous);
                    Rollback::Restored
                } else {
                    Rollback::ResyncRequired
                };
                drop(working_set);
                self.changed();
                tracing::warn!(task_id = %id, error = %source, ?rollback, "task change rejected");
                Err(MutationError::Rejected { source, rollback })
            }
        }
    }

    /// Remove optimistically; a failed delete is repaired by a full resync.
    pub async fn delete(
        &self,
        store: &SharedWorkingSet,
        id: &str,
        scope: DeleteScope,
    ) -> Result<(), MutationError> {
        let _guard = self.acquire(id)?;

        let removed = store
            .write()
            .await
            .remove(id)
            .ok_or_else(|| MutationError::NotFound(id.to_string()))?;
        self.changed();

        if scope == DeleteScope::StopRepeating && !removed.repeating {
            tracing::debug!(task_id = %id, "stop-repeating delete on a non-repeating task");
        }

        match self.service.delete(id, scope).await {
            Ok(()) => {
                tracing::debug!(task_id = %id, ?scope, "task deleted");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(task_id = %id, error = %source, "task delete rejected");
                Err(MutationError::Rejected {
                    source,
                    rollback: Rollback::ResyncRequired,
                })
            }
        }
    }

    /// Show a provisional record immediately and swap in the server's copy on
    /// success; drop the provisional record on failure.
    pub async fn create(
        &self,
        store: &SharedWorkingSet,
        task: NewTask,
        identity: &Identity,
    ) -> Result<TaskRecord, MutationError> {
        if task.name.trim().is_empty() {
            return Err(MutationError::Invalid("task name is required"));
        }

        let provisional_id = format!("local-{}", Uuid::new_v4());
        let _guard = self.acquire(&provisional_id)?;

        store
            .write()
            .await
            .upsert(task.provisional(provisional_id.clone(), identity.as_person()));
        self.changed();

        match self.service.create(&task).await {
            Ok(created) => {
                store.write().await.reconcile(&provisional_id, created.clone());
                self.changed();
                tracing::debug!(task_id = %created.id, "task created");
                Ok(created)
            }
            Err(source) => {
                store.write().await.remove(&provisional_id);
                self.changed();
                tracing::warn!(error = %source, "task creation rejected");
                Err(MutationError::Rejected {
                    source,
                    rollback: Rollback::Restored,
                })
            }
        }
    }
}
