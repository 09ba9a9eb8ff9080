use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use super::{
    client::{TaskScope, TaskService, TaskServiceError},
    model::TaskRecord,
    store::SharedWorkingSet,
};

// Upper bound on fallback pages for a service that never reports the end.
const MAX_FALLBACK_PAGES: u32 = 10_000;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("retrieval superseded by a newer request")]
    Cancelled,
    #[error("task retrieval failed (bulk: {primary}; paged: {fallback})")]
    Exhausted {
        primary: TaskServiceError,
        fallback: TaskServiceError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RetrievalState {
    #[default]
    Idle,
    FetchingPrimary,
    FetchingFallback {
        page: u32,
        records_so_far: usize,
    },
    Done {
        count: usize,
    },
    Failed {
        message: String,
    },
}

impl RetrievalState {
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            RetrievalState::FetchingPrimary | RetrievalState::FetchingFallback { .. }
        )
    }
}

impl fmt::Display for RetrievalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalState::Idle => f.write_str("idle"),
            RetrievalState::FetchingPrimary => f.write_str("Loading tasks..."),
            RetrievalState::FetchingFallback {
                page,
                records_so_far,
            } => write!(f, "Loading tasks: {records_so_far} so far (page {page})"),
            RetrievalState::Done { count } => write!(f, "Loaded {count} tasks"),
            RetrievalState::Failed { message } => write!(f, "Failed to load tasks: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Bulk,
    Paged,
}

#[derive(Debug)]
pub struct Retrieval {
    pub generation: u64,
    pub strategy: Strategy,
    pub tasks: Vec<TaskRecord>,
}

/// Fetches the full working set: one bulk request, falling back to paging
/// when the bulk request fails. A new call cancels the one in flight, and only
/// the latest call may commit.
pub struct RetrievalCoordinator {
    service: Arc<dyn TaskService>,
    page_size: u32,
    generation: AtomicU64,
    in_flight: Mutex<Option<CancellationToken>>,
    state: watch::Sender<RetrievalState>,
}

impl RetrievalCoordinator {
    pub fn new(service: Arc<dyn TaskService>, page_size: u32) -> Self {
        let (state, _) = watch::channel(RetrievalState::Idle);
        Self {
            service,
            page_size: page_size.max(1),
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RetrievalState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RetrievalState {
        self.state.borrow().clone()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn begin(&self) -> (u64, CancellationToken) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(previous) = in_flight.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *in_flight = Some(token.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (generation, token)
    }

    fn publish(&self, generation: u64, state: RetrievalState) {
        if self.is_current(generation) {
            self.state.send_replace(state);
        }
    }

    pub async fn retrieve(&self, scope: &TaskScope) -> Result<Retrieval, RetrievalError> {
        let (generation, token) = self.begin().await;
        self.publish(generation, RetrievalState::FetchingPrimary);

        let primary = tokio::select! {
            _ = token.cancelled() => return Err(RetrievalError::Cancelled),
            res = self.service.list_all(scope) => res,
        };

        let (strategy, tasks) = match primary {
            Ok(resp) => (Strategy::Bulk, resp.tasks),
            Err(primary) => {
                tracing::warn!(
                    error = %primary,
                    "bulk task retrieval failed; falling back to paging"
                );
                match self.fetch_pages(scope, &token, generation).await {
                    Ok(tasks) => (Strategy::Paged, tasks),
                    Err(PageFailure::Cancelled) => return Err(RetrievalError::Cancelled),
                    Err(PageFailure::Service(fallback)) => {
                        let err = RetrievalError::Exhausted { primary, fallback };
                        tracing::error!(error = %err, "task retrieval exhausted");
                        self.publish(
                            generation,
                            RetrievalState::Failed {
                                message: err.to_string(),
                            },
                        );
                        return Err(err);
                    }
                }
            }
        };

        if token.is_cancelled() || !self.is_current(generation) {
            return Err(RetrievalError::Cancelled);
        }

        tracing::info!(count = tasks.len(), ?strategy, generation, "retrieved tasks");
        self.publish(generation, RetrievalState::Done { count: tasks.len() });

        Ok(Retrieval {
            generation,
            strategy,
            tasks,
        })
    }

    /// Retrieve and replace the working set, unless a newer retrieval started
    /// in the meantime. Returns the committed record count.
    pub async fn retrieve_into(
        &self,
        store: &SharedWorkingSet,
        scope: &TaskScope,
    ) -> Result<usize, RetrievalError> {
        let retrieval = self.retrieve(scope).await?;

        let mut working_set = store.write().await;
        if !self.is_current(retrieval.generation) {
            tracing::debug!(
                generation = retrieval.generation,
                "discarding superseded retrieval result"
            );
            return Err(RetrievalError::Cancelled);
        }
        working_set.ingest(retrieval.tasks);
        Ok(working_set.len())
    }

    async fn fetch_pages(
        &self,
        scope: &TaskScope,
        token: &CancellationToken,
        generation: u64,
    ) -> Result<Vec<TaskRecord>, PageFailure> {
        let mut tasks = Vec::new();
        let mut page = 1;

        loop {
            if token.is_cancelled() {
                return Err(PageFailure::Cancelled);
            }
            self.publish(
                generation,
                RetrievalState::FetchingFallback {
                    page,
                    records_so_far: tasks.len(),
                },
            );

            let res = tokio::select! {
                _ = token.cancelled() => return Err(PageFailure::Cancelled),
                res = self.service.list_page(page, self.page_size, scope) => res,
            };
            let resp = res.map_err(PageFailure::Service)?;

            let received = resp.tasks.len();
            tasks.extend(resp.tasks);
            tracing::debug!(page, received, total = tasks.len(), "fetched task page");

            let short_page = received < self.page_size as usize;
            if short_page || resp.has_more == Some(false) {
                break;
            }
            if page >= MAX_FALLBACK_PAGES {
                tracing::warn!(page, "stopping paged retrieval at page limit");
                break;
            }
            page += 1;
        }

        Ok(tasks)
    }
}

enum PageFailure {
    Cancelled,
    Service(TaskServiceError),
}
