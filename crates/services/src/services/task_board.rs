pub mod client;
pub mod config;
pub mod identity;
pub mod invalidation;
pub mod model;
pub mod mutation;
pub mod pipeline;
pub mod retrieval;
pub mod reveal;
pub mod store;

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use utils::debounce::Debouncer;

use self::{
    client::{DeleteScope, TaskService},
    config::BoardSettings,
    identity::Identity,
    invalidation::InvalidationEvent,
    model::{NewTask, Priority, TaskPatch, TaskRecord},
    mutation::{MutationCoordinator, MutationError},
    pipeline::{Criterion, SortOrder, ViewQuery},
    retrieval::{RetrievalCoordinator, RetrievalError, RetrievalState},
    reveal::{RevealEngine, RevealMode},
    store::{FilterOptions, SharedWorkingSet, WorkingSet},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierView {
    pub priority: Priority,
    /// The revealed prefix of the tier.
    pub rows: Vec<TaskRecord>,
    pub total: usize,
    pub has_more: bool,
}

/// Everything a presentation layer needs to draw the board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardSnapshot {
    /// Sequence of the recompute that produced the rows.
    pub sequence: u64,
    /// Generation to pass back with proximity signals.
    pub generation: u64,
    pub query: ViewQuery,
    pub mode: RevealMode,
    pub tiers: Vec<TierView>,
    pub total: usize,
    pub page: usize,
    pub page_count: usize,
    pub page_rows: Vec<TaskRecord>,
    pub loading: bool,
    pub progress: RetrievalState,
    pub error: Option<String>,
    pub filter_options: FilterOptions,
}

impl BoardSnapshot {
    pub fn tier(&self, priority: Priority) -> Option<&TierView> {
        self.tiers.iter().find(|t| t.priority == priority)
    }
}

struct ViewState {
    query: ViewQuery,
    /// Query the reveal engine was last reset for.
    installed: Option<ViewQuery>,
    reveal: RevealEngine,
    published: u64,
}

impl ViewState {
    fn render(&self, out: &mut BoardSnapshot) {
        let reveal = &self.reveal;
        out.sequence = self.published;
        out.generation = reveal.generation();
        out.query = self.query.clone();
        out.mode = reveal.mode();
        out.tiers = Priority::ALL
            .into_iter()
            .map(|priority| TierView {
                priority,
                rows: reveal.visible_slice(priority).to_vec(),
                total: reveal.tiers().get(priority).len(),
                has_more: reveal.has_more(priority),
            })
            .collect();
        out.total = reveal.tiers().total();
        out.page = reveal.page();
        out.page_count = reveal.page_count();
        out.page_rows = reveal.page_rows().into_iter().cloned().collect();
    }
}

struct BoardInner {
    identity: Identity,
    store: SharedWorkingSet,
    retrieval: RetrievalCoordinator,
    mutations: MutationCoordinator,
    view: Mutex<ViewState>,
    snapshot: watch::Sender<BoardSnapshot>,
    sequence: AtomicU64,
    loaded: AtomicBool,
    recompute: Debouncer,
}

impl BoardInner {
    async fn recompute(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let query = self.view.lock().await.query.clone();

        let (filtered, filter_options) = {
            let working_set = self.store.read().await;
            (
                pipeline::apply_query(working_set.iter(), &query, &self.identity),
                working_set.filter_options().clone(),
            )
        };

        let mut view = self.view.lock().await;
        if sequence < view.published {
            tracing::debug!(
                sequence,
                published = view.published,
                "dropping stale recompute"
            );
            return;
        }
        view.published = sequence;

        let rows = filtered.len();
        if view.installed.as_ref() == Some(&query) {
            view.reveal.refresh(filtered);
        } else {
            view.reveal.reset(filtered);
            view.installed = Some(query);
        }
        tracing::debug!(
            sequence,
            rows,
            generation = view.reveal.generation(),
            "view recomputed"
        );

        self.snapshot.send_modify(|snapshot| {
            view.render(snapshot);
            snapshot.filter_options = filter_options;
        });
    }

    async fn publish_view(&self) {
        let view = self.view.lock().await;
        self.snapshot.send_modify(|snapshot| view.render(snapshot));
    }

    fn sync_progress(&self) {
        let state = self.retrieval.state();
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.progress == state {
                return false;
            }
            snapshot.loading = state.is_loading();
            snapshot.progress = state;
            true
        });
    }

    fn set_error(&self, error: Option<String>) {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.error == error {
                return false;
            }
            snapshot.error = error;
            true
        });
    }
}

/// The task board: working set, derived view, and the operations that change
/// either. Cheap to clone; clones share state.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct TaskBoard {
    inner: Arc<BoardInner>,
}

impl TaskBoard {
    pub fn new(service: Arc<dyn TaskService>, identity: Identity, settings: BoardSettings) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<BoardInner>| {
            let recompute = {
                let weak = weak.clone();
                Debouncer::spawn(settings.debounce, move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.recompute().await;
                        }
                    }
                })
            };

            let mutations = {
                let weak = weak.clone();
                // Optimistic edits render right away instead of waiting out the debounce.
                MutationCoordinator::new(service.clone()).with_change_hook(move || {
                    if let Some(inner) = weak.upgrade() {
                        tokio::spawn(async move { inner.recompute().await });
                    }
                })
            };

            let (snapshot, _) = watch::channel(BoardSnapshot::default());

            BoardInner {
                identity,
                store: WorkingSet::shared(),
                retrieval: RetrievalCoordinator::new(service, settings.fetch_page_size),
                mutations,
                view: Mutex::new(ViewState {
                    query: ViewQuery::default(),
                    installed: None,
                    reveal: RevealEngine::new(&settings),
                    published: 0,
                }),
                snapshot,
                sequence: AtomicU64::new(0),
                loaded: AtomicBool::new(false),
                recompute,
            }
        });

        spawn_progress_forwarder(&inner);
        Self { inner }
    }

    pub fn subscribe(&self) -> watch::Receiver<BoardSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn store(&self) -> &SharedWorkingSet {
        &self.inner.store
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.mutations.is_pending(id)
    }

    /// Full retrieval into the working set. The first successful load renders
    /// immediately; later ones go through the debounce.
    pub async fn refresh(&self) -> Result<usize, RetrievalError> {
        let assignee = self.inner.view.lock().await.query.criteria.assignee.clone();
        let scope = self.inner.identity.retrieval_scope(assignee.as_deref());
        match self
            .inner
            .retrieval
            .retrieve_into(&self.inner.store, &scope)
            .await
        {
            Ok(count) => {
                self.inner.sync_progress();
                self.inner.set_error(None);
                if self.inner.loaded.swap(true, Ordering::SeqCst) {
                    self.inner.recompute.trigger();
                } else {
                    self.inner.recompute().await;
                }
                Ok(count)
            }
            Err(RetrievalError::Cancelled) => Err(RetrievalError::Cancelled),
            Err(err) => {
                self.inner.sync_progress();
                self.inner.set_error(Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn update_query(&self, change: impl FnOnce(&mut ViewQuery) -> bool) -> bool {
        let changed = {
            let mut view = self.inner.view.lock().await;
            change(&mut view.query)
        };
        if changed {
            self.inner.recompute.trigger();
        }
        changed
    }

    /// A standard user choosing or clearing an assignee filter changes what the
    /// service is asked for, so that also starts a refresh.
    pub async fn set_criterion(&self, criterion: Criterion) -> bool {
        let rescopes =
            !self.inner.identity.is_admin() && matches!(criterion, Criterion::Assignee(_));
        let changed = self.update_query(|query| query.criteria.set(criterion)).await;
        if changed && rescopes {
            let board = self.clone();
            tokio::spawn(async move {
                match board.refresh().await {
                    Ok(_) | Err(RetrievalError::Cancelled) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "refresh after assignee change failed")
                    }
                }
            });
        }
        changed
    }

    pub async fn set_search_term(&self, term: impl Into<String>) -> bool {
        let term = term.into();
        self.update_query(|query| {
            if query.search_term == term {
                return false;
            }
            query.search_term = term;
            true
        })
        .await
    }

    pub async fn set_hide_completed(&self, hide: bool) -> bool {
        self.update_query(|query| {
            let changed = query.hide_completed != hide;
            query.hide_completed = hide;
            changed
        })
        .await
    }

    pub async fn toggle_sort_order(&self) -> SortOrder {
        let mut order = SortOrder::default();
        self.update_query(|query| {
            query.sort_order = query.sort_order.toggled();
            order = query.sort_order;
            true
        })
        .await;
        order
    }

    /// Proximity signal for `tier`, issued against the view `generation`.
    pub async fn grow_window(&self, tier: Priority, generation: u64) -> bool {
        let grown = self
            .inner
            .view
            .lock()
            .await
            .reveal
            .grow_window(tier, generation);
        if grown {
            self.inner.publish_view().await;
        }
        grown
    }

    pub async fn set_reveal_mode(&self, mode: RevealMode) {
        self.inner.view.lock().await.reveal.set_mode(mode);
        self.inner.publish_view().await;
    }

    pub async fn set_page(&self, page: usize) -> usize {
        let page = self.inner.view.lock().await.reveal.set_page(page);
        self.inner.publish_view().await;
        page
    }

    pub async fn mutate(&self, id: &str, patch: TaskPatch) -> Result<TaskRecord, MutationError> {
        let res = self
            .inner
            .mutations
            .mutate(&self.inner.store, id, patch)
            .await;
        self.after_mutation(res).await
    }

    pub async fn delete(&self, id: &str, scope: DeleteScope) -> Result<(), MutationError> {
        let res = self
            .inner
            .mutations
            .delete(&self.inner.store, id, scope)
            .await;
        self.after_mutation(res).await
    }

    pub async fn create(&self, task: NewTask) -> Result<TaskRecord, MutationError> {
        let res = self
            .inner
            .mutations
            .create(&self.inner.store, task, &self.inner.identity)
            .await;
        self.after_mutation(res).await
    }

    async fn after_mutation<T>(
        &self,
        res: Result<T, MutationError>,
    ) -> Result<T, MutationError> {
        let err = match res {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if matches!(err, MutationError::Rejected { .. }) {
            self.inner.set_error(Some(err.to_string()));
        }
        if err.needs_resync() {
            tracing::info!("resynchronising after a change that could not be rolled back");
            if let Err(resync) = self.refresh().await {
                tracing::warn!(error = %resync, "resync after failed change did not complete");
            }
        }
        Err(err)
    }

    /// Run a full retrieval for every change notice until the channel closes.
    /// Each notice cancels the retrieval the previous one started.
    pub fn attach_invalidation(
        &self,
        mut events: mpsc::UnboundedReceiver<InvalidationEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                tracing::debug!(kind = event.kind(), "refreshing after change notice");
                let board = TaskBoard { inner };
                tokio::spawn(async move {
                    match board.refresh().await {
                        Ok(_) | Err(RetrievalError::Cancelled) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "refresh after change notice failed")
                        }
                    }
                });
            }
            tracing::debug!("invalidation channel closed");
        })
    }
}

fn spawn_progress_forwarder(inner: &Arc<BoardInner>) {
    let mut progress = inner.retrieval.subscribe();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let state = progress.borrow_and_update().clone();
            inner.snapshot.send_modify(|snapshot| {
                snapshot.loading = state.is_loading();
                snapshot.progress = state;
            });
        }
    });
}
