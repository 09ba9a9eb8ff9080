use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use serde::Serialize;
use tokio::sync::RwLock;

use super::model::{TaskPatch, TaskRecord};

pub type SharedWorkingSet = Arc<RwLock<WorkingSet>>;

/// Values offered by the assigned-by and status filter pickers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOptions {
    pub assigned_by: Vec<String>,
    pub statuses: Vec<String>,
}

/// Deduplicated, id-indexed collection of every task known locally.
///
/// Iteration order is the order records were ingested or inserted, which is the
/// input order for the filter pipeline.
#[derive(Debug, Default)]
pub struct WorkingSet {
    order: Vec<String>,
    records: HashMap<String, TaskRecord>,
    filter_options: FilterOptions,
    revision: u64,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedWorkingSet {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Replace the whole set. Later records repeating an earlier id are dropped.
    /// Returns the number of duplicates discarded.
    pub fn ingest(&mut self, records: Vec<TaskRecord>) -> usize {
        let mut order = Vec::with_capacity(records.len());
        let mut by_id = HashMap::with_capacity(records.len());
        let mut duplicates = 0;

        for record in records {
            if by_id.contains_key(&record.id) {
                duplicates += 1;
                continue;
            }
            order.push(record.id.clone());
            by_id.insert(record.id.clone(), record);
        }

        self.order = order;
        self.records = by_id;
        self.revision += 1;
        self.filter_options = self.compute_filter_options();

        if duplicates > 0 {
            tracing::debug!(
                duplicates,
                kept = self.order.len(),
                "dropped duplicate task ids on ingest"
            );
        }
        duplicates
    }

    /// Patch one record in place, returning its value before the patch.
    pub fn apply_local_mutation(&mut self, id: &str, patch: &TaskPatch) -> Option<TaskRecord> {
        let record = self.records.get_mut(id)?;
        let previous = record.clone();
        patch.apply_to(record);
        Some(previous)
    }

    /// Store the authoritative server copy. Inserts when the id is unknown.
    pub fn reconcile(&mut self, id: &str, server_record: TaskRecord) {
        if server_record.id != id {
            // The service may re-key a record (provisional ids on create).
            self.remove(id);
        }
        self.upsert(server_record);
    }

    pub fn upsert(&mut self, record: TaskRecord) {
        if !self.records.contains_key(&record.id) {
            self.order.push(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskRecord> {
        let removed = self.records.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.iter().cloned().collect()
    }

    /// Bumped on every `ingest`; lets callers detect a full replacement that
    /// happened while they were suspended.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn filter_options(&self) -> &FilterOptions {
        &self.filter_options
    }

    fn compute_filter_options(&self) -> FilterOptions {
        let mut assigned_by = BTreeSet::new();
        let mut statuses = BTreeSet::new();

        for record in self.records.values() {
            let name = record.assigned_by.name.trim();
            if !name.is_empty() {
                assigned_by.insert(name.to_string());
            }
            statuses.insert(record.status.to_string());
        }

        FilterOptions {
            assigned_by: assigned_by.into_iter().collect(),
            statuses: statuses.into_iter().collect(),
        }
    }
}
