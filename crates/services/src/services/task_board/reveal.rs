//! Priority tiers and the per-tier reveal window.
//!
//! Each tier exposes a prefix of its rows that grows by a fixed step per
//! proximity signal. Signals carry the generation they were issued for; a
//! filter or sort change bumps the generation, so late signals for the old
//! view are ignored instead of growing the new one.

use serde::{Deserialize, Serialize};

use super::{
    config::BoardSettings,
    model::{Priority, TaskRecord},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealMode {
    /// Three tiers, each revealed incrementally.
    #[default]
    Incremental,
    /// One flat list (High, Medium, Low) split into numbered pages.
    Paged,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityTiers {
    tiers: [Vec<TaskRecord>; 3],
}

impl PriorityTiers {
    pub fn get(&self, tier: Priority) -> &[TaskRecord] {
        &self.tiers[tier.index()]
    }

    pub fn total(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    pub fn flat(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tiers.iter().flatten()
    }
}

/// Split into tiers, keeping the incoming order inside each tier.
pub fn partition(filtered: Vec<TaskRecord>) -> PriorityTiers {
    let mut tiers: [Vec<TaskRecord>; 3] = Default::default();
    for task in filtered {
        tiers[task.priority.index()].push(task);
    }
    PriorityTiers { tiers }
}

#[derive(Debug, Clone)]
pub struct RevealEngine {
    initial: usize,
    step: usize,
    page_size: usize,
    generation: u64,
    tiers: PriorityTiers,
    requested: [usize; 3],
    mode: RevealMode,
    page: usize,
}

impl RevealEngine {
    pub fn new(settings: &BoardSettings) -> Self {
        Self {
            initial: settings.reveal_page_size,
            step: settings.reveal_step.max(1),
            page_size: settings.mobile_page_size.max(1),
            generation: 0,
            tiers: PriorityTiers::default(),
            requested: [0; 3],
            mode: RevealMode::default(),
            page: 1,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> RevealMode {
        self.mode
    }

    pub fn tiers(&self) -> &PriorityTiers {
        &self.tiers
    }

    /// Install a list produced by a new filter or sort order: every tier goes
    /// back to the first page and the generation advances.
    pub fn reset(&mut self, filtered: Vec<TaskRecord>) -> u64 {
        self.tiers = partition(filtered);
        self.generation += 1;
        self.page = 1;
        for tier in Priority::ALL {
            self.requested[tier.index()] = self.initial.min(self.tiers.get(tier).len());
        }
        self.generation
    }

    /// Install a list produced by fresh data under the same query. Windows keep
    /// their size (clamped to the new lengths) and pending signals stay valid.
    pub fn refresh(&mut self, filtered: Vec<TaskRecord>) {
        self.tiers = partition(filtered);
        for tier in Priority::ALL {
            let len = self.tiers.get(tier).len();
            let slot = &mut self.requested[tier.index()];
            *slot = (*slot).max(self.initial.min(len));
        }
        self.page = self.page.min(self.page_count().max(1));
    }

    /// One growth step for `tier`. Returns whether anything new became visible.
    pub fn grow_window(&mut self, tier: Priority, generation: u64) -> bool {
        if generation != self.generation {
            tracing::trace!(
                ?tier,
                signal = generation,
                current = self.generation,
                "ignoring proximity signal for a previous view"
            );
            return false;
        }
        if self.mode == RevealMode::Paged {
            return false;
        }

        let len = self.tiers.get(tier).len();
        let before = self.reveal_count(tier);
        if before >= len {
            return false;
        }

        let grown = (before + self.step).min(len);
        self.requested[tier.index()] = grown;
        true
    }

    pub fn reveal_count(&self, tier: Priority) -> usize {
        self.requested[tier.index()].min(self.tiers.get(tier).len())
    }

    pub fn visible_slice(&self, tier: Priority) -> &[TaskRecord] {
        &self.tiers.get(tier)[..self.reveal_count(tier)]
    }

    pub fn has_more(&self, tier: Priority) -> bool {
        self.reveal_count(tier) < self.tiers.get(tier).len()
    }

    pub fn set_mode(&mut self, mode: RevealMode) {
        self.mode = mode;
        self.page = 1;
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_count(&self) -> usize {
        self.tiers.total().div_ceil(self.page_size)
    }

    /// Jump to a 1-based page, clamped to the available range.
    pub fn set_page(&mut self, page: usize) -> usize {
        self.page = page.clamp(1, self.page_count().max(1));
        self.page
    }

    pub fn page_rows(&self) -> Vec<&TaskRecord> {
        self.tiers
            .flat()
            .skip((self.page - 1) * self.page_size)
            .take(self.page_size)
            .collect()
    }
}
