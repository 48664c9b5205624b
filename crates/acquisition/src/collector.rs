//! Run-scoped item collection
//!
//! Both channels feed one `Collector`, which owns the seen-id set and applies
//! the early-stop conditions in priority order: target count, then the
//! stop-at-id / since cutoff / caller predicate. The item that matches a stop
//! condition is not collected.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use platform::{Item, TimeBounds};

pub type ItemPredicate = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// Caller-supplied early-stop conditions.
///
/// `bounds.since` halts at the first item older than it (timelines arrive
/// newest first); `bounds.until` skips items newer than it without halting.
/// Items without a timestamp never trip either bound.
#[derive(Clone, Default)]
pub struct StopCondition {
    pub stop_at_id: Option<String>,
    pub bounds: TimeBounds,
    pub predicate: Option<ItemPredicate>,
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopCondition")
            .field("stop_at_id", &self.stop_at_id)
            .field("bounds", &self.bounds)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl StopCondition {
    pub fn at_id(id: impl Into<String>) -> Self {
        Self {
            stop_at_id: Some(id.into()),
            ..Self::default()
        }
    }

    fn halts_on(&self, item: &Item) -> Option<StopReason> {
        if self.stop_at_id.as_deref() == Some(item.id.as_str()) {
            return Some(StopReason::StopAtId);
        }
        if let (Some(since), Some(created)) = (self.bounds.since, item.created_at)
            && created < since
        {
            return Some(StopReason::SinceCutoff);
        }
        if let Some(predicate) = &self.predicate
            && predicate(item)
        {
            return Some(StopReason::Predicate);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    StopAtId,
    SinceCutoff,
    Predicate,
}

/// What one batch did to the collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub added: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub halted: Option<StopReason>,
}

#[derive(Debug)]
pub struct Collector {
    seen: HashSet<String>,
    items: Vec<Item>,
    /// Items emitted by earlier attempts of a resumed run.
    carried: usize,
    limit: usize,
    stop: StopCondition,
    halted: Option<StopReason>,
}

impl Collector {
    pub fn new(limit: usize, stop: StopCondition) -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
            carried: 0,
            limit,
            stop,
            halted: None,
        }
    }

    /// Pick up a resumed run: `ids` count as duplicates from now on and the
    /// `count` items already emitted count toward the limit.
    pub fn resume_from(&mut self, count: usize, ids: impl IntoIterator<Item = String>) {
        self.seen.extend(ids);
        self.carried = count;
        if self.total() >= self.limit {
            self.halted = Some(StopReason::TargetReached);
        }
    }

    pub fn ingest(&mut self, batch: Vec<Item>) -> IngestReport {
        let mut report = IngestReport::default();
        for item in batch {
            if self.halted.is_some() {
                break;
            }
            if let Some(reason) = self.stop.halts_on(&item) {
                self.halted = Some(reason);
                break;
            }
            if !self.seen.insert(item.id.clone()) {
                report.duplicates += 1;
                continue;
            }
            if let (Some(until), Some(created)) = (self.stop.bounds.until, item.created_at)
                && created > until
            {
                report.skipped += 1;
                continue;
            }
            self.items.push(item);
            report.added += 1;
            if self.total() >= self.limit {
                self.halted = Some(StopReason::TargetReached);
            }
        }
        report.halted = self.halted;
        report
    }

    pub fn halted(&self) -> Option<StopReason> {
        self.halted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items emitted across every attempt of the run.
    pub fn total(&self) -> usize {
        self.carried + self.items.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.total())
    }

    pub fn last_item_id(&self) -> Option<&str> {
        self.items.last().map(|i| i.id.as_str())
    }

    pub fn seen_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.seen.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Item> {
        self.items
    }
}
