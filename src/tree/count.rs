//! Building a weighted quadtree from element counts.
//!
//! Scanner threads each own a [`CollectCounts`], which tallies quadtrees in a
//! hash map and periodically hands a sorted [`CountMap`] to the single
//! [`AddCountMap`] reducer. The reducer owns the tree outright and gives it
//! back from `finish`.

use super::WeightedQuadtree;
use crate::error::Result;
use crate::pipeline::callback::CallFinish;
use crate::pipeline::observer::{SharedObserver, notify};
use crate::quadtree::{MAX_DEPTH, Quadtree};
use crate::router::Element;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// Element count per tile, in preorder.
pub type CountMap = BTreeMap<Quadtree, i64>;

/// Count one per element at the element's quadtree.
pub fn collect_block<E: Element>(counts: &mut CountMap, elements: &[E]) {
    for e in elements {
        *counts.entry(e.quadtree()).or_insert(0) += 1;
    }
}

/// Per-thread tally of quadtrees, flushed downstream once it holds more
/// than `limit` distinct tiles.
pub struct CollectCounts<C> {
    counts: FxHashMap<Quadtree, i64>,
    limit: usize,
    downstream: C,
}

impl<C> CollectCounts<C>
where
    C: CallFinish<CallType = CountMap>,
{
    pub fn new(limit: usize, downstream: C) -> Self {
        Self {
            counts: FxHashMap::default(),
            limit,
            downstream,
        }
    }

    fn flush(&mut self) -> Result<()> {
        let sorted: CountMap = self.counts.drain().collect();
        log::debug!("flushing {} tile counts", sorted.len());
        self.downstream.call(sorted)
    }
}

impl<C> CallFinish for CollectCounts<C>
where
    C: CallFinish<CallType = CountMap>,
{
    type CallType = Vec<Quadtree>;
    type ReturnType = C::ReturnType;

    fn call(&mut self, qts: Vec<Quadtree>) -> Result<()> {
        for qt in qts {
            *self.counts.entry(qt).or_insert(0) += 1;
        }
        if self.counts.len() > self.limit {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<C::ReturnType> {
        if !self.counts.is_empty() {
            self.flush()?;
        }
        self.downstream.finish()
    }
}

/// The single writer of the tree being built.
pub struct AddCountMap {
    tree: WeightedQuadtree,
    maxlevel: u32,
    observer: Option<SharedObserver>,
    batches: usize,
    skipped: i64,
}

impl AddCountMap {
    /// Counts deeper than `maxlevel` are added at their ancestor at
    /// `maxlevel`.
    pub fn new(maxlevel: u32) -> Self {
        Self {
            tree: WeightedQuadtree::new(),
            maxlevel: maxlevel.min(MAX_DEPTH),
            observer: None,
            batches: 0,
            skipped: 0,
        }
    }

    pub fn with_observer(mut self, observer: Option<SharedObserver>) -> Self {
        self.observer = observer;
        self
    }
}

impl CallFinish for AddCountMap {
    type CallType = CountMap;
    type ReturnType = WeightedQuadtree;

    fn call(&mut self, counts: CountMap) -> Result<()> {
        for (qt, n) in counts {
            // elements without a location
            if qt.as_int() < 0 {
                self.skipped += n;
                continue;
            }
            self.tree.add(qt.round(self.maxlevel), n)?;
        }
        self.batches += 1;
        let (batches, nodes, total) = (self.batches, self.tree.len(), self.tree.root().total);
        notify(&self.observer, || {
            format!(
                "added {} count batches: {} tree nodes, total weight {}",
                batches, nodes, total
            )
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<WeightedQuadtree> {
        if self.skipped > 0 {
            log::warn!("skipped {} elements without a quadtree", self.skipped);
        }
        log::info!(
            "built tree with {} nodes from {} batches, total weight {}",
            self.tree.len(),
            self.batches,
            self.tree.root().total
        );
        Ok(std::mem::take(&mut self.tree))
    }
}

/// Build a tree from one count map on the calling thread.
pub fn build_tree(counts: CountMap, maxlevel: u32) -> Result<WeightedQuadtree> {
    let mut add = AddCountMap::new(maxlevel);
    add.call(counts)?;
    add.finish()
}
