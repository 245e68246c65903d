//! Builder tying counting, group finding and routing together.
//!
//! A typical run counts element quadtrees on several threads, builds the
//! groups tree from the counts, then routes the elements by group:
//!
//! ```rust
//! use qtsort::prelude::*;
//! use std::sync::Arc;
//!
//! let builder = GroupsBuilder::new().config(Config::default().with_target(2, 1).with_numchan(2));
//!
//! let mut collectors = builder.count_collectors()?;
//! let qts: Vec<Quadtree> = ["AA", "AB", "AB", "C"].iter().map(|s| s.parse()).collect::<Result<_>>()?;
//! collectors[0].call(qts)?;
//! let tree = builder.finish_collectors(collectors)?;
//!
//! let groups = Arc::new(builder.build(tree)?);
//! assert!(groups.num_groups() > 0);
//! # Ok::<(), qtsort::QtSortError>(())
//! ```

use crate::config::Config;
use crate::error::{QtSortError, Result};
use crate::pipeline::callback::CallFinish;
use crate::pipeline::observer::{SharedObserver, notify};
use crate::pipeline::threaded::ThreadedCallback;
use crate::router::{Element, SortGroup, TileBatch, TileRouter};
use crate::tree::{
    AddCountMap, CollectCounts, CountMap, GroupFinder, WeightedQuadtree, tree_rollup,
    tree_round_copy,
};
#[cfg(feature = "snapshot")]
use crate::tree::snapshot::GroupsFile;
#[cfg(feature = "snapshot")]
use std::path::PathBuf;
use std::sync::Arc;

/// Per-thread counting stage feeding the shared tree reducer.
pub type CountCollector = CollectCounts<ThreadedCallback<CountMap, WeightedQuadtree>>;

/// Builder for a groups tree and the routing stage that uses it.
#[derive(Clone, Default)]
pub struct GroupsBuilder {
    config: Config,
    observer: Option<SharedObserver>,
    #[cfg(feature = "snapshot")]
    snapshot_path: Option<PathBuf>,
}

impl GroupsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Save the groups tree here once built.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// One counting stage per worker thread, all feeding a single reducer
    /// thread which owns the tree.
    pub fn count_collectors(&self) -> Result<Vec<CountCollector>> {
        self.config.validate()?;
        let reducer = AddCountMap::new(self.config.maxlevel).with_observer(self.observer.clone());
        let handles = ThreadedCallback::new_multi(
            "add-counts",
            reducer,
            self.config.numchan,
            self.config.queue_capacity,
        )?;
        Ok(handles
            .into_iter()
            .map(|h| CollectCounts::new(self.config.count_limit, h))
            .collect())
    }

    /// Finish every collector and return the tree they built.
    pub fn finish_collectors(&self, collectors: Vec<CountCollector>) -> Result<WeightedQuadtree> {
        let mut tree = None;
        for mut collector in collectors {
            if let Some(t) = collector.finish()? {
                tree = Some(t);
            }
        }
        tree.ok_or_else(|| QtSortError::Pipeline("count reducer returned no tree".to_string()))
    }

    /// Turn a count tree into a groups tree.
    ///
    /// With `rollup` set, small subtrees are first folded into their
    /// parents. With `round_level` set, the groups are the tiles at that
    /// level; otherwise they are found with `target` and `minsize`.
    pub fn build(&self, mut tree: WeightedQuadtree) -> Result<WeightedQuadtree> {
        self.config.validate()?;
        if self.config.rollup {
            tree_rollup(&mut tree, self.config.minsize);
        }
        let groups = match self.config.round_level {
            Some(level) => tree_round_copy(&tree, level)?,
            None => {
                let mut finder = GroupFinder::new(self.config.target, self.config.minsize);
                if let Some(observer) = &self.observer {
                    finder = finder.with_observer(observer.clone());
                }
                finder.find_groups_copy(&tree)?
            }
        };
        let num_groups = groups.num_groups();
        notify(&self.observer, || {
            format!("{} groups from {} tree nodes", num_groups, tree.len())
        });

        #[cfg(feature = "snapshot")]
        if let Some(path) = &self.snapshot_path {
            GroupsFile::new(self.config.target, self.config.minsize, groups.clone()).save(path)?;
        }
        Ok(groups)
    }

    /// Routing stage sending each element to its group's tile.
    pub fn router<T, C>(
        &self,
        groups: Arc<WeightedQuadtree>,
        downstream: C,
    ) -> Result<TileRouter<T, SortGroup, C::ReturnType>>
    where
        T: Element,
        C: CallFinish<CallType = TileBatch<T>>,
    {
        let key = SortGroup::new(groups, self.config.blocksplit)?;
        let max_tile = key.max_tile();
        let router = TileRouter::new(
            "sort-group",
            key,
            max_tile,
            self.config.writeat,
            downstream,
            self.config.queue_capacity,
        )?;
        Ok(router.with_observer(self.observer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Collect;
    use crate::quadtree::Quadtree;
    use crate::router::{Block, ElementHeader, ElementKind};

    fn qt(s: &str) -> Quadtree {
        s.parse().unwrap()
    }

    fn builder() -> GroupsBuilder {
        GroupsBuilder::new().config(
            Config::default()
                .with_target(100, 50)
                .with_numchan(3)
                .with_count_limit(2)
                .with_writeat(5),
        )
    }

    #[test]
    fn test_collectors_share_one_tree() {
        let builder = builder();
        let mut collectors = builder.count_collectors().unwrap();
        assert_eq!(collectors.len(), 3);
        for (i, c) in collectors.iter_mut().enumerate() {
            let codes = ["A", "B", "C"];
            c.call(vec![qt(codes[i]); 10]).unwrap();
            c.call(vec![qt("DA"), qt("DB"), qt("DC")]).unwrap();
        }
        let tree = builder.finish_collectors(collectors).unwrap();
        assert_eq!(tree.root().total, 39);
        assert_eq!(tree[tree.find(qt("A"))].weight, 10);
        assert_eq!(tree[tree.find(qt("DB"))].weight, 3);
    }

    #[test]
    fn test_build_round_level() {
        let mut tree = WeightedQuadtree::new();
        tree.add(qt("ABCD"), 7).unwrap();
        tree.add(qt("ABDA"), 3).unwrap();
        let builder = GroupsBuilder::new().config(Config::default().with_round_level(Some(2)));
        let groups = builder.build(tree).unwrap();
        let found: Vec<(String, i64)> = groups.groups().map(|n| (n.code.to_string(), n.weight)).collect();
        assert_eq!(found, vec![("AB".to_string(), 10)]);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let builder = GroupsBuilder::new().config(Config::default().with_numchan(0));
        assert!(matches!(
            builder.build(WeightedQuadtree::new()),
            Err(QtSortError::InvalidConfig(_))
        ));
        assert!(builder.count_collectors().is_err());
    }

    #[test]
    fn test_route_by_built_groups() {
        let builder = builder();
        let mut tree = WeightedQuadtree::new();
        for code in ["A", "B", "C", "D"] {
            tree.add(qt(code), 100).unwrap();
        }
        let groups = Arc::new(builder.build(tree).unwrap());
        assert_eq!(groups.num_groups(), 4);

        let mut router = builder.router(groups.clone(), Collect::new()).unwrap();
        let elements: Vec<ElementHeader> = ["DD", "A", "CB", "A"]
            .iter()
            .enumerate()
            .map(|(i, c)| ElementHeader::new(ElementKind::Node, i as i64, qt(c)))
            .collect();
        router.call(Block::new(0, 100.0, elements)).unwrap();
        let batches = router.finish().unwrap();
        let tiles: Vec<(usize, usize)> = batches.iter().map(|b| (b.tile, b.elements.len())).collect();
        assert_eq!(tiles, vec![(1, 2), (3, 1), (4, 1)]);
    }
}
