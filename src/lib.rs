//! Quadtree partitioning of OpenStreetMap data, with the threaded pipeline
//! stages used to re-sort elements into the resulting tiles.
//!
//! Element counts per quadtree tile are gathered into a [`WeightedQuadtree`];
//! the [`GroupFinder`] then cuts that tree into groups of roughly `target`
//! weight, and a [`TileRouter`] sends each element to its group's tile.
//!
//! ```rust
//! use qtsort::{Quadtree, WeightedQuadtree, find_groups_copy};
//!
//! let mut tree = WeightedQuadtree::new();
//! for (code, count) in [("AA", 900), ("AB", 1100), ("C", 40)] {
//!     tree.add(code.parse::<Quadtree>()?, count)?;
//! }
//! let groups = find_groups_copy(&tree, 1000, 500)?;
//! let tile = groups.find_tile("ABCD".parse()?);
//! assert_eq!(tile.code.to_string(), "AB");
//! # Ok::<(), qtsort::QtSortError>(())
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod quadtree;
pub mod router;
pub mod tree;

pub use builder::{CountCollector, GroupsBuilder};
pub use config::Config;
pub use error::{QtSortError, Result};
pub use quadtree::{MAX_DEPTH, Quadtree};

pub use tree::{
    AddCountMap, CollectCounts, CountMap, GroupFinder, RollupStats, TreeNode, WeightedQuadtree,
    build_tree, collect_block, find_groups_clip, find_groups_copy, tree_rollup, tree_round_copy,
};
#[cfg(feature = "snapshot")]
pub use tree::snapshot::GroupsFile;

pub use pipeline::{
    BoundedQueue, CallFinish, CallbackFn, Collect, FanOut, LogObserver, MapCallback,
    MultiThreadedCallback, ProgressObserver, SharedObserver, SplitCallback, ThreadedCallback,
};

pub use router::{
    Block, BlockCollector, Element, ElementHeader, ElementKind, ResortObjects, RouteKey,
    SortGroup, SplitById, TileBatch, TileRouter,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Config, GroupsBuilder, QtSortError, Result};

    pub use crate::{Quadtree, WeightedQuadtree, find_groups_copy};

    pub use crate::{CallFinish, Collect, ThreadedCallback};

    pub use crate::{Block, Element, ElementHeader, ElementKind, TileBatch};
}
