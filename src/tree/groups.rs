//! Finding balanced groups of tiles.
//!
//! The group finder turns a sparse, skewed count tree into a groups tree
//! whose weighted nodes each hold roughly `target` elements. Dense regions
//! are split by descending into children; sparse regions are merged by
//! committing an ancestor's whole remaining total. Passes are repeated with a
//! tolerance window that widens by 50 on each side until every unit of weight
//! has been assigned.

use super::WeightedQuadtree;
use crate::error::{QtSortError, Result};
use crate::pipeline::observer::{SharedObserver, notify, notify_progress};
use crate::quadtree::Quadtree;

/// Deepest level considered by [`tree_rollup`].
pub const ROLLUP_MAX_DEPTH: u32 = 17;

const WINDOW_STEP: i64 = 50;

/// Tolerance widening stops (with an error) once `max` exceeds
/// `target * CAPACITY_FACTOR`.
const CAPACITY_FACTOR: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollupStats {
    /// Number of children folded into their parents.
    pub removed: usize,
    /// Total weight moved.
    pub weight: i64,
}

/// Configured group finder.
///
/// ```rust
/// use qtsort::{GroupFinder, Quadtree, WeightedQuadtree};
///
/// let mut tree = WeightedQuadtree::new();
/// tree.add("AB".parse::<Quadtree>()?, 120)?;
/// tree.add("AC".parse::<Quadtree>()?, 90)?;
/// let groups = GroupFinder::new(100, 10).find_groups_copy(&tree)?;
/// assert_eq!(groups.root().total, 210);
/// # Ok::<(), qtsort::QtSortError>(())
/// ```
#[derive(Clone)]
pub struct GroupFinder {
    target: i64,
    minsize: i64,
    observer: Option<SharedObserver>,
}

/// Current tolerance window.
#[derive(Debug, Clone, Copy)]
struct Window {
    min: i64,
    max: i64,
}

impl GroupFinder {
    pub fn new(target: i64, minsize: i64) -> Self {
        Self {
            target,
            minsize,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn initial_window(&self) -> Window {
        Window {
            min: (self.target - WINDOW_STEP).max(self.minsize),
            max: self.target + WINDOW_STEP,
        }
    }

    /// Widen the window, failing once it has grown past the capacity limit.
    fn widen(&self, window: &mut Window, remaining: i64) -> Result<()> {
        window.min = (window.min - WINDOW_STEP).max(self.minsize);
        window.max += WINDOW_STEP;
        if window.max > CAPACITY_FACTOR * self.target {
            log::error!(
                "group finder gave up: max={} with {} unassigned",
                window.max,
                remaining
            );
            return Err(QtSortError::Capacity {
                target: self.target,
                max: window.max,
                remaining,
            });
        }
        Ok(())
    }

    fn report(&self, window: Window, found: usize, remaining: i64, total: i64) {
        let percent = if total > 0 {
            100.0 * remaining as f64 / total as f64
        } else {
            0.0
        };
        notify_progress(&self.observer, 100.0 - percent, || {
            format!(
                "min={}, max={} found={} remaining {} [{:5.1}%]",
                window.min, window.max, found, remaining, percent
            )
        });
    }

    /// Build a groups tree from `tree` without modifying it.
    pub fn find_groups_copy(&self, tree: &WeightedQuadtree) -> Result<WeightedQuadtree> {
        self.find_groups_window(tree).map(|(groups, _)| groups)
    }

    /// [`find_groups_copy`](Self::find_groups_copy), also returning the
    /// window the last pass ran with.
    fn find_groups_window(&self, tree: &WeightedQuadtree) -> Result<(WeightedQuadtree, Window)> {
        let total = tree.root().total;
        let root_weight = tree.root().weight;
        let mut result = WeightedQuadtree::new();
        let mut window = self.initial_window();

        loop {
            let remaining = total - result.root().total;
            if remaining == 0 {
                break;
            }
            if remaining <= window.max || remaining == root_weight {
                result.add(Quadtree::ROOT, remaining)?;
                break;
            }
            let (count, committed) = clip_within_copy(tree, &mut result, window, self.minsize)?;
            log::debug!("pass committed {} groups, weight {}", count, committed);
            if count == 0 {
                self.report(window, result.len(), remaining, total);
                self.widen(&mut window, remaining)?;
            }
        }

        Ok((self.finish_groups(result), window))
    }

    /// Build a groups tree by clipping committed subtrees out of `tree`.
    /// Produces the same groups as [`find_groups_copy`](Self::find_groups_copy)
    /// and leaves `tree` empty.
    pub fn find_groups_clip(&self, tree: &mut WeightedQuadtree) -> Result<WeightedQuadtree> {
        let total = tree.root().total;
        let mut result = WeightedQuadtree::new();
        let mut window = self.initial_window();

        loop {
            let remaining = tree.root().total;
            if remaining == 0 {
                break;
            }
            if remaining <= window.max || remaining == tree.root().weight {
                result.add(Quadtree::ROOT, remaining)?;
                tree.clip(0);
                break;
            }
            let count = clip_within(tree, &mut result, window, self.minsize)?;
            if count == 0 {
                self.report(window, result.len(), remaining, total);
                self.widen(&mut window, remaining)?;
            }
        }

        Ok(self.finish_groups(result))
    }

    fn finish_groups(&self, mut result: WeightedQuadtree) -> WeightedQuadtree {
        let count = result.number_groups();
        log::info!("found {} groups", count);
        notify(&self.observer, || format!("found {} groups", count));
        result
    }
}

/// Should a node with `remaining` weight left be committed whole?
#[inline]
fn commit_whole(
    remaining: i64,
    weight: i64,
    children: &[i64; 4],
    window: Window,
    minsize: i64,
) -> bool {
    children.iter().all(|&c| c <= minsize) || remaining == weight || remaining <= window.max
}

/// One preorder scan of `tree`, committing into `result`. Returns the number
/// of groups committed and the weight they carry.
fn clip_within_copy(
    tree: &WeightedQuadtree,
    result: &mut WeightedQuadtree,
    window: Window,
    minsize: i64,
) -> Result<(usize, i64)> {
    let mut count = 0;
    let mut committed = 0;
    let mut prev = Quadtree::ROOT;
    let mut i = 0;

    while i < tree.len() {
        let node = &tree[i];
        if node.code < prev {
            return Err(QtSortError::Structural(format!(
                "tree out of order: {} after {}",
                node.code, prev
            )));
        }
        prev = node.code;

        let claimed = &result[result.find(node.code)];
        let exact = claimed.code == node.code;
        let remaining = node.total - if exact { claimed.total } else { 0 };

        if remaining <= 0 || remaining < window.min {
            i = tree.next(i, 4);
            continue;
        }

        let mut children = [0i64; 4];
        for (ci, child_total) in children.iter_mut().enumerate() {
            let c = node.children[ci];
            if c == 0 {
                continue;
            }
            *child_total = tree[c].total;
            if exact && claimed.children[ci] != 0 {
                *child_total -= result[claimed.children[ci]].total;
            }
        }

        if commit_whole(remaining, node.weight, &children, window, minsize) {
            result.add(node.code, remaining)?;
            count += 1;
            committed += remaining;
            i = tree.next(i, 4);
        } else {
            i = tree.next(i, 0);
        }
    }
    Ok((count, committed))
}

/// Destructive counterpart of [`clip_within_copy`]: committed subtrees are
/// clipped out of `tree`, so each node's `total` already is its remainder.
fn clip_within(
    tree: &mut WeightedQuadtree,
    result: &mut WeightedQuadtree,
    window: Window,
    minsize: i64,
) -> Result<usize> {
    let mut count = 0;
    let mut prev = Quadtree::ROOT;
    let mut i = 0;

    while i < tree.len() {
        let node = &tree[i];
        if node.code < prev {
            return Err(QtSortError::Structural(format!(
                "tree out of order: {} after {}",
                node.code, prev
            )));
        }
        prev = node.code;

        let remaining = node.total;
        if remaining <= 0 || remaining < window.min {
            i = tree.next(i, 4);
            continue;
        }

        let mut children = [0i64; 4];
        for (ci, child_total) in children.iter_mut().enumerate() {
            if node.children[ci] != 0 {
                *child_total = tree[node.children[ci]].total;
            }
        }

        if commit_whole(remaining, node.weight, &children, window, minsize) {
            result.add(node.code, remaining)?;
            count += 1;
            i = tree.clip(i);
        } else {
            i = tree.next(i, 0);
        }
    }
    Ok(count)
}

/// Build a groups tree without modifying `tree`. See [`GroupFinder`].
pub fn find_groups_copy(
    tree: &WeightedQuadtree,
    target: i64,
    minsize: i64,
) -> Result<WeightedQuadtree> {
    GroupFinder::new(target, minsize).find_groups_copy(tree)
}

/// Build a groups tree, consuming the detail of `tree`. See [`GroupFinder`].
pub fn find_groups_clip(
    tree: &mut WeightedQuadtree,
    target: i64,
    minsize: i64,
) -> Result<WeightedQuadtree> {
    GroupFinder::new(target, minsize).find_groups_clip(tree)
}

/// Fold every child whose total is below `minsize` into its parent, working
/// from depth [`ROLLUP_MAX_DEPTH`] up to the root so small tiles cascade
/// upwards.
pub fn tree_rollup(tree: &mut WeightedQuadtree, minsize: i64) -> RollupStats {
    let mut stats = RollupStats::default();
    for depth in (0..=ROLLUP_MAX_DEPTH).rev() {
        let mut i = 0;
        while i < tree.len() {
            let node = &tree[i];
            if node.code.depth() < depth {
                i = tree.next(i, 0);
                continue;
            }
            for ci in 0..4 {
                let c = tree[i].children[ci];
                if c != 0 && tree[c].total < minsize {
                    stats.removed += 1;
                    stats.weight += tree[c].total;
                    tree.rollup_child(i, ci);
                }
            }
            i = tree.next(i, 4);
        }
    }
    log::info!(
        "rollup: minsize={}; removed {} weight={}",
        minsize,
        stats.removed,
        stats.weight
    );
    stats
}

/// Copy of `tree` in which every tile at exactly `maxlevel` carries its
/// whole subtree's total, and shallower tiles carry only their own weight.
pub fn tree_round_copy(tree: &WeightedQuadtree, maxlevel: u32) -> Result<WeightedQuadtree> {
    let mut result = WeightedQuadtree::new();
    let mut i = 0;
    while i < tree.len() {
        let node = &tree[i];
        if node.total == 0 {
            i = tree.next(i, 4);
        } else if node.code.depth() == maxlevel {
            result.add(node.code, node.total)?;
            i = tree.next(i, 4);
        } else {
            if node.weight > 0 {
                result.add(node.code, node.weight)?;
            }
            i = tree.next(i, 0);
        }
    }
    result.number_groups();
    Ok(result)
}
