//! Routing elements into per-tile batches.
//!
//! Elements arrive in [`Block`]s. A [`TileRouter`] asks a [`RouteKey`] for
//! each element's destination tile and accumulates the elements per tile.
//! Once enough weight has built up, the accumulated batches are handed to a
//! background writer stage in ascending tile order.

pub mod collect;
pub mod keys;
pub mod resort;

use crate::error::{QtSortError, Result};
use crate::pipeline::callback::CallFinish;
use crate::pipeline::observer::{SharedObserver, notify_progress};
use crate::pipeline::threaded::ThreadedCallback;
use crate::quadtree::Quadtree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;

pub use collect::BlockCollector;
pub use keys::{SortGroup, SplitById};
pub use resort::ResortObjects;

/// Kind of an element. The ordering is the element sort order: all nodes,
/// then ways, then relations, then the geometry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Node,
    Way,
    Relation,
    Point,
    Linestring,
    SimplePolygon,
    ComplicatedPolygon,
}

impl ElementKind {
    /// Routing weight: one per element, plus 5 for ways and linear or simple
    /// area geometries and 10 for relations and complicated polygons.
    pub const fn weight(self) -> i64 {
        match self {
            ElementKind::Node | ElementKind::Point => 1,
            ElementKind::Way | ElementKind::Linestring | ElementKind::SimplePolygon => 6,
            ElementKind::Relation | ElementKind::ComplicatedPolygon => 11,
        }
    }
}

/// What the router needs to know about an element.
pub trait Element: Send + 'static {
    fn quadtree(&self) -> Quadtree;

    fn kind(&self) -> ElementKind;

    fn id(&self) -> i64;

    #[inline]
    fn sort_key(&self) -> (ElementKind, i64) {
        (self.kind(), self.id())
    }
}

/// An element reduced to its routing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHeader {
    pub kind: ElementKind,
    pub id: i64,
    pub quadtree: Quadtree,
}

impl ElementHeader {
    pub fn new(kind: ElementKind, id: i64, quadtree: Quadtree) -> Self {
        Self { kind, id, quadtree }
    }
}

impl Element for ElementHeader {
    fn quadtree(&self) -> Quadtree {
        self.quadtree
    }

    fn kind(&self) -> ElementKind {
        self.kind
    }

    fn id(&self) -> i64 {
        self.id
    }
}

/// A unit of incoming elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<T> {
    pub index: u64,
    /// Percentage of the input consumed once this block is processed.
    pub progress: f64,
    pub elements: Vec<T>,
}

impl<T> Block<T> {
    pub fn new(index: u64, progress: f64, elements: Vec<T>) -> Self {
        Self {
            index,
            progress,
            elements,
        }
    }
}

/// Elements routed to one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBatch<T> {
    pub tile: usize,
    pub elements: Vec<T>,
}

/// Maps an element to its destination tile.
pub trait RouteKey<T>: Send + 'static {
    fn tile(&self, element: &T) -> Result<usize>;
}

impl<T, F> RouteKey<T> for F
where
    F: Fn(&T) -> Result<usize> + Send + 'static,
{
    fn tile(&self, element: &T) -> Result<usize> {
        self(element)
    }
}

/// Writer stage body: pass each batch of a flush downstream.
struct ForwardBatches<T, C> {
    downstream: C,
    _item: PhantomData<fn(T)>,
}

impl<T, C> CallFinish for ForwardBatches<T, C>
where
    T: Send + 'static,
    C: CallFinish<CallType = TileBatch<T>>,
{
    type CallType = Vec<TileBatch<T>>;
    type ReturnType = C::ReturnType;

    fn call(&mut self, batches: Vec<TileBatch<T>>) -> Result<()> {
        for batch in batches {
            self.downstream.call(batch)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<C::ReturnType> {
        self.downstream.finish()
    }
}

/// Splits blocks of elements into per-tile batches.
///
/// Each element goes to `key.tile(element)`, which must not exceed
/// `max_tile`. The router keeps a running weight of the elements it holds
/// (see [`ElementKind::weight`]); after a block pushes it past `writeat`, all
/// non-empty batches are passed to the writer thread in ascending tile order
/// and the router starts afresh. A tile may therefore appear in several
/// flushes, always in the order its elements arrived.
///
/// Any failure is final: the first error is kept and returned by every later
/// `call` and `finish`, pending batches are dropped and the writer is
/// cancelled without finishing `downstream`.
pub struct TileRouter<T, K, R> {
    name: String,
    key: K,
    max_tile: usize,
    writeat: i64,
    tiles: BTreeMap<usize, Vec<T>>,
    weight: i64,
    flushes: usize,
    writer: ThreadedCallback<Vec<TileBatch<T>>, R>,
    observer: Option<SharedObserver>,
    error: Option<QtSortError>,
}

impl<T, K, R> TileRouter<T, K, R>
where
    T: Element,
    K: RouteKey<T>,
    R: Send + 'static,
{
    pub fn new<C>(
        name: &str,
        key: K,
        max_tile: usize,
        writeat: i64,
        downstream: C,
        capacity: usize,
    ) -> Result<Self>
    where
        C: CallFinish<CallType = TileBatch<T>, ReturnType = R>,
    {
        let writer = ThreadedCallback::new(
            &format!("{}-write", name),
            ForwardBatches {
                downstream,
                _item: PhantomData,
            },
            capacity,
        )?;
        Ok(Self {
            name: name.to_string(),
            key,
            max_tile,
            writeat,
            tiles: BTreeMap::new(),
            weight: 0,
            flushes: 0,
            writer,
            observer: None,
            error: None,
        })
    }

    pub fn with_observer(mut self, observer: Option<SharedObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn max_tile(&self) -> usize {
        self.max_tile
    }

    /// Weight accumulated since the last flush.
    pub fn pending_weight(&self) -> i64 {
        self.weight
    }

    fn route(&mut self, block: Block<T>) -> Result<()> {
        for element in block.elements {
            let tile = self.key.tile(&element)?;
            if tile > self.max_tile {
                return Err(QtSortError::Structural(format!(
                    "{}: element {:?} {} routed to tile {} beyond max tile {}",
                    self.name,
                    element.kind(),
                    element.id(),
                    tile,
                    self.max_tile
                )));
            }
            self.weight += element.kind().weight();
            self.tiles.entry(tile).or_default().push(element);
        }
        if self.weight > self.writeat {
            let (name, weight) = (&self.name, self.weight);
            notify_progress(&self.observer, block.progress, || {
                format!("{}: block {} flushing weight {}", name, block.index, weight)
            });
            self.flush()?;
        }
        Ok(())
    }

    /// Record the run's failure and tear down the writer.
    fn fail(&mut self, err: QtSortError) -> QtSortError {
        self.tiles.clear();
        self.weight = 0;
        let err = self.writer.abort(err);
        self.error = Some(err.clone());
        err
    }

    fn flush(&mut self) -> Result<()> {
        let tiles = std::mem::take(&mut self.tiles);
        let batches: Vec<TileBatch<T>> = tiles
            .into_iter()
            .filter(|(_, elements)| !elements.is_empty())
            .map(|(tile, elements)| TileBatch { tile, elements })
            .collect();
        log::debug!(
            "{}: flush {} with {} tiles, weight {}",
            self.name,
            self.flushes,
            batches.len(),
            self.weight
        );
        self.flushes += 1;
        self.weight = 0;
        if batches.is_empty() {
            return Ok(());
        }
        self.writer.call(batches)
    }
}

impl<T, K, R> CallFinish for TileRouter<T, K, R>
where
    T: Element,
    K: RouteKey<T>,
    R: Send + 'static,
{
    type CallType = Block<T>;
    type ReturnType = R;

    fn call(&mut self, block: Block<T>) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.route(block).map_err(|e| self.fail(e))
    }

    fn finish(&mut self) -> Result<R> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.flush().map_err(|e| self.fail(e))?;
        log::info!("{}: finished after {} flushes", self.name, self.flushes);
        let result = self.writer.finish().map_err(|e| self.fail(e))?;
        result.ok_or_else(|| {
            QtSortError::Pipeline(format!("{}: writer returned no result", self.name))
        })
    }
}
