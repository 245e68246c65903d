use qtsort::prelude::*;
use qtsort::{
    AddCountMap, BlockCollector, CountCollector, CountMap, FanOut, ResortObjects, SplitById,
    TileRouter, build_tree, collect_block, find_groups_clip,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic elements, three quarters of them packed into one corner.
fn synthetic_elements(n: usize, seed: u64) -> Vec<ElementHeader> {
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        state >> 33
    };
    (0..n)
        .map(|i| {
            let z = 12 + (next() % 6) as u32;
            let dense = next() % 4 != 0;
            let span = if dense { 1i64 << (z - 6) } else { 1i64 << z };
            let x = next() as i64 % span;
            let y = next() as i64 % span;
            let kind = match i % 10 {
                0..=6 => ElementKind::Node,
                7 | 8 => ElementKind::Way,
                _ => ElementKind::Relation,
            };
            ElementHeader::new(kind, i as i64, Quadtree::from_tuple(x, y, z).unwrap())
        })
        .collect()
}

fn blocks(elements: &[ElementHeader], size: usize) -> Vec<Block<ElementHeader>> {
    let n = elements.len().div_ceil(size);
    elements
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| Block::new(i as u64, 100.0 * (i + 1) as f64 / n as f64, chunk.to_vec()))
        .collect()
}

fn builder() -> GroupsBuilder {
    GroupsBuilder::new().config(
        Config::default()
            .with_target(500, 250)
            .with_numchan(4)
            .with_count_limit(1000)
            .with_writeat(2000)
            .with_queue_capacity(2),
    )
}

fn count_on_threads(builder: &GroupsBuilder, elements: &[ElementHeader]) -> WeightedQuadtree {
    let collectors = builder.count_collectors().unwrap();
    let per_thread = elements.len().div_ceil(collectors.len());
    let threads: Vec<_> = collectors
        .into_iter()
        .zip(elements.chunks(per_thread))
        .map(|(mut collector, share)| {
            let qts: Vec<Quadtree> = share.iter().map(|e| e.quadtree).collect();
            thread::spawn(move || {
                for part in qts.chunks(100) {
                    collector.call(part.to_vec()).unwrap();
                }
                collector
            })
        })
        .collect();
    let collectors: Vec<CountCollector> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    builder.finish_collectors(collectors).unwrap()
}

#[test]
fn test_count_find_route_end_to_end() {
    init_logging();
    let elements = synthetic_elements(20_000, 7);
    let builder = builder();

    let tree = count_on_threads(&builder, &elements);
    assert_eq!(tree.root().total, 20_000);

    let groups = Arc::new(builder.build(tree).unwrap());
    assert_eq!(groups.root().total, 20_000);
    assert!(groups.num_groups() > 10);
    let indices: Vec<u32> = groups.groups().map(|g| g.index).collect();
    assert_eq!(indices, (1..=groups.num_groups() as u32).collect::<Vec<_>>());

    let mut router = builder.router(groups.clone(), Collect::new()).unwrap();
    for block in blocks(&elements, 1000) {
        router.call(block).unwrap();
    }
    let batches = router.finish().unwrap();

    let mut per_tile: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
    let mut routed = 0;
    for batch in &batches {
        for e in &batch.elements {
            assert_eq!(groups.find_tile(e.quadtree).index as usize, batch.tile);
            per_tile.entry(batch.tile).or_default().push(e.id);
            routed += 1;
        }
    }
    assert_eq!(routed, elements.len());
    // each tile keeps the arrival order of its elements
    for ids in per_tile.values() {
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_clip_and_copy_agree_on_skewed_data() {
    let elements = synthetic_elements(30_000, 11);
    let mut counts = CountMap::new();
    collect_block(&mut counts, &elements);
    let mut tree = build_tree(counts, 17).unwrap();

    let copied = find_groups_copy(&tree, 800, 400).unwrap();
    let clipped = find_groups_clip(&mut tree, 800, 400).unwrap();
    assert!(tree.is_empty());

    let a: Vec<_> = copied.groups().map(|g| (g.code, g.weight, g.index)).collect();
    let b: Vec<_> = clipped.groups().map(|g| (g.code, g.weight, g.index)).collect();
    assert_eq!(a, b);
}

#[test]
fn test_fan_out_counting_matches_single_thread() {
    let elements = synthetic_elements(10_000, 3);

    let mut stage = FanOut::new(
        "count-blocks",
        |_| {
            |block: Block<ElementHeader>| {
                let mut counts = CountMap::new();
                collect_block(&mut counts, &block.elements);
                Ok(counts)
            }
        },
        3,
        2,
        AddCountMap::new(17),
    )
    .unwrap();
    for block in blocks(&elements, 250) {
        stage.call(block).unwrap();
    }
    let parallel = stage.finish().unwrap();

    let mut counts = CountMap::new();
    collect_block(&mut counts, &elements);
    let single = build_tree(counts, 17).unwrap();

    let a: Vec<_> = parallel.iter().map(|(_, n)| (n.code, n.weight, n.total)).collect();
    let b: Vec<_> = single.iter().map(|(_, n)| (n.code, n.weight, n.total)).collect();
    assert_eq!(a, b);
}

#[test]
fn test_block_collector_feeds_threaded_router() {
    let mut elements = synthetic_elements(5_000, 5);
    elements.sort_by_key(|e| e.sort_key());
    let builder = builder();
    let groups = Arc::new(builder.build(count_on_threads(&builder, &elements)).unwrap());

    let router = builder.router(groups.clone(), Collect::new()).unwrap();
    let handles = ThreadedCallback::new_multi("route", router, 3, 2).unwrap();
    let mut collector = BlockCollector::new(handles, 400)
        .unwrap()
        .check_order()
        .with_expected(elements.len() as u64);
    for chunk in elements.chunks(333) {
        collector.call(chunk.to_vec()).unwrap();
    }
    let results = collector.finish().unwrap();
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    let batches = results.into_iter().flatten().next().unwrap();

    let routed: usize = batches.iter().map(|b| b.elements.len()).sum();
    assert_eq!(routed, elements.len());
    for batch in &batches {
        for e in &batch.elements {
            assert_eq!(groups.find_tile(e.quadtree).index as usize, batch.tile);
        }
    }
}

#[test]
fn test_split_by_id_routing() {
    let elements = synthetic_elements(3_000, 9);
    let key = SplitById::new(1000, 200, 4).unwrap();
    let mut router = TileRouter::new("split-by-id", key, key.max_tile(), 500, Collect::new(), 2).unwrap();
    for block in blocks(&elements, 128) {
        router.call(block).unwrap();
    }
    let batches = router.finish().unwrap();

    let mut seen = 0;
    for batch in &batches {
        for e in &batch.elements {
            let band = match e.kind {
                ElementKind::Node => 0,
                ElementKind::Way => 1,
                _ => 2,
            };
            assert_eq!(batch.tile / 4, band, "{:?} {}", e.kind, e.id);
            seen += 1;
        }
    }
    assert_eq!(seen, elements.len());
    // nodes 0..999 land in the first tile
    let first: Vec<_> = batches.iter().filter(|b| b.tile == 0).collect();
    assert!(first.iter().flat_map(|b| &b.elements).all(|e| e.id < 1000));
}

#[test]
fn test_blocksplit_then_resort() {
    let elements = synthetic_elements(8_000, 13);
    let builder = GroupsBuilder::new().config(
        Config::default()
            .with_target(300, 150)
            .with_numchan(2)
            .with_blocksplit(4)
            .with_writeat(1500),
    );
    let groups = Arc::new(builder.build(count_on_threads(&builder, &elements)).unwrap());

    let resort = ResortObjects::new(groups.clone(), 4, Collect::new()).unwrap().sorted();
    let mut router = builder.router(groups.clone(), resort).unwrap();
    for block in blocks(&elements, 500) {
        router.call(block).unwrap();
    }
    let batches = router.finish().unwrap();

    let mut routed = 0;
    for batch in &batches {
        assert!(batch.elements.windows(2).all(|w| w[0].sort_key() < w[1].sort_key()));
        for e in &batch.elements {
            assert_eq!(groups.find_tile(e.quadtree).index as usize, batch.tile);
        }
        routed += batch.elements.len();
    }
    assert_eq!(routed, elements.len());
}
