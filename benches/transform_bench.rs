use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::time::Duration;

use arborspace::allometry::{analyse_forest, AllometryParams};
use arborspace::model::{Forest, Segment, Tree, NO_PARENT};
use arborspace::transform::{decimate, prune_diameter, prune_length};

/// A randomized self-similar binary tree with roughly `2^depth` branches.
fn synthetic_tree(depth: usize, seed: u64) -> Tree {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut tree = Tree {
        segments: vec![Segment::new(Vector3::zeros(), 0.5, NO_PARENT)],
        attribute_names: vec![],
        tree_attribute_names: vec![],
        tree_attributes: vec![],
    };
    struct Item {
        parent: usize,
        direction: Vector3<f64>,
        length: f64,
        radius: f64,
        level: usize,
    }
    let mut stack = vec![Item {
        parent: 0,
        direction: Vector3::z(),
        length: 2.0,
        radius: 0.5,
        level: 0,
    }];
    while let Some(item) = stack.pop() {
        let tip = tree.segments[item.parent].tip + item.direction * item.length;
        tree.segments
            .push(Segment::new(tip, item.radius, item.parent as i32));
        let index = tree.segments.len() - 1;
        if item.level + 1 >= depth {
            continue;
        }
        let lateral = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            0.0,
        );
        for sign in [1.0, -1.0] {
            let direction = (item.direction + lateral * (0.5 * sign)).normalize();
            stack.push(Item {
                parent: index,
                direction,
                length: item.length * 0.7,
                radius: item.radius / 2.0f64.sqrt(),
                level: item.level + 1,
            });
        }
    }
    tree
}

fn synthetic_forest(num_trees: usize, depth: usize) -> Forest {
    Forest {
        trees: (0..num_trees as u64)
            .map(|seed| synthetic_tree(depth, seed))
            .collect(),
        comments: vec![],
    }
}

fn bench_pruning(c: &mut Criterion) {
    let mut group = c.benchmark_group("pruning");
    group.measurement_time(Duration::from_secs(10));
    for depth in [8usize, 11, 13] {
        let forest = synthetic_forest(8, depth);
        group.bench_with_input(
            BenchmarkId::new("diameter", forest.num_segments()),
            &forest,
            |b, forest| b.iter(|| black_box(prune_diameter(forest, 0.05).unwrap())),
        );
        group.bench_with_input(
            BenchmarkId::new("length", forest.num_segments()),
            &forest,
            |b, forest| b.iter(|| black_box(prune_length(forest, 1.0).unwrap())),
        );
        group.bench_with_input(
            BenchmarkId::new("decimate", forest.num_segments()),
            &forest,
            |b, forest| b.iter(|| black_box(decimate(forest, 2).unwrap())),
        );
    }
    group.finish();
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    group.measurement_time(Duration::from_secs(10));
    let params = AllometryParams::default();
    for depth in [8usize, 11] {
        let forest = synthetic_forest(8, depth);
        group.bench_with_input(
            BenchmarkId::new("analyse_forest", forest.num_segments()),
            &forest,
            |b, forest| {
                b.iter(|| {
                    let mut forest = forest.clone();
                    black_box(analyse_forest(&mut forest, &params).unwrap())
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pruning, bench_analysis);
criterion_main!(benches);
