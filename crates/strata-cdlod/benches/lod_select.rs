use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use glam::{Vec2, Vec3};
use strata_cdlod::*;
use strata_config::Config;

fn flat_tree(levels: u32, world: f32) -> CdlodQuadtree {
    let heights = MinMaxHeightCache::new(
        Arc::new(ConstantHeightRange { min: 0.0, max: 50.0 }),
        levels,
        (0.0, 50.0),
    );
    CdlodQuadtree::new(32.0, levels, Vec2::ZERO, Vec2::splat(world), heights)
}

fn bench_lod_select(c: &mut Criterion) {
    let tree = flat_tree(6, 2048.0);
    let desc = SelectionDesc::from_config(
        &Config::default(),
        Vec3::new(700.0, 900.0, 40.0),
        Frustum::infinite(),
    );
    let mut selection = LodSelection::with_capacity(4096);
    c.bench_function("lod_select_2km", |bencher| {
        bencher.iter(|| {
            tree.lod_select(black_box(&desc), &mut selection);
            black_box(selection.len())
        })
    });
}

fn bench_lod_select_large_world(c: &mut Criterion) {
    let tree = flat_tree(8, 32768.0);
    let mut desc = SelectionDesc::from_config(
        &Config::default(),
        Vec3::new(16000.0, 16000.0, 100.0),
        Frustum::infinite(),
    );
    desc.max_visibility_distance = 20000.0;
    let mut selection = LodSelection::with_capacity(tree.suggested_selection_capacity() * 4);
    c.bench_function("lod_select_32km", |bencher| {
        bencher.iter(|| {
            tree.lod_select(black_box(&desc), &mut selection);
            black_box(selection.len())
        })
    });
}

fn bench_texture_streaming_select(c: &mut Criterion) {
    let config = Config::default();
    let tree = flat_tree(6, 2048.0);
    let desc = SelectionDesc::texture_streaming(
        &config,
        &config.material_texture,
        Vec3::new(700.0, 900.0, 40.0),
        Frustum::infinite(),
    );
    let mut selection = LodSelection::with_capacity(4096);
    c.bench_function("lod_select_texture_streaming", |bencher| {
        bencher.iter(|| {
            tree.lod_select(black_box(&desc), &mut selection);
            black_box(selection.len())
        })
    });
}

criterion_group!(
    benches,
    bench_lod_select,
    bench_lod_select_large_world,
    bench_texture_streaming_select
);
criterion_main!(benches);
