//! Loader Factory Tests
//!
//! End-to-end checks of `build_loaders` over a generated image folder:
//! split layout, batch sizing, seeding, distributed sharding and errors.

use image::{Rgb, RgbImage};
use ndarray::Array4;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use vision_data::data::{Dataset, ProcessGroup, IMAGENET_MEAN, IMAGENET_STD};
use vision_data::{build_loaders, DataError, ImageLoader, LoaderConfig};

const SIDE: u32 = 16;
const CLASSES: [&str; 3] = ["n01", "n02", "n03"];

/// Creates `count` images per class under `dir`; pixel value encodes class and index.
fn write_split(dir: &Path, count: usize) {
    for (c, class) in CLASSES.iter().enumerate() {
        let class_dir = dir.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        for i in 0..count {
            let value = (c * 60 + i) as u8;
            RgbImage::from_fn(SIDE, SIDE, |x, y| Rgb([value, x as u8, y as u8]))
                .save(class_dir.join(format!("img_{:03}.png", i)))
                .unwrap();
        }
    }
}

/// `train`: 3 x 8 images, `val2`: 3 x 40 images.
fn fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("train"), 8);
    write_split(&dir.path().join("val2"), 40);
    dir
}

fn config() -> LoaderConfig {
    LoaderConfig::new(12).num_workers(2).seed(42)
}

fn images(loader: &mut ImageLoader) -> Vec<Array4<f32>> {
    loader
        .iter()
        .unwrap()
        .map(|batch| batch.unwrap().images)
        .collect()
}

#[test]
fn val_batch_size_is_fixed_at_100() {
    let dir = fixture();
    for batch_size in [1, 64, 512] {
        let (_, mut val) = build_loaders(dir.path(), &config().batch_size(batch_size)).unwrap();
        assert_eq!(val.batch_size(), 100);

        let sizes: Vec<usize> = val.iter().unwrap().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![100, 20]);
    }
}

#[test]
fn val_only_skips_train_loader() {
    let dir = fixture();
    let (train, _) = build_loaders(dir.path(), &config().val_only(true)).unwrap();
    assert!(train.is_none());

    let (train, _) = build_loaders(dir.path(), &config()).unwrap();
    assert!(train.is_some());
}

#[test]
fn val_only_does_not_need_train_split() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("val2"), 2);

    let (train, val) = build_loaders(dir.path(), &config().val_only(true)).unwrap();
    assert!(train.is_none());
    assert_eq!(val.len(), 6);
}

#[test]
fn missing_val2_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    // `train` is a plain file: any attempt to scan it would fail with Io
    fs::write(dir.path().join("train"), b"").unwrap();

    match build_loaders(dir.path(), &config()) {
        Err(DataError::Configuration { path, hint }) => {
            assert!(path.ends_with("val2"));
            assert!(hint.contains("data-preparation"));
        }
        other => panic!("expected configuration error, got {:?}", other.err()),
    }
}

#[test]
fn missing_train_propagates_io_error() {
    let dir = tempfile::tempdir().unwrap();
    write_split(&dir.path().join("val2"), 2);

    match build_loaders(dir.path(), &config()) {
        Err(DataError::Io { path, source }) => {
            assert!(path.ends_with("train"));
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("expected io error, got {:?}", other.err()),
    }
}

#[test]
fn train_batch_size_divides_by_grad_accum_steps() {
    let dir = fixture();
    let (train, _) =
        build_loaders(dir.path(), &config().batch_size(128).grad_accum_steps(4)).unwrap();
    assert_eq!(train.unwrap().batch_size(), 32);

    let (train, _) = build_loaders(dir.path(), &config().batch_size(10).grad_accum_steps(4)).unwrap();
    assert_eq!(train.unwrap().batch_size(), 2);
}

#[test]
fn grad_accum_larger_than_batch_is_rejected() {
    let dir = fixture();
    let result = build_loaders(dir.path(), &config().batch_size(2).grad_accum_steps(4));
    assert!(matches!(result, Err(DataError::InvalidConfig(_))));
}

#[test]
fn worker_seeds_are_base_plus_index() {
    let dir = fixture();
    let (train, val) = build_loaders(dir.path(), &config().num_workers(4).seed(1000)).unwrap();
    let train = train.unwrap();

    assert_eq!(train.worker_seeds(), vec![1000, 1001, 1002, 1003]);
    assert_eq!(val.worker_seeds(), vec![1000, 1001, 1002, 1003]);
    assert!(train.pin_memory());
    assert!(val.pin_memory());
}

#[test]
fn same_seed_reproduces_augmented_batches() {
    let dir = fixture();
    let run = || {
        let (train, _) = build_loaders(dir.path(), &config().batch_size(5)).unwrap();
        images(&mut train.unwrap())
    };
    assert_eq!(run(), run());
}

#[test]
fn train_augmentation_differs_between_epochs() {
    let dir = fixture();
    let (train, _) = build_loaders(dir.path(), &config().batch_size(5)).unwrap();
    let mut train = train.unwrap();

    // Compare per-sample tensors keyed by index, since the order reshuffles too
    let mut epoch = || {
        let mut samples: Vec<(usize, Vec<f32>)> = Vec::new();
        for batch in train.iter().unwrap() {
            let batch = batch.unwrap();
            for (row, &index) in batch.indices.iter().enumerate() {
                let image = batch.images.index_axis(ndarray::Axis(0), row);
                samples.push((index, image.iter().copied().collect()));
            }
        }
        samples.sort_by_key(|(index, _)| *index);
        samples
    };
    let first = epoch();
    let second = epoch();
    assert_eq!(first.len(), 24);
    assert!(first.iter().zip(&second).any(|(a, b)| a.1 != b.1));
}

#[test]
fn unseeded_calls_draw_fresh_seeds() {
    let dir = fixture();
    let unseeded = LoaderConfig::new(12).num_workers(0);
    let seeds: HashSet<u64> = (0..8)
        .map(|_| build_loaders(dir.path(), &unseeded).unwrap().1.seed())
        .collect();
    assert!(seeds.len() > 1);
    assert!(seeds.iter().all(|&s| s <= 10_000));
}

#[test]
fn val_batches_are_in_dataset_order() {
    let dir = fixture();
    let (_, mut val) = build_loaders(dir.path(), &config()).unwrap();
    assert!(!val.shuffle());

    let indices: Vec<usize> = val
        .iter()
        .unwrap()
        .flat_map(|b| b.unwrap().indices)
        .collect();
    assert_eq!(indices, (0..120).collect::<Vec<_>>());
}

#[test]
fn val_pipeline_center_crops_and_normalizes() {
    let dir = fixture();
    let (_, mut val) = build_loaders(dir.path(), &config().num_workers(0)).unwrap();
    let batch = val.iter().unwrap().next().unwrap().unwrap();

    assert_eq!(batch.images.shape(), &[100, 3, 12, 12]);
    assert_eq!(batch.labels[0], 0);
    assert_eq!(batch.labels[40], 1);

    // Sample 1 of class n01: R = 1, G = x, B = y; a 12px crop of 16 starts at 2
    let expect = |c: usize, raw: f32| (raw / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
    let sample = batch.images.index_axis(ndarray::Axis(0), 1);
    assert!((sample[[0, 0, 0]] - expect(0, 1.0)).abs() < 1e-5);
    assert!((sample[[1, 0, 0]] - expect(1, 2.0)).abs() < 1e-5);
    assert!((sample[[2, 5, 0]] - expect(2, 7.0)).abs() < 1e-5);
}

#[test]
fn without_augment_train_uses_val_geometry() {
    let dir = fixture();
    let (train, val) = build_loaders(dir.path(), &config().augment(false)).unwrap();
    let train = train.unwrap();
    assert_eq!(train.pipeline().describe(), val.pipeline().describe());
    assert_ne!(train.dataset().root(), val.dataset().root());

    let (train, _) = build_loaders(dir.path(), &config()).unwrap();
    assert_eq!(
        train.unwrap().pipeline().describe()[0],
        "RandomCrop(12, padding=8)"
    );
}

#[test]
fn train_loader_shuffles_when_not_distributed() {
    let dir = fixture();
    let (train, _) = build_loaders(dir.path(), &config()).unwrap();
    let train = train.unwrap();
    assert!(train.shuffle());
    assert!(!train.has_custom_sampler());
}

#[test]
fn distributed_train_loader_shards_without_shuffle() {
    let dir = fixture();
    let mut shards = Vec::new();
    for rank in 0..2 {
        let group = ProcessGroup::new(rank, 2).unwrap();
        let (train, _) = build_loaders(
            dir.path(),
            &config().distributed(true).process_group(group).batch_size(4),
        )
        .unwrap();
        let mut train = train.unwrap();

        assert!(!train.shuffle());
        assert!(train.has_custom_sampler());
        assert_eq!(train.dataset().len(), 24);

        let indices: Vec<usize> = train
            .iter()
            .unwrap()
            .flat_map(|b| b.unwrap().indices)
            .collect();
        assert_eq!(indices.len(), 12);
        shards.push(indices);
    }

    let (a, b): (HashSet<_>, HashSet<_>) = (
        shards[0].iter().copied().collect(),
        shards[1].iter().copied().collect(),
    );
    assert!(a.is_disjoint(&b));
    assert_eq!(a.len() + b.len(), 24);
}
