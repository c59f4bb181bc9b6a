//! Loader Inspection Example
//!
//! Builds the train/val loaders for a prepared dataset directory and walks
//! one epoch of each, printing batch shapes and throughput.
//!
//! Run with:
//! `cargo run --example inspect_loaders -- --data-dir data/tiny-imagenet-200 --prepare`

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use vision_data::{build_loaders, prepare_val_split, ImageLoader, LoaderConfig};

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect image-folder train/val loaders", long_about = None)]
struct Args {
    /// Корень датасета (train/ и val2/)
    #[arg(long)]
    data_dir: PathBuf,

    /// JSON с LoaderConfig; флаги ниже переопределяют его поля
    #[arg(long)]
    config: Option<PathBuf>,

    /// Сначала разложить val/ в val2/
    #[arg(long)]
    prepare: bool,

    #[arg(long)]
    input_size: Option<u32>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_workers: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    val_only: bool,

    #[arg(long)]
    no_augment: bool,

    /// Остановиться после стольких батчей каждого загрузчика
    #[arg(long)]
    max_batches: Option<usize>,
}

fn walk(name: &str, loader: &mut ImageLoader, max_batches: Option<usize>) -> vision_data::Result<()> {
    let start = Instant::now();
    let mut samples = 0;
    let limit = max_batches.unwrap_or(usize::MAX);

    for (i, batch) in loader.iter()?.take(limit).enumerate() {
        let batch = batch?;
        samples += batch.len();
        if i == 0 {
            println!(
                "[{}] first batch: images {:?}, labels {:?}",
                name,
                batch.images.shape(),
                batch.labels.shape()
            );
        }
    }

    let elapsed = start.elapsed();
    println!(
        "[{}] {} samples in {:.2?} ({:.1} samples/s)",
        name,
        samples,
        elapsed,
        samples as f64 / elapsed.as_secs_f64().max(1e-9)
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_json_file(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(size) = args.input_size {
        config.input_size = size;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = args.num_workers {
        config.num_workers = workers;
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    config.val_only |= args.val_only;
    config.augment &= !args.no_augment;

    if args.prepare {
        let report = prepare_val_split(&args.data_dir)?;
        println!(
            "[prepare] copied {}, skipped {}, classes {}",
            report.copied, report.skipped, report.classes
        );
    }

    let (train, mut val) = build_loaders(&args.data_dir, &config)?;
    println!();
    println!("[config] {:?}", config);

    if let Some(mut train) = train {
        walk("train", &mut train, args.max_batches)?;
    }
    walk("val", &mut val, args.max_batches)?;
    Ok(())
}
