//! # Data Loading Module
//!
//! Dataset and DataLoader API for image classification data.
//!
//! ## Key Components
//!
//! - [`Dataset`]: Trait for defining data sources
//! - [`ImageFolder`]: One subdirectory per class label
//! - [`DataLoader`]: Batched iterator with shuffle support and a worker pool
//! - [`Sampler`]: Data sampling strategies (sequential, random, distributed)
//! - [`Compose`]: Image and tensor transform pipeline
//!
//! ## Example
//!
//! ```ignore
//! use vision_data::data::{Compose, CenterCrop, DataLoaderBuilder, ImageFolder, Normalize};
//!
//! let dataset = ImageFolder::new("data/val2")?;
//! let pipeline = Compose::new()
//!     .image(CenterCrop::new(56))
//!     .tensor(Normalize::imagenet());
//!
//! let mut loader = DataLoaderBuilder::new()
//!     .batch_size(100)
//!     .num_workers(4)
//!     .build(dataset, pipeline)?;
//!
//! for batch in loader.iter()? {
//!     let batch = batch?;
//!     // batch.images: [N, 3, 56, 56], batch.labels: [N]
//! }
//! ```
//!
//! ## Available Components
//!
//! ### Samplers
//! - [`SequentialSampler`]: Iterate in order
//! - [`RandomSampler`]: Shuffle indices, reshuffled every epoch
//! - [`DistributedSampler`]: Disjoint shard per process
//! - [`BatchSampler`]: Group indices into batches
//!
//! ### Transforms
//! - [`CenterCrop`], [`RandomCrop`], [`RandomHorizontalFlip`]: geometry
//! - [`Normalize`]: Normalize with per-channel mean and std

pub mod dataloader;
pub mod dataset;
pub mod sampler;
pub mod transforms;

pub use dataloader::{
    seed_worker, worker_seed, Batch, DataLoader, DataLoaderBuilder, DataLoaderIter, WorkerInfo,
    WorkerInitFn,
};
pub use dataset::{Dataset, ImageFolder};
pub use sampler::{
    BatchSampler, DistributedSampler, ProcessGroup, RandomSampler, Sampler, SequentialSampler,
};
pub use transforms::{
    CenterCrop, Compose, ImageTransform, Normalize, RandomCrop, RandomHorizontalFlip,
    TensorTransform, IMAGENET_MEAN, IMAGENET_STD,
};
