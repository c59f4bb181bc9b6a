//! # vision-data: image-folder loaders for vision training
//!
//! Builds the train and validation loaders of an image classification
//! pipeline from a directory tree with one subdirectory per class.
//!
//! ## Usage Example
//!
//! ```no_run
//! use vision_data::{build_loaders, LoaderConfig};
//!
//! let config = LoaderConfig::new(56).batch_size(128).seed(7);
//! let (train, mut val) = build_loaders("data/tiny-imagenet-200", &config)?;
//! assert!(train.is_some());
//!
//! for batch in val.iter()? {
//!     let batch = batch?;
//!     assert_eq!(batch.images.shape()[1..], [3, 56, 56]);
//! }
//! # Ok::<(), vision_data::DataError>(())
//! ```

// Declare public modules that constitute the library API.
pub mod data;
pub mod error;
pub mod factory;
pub mod prepare;

pub use error::{DataError, Result};
pub use factory::{build_loaders, eval_transform, train_transform, ImageLoader, LoaderConfig};
pub use prepare::{prepare_val_split, PrepareReport};
