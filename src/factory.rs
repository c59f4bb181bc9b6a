// --- Файл: src/factory.rs ---

//! Фабрика загрузчиков train/val для директории изображений.
//!
//! Ожидаемая раскладка:
//!
//! ```text
//! data_dir/train/<class>/<image>
//! data_dir/val2/<class>/<image>
//! ```
//!
//! `val2` создается шагом подготовки ([`crate::prepare::prepare_val_split`]).

use crate::data::{
    CenterCrop, Compose, DataLoader, DataLoaderBuilder, Dataset, DistributedSampler, ImageFolder,
    Normalize, ProcessGroup, RandomCrop, RandomHorizontalFlip,
};
use crate::error::{DataError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Поддиректория обучающей выборки.
pub const TRAIN_DIR: &str = "train";
/// Поддиректория валидационной выборки.
pub const VAL_DIR: &str = "val2";
/// Размер батча валидации, не зависит от `batch_size`.
pub const VAL_BATCH_SIZE: usize = 100;
/// Padding для случайного кропа при аугментации.
pub const RANDOM_CROP_PADDING: u32 = 8;
/// Верхняя граница случайного seed, если он не задан.
const MAX_RANDOM_SEED: u64 = 10_000;

/// Загрузчик изображений из директории.
pub type ImageLoader = DataLoader<ImageFolder>;

/// Параметры построения загрузчиков.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Сторона квадратного входа модели в пикселях
    pub input_size: u32,
    /// Строить только валидационный загрузчик
    pub val_only: bool,
    /// Номинальный размер батча обучения
    pub batch_size: usize,
    /// Размер подвыборки обучения. Принимается, но не применяется.
    pub subsample_size: Option<usize>,
    /// Базовый seed. `None` - новый случайный seed на каждый вызов.
    pub seed: Option<u64>,
    /// Аугментация обучающей выборки
    pub augment: bool,
    /// Количество воркеров на каждый загрузчик
    pub num_workers: usize,
    /// Шагов накопления градиента на один шаг оптимизатора
    pub grad_accum_steps: usize,
    /// Распределенное обучение: шардировать train между процессами
    pub distributed: bool,
    /// Положение процесса в группе. `None` - читать из окружения.
    pub process_group: Option<ProcessGroup>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            input_size: 64,
            val_only: false,
            batch_size: 128,
            subsample_size: None,
            seed: None,
            augment: true,
            num_workers: 4,
            grad_accum_steps: 1,
            distributed: false,
            process_group: None,
        }
    }
}

impl LoaderConfig {
    /// Конфигурация по умолчанию для заданного размера входа.
    pub fn new(input_size: u32) -> Self {
        Self {
            input_size,
            ..Self::default()
        }
    }

    /// Читает конфигурацию из JSON; отсутствующие поля берутся по умолчанию.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| DataError::io(path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn val_only(mut self, val_only: bool) -> Self {
        self.val_only = val_only;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn subsample_size(mut self, size: usize) -> Self {
        self.subsample_size = Some(size);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn augment(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn grad_accum_steps(mut self, steps: usize) -> Self {
        self.grad_accum_steps = steps;
        self
    }

    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn process_group(mut self, group: ProcessGroup) -> Self {
        self.process_group = Some(group);
        self
    }

    /// Размер батча обучающего загрузчика: `batch_size / grad_accum_steps`.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size / self.grad_accum_steps.max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(DataError::InvalidConfig("input_size must be positive".into()));
        }
        if self.grad_accum_steps == 0 {
            return Err(DataError::InvalidConfig(
                "grad_accum_steps must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Детерминированный конвейер: центральный кроп и нормализация ImageNet.
pub fn eval_transform(input_size: u32) -> Compose {
    Compose::new()
        .image(CenterCrop::new(input_size))
        .tensor(Normalize::imagenet())
}

/// Конвейер обучения; без аугментации совпадает с [`eval_transform`].
pub fn train_transform(input_size: u32, augment: bool) -> Compose {
    if !augment {
        return eval_transform(input_size);
    }
    Compose::new()
        .image(RandomCrop::new(input_size, RANDOM_CROP_PADDING))
        .image(RandomHorizontalFlip::new(0.5))
        .tensor(Normalize::imagenet())
}

/// Строит загрузчики `(train, val)` для `data_dir`.
///
/// Проверяется только наличие `data_dir/val2`: без нее возвращается
/// [`DataError::Configuration`] до любого обращения к `train`. Отсутствие
/// `data_dir/train` отдельно не проверяется, ошибка сканирования
/// директории пробрасывается как [`DataError::Io`].
///
/// При `val_only` обучающий загрузчик равен `None`.
pub fn build_loaders(
    data_dir: impl AsRef<Path>,
    config: &LoaderConfig,
) -> Result<(Option<ImageLoader>, ImageLoader)> {
    config.validate()?;
    let data_dir = data_dir.as_ref();
    let seed = config
        .seed
        .unwrap_or_else(|| rand::rng().random_range(0..=MAX_RANDOM_SEED));

    if let Some(size) = config.subsample_size {
        tracing::warn!(
            subsample_size = size,
            "subsample_size is accepted but not applied; the full training split is used"
        );
    }

    let val_dir = data_dir.join(VAL_DIR);
    if !val_dir.exists() {
        return Err(DataError::Configuration {
            path: val_dir,
            hint: "validation split missing; run the data-preparation step \
                   (prepare_val_split) before building loaders"
                .into(),
        });
    }

    let val_loader = DataLoaderBuilder::new()
        .batch_size(VAL_BATCH_SIZE)
        .shuffle(false)
        .num_workers(config.num_workers)
        .pin_memory(true)
        .seed(seed)
        .build(ImageFolder::new(&val_dir)?, eval_transform(config.input_size))?;

    let train_loader = if config.val_only {
        None
    } else {
        Some(build_train_loader(&data_dir.join(TRAIN_DIR), config, seed)?)
    };

    tracing::info!(
        data_dir = %data_dir.display(),
        seed,
        train_samples = train_loader.as_ref().map(|l| l.len()),
        val_samples = val_loader.len(),
        "loaders ready"
    );

    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "| loaded tiny imagenet");
    let _ = stdout.flush();

    Ok((train_loader, val_loader))
}

fn build_train_loader(train_dir: &Path, config: &LoaderConfig, seed: u64) -> Result<ImageLoader> {
    let dataset = ImageFolder::new(train_dir)?;

    let batch_size = config.effective_batch_size();
    if batch_size == 0 {
        return Err(DataError::InvalidConfig(format!(
            "batch_size {} / grad_accum_steps {} leaves an empty train batch",
            config.batch_size, config.grad_accum_steps
        )));
    }

    let builder = DataLoaderBuilder::new()
        .batch_size(batch_size)
        .num_workers(config.num_workers)
        .pin_memory(true)
        .seed(seed);

    let builder = if config.distributed {
        let group = match config.process_group {
            Some(group) => group,
            None => ProcessGroup::from_env()?,
        };
        tracing::debug!(rank = group.rank, world_size = group.world_size, "sharding train split");
        builder
            .shuffle(false)
            .sampler(DistributedSampler::new(dataset.len(), group)?)
    } else {
        builder.shuffle(true)
    };

    builder.build(dataset, train_transform(config.input_size, config.augment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_signature() {
        let config = LoaderConfig::default();
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.grad_accum_steps, 1);
        assert!(config.augment);
        assert!(!config.val_only);
        assert!(!config.distributed);
        assert_eq!(config.seed, None);
        assert_eq!(config.subsample_size, None);
    }

    #[test]
    fn test_effective_batch_size_floors() {
        assert_eq!(LoaderConfig::new(56).grad_accum_steps(4).effective_batch_size(), 32);
        assert_eq!(
            LoaderConfig::new(56)
                .batch_size(10)
                .grad_accum_steps(3)
                .effective_batch_size(),
            3
        );
    }

    #[test]
    fn test_transforms_describe() {
        assert_eq!(
            eval_transform(56).describe(),
            vec!["CenterCrop(56)", "ToTensor", "Normalize"]
        );
        assert_eq!(
            train_transform(56, true).describe(),
            vec![
                "RandomCrop(56, padding=8)",
                "RandomHorizontalFlip(0.5)",
                "ToTensor",
                "Normalize"
            ]
        );
        assert_eq!(train_transform(56, false).describe(), eval_transform(56).describe());
    }

    #[test]
    fn test_config_from_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loader.json");
        std::fs::write(
            &path,
            r#"{ "input_size": 56, "batch_size": 256, "process_group": { "rank": 1, "world_size": 4 } }"#,
        )
        .unwrap();

        let config = LoaderConfig::from_json_file(&path).unwrap();
        assert_eq!(config.input_size, 56);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.process_group, Some(ProcessGroup { rank: 1, world_size: 4 }));
    }

    #[test]
    fn test_invalid_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loader.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            LoaderConfig::from_json_file(&path),
            Err(DataError::Json(_))
        ));
    }

    #[test]
    fn test_invalid_knobs_rejected_before_io() {
        let missing = Path::new("/definitely/not/here");
        assert!(matches!(
            build_loaders(missing, &LoaderConfig::new(0)),
            Err(DataError::InvalidConfig(_))
        ));
        assert!(matches!(
            build_loaders(missing, &LoaderConfig::new(8).grad_accum_steps(0)),
            Err(DataError::InvalidConfig(_))
        ));
    }
}
