// --- Файл: src/data/dataloader.rs ---

//! DataLoader - итератор по батчам данных с пулом воркеров.
//!
//! Эпоха начинается вызовом [`DataLoader::iter`]: сэмплер выдает порядок
//! индексов, индексы режутся на батчи, батч `b` уходит воркеру
//! `b % num_workers`. Каждый воркер обрабатывает свои задачи по порядку,
//! поэтому потребитель получает батчи в исходном порядке без буфера
//! переупорядочивания. Пул живет ровно столько, сколько итератор эпохи.

use super::dataset::Dataset;
use super::sampler::{BatchSampler, RandomSampler, Sampler, SequentialSampler};
use super::transforms::Compose;
use crate::error::{DataError, Result};
use image::RgbImage;
use ndarray::{Array1, Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Батч данных - пара (изображения, метки).
#[derive(Debug, Clone)]
pub struct Batch {
    /// Изображения формы `[N, C, H, W]`
    pub images: Array4<f32>,
    /// Индексы классов формы `[N]`
    pub labels: Array1<i64>,
    /// Индексы образцов в этом батче
    pub indices: Vec<usize>,
}

impl Batch {
    /// Возвращает размер батча.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Проверяет, пуст ли батч.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Сведения, которые воркер получает при старте.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Номер воркера, `0..num_workers`
    pub id: usize,
    pub num_workers: usize,
    /// Производный seed воркера: `base_seed + id`
    pub seed: u64,
    /// Номер эпохи загрузчика, считая с 0 (по одному на вызов `iter`)
    pub epoch: u64,
}

/// Пользовательский хук, вызываемый один раз при старте каждого воркера.
pub type WorkerInitFn = Arc<dyn Fn(&WorkerInfo) + Send + Sync>;

/// Seed воркера `worker_id` для базового seed загрузчика.
pub fn worker_seed(base_seed: u64, worker_id: usize) -> u64 {
    base_seed.wrapping_add(worker_id as u64)
}

/// Инициализирует генератор воркера из его seed и номера эпохи.
///
/// В эпохе 0 это ровно `seed_from_u64(info.seed)`; в следующих эпохах поток
/// аугментаций меняется, оставаясь воспроизводимым для того же seed.
pub fn seed_worker(info: &WorkerInfo) -> StdRng {
    StdRng::seed_from_u64(epoch_seed(info.seed, info.epoch))
}

/// Смешивает seed с номером эпохи (мультипликатор splitmix64).
fn epoch_seed(seed: u64, epoch: u64) -> u64 {
    seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

type BoxedSampler = Box<dyn Sampler + Send>;

/// Конструктор DataLoader.
pub struct DataLoaderBuilder {
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: Option<u64>,
    num_workers: usize,
    pin_memory: bool,
    prefetch_factor: usize,
    sampler: Option<BoxedSampler>,
    worker_init_fn: Option<WorkerInitFn>,
}

impl Default for DataLoaderBuilder {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            drop_last: false,
            seed: None,
            num_workers: 0,
            pin_memory: false,
            prefetch_factor: 2,
            sampler: None,
            worker_init_fn: None,
        }
    }
}

impl DataLoaderBuilder {
    /// Создает новый builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Устанавливает размер батча.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Включает перемешивание каждую эпоху.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Устанавливает drop_last.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Базовый seed: от него считаются seed'ы воркеров и порядок перемешивания.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Количество воркеров. 0 - загрузка в вызывающем потоке.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Флаг pinned memory. Хранится для потребителя батчей, который
    /// переносит их на устройство; на CPU-массивы не влияет.
    pub fn pin_memory(mut self, pin: bool) -> Self {
        self.pin_memory = pin;
        self
    }

    /// Сколько батчей держать в работе на каждого воркера.
    pub fn prefetch_factor(mut self, factor: usize) -> Self {
        self.prefetch_factor = factor;
        self
    }

    /// Явный сэмплер (например, распределенный). Несовместим с `shuffle`.
    pub fn sampler<S: Sampler + Send + 'static>(mut self, sampler: S) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Хук инициализации воркера.
    pub fn worker_init_fn(mut self, init: WorkerInitFn) -> Self {
        self.worker_init_fn = Some(init);
        self
    }

    /// Строит DataLoader.
    pub fn build<D>(self, dataset: D, pipeline: Compose) -> Result<DataLoader<D>>
    where
        D: Dataset<Item = RgbImage, Label = usize> + 'static,
    {
        if self.batch_size == 0 {
            return Err(DataError::InvalidConfig(
                "batch_size must be a positive integer".into(),
            ));
        }
        if self.shuffle && self.sampler.is_some() {
            return Err(DataError::InvalidConfig(
                "sampler option is mutually exclusive with shuffle".into(),
            ));
        }
        if self.num_workers > 0 && self.prefetch_factor == 0 {
            return Err(DataError::InvalidConfig(
                "prefetch_factor must be positive when num_workers > 0".into(),
            ));
        }

        let seed = self.seed.unwrap_or_else(rand::random);
        let has_custom_sampler = self.sampler.is_some();
        let sampler: BoxedSampler = match self.sampler {
            Some(sampler) => sampler,
            None if self.shuffle => Box::new(RandomSampler::with_seed(dataset.len(), seed)),
            None => Box::new(SequentialSampler::new(dataset.len())),
        };

        Ok(DataLoader {
            dataset: Arc::new(dataset),
            pipeline: Arc::new(pipeline),
            batch_sampler: BatchSampler::new(sampler, self.batch_size, self.drop_last),
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            drop_last: self.drop_last,
            has_custom_sampler,
            seed,
            num_workers: self.num_workers,
            pin_memory: self.pin_memory,
            prefetch_factor: self.prefetch_factor,
            worker_init_fn: self.worker_init_fn,
            epoch: 0,
        })
    }
}

/// DataLoader - интерфейс для итерации по датасету батчами.
///
/// # Пример
///
/// ```rust,ignore
/// let mut loader = DataLoaderBuilder::new()
///     .batch_size(32)
///     .shuffle(true)
///     .num_workers(4)
///     .build(dataset, pipeline)?;
///
/// for batch in loader.iter()? {
///     let batch = batch?;
///     println!("Batch size: {}", batch.len());
/// }
/// ```
pub struct DataLoader<D> {
    dataset: Arc<D>,
    pipeline: Arc<Compose>,
    batch_sampler: BatchSampler<BoxedSampler>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    has_custom_sampler: bool,
    seed: u64,
    num_workers: usize,
    pin_memory: bool,
    prefetch_factor: usize,
    worker_init_fn: Option<WorkerInitFn>,
    /// Сколько эпох уже начато через `iter`
    epoch: u64,
}

impl<D> DataLoader<D>
where
    D: Dataset<Item = RgbImage, Label = usize> + 'static,
{
    pub fn builder() -> DataLoaderBuilder {
        DataLoaderBuilder::new()
    }

    /// Возвращает размер батча.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Перемешивает ли сам загрузчик (без учета явного сэмплера).
    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    /// Задан ли явный сэмплер (распределенный режим).
    pub fn has_custom_sampler(&self) -> bool {
        self.has_custom_sampler
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn pin_memory(&self) -> bool {
        self.pin_memory
    }

    /// Базовый seed загрузчика.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Seed'ы, с которыми стартуют воркеры: `seed + worker_index`.
    pub fn worker_seeds(&self) -> Vec<u64> {
        (0..self.num_workers)
            .map(|id| worker_seed(self.seed, id))
            .collect()
    }

    /// Возвращает размер датасета.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// Проверяет, пуст ли DataLoader.
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Возвращает количество батчей за эпоху.
    pub fn num_batches(&self) -> usize {
        self.batch_sampler.num_batches()
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn pipeline(&self) -> &Compose {
        &self.pipeline
    }

    /// Передает номер эпохи сэмплеру (нужно для распределенного режима).
    pub fn set_epoch(&mut self, epoch: u64) {
        self.batch_sampler.sampler_mut().set_epoch(epoch);
    }

    /// Начинает эпоху и возвращает итератор по батчам.
    ///
    /// При `num_workers > 0` запускает пул воркеров, который
    /// останавливается при исчерпании или удалении итератора.
    pub fn iter(&mut self) -> Result<DataLoaderIter<D>> {
        self.batch_sampler.reset();
        let batches: VecDeque<Vec<usize>> = self.batch_sampler.by_ref().collect();
        let epoch = self.epoch;

        let fetcher = if self.num_workers == 0 {
            let info = WorkerInfo {
                id: 0,
                num_workers: 0,
                seed: self.seed,
                epoch,
            };
            Fetcher::Inline {
                dataset: Arc::clone(&self.dataset),
                pipeline: Arc::clone(&self.pipeline),
                rng: seed_worker(&info),
            }
        } else {
            Fetcher::Workers(WorkerPool::spawn(
                self.num_workers,
                self.seed,
                epoch,
                &self.dataset,
                &self.pipeline,
                self.worker_init_fn.as_ref(),
            )?)
        };
        self.epoch += 1;

        tracing::trace!(
            epoch,
            batches = batches.len(),
            workers = self.num_workers,
            "epoch started"
        );

        let mut iter = DataLoaderIter {
            total: batches.len(),
            pending: batches,
            dispatched: 0,
            yielded: 0,
            max_in_flight: self.prefetch_factor * self.num_workers,
            fetcher,
        };
        iter.dispatch();
        Ok(iter)
    }
}

impl<D> std::fmt::Debug for DataLoader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("drop_last", &self.drop_last)
            .field("has_custom_sampler", &self.has_custom_sampler)
            .field("seed", &self.seed)
            .field("num_workers", &self.num_workers)
            .field("pin_memory", &self.pin_memory)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Загружает и собирает один батч.
fn fetch_batch<D>(
    dataset: &D,
    pipeline: &Compose,
    indices: Vec<usize>,
    rng: &mut StdRng,
) -> Result<Batch>
where
    D: Dataset<Item = RgbImage, Label = usize>,
{
    let mut images = Vec::with_capacity(indices.len());
    let mut labels = Vec::with_capacity(indices.len());
    for &index in &indices {
        let (image, label) = dataset.get(index)?;
        images.push(pipeline.apply(image, rng)?);
        labels.push(label as i64);
    }

    let views: Vec<_> = images.iter().map(|image| image.view()).collect();
    let images = ndarray::stack(Axis(0), &views)
        .map_err(|e| DataError::Transform(format!("не удалось собрать батч: {}", e)))?;

    Ok(Batch {
        images,
        labels: Array1::from(labels),
        indices,
    })
}

type Task = (usize, Vec<usize>);
type TaskResult = (usize, Result<Batch>);

/// Воркер со своими каналами задач и результатов.
struct WorkerHandle {
    tasks: Option<Sender<Task>>,
    results: Receiver<TaskResult>,
    thread: Option<JoinHandle<()>>,
}

struct WorkerPool {
    workers: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    fn spawn<D>(
        num_workers: usize,
        base_seed: u64,
        epoch: u64,
        dataset: &Arc<D>,
        pipeline: &Arc<Compose>,
        init: Option<&WorkerInitFn>,
    ) -> Result<Self>
    where
        D: Dataset<Item = RgbImage, Label = usize> + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let info = WorkerInfo {
                id,
                num_workers,
                seed: worker_seed(base_seed, id),
                epoch,
            };
            let (task_tx, task_rx) = mpsc::channel::<Task>();
            let (result_tx, result_rx) = mpsc::channel::<TaskResult>();
            let dataset = Arc::clone(dataset);
            let pipeline = Arc::clone(pipeline);
            let init = init.cloned();
            let shutdown = Arc::clone(&shutdown);

            let thread = thread::Builder::new()
                .name(format!("data-worker-{}", id))
                .spawn(move || {
                    worker_loop(info, &*dataset, &pipeline, init, task_rx, result_tx, &shutdown)
                })
                .map_err(|e| DataError::io(format!("<data-worker-{}>", id), e))?;

            workers.push(WorkerHandle {
                tasks: Some(task_tx),
                results: result_rx,
                thread: Some(thread),
            });
        }

        tracing::debug!(num_workers, base_seed, epoch, "data workers spawned");
        Ok(Self { workers, shutdown })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for worker in &mut self.workers {
            worker.tasks.take();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    tracing::warn!("data worker panicked during shutdown");
                }
            }
        }
    }
}

fn worker_loop<D>(
    info: WorkerInfo,
    dataset: &D,
    pipeline: &Compose,
    init: Option<WorkerInitFn>,
    tasks: Receiver<Task>,
    results: Sender<TaskResult>,
    shutdown: &AtomicBool,
) where
    D: Dataset<Item = RgbImage, Label = usize>,
{
    if let Some(init) = init {
        init(&info);
    }
    let mut rng = seed_worker(&info);

    for (batch_idx, indices) in tasks {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let batch = fetch_batch(dataset, pipeline, indices, &mut rng);
        if results.send((batch_idx, batch)).is_err() {
            break;
        }
    }
}

enum Fetcher<D> {
    Inline {
        dataset: Arc<D>,
        pipeline: Arc<Compose>,
        rng: StdRng,
    },
    Workers(WorkerPool),
}

/// Итератор по батчам одной эпохи.
pub struct DataLoaderIter<D> {
    pending: VecDeque<Vec<usize>>,
    total: usize,
    dispatched: usize,
    yielded: usize,
    max_in_flight: usize,
    fetcher: Fetcher<D>,
}

impl<D> DataLoaderIter<D> {
    /// Сколько батчей осталось выдать в этой эпохе.
    pub fn remaining(&self) -> usize {
        self.total - self.yielded
    }

    /// Догружает очереди воркеров до `prefetch_factor` задач на воркера.
    fn dispatch(&mut self) {
        let Fetcher::Workers(pool) = &self.fetcher else {
            return;
        };
        while self.dispatched - self.yielded < self.max_in_flight {
            let Some(indices) = self.pending.pop_front() else {
                break;
            };
            let worker = &pool.workers[self.dispatched % pool.workers.len()];
            // Упавший воркер обнаружится при чтении результата
            if let Some(tasks) = &worker.tasks {
                let _ = tasks.send((self.dispatched, indices));
            }
            self.dispatched += 1;
        }
    }
}

impl<D> Iterator for DataLoaderIter<D>
where
    D: Dataset<Item = RgbImage, Label = usize>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.yielded >= self.total {
            return None;
        }

        let item = match &mut self.fetcher {
            Fetcher::Inline {
                dataset,
                pipeline,
                rng,
            } => {
                let indices = self.pending.pop_front()?;
                fetch_batch(&**dataset, pipeline, indices, rng)
            }
            Fetcher::Workers(pool) => {
                let worker_id = self.yielded % pool.workers.len();
                match pool.workers[worker_id].results.recv() {
                    Ok((batch_idx, batch)) => {
                        debug_assert_eq!(batch_idx, self.yielded);
                        batch
                    }
                    Err(_) => {
                        self.yielded = self.total;
                        return Some(Err(DataError::WorkerDisconnected(worker_id)));
                    }
                }
            }
        };

        self.yielded += 1;
        self.dispatch();
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}
