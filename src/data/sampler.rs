// --- Файл: src/data/sampler.rs ---

//! Стратегии сэмплирования данных для DataLoader.

use crate::error::{DataError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Трейт для сэмплеров - генераторов индексов.
pub trait Sampler: Iterator<Item = usize> {
    /// Возвращает общее количество образцов за эпоху.
    fn len(&self) -> usize;

    /// Проверяет, пуст ли сэмплер.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Сбрасывает сэмплер в начало эпохи.
    fn reset(&mut self);

    /// Сообщает сэмплеру номер эпохи. По умолчанию ничего не делает.
    fn set_epoch(&mut self, _epoch: u64) {}
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn set_epoch(&mut self, epoch: u64) {
        (**self).set_epoch(epoch)
    }
}

/// Последовательный сэмплер - возвращает индексы по порядку.
pub struct SequentialSampler {
    len: usize,
    current: usize,
}

impl SequentialSampler {
    /// Создает последовательный сэмплер для датасета заданного размера.
    pub fn new(len: usize) -> Self {
        Self { len, current: 0 }
    }
}

impl Iterator for SequentialSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current < self.len {
            let idx = self.current;
            self.current += 1;
            Some(idx)
        } else {
            None
        }
    }
}

impl Sampler for SequentialSampler {
    fn len(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.current = 0;
    }
}

/// Случайный сэмплер - возвращает индексы в случайном порядке.
///
/// Каждый `reset` перемешивает заново, продолжая поток одного генератора:
/// порядок меняется от эпохи к эпохе, но воспроизводим при фиксированном seed.
pub struct RandomSampler {
    indices: Vec<usize>,
    current: usize,
    rng: StdRng,
}

impl RandomSampler {
    /// Создает случайный сэмплер для датасета заданного размера.
    pub fn new(len: usize) -> Self {
        Self::from_rng(len, StdRng::from_os_rng())
    }

    /// Создает случайный сэмплер с фиксированным seed для воспроизводимости.
    pub fn with_seed(len: usize, seed: u64) -> Self {
        Self::from_rng(len, StdRng::seed_from_u64(seed))
    }

    fn from_rng(len: usize, rng: StdRng) -> Self {
        let mut sampler = Self {
            indices: (0..len).collect(),
            current: 0,
            rng,
        };
        sampler.shuffle();
        sampler
    }

    fn shuffle(&mut self) {
        self.indices.shuffle(&mut self.rng);
    }
}

impl Iterator for RandomSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current < self.indices.len() {
            let idx = self.indices[self.current];
            self.current += 1;
            Some(idx)
        } else {
            None
        }
    }
}

impl Sampler for RandomSampler {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn reset(&mut self) {
        self.current = 0;
        self.shuffle();
    }
}

/// Положение процесса в группе распределенного обучения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGroup {
    /// Номер процесса, `0..world_size`
    pub rank: usize,
    /// Количество процессов
    pub world_size: usize,
}

impl ProcessGroup {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(DataError::Distributed("world_size must be positive".into()));
        }
        if rank >= world_size {
            return Err(DataError::Distributed(format!(
                "rank {} is out of range for world_size {}",
                rank, world_size
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Читает `RANK` и `WORLD_SIZE` из окружения (как их выставляет лаунчер).
    pub fn from_env() -> Result<Self> {
        let read = |name: &str| -> Result<usize> {
            let raw = std::env::var(name).map_err(|_| {
                DataError::Distributed(format!(
                    "{} is not set; the process group has not been initialized",
                    name
                ))
            })?;
            raw.trim().parse().map_err(|_| {
                DataError::Distributed(format!("{} is not a valid integer: {:?}", name, raw))
            })
        };
        Self::new(read("RANK")?, read("WORLD_SIZE")?)
    }
}

/// Распределенный сэмплер: каждый процесс получает свой непересекающийся шард.
///
/// Индексы эпохи перемешиваются генератором с seed `seed + epoch` (одинаковым
/// на всех процессах), дополняются по кругу до кратной `num_replicas` длины,
/// после чего процесс `rank` берет каждый `num_replicas`-й индекс начиная с `rank`.
pub struct DistributedSampler {
    dataset_len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    drop_last: bool,
    epoch: u64,
    num_samples: usize,
    indices: Vec<usize>,
    current: usize,
}

impl DistributedSampler {
    /// Сэмплер с перемешиванием, seed 0 и без отбрасывания хвоста.
    pub fn new(dataset_len: usize, group: ProcessGroup) -> Result<Self> {
        let group = ProcessGroup::new(group.rank, group.world_size)?;
        let mut sampler = Self {
            dataset_len,
            num_replicas: group.world_size,
            rank: group.rank,
            shuffle: true,
            seed: 0,
            drop_last: false,
            epoch: 0,
            num_samples: 0,
            indices: Vec::new(),
            current: 0,
        };
        sampler.rebuild();
        Ok(sampler)
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self.rebuild();
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rebuild();
        self
    }

    /// Отбрасывать хвост вместо дополнения до кратной длины.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self.rebuild();
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Полный размер эпохи на всех процессах.
    pub fn total_size(&self) -> usize {
        self.num_samples * self.num_replicas
    }

    fn rebuild(&mut self) {
        let n = self.dataset_len;
        let replicas = self.num_replicas;
        self.num_samples = if self.drop_last && n % replicas != 0 {
            n.saturating_sub(replicas).div_ceil(replicas)
        } else {
            n.div_ceil(replicas)
        };
        let total_size = self.total_size();

        let mut indices: Vec<usize> = (0..n).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            indices.shuffle(&mut rng);
        }

        if self.drop_last {
            indices.truncate(total_size);
        } else if n > 0 {
            let mut i = 0;
            while indices.len() < total_size {
                indices.push(indices[i % n]);
                i += 1;
            }
        }

        self.indices = indices
            .into_iter()
            .skip(self.rank)
            .step_by(replicas)
            .collect();
        self.current = 0;
    }
}

impl Iterator for DistributedSampler {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = *self.indices.get(self.current)?;
        self.current += 1;
        Some(idx)
    }
}

impl Sampler for DistributedSampler {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn reset(&mut self) {
        self.current = 0;
    }

    fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.rebuild();
    }
}

/// Батч-сэмплер - группирует индексы в батчи.
pub struct BatchSampler<S: Sampler> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    /// Создает батч-сэмплер.
    ///
    /// # Аргументы
    ///
    /// * `sampler` - Внутренний сэмплер для генерации индексов
    /// * `batch_size` - Размер батча
    /// * `drop_last` - Отбросить последний неполный батч
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Self {
        Self {
            sampler,
            batch_size,
            drop_last,
        }
    }

    /// Возвращает количество батчей.
    pub fn num_batches(&self) -> usize {
        let n = self.sampler.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Сбрасывает сэмплер.
    pub fn reset(&mut self) {
        self.sampler.reset();
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }
}

impl<S: Sampler> Iterator for BatchSampler<S> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.batch_size);

        for _ in 0..self.batch_size {
            if let Some(idx) = self.sampler.next() {
                batch.push(idx);
            } else {
                break;
            }
        }

        if batch.is_empty() {
            return None;
        }

        if batch.len() < self.batch_size && self.drop_last {
            return None;
        }

        Some(batch)
    }
}
