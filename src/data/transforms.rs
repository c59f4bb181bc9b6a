// --- Файл: src/data/transforms.rs ---

//! Преобразования изображений для предобработки.
//!
//! Конвейер состоит из двух стадий: геометрия над `RgbImage`
//! (кропы, отражения), затем перевод в тензор `[C, H, W]` и операции
//! над тензором (нормализация). Случайность берется только из переданного
//! генератора, поэтому результат определяется seed'ом воркера.

use crate::error::{DataError, Result};
use image::{imageops, RgbImage};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::Rng;

/// Среднее по каналам RGB для ImageNet.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Стандартное отклонение по каналам RGB для ImageNet.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Трейт для преобразований изображения до перевода в тензор.
pub trait ImageTransform: Send + Sync {
    /// Применяет преобразование к изображению.
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> Result<RgbImage>;

    /// Короткое имя для диагностики.
    fn name(&self) -> String;
}

/// Трейт для преобразований тензора `[C, H, W]`.
pub trait TensorTransform: Send + Sync {
    /// Применяет преобразование к тензору.
    fn apply(&self, data: Array3<f32>) -> Result<Array3<f32>>;

    /// Короткое имя для диагностики.
    fn name(&self) -> String;
}

/// Композиция преобразований: изображение -> ToTensor -> тензор.
pub struct Compose {
    image_transforms: Vec<Box<dyn ImageTransform>>,
    tensor_transforms: Vec<Box<dyn TensorTransform>>,
}

impl Compose {
    /// Создает композицию, состоящую только из ToTensor.
    pub fn new() -> Self {
        Self {
            image_transforms: Vec::new(),
            tensor_transforms: Vec::new(),
        }
    }

    /// Добавляет преобразование изображения.
    pub fn image<T: ImageTransform + 'static>(mut self, transform: T) -> Self {
        self.image_transforms.push(Box::new(transform));
        self
    }

    /// Добавляет преобразование тензора (выполняется после ToTensor).
    pub fn tensor<T: TensorTransform + 'static>(mut self, transform: T) -> Self {
        self.tensor_transforms.push(Box::new(transform));
        self
    }

    /// Прогоняет изображение через весь конвейер.
    pub fn apply(&self, mut image: RgbImage, rng: &mut StdRng) -> Result<Array3<f32>> {
        for transform in &self.image_transforms {
            image = transform.apply(image, rng)?;
        }
        let mut data = to_tensor(&image);
        for transform in &self.tensor_transforms {
            data = transform.apply(data)?;
        }
        Ok(data)
    }

    /// Имена стадий в порядке применения.
    pub fn describe(&self) -> Vec<String> {
        self.image_transforms
            .iter()
            .map(|t| t.name())
            .chain(std::iter::once("ToTensor".to_string()))
            .chain(self.tensor_transforms.iter().map(|t| t.name()))
            .collect()
    }
}

impl Default for Compose {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Compose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Compose").field(&self.describe()).finish()
    }
}

/// Переводит RGB изображение `[H, W, C]` u8 в тензор `[C, H, W]` f32 в [0, 1].
pub fn to_tensor(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

/// Дополняет изображение черными полями.
fn pad(image: &RgbImage, left: u32, top: u32, right: u32, bottom: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut canvas = RgbImage::new(width + left + right, height + top + bottom);
    imageops::replace(&mut canvas, image, left as i64, top as i64);
    canvas
}

/// Вырезает центральный квадрат `size x size`.
///
/// Если изображение меньше `size`, оно сначала симметрично дополняется нулями.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterCrop {
    size: u32,
}

impl CenterCrop {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    /// Левый верхний угол кропа для изображения `width x height`.
    pub fn origin(&self, width: u32, height: u32) -> (u32, u32) {
        let offset =
            |dim: u32| (dim.saturating_sub(self.size) as f64 / 2.0).round_ties_even() as u32;
        (offset(width), offset(height))
    }
}

impl ImageTransform for CenterCrop {
    fn apply(&self, mut image: RgbImage, _rng: &mut StdRng) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        if width < self.size || height < self.size {
            let pad_w = self.size.saturating_sub(width);
            let pad_h = self.size.saturating_sub(height);
            image = pad(&image, pad_w / 2, pad_h / 2, (pad_w + 1) / 2, (pad_h + 1) / 2);
        }

        let (width, height) = image.dimensions();
        if width == self.size && height == self.size {
            return Ok(image);
        }
        let (x, y) = self.origin(width, height);
        Ok(imageops::crop_imm(&image, x, y, self.size, self.size).to_image())
    }

    fn name(&self) -> String {
        format!("CenterCrop({})", self.size)
    }
}

/// Случайный кроп `size x size` после дополнения нулями на `padding` пикселей.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomCrop {
    size: u32,
    padding: u32,
}

impl RandomCrop {
    pub fn new(size: u32, padding: u32) -> Self {
        Self { size, padding }
    }
}

impl ImageTransform for RandomCrop {
    fn apply(&self, image: RgbImage, rng: &mut StdRng) -> Result<RgbImage> {
        let image = if self.padding > 0 {
            pad(&image, self.padding, self.padding, self.padding, self.padding)
        } else {
            image
        };

        let (width, height) = image.dimensions();
        if width < self.size || height < self.size {
            return Err(DataError::Transform(format!(
                "размер кропа {0}x{0} больше изображения {1}x{2} (с учетом padding)",
                self.size, width, height
            )));
        }
        if width == self.size && height == self.size {
            return Ok(image);
        }

        let top = rng.random_range(0..=height - self.size);
        let left = rng.random_range(0..=width - self.size);
        Ok(imageops::crop_imm(&image, left, top, self.size, self.size).to_image())
    }

    fn name(&self) -> String {
        format!("RandomCrop({}, padding={})", self.size, self.padding)
    }
}

/// Горизонтальное отражение с вероятностью `p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomHorizontalFlip {
    p: f64,
}

impl RandomHorizontalFlip {
    /// # Panics
    /// Паникует если `p` не в диапазоне [0, 1]
    pub fn new(p: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&p),
            "Flip probability must be in [0, 1], got {}",
            p
        );
        Self { p }
    }
}

impl Default for RandomHorizontalFlip {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ImageTransform for RandomHorizontalFlip {
    fn apply(&self, mut image: RgbImage, rng: &mut StdRng) -> Result<RgbImage> {
        if rng.random::<f64>() < self.p {
            imageops::flip_horizontal_in_place(&mut image);
        }
        Ok(image)
    }

    fn name(&self) -> String {
        format!("RandomHorizontalFlip({})", self.p)
    }
}

/// Нормализация по каналам: (x - mean[c]) / std[c]
#[derive(Debug, Clone, PartialEq)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    /// Создает нормализатор с заданными параметрами.
    ///
    /// # Panics
    /// Паникует если длины не совпадают или какое-то std равно нулю.
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        assert_eq!(mean.len(), std.len(), "mean and std must have the same length");
        assert!(std.iter().all(|&s| s != 0.0), "std evaluated to zero");
        Self { mean, std }
    }

    /// Создает нормализатор для изображений ImageNet (3 канала).
    pub fn imagenet() -> Self {
        Self::new(IMAGENET_MEAN.to_vec(), IMAGENET_STD.to_vec())
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn std(&self) -> &[f32] {
        &self.std
    }
}

impl TensorTransform for Normalize {
    fn apply(&self, mut data: Array3<f32>) -> Result<Array3<f32>> {
        let channels = data.shape()[0];
        if channels != self.mean.len() {
            return Err(DataError::Transform(format!(
                "Normalize ожидал {} каналов, получено {}",
                self.mean.len(),
                channels
            )));
        }

        for (c, mut plane) in data.outer_iter_mut().enumerate() {
            let (mean, std) = (self.mean[c], self.std[c]);
            plane.mapv_inplace(|x| (x - mean) / std);
        }
        Ok(data)
    }

    fn name(&self) -> String {
        "Normalize".to_string()
    }
}
