// --- Файл: src/error.rs ---

//! Ошибки загрузки данных.
//!
//! Одна таксономия на весь крейт: от сканирования директорий и декодирования
//! изображений до воркеров DataLoader и фабрики загрузчиков.

use std::path::PathBuf;
use thiserror::Error;

/// Ошибки, возникающие при построении и итерации загрузчиков.
#[derive(Error, Debug)]
pub enum DataError {
    /// Нарушено предусловие раскладки данных на диске (например, нет `val2`).
    #[error("Ошибка конфигурации данных в {path}: {hint}")]
    Configuration { path: PathBuf, hint: String },

    #[error("Ошибка ввода/вывода в {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ошибка декодирования изображения {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("В {0} не найдено ни одной поддиректории-класса")]
    NoClasses(PathBuf),

    #[error("Класс '{class}' не содержит ни одного изображения: {path}")]
    NoImages { class: String, path: PathBuf },

    #[error("Индекс {index} вне диапазона датасета длины {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Ошибка преобразования: {0}")]
    Transform(String),

    #[error("Неверные параметры загрузчика: {0}")]
    InvalidConfig(String),

    #[error("Ошибка распределенной конфигурации: {0}")]
    Distributed(String),

    #[error("Воркер {0} завершился, не вернув батч")]
    WorkerDisconnected(usize),

    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DataError {
    /// Оборачивает `std::io::Error` вместе с путем, на котором он возник.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
