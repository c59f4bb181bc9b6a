// --- Файл: src/prepare.rs ---

//! Подготовка валидационной выборки Tiny ImageNet.
//!
//! В исходном архиве валидация лежит одной плоской директорией
//! `val/images/` с разметкой в `val/val_annotations.txt`. Загрузчику нужна
//! раскладка «одна поддиректория на класс», поэтому изображения копируются
//! в `val2/<class>/`.

use crate::error::{DataError, Result};
use crate::factory::VAL_DIR;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};

/// Файл разметки валидации внутри `val/`.
pub const VAL_ANNOTATIONS: &str = "val_annotations.txt";

/// Итог подготовки `val2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    /// Скопировано файлов
    pub copied: usize,
    /// Пропущено файлов, уже лежащих на месте
    pub skipped: usize,
    /// Количество различных классов в разметке
    pub classes: usize,
}

/// Раскладывает `data_dir/val/images/*` по `data_dir/val2/<class>/`.
///
/// Строка разметки: `<file>\t<class>\t<x0>\t<y0>\t<x1>\t<y1>`, рамки
/// игнорируются. Уже существующие файлы не перезаписываются, так что
/// повторный запуск безопасен.
pub fn prepare_val_split(data_dir: impl AsRef<Path>) -> Result<PrepareReport> {
    let data_dir = data_dir.as_ref();
    let val_dir = data_dir.join("val");
    let annotations_path = val_dir.join(VAL_ANNOTATIONS);
    if !annotations_path.exists() {
        return Err(DataError::Configuration {
            path: annotations_path,
            hint: "annotations file not found; is this a Tiny ImageNet directory?".into(),
        });
    }

    let annotations =
        fs::read_to_string(&annotations_path).map_err(|e| DataError::io(&annotations_path, e))?;
    let images_dir = val_dir.join("images");
    let out_dir = data_dir.join(VAL_DIR);

    let mut report = PrepareReport::default();
    let mut classes = BTreeSet::new();

    for (line_no, line) in annotations.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split('\t');
        let (Some(file), Some(class)) = (fields.next(), fields.next()) else {
            return Err(DataError::Configuration {
                path: annotations_path.clone(),
                hint: format!("malformed annotation on line {}: {:?}", line_no + 1, line),
            });
        };
        for name in [file, class] {
            if !is_plain_name(name) {
                return Err(DataError::Configuration {
                    path: annotations_path.clone(),
                    hint: format!(
                        "line {}: {:?} must be a plain relative name",
                        line_no + 1,
                        name
                    ),
                });
            }
        }

        let class_dir = out_dir.join(class);
        if classes.insert(class.to_string()) {
            fs::create_dir_all(&class_dir).map_err(|e| DataError::io(&class_dir, e))?;
        }

        let dest = class_dir.join(file);
        if dest.exists() {
            report.skipped += 1;
            continue;
        }
        let src = images_dir.join(file);
        fs::copy(&src, &dest).map_err(|e| DataError::io(&src, e))?;
        report.copied += 1;
    }

    report.classes = classes.len();
    tracing::info!(
        copied = report.copied,
        skipped = report.skipped,
        classes = report.classes,
        out = %out_dir.display(),
        "validation split prepared"
    );
    Ok(report)
}

/// Непустой путь только из обычных компонентов: без `..`, `.` и корня.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
