// --- Файл: src/data/dataset.rs ---

//! Определение трейта Dataset и датасета-директории изображений.

use crate::error::{DataError, Result};
use image::RgbImage;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Расширения файлов, которые считаются изображениями (без учета регистра).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

/// Трейт для источников данных.
///
/// Каждый датасет должен уметь:
/// - Возвращать количество элементов
/// - Возвращать элемент по индексу
pub trait Dataset: Send + Sync {
    /// Тип элемента данных (features)
    type Item;
    /// Тип метки (label)
    type Label;

    /// Возвращает количество элементов в датасете.
    fn len(&self) -> usize;

    /// Проверяет, пуст ли датасет.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Возвращает элемент и метку по индексу.
    ///
    /// Загрузка может упасть (файл удален, битое изображение), поэтому
    /// результат - `Result`, а не `Option`.
    fn get(&self, index: usize) -> Result<(Self::Item, Self::Label)>;

    /// Возвращает только метку по индексу.
    fn get_label(&self, index: usize) -> Result<Self::Label> {
        self.get(index).map(|(_, label)| label)
    }
}

/// Датасет классификации изображений: одна поддиректория на класс.
///
/// ```text
/// root/n01443537/img_0.JPEG
/// root/n01443537/img_1.JPEG
/// root/n01629819/img_0.JPEG
/// ```
///
/// Классы - отсортированные имена поддиректорий, индекс класса - позиция
/// в этом списке. Образцы упорядочены по классу, затем по имени файла.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    class_to_idx: HashMap<String, usize>,
    samples: Vec<(PathBuf, usize)>,
}

impl ImageFolder {
    /// Сканирует `root` и строит индекс образцов.
    ///
    /// Ошибка ввода/вывода при чтении `root` (в том числе отсутствие
    /// директории) пробрасывается как есть, в виде [`DataError::Io`].
    /// Класс без единого изображения дает [`DataError::NoImages`].
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let classes = find_classes(&root)?;
        let class_to_idx: HashMap<String, usize> = classes
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        let mut samples = Vec::new();
        for (idx, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            let mut files = Vec::new();
            collect_images(&class_dir, &mut files)?;
            if files.is_empty() {
                return Err(DataError::NoImages {
                    class: class.clone(),
                    path: class_dir,
                });
            }
            samples.extend(files.into_iter().map(|path| (path, idx)));
        }

        tracing::debug!(
            root = %root.display(),
            classes = classes.len(),
            samples = samples.len(),
            "image folder scanned"
        );

        Ok(Self {
            root,
            classes,
            class_to_idx,
            samples,
        })
    }

    /// Корневая директория датасета.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Отсортированные имена классов.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Индекс класса по его имени.
    pub fn class_to_idx(&self, class: &str) -> Option<usize> {
        self.class_to_idx.get(class).copied()
    }

    /// Пары (путь к файлу, индекс класса) в порядке датасета.
    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }
}

impl Dataset for ImageFolder {
    type Item = RgbImage;
    type Label = usize;

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<(Self::Item, Self::Label)> {
        let (path, label) = self
            .samples
            .get(index)
            .ok_or(DataError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })?;

        let image = image::open(path)
            .map_err(|source| DataError::Image {
                path: path.clone(),
                source,
            })?
            .to_rgb8();

        Ok((image, *label))
    }

    fn get_label(&self, index: usize) -> Result<Self::Label> {
        self.samples
            .get(index)
            .map(|(_, label)| *label)
            .ok_or(DataError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })
    }
}

/// Возвращает отсортированные имена поддиректорий `root`.
fn find_classes(root: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| DataError::io(root, e))? {
        let entry = entry.map_err(|e| DataError::io(root, e))?;
        // is_dir() идет по симлинкам
        if entry.path().is_dir() {
            classes.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    if classes.is_empty() {
        return Err(DataError::NoClasses(root.to_path_buf()));
    }

    classes.sort();
    Ok(classes)
}

/// Рекурсивно собирает файлы изображений в `dir`.
///
/// Сначала отсортированные файлы самой директории, затем по очереди
/// отсортированные поддиректории.
fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| DataError::io(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| DataError::io(dir, e))?;
    entries.sort();

    let (subdirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|p| p.is_dir());
    out.extend(files.into_iter().filter(|p| has_image_extension(p)));
    for subdir in subdirs {
        collect_images(&subdir, out)?;
    }
    Ok(())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_image(path: &Path, color: [u8; 3]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(4, 4, Rgb(color)).save(path).unwrap();
    }

    #[test]
    fn test_image_folder_scan_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_image(&root.join("zebra/b.png"), [0, 0, 0]);
        write_image(&root.join("zebra/a.png"), [0, 0, 0]);
        write_image(&root.join("ant/x.png"), [255, 0, 0]);
        fs::write(root.join("ant/notes.txt"), "not an image").unwrap();

        let dataset = ImageFolder::new(root).unwrap();

        assert_eq!(dataset.classes(), &["ant".to_string(), "zebra".to_string()]);
        assert_eq!(dataset.class_to_idx("zebra"), Some(1));
        assert_eq!(dataset.len(), 3);

        let names: Vec<_> = dataset
            .samples()
            .iter()
            .map(|(p, l)| (p.file_name().unwrap().to_str().unwrap().to_string(), *l))
            .collect();
        assert_eq!(
            names,
            vec![
                ("x.png".to_string(), 0),
                ("a.png".to_string(), 1),
                ("b.png".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_image_folder_get_decodes_rgb() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("red/0.png"), [255, 0, 0]);

        let dataset = ImageFolder::new(dir.path()).unwrap();
        let (image, label) = dataset.get(0).unwrap();

        assert_eq!(label, 0);
        assert_eq!(image.dimensions(), (4, 4));
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert!(matches!(
            dataset.get(1),
            Err(DataError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_missing_root_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageFolder::new(dir.path().join("absent")).unwrap_err();
        match err {
            DataError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_root_without_classes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("loose.png"), b"").unwrap();
        assert!(matches!(
            ImageFolder::new(dir.path()),
            Err(DataError::NoClasses(_))
        ));
    }

    #[test]
    fn test_nested_files_follow_parent_files() {
        let dir = tempfile::tempdir().unwrap();
        let class = dir.path().join("cls");
        write_image(&class.join("c.png"), [0, 0, 0]);
        write_image(&class.join("b/x.png"), [0, 0, 0]);
        write_image(&class.join("a.png"), [0, 0, 0]);

        let dataset = ImageFolder::new(dir.path()).unwrap();
        let order: Vec<_> = dataset
            .samples()
            .iter()
            .map(|(p, _)| p.strip_prefix(&class).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("a.png"),
                PathBuf::from("c.png"),
                PathBuf::from("b/x.png")
            ]
        );
    }

    #[test]
    fn test_class_without_images() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("full/0.png"), [0, 0, 0]);
        fs::create_dir_all(dir.path().join("empty/nested")).unwrap();
        fs::write(dir.path().join("empty/readme.txt"), "no images").unwrap();

        match ImageFolder::new(dir.path()) {
            Err(DataError::NoImages { class, path }) => {
                assert_eq!(class, "empty");
                assert!(path.ends_with("empty"));
            }
            other => panic!("expected no-images error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_corrupt_image_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("c")).unwrap();
        fs::write(dir.path().join("c/broken.png"), b"not png").unwrap();

        let dataset = ImageFolder::new(dir.path()).unwrap();
        assert_eq!(dataset.get_label(0).unwrap(), 0);
        match dataset.get(0) {
            Err(DataError::Image { path, .. }) => assert!(path.ends_with("broken.png")),
            other => panic!("expected image error, got {other:?}"),
        }
    }
}
