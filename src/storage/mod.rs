use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::engine::catalog;
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Path is outside the allowed directories: {0}")]
    OutsideAllowedRoots(String),
    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),
    #[error("storage io error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maps opaque input references to filesystem paths and allocates output
/// paths for processed files.
pub trait FileProvider: Send + Sync + 'static {
    fn resolve_input(&self, reference: &str) -> Result<PathBuf, StorageError>;
    fn output_path(
        &self,
        owner: Option<&str>,
        source: &Path,
        format: &str,
    ) -> Result<PathBuf, StorageError>;
    fn temp_path(&self, extension: &str) -> Result<PathBuf, StorageError>;
}

pub type SharedFileProvider = Arc<dyn FileProvider>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileStorage {
    upload_dir: PathBuf,
    processed_dir: PathBuf,
    temp_dir: PathBuf,
}

impl LocalFileStorage {
    pub fn new(
        upload_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            processed_dir: processed_dir.into(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.upload_dir.clone(),
            settings.processed_dir.clone(),
            settings.temp_dir.clone(),
        )
    }

    pub fn processed_dir(&self) -> &Path {
        self.processed_dir.as_path()
    }

    fn allowed_roots(&self) -> Vec<PathBuf> {
        [&self.upload_dir, &self.processed_dir, &self.temp_dir]
            .into_iter()
            .filter_map(|root| root.canonicalize().ok())
            .collect()
    }
}

fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl FileProvider for LocalFileStorage {
    /// Relative references resolve under the upload directory. The canonical
    /// result must stay inside one of the storage roots.
    fn resolve_input(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(StorageError::NotFound(String::from("(empty reference)")));
        }
        let candidate = Path::new(trimmed);
        let candidate = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.upload_dir.join(candidate)
        };
        let resolved = candidate
            .canonicalize()
            .map_err(|_| StorageError::NotFound(trimmed.to_string()))?;
        if !self
            .allowed_roots()
            .iter()
            .any(|root| resolved.starts_with(root))
        {
            return Err(StorageError::OutsideAllowedRoots(trimmed.to_string()));
        }
        if !resolved.is_file() {
            return Err(StorageError::NotFound(trimmed.to_string()));
        }
        Ok(resolved)
    }

    /// `<processed>/<owner|anonymous>/<stem>_<8 hex>.<format>`
    fn output_path(
        &self,
        owner: Option<&str>,
        source: &Path,
        format: &str,
    ) -> Result<PathBuf, StorageError> {
        let format = format.trim().to_ascii_lowercase();
        if !catalog::is_allowed_output_format(format.as_str()) {
            return Err(StorageError::UnsupportedFormat(format));
        }
        let owner_dir = owner
            .map(catalog::sanitize_filename)
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .unwrap_or_else(|| String::from("anonymous"));
        let dir = self.processed_dir.join(owner_dir);
        ensure_dir(dir.as_path())?;

        let stem = source
            .file_stem()
            .map(|stem| catalog::sanitize_filename(stem.to_string_lossy().as_ref()))
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| String::from("image"));
        Ok(dir.join(format!("{stem}_{}.{format}", short_hex())))
    }

    fn temp_path(&self, extension: &str) -> Result<PathBuf, StorageError> {
        ensure_dir(self.temp_dir.as_path())?;
        let extension = catalog::sanitize_filename(extension);
        Ok(self
            .temp_dir
            .join(format!("tmp_{}.{extension}", Uuid::new_v4().simple())))
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "avif" => "image/avif",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "psd" => "image/vnd.adobe.photoshop",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_storage() -> (PathBuf, LocalFileStorage) {
        let root = std::env::temp_dir().join(format!("imagemill_storage_{}", Uuid::new_v4()));
        let storage = LocalFileStorage::new(root.join("uploads"), root.join("processed"), root.join("tmp"));
        fs::create_dir_all(root.join("uploads")).expect("uploads dir");
        fs::create_dir_all(root.join("processed")).expect("processed dir");
        (root, storage)
    }

    #[test]
    fn resolves_relative_references_under_uploads() {
        let (root, storage) = temp_storage();
        fs::write(root.join("uploads/cat.png"), b"png").expect("write");
        let resolved = storage.resolve_input("cat.png").expect("resolve");
        assert!(resolved.ends_with("uploads/cat.png"));
    }

    #[test]
    fn rejects_escapes_and_missing_files() {
        let (root, storage) = temp_storage();
        fs::write(root.join("secret.png"), b"png").expect("write");
        assert!(matches!(
            storage.resolve_input("../secret.png"),
            Err(StorageError::OutsideAllowedRoots(_))
        ));
        assert!(matches!(
            storage.resolve_input("nope.png"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.resolve_input(""),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn output_paths_are_owner_scoped_and_unique() {
        let (root, storage) = temp_storage();
        let first = storage
            .output_path(Some("alice"), Path::new("/x/holiday photo.jpg"), "WEBP")
            .expect("output path");
        let second = storage
            .output_path(Some("alice"), Path::new("/x/holiday photo.jpg"), "webp")
            .expect("output path");
        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(root.join("processed/alice").as_path()));
        let name = first.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("holiday_photo_"));
        assert!(name.ends_with(".webp"));
        assert_eq!(name.len(), "holiday_photo_".len() + 8 + ".webp".len());

        let anonymous = storage
            .output_path(None, Path::new("a.png"), "png")
            .expect("output path");
        assert!(anonymous.starts_with(root.join("processed/anonymous")));

        assert!(matches!(
            storage.output_path(None, Path::new("a.png"), "exe"),
            Err(StorageError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn mime_types_cover_engine_formats() {
        assert_eq!(mime_for_path(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("a.pdf")), "application/pdf");
        assert_eq!(mime_for_path(Path::new("a")), "application/octet-stream");
    }
}
