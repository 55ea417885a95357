use super::{validate_key, StorageBackend, StorageError};
use crate::config::StorageProvider;
use crate::utils::cancel::{copy_cancellable, CancelToken};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffix of files still being written
const PARTIAL_SUFFIX: &str = ".partial";

/// Artifacts stored under a directory on the local filesystem.
///
/// The URI of an artifact is its absolute path.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(base_dir: &Path) -> Result<Self, StorageError> {
        let base_dir = if base_dir.is_absolute() {
            base_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| StorageError::io(base_dir, e))?
                .join(base_dir)
        };
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a URI to a path inside the base directory
    fn resolve(&self, uri: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(uri);
        let inside = path.is_absolute()
            && path.starts_with(&self.base_dir)
            && !path.components().any(|c| matches!(c, Component::ParentDir))
            && !uri.ends_with(PARTIAL_SUFFIX);
        if !inside {
            return Err(StorageError::InvalidUri(uri.to_string()));
        }
        Ok(path.to_path_buf())
    }

    fn uri_for(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }
}

/// Copy `source` to `target` through a `.partial` sibling, renaming at the end
fn copy_atomically(source: &Path, target: &Path, cancel: &CancelToken) -> Result<u64, StorageError> {
    let partial = partial_path(target);

    let result = (|| {
        let input = File::open(source).map_err(|e| StorageError::io(source, e))?;
        let output = File::create(&partial).map_err(|e| StorageError::io(&partial, e))?;
        let mut writer = BufWriter::new(output);
        let copied = copy_cancellable(&mut BufReader::new(input), &mut writer, cancel)
            .map_err(|e| StorageError::stream(&partial, e))?;
        writer
            .into_inner()
            .map_err(|e| StorageError::io(&partial, e.into_error()))?
            .sync_all()
            .map_err(|e| StorageError::io(&partial, e))?;
        fs::rename(&partial, target).map_err(|e| StorageError::io(target, e))?;
        Ok(copied)
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(&partial) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {:?}: {}", partial, e);
            }
        }
    }
    result
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

impl StorageBackend for LocalBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Local
    }

    fn put(&self, key: &str, local_path: &Path, cancel: &CancelToken) -> Result<String, StorageError> {
        validate_key(key)?;
        cancel.check()?;

        let target = self.base_dir.join(key);
        if target.exists() {
            return Err(StorageError::Conflict(Self::uri_for(&target)));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let bytes = copy_atomically(local_path, &target, cancel)?;
        info!("Stored {} bytes at {:?}", bytes, target);
        Ok(Self::uri_for(&target))
    }

    fn get(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<(), StorageError> {
        let source = self.resolve(uri)?;
        if !source.is_file() {
            return Err(StorageError::NotFound(uri.to_string()));
        }
        copy_atomically(&source, dest, cancel)?;
        debug!("Copied {} to {:?}", uri, dest);
        Ok(())
    }

    fn delete(&self, uri: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        cancel.check()?;
        let path = self.resolve(uri)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(uri.to_string())),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    fn exists(&self, uri: &str, cancel: &CancelToken) -> Result<bool, StorageError> {
        cancel.check()?;
        Ok(self.resolve(uri)?.is_file())
    }

    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, StorageError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut uris = Vec::new();
        for item in WalkDir::new(&self.base_dir).sort_by_file_name() {
            cancel.check()?;
            let item = item.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.base_dir.clone());
                StorageError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !item.file_type().is_file() {
                continue;
            }
            let uri = Self::uri_for(item.path());
            if uri.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let Ok(relative) = item.path().strip_prefix(&self.base_dir) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            if key.starts_with(prefix) {
                uris.push(uri);
            }
        }
        uris.sort();
        Ok(uris)
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        self.resolve(uri).ok()
    }
}
