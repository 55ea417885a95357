//! Deterministic ZIP archives of file trees
//!
//! Entries are sorted by name and written uncompressed with fixed timestamps
//! and permissions, so the same tree always yields byte-identical archives.
//! Compression is left to the transform stage.

use super::cancel::{copy_cancellable, CancelToken, Cancelled, StreamError};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("archive format error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("archive entry escapes the target directory: {0}")]
    UnsafePath(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn stream(path: &Path, err: StreamError) -> Self {
        match err {
            StreamError::Io(source) => ArchiveError::io(path, source),
            StreamError::Cancelled(reason) => ArchiveError::Cancelled(reason),
        }
    }
}

/// One file to be stored in an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Name inside the archive, `/`-separated and relative
    pub name: String,
    pub source: PathBuf,
}

/// Resolve include patterns (minus exclude patterns) into archive entries.
///
/// An include is either a path (file or directory, walked recursively) or a
/// glob. Relative includes are resolved against `root`. Entry names are
/// relative to `root` when the file lives under it, otherwise the absolute
/// path without its root component. Missing literal paths are skipped with a
/// warning.
pub fn collect_entries(
    includes: &[String],
    excludes: &[String],
    root: &Path,
) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let exclude_set = build_globset(excludes)?;
    let mut entries: BTreeMap<String, PathBuf> = BTreeMap::new();

    for include in includes {
        let resolved = if Path::new(include).is_absolute() {
            PathBuf::from(include)
        } else {
            root.join(include)
        };

        let (base, matcher) = if is_glob(include) {
            let pattern = resolved.to_string_lossy().to_string();
            let glob = Glob::new(&pattern)
                .map_err(|source| ArchiveError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?
                .compile_matcher();
            (glob_base(&resolved), Some(glob))
        } else {
            (resolved, None)
        };

        if !base.exists() {
            warn!("Include path does not exist: {:?}", base);
            continue;
        }

        let walker = WalkDir::new(&base)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_excluded(&exclude_set, e.path(), root));

        for item in walker {
            let item = item.map_err(|source| ArchiveError::Walk {
                path: base.clone(),
                source,
            })?;

            if !item.file_type().is_file() {
                if item.file_type().is_symlink() {
                    debug!("Skipping symlink: {:?}", item.path());
                }
                continue;
            }

            let path = item.path();
            if is_excluded(&exclude_set, path, root) {
                continue;
            }
            if let Some(ref glob) = matcher {
                if !glob.is_match(path) {
                    continue;
                }
            }

            entries.insert(entry_name(path, root), path.to_path_buf());
        }
    }

    Ok(entries
        .into_iter()
        .map(|(name, source)| ArchiveEntry { name, source })
        .collect())
}

/// Every file below `dir`, named relative to it and prefixed with `prefix/`
pub fn entries_under(dir: &Path, prefix: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut entries = Vec::new();

    for item in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let item = item.map_err(|source| ArchiveError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = entry_name(item.path(), dir);
        let name = if prefix.is_empty() {
            relative
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), relative)
        };
        entries.push(ArchiveEntry {
            name,
            source: item.path().to_path_buf(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Write `entries` to a new archive at `output`; returns the entry count
pub fn write_archive(
    entries: &[ArchiveEntry],
    output: &Path,
    cancel: &CancelToken,
) -> Result<usize, ArchiveError> {
    let mut sorted: Vec<&ArchiveEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let file = File::create(output).map_err(|e| ArchiveError::io(output, e))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
        .large_file(true);

    for entry in &sorted {
        cancel.check()?;
        writer.start_file(entry.name.as_str(), options)?;

        let source = File::open(&entry.source).map_err(|e| ArchiveError::io(&entry.source, e))?;
        copy_cancellable(&mut BufReader::new(source), &mut writer, cancel)
            .map_err(|e| ArchiveError::stream(&entry.source, e))?;
    }

    writer
        .finish()?
        .flush()
        .map_err(|e| ArchiveError::io(output, e))?;

    info!("Wrote archive {:?} with {} entries", output, sorted.len());
    Ok(sorted.len())
}

/// Extract an archive into `target`; returns the number of files written
pub fn extract_archive(
    archive: &Path,
    target: &Path,
    cancel: &CancelToken,
) -> Result<usize, ArchiveError> {
    let file = File::open(archive).map_err(|e| ArchiveError::io(archive, e))?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;

    fs::create_dir_all(target).map_err(|e| ArchiveError::io(target, e))?;

    let mut written = 0;
    for index in 0..zip.len() {
        cancel.check()?;
        let mut entry = zip.by_index(index)?;

        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafePath(entry.name().to_string()))?;
        let destination = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination).map_err(|e| ArchiveError::io(&destination, e))?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }

        let mut out = BufWriter::new(
            File::create(&destination).map_err(|e| ArchiveError::io(&destination, e))?,
        );
        copy_cancellable(&mut entry, &mut out, cancel)
            .map_err(|e| ArchiveError::stream(&destination, e))?;
        written += 1;
    }

    debug!("Extracted {} files from {:?} into {:?}", written, archive, target);
    Ok(written)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ArchiveError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ArchiveError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ArchiveError::Pattern {
        pattern: patterns.join(", "),
        source,
    })
}

/// Excludes match the full path, the path relative to the root, or the file name
fn is_excluded(set: &GlobSet, path: &Path, root: &Path) -> bool {
    if set.is_empty() {
        return false;
    }
    if set.is_match(path) {
        return true;
    }
    if let Ok(relative) = path.strip_prefix(root) {
        if set.is_match(relative) {
            return true;
        }
    }
    path.file_name().map(|name| set.is_match(name)).unwrap_or(false)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Longest leading directory of a glob that has no wildcard in it
fn glob_base(pattern: &Path) -> PathBuf {
    let mut base = PathBuf::new();
    for component in pattern.components() {
        if is_glob(&component.as_os_str().to_string_lossy()) {
            break;
        }
        base.push(component);
    }
    base
}

fn entry_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
