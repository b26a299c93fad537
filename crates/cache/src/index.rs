//! Path → file mapping served by the workers

use crate::resolve_cache_path;
use shmcache_core::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// One servable file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Request key, always starting with `/`
    pub path: String,
    /// Size in bytes when the index was built
    pub size: u64,
    /// Where the content lives on disk
    pub disk_location: PathBuf,
}

/// What the index was built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSource {
    /// Every regular file below a directory
    Directory(PathBuf),
    /// A manifest of `request-path disk-path` lines
    Manifest(PathBuf),
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSource::Directory(path) => write!(f, "directory {}", path.display()),
            CacheSource::Manifest(path) => write!(f, "manifest {}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheIndex {
    source: CacheSource,
    entries: HashMap<String, CacheEntry>,
}

impl CacheIndex {
    /// Build the index from `source`, a directory or a manifest file
    pub fn init(source: impl AsRef<Path>) -> Result<Self> {
        let source = source.as_ref();
        let metadata = fs::metadata(source)
            .map_err(|e| Error::file_system(source, "open cache source", e))?;

        let index = if metadata.is_dir() {
            Self {
                entries: scan_directory(source)?,
                source: CacheSource::Directory(source.to_path_buf()),
            }
        } else {
            Self {
                entries: load_manifest(source)?,
                source: CacheSource::Manifest(source.to_path_buf()),
            }
        };

        tracing::info!(source = %index.source, entries = index.len(), "cache index built");
        Ok(index)
    }

    /// Entry for request path `path`
    pub fn lookup(&self, path: &str) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source(&self) -> &CacheSource {
        &self.source
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }
}

fn scan_directory(root: &Path) -> Result<HashMap<String, CacheEntry>> {
    let mut entries = HashMap::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable cache entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(key) = request_key(root, entry.path()) else {
            tracing::warn!(path = %entry.path().display(), "skipping file with a non UTF-8 name");
            continue;
        };
        let size = entry
            .metadata()
            .map_err(|e| Error::file_system(entry.path(), "stat cached file", e.into()))?
            .len();

        entries.insert(
            key.clone(),
            CacheEntry {
                path: key,
                size,
                disk_location: entry.into_path(),
            },
        );
    }

    Ok(entries)
}

/// `/`-joined path of `file` relative to `root`, with a leading `/`
fn request_key(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let mut key = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            key.push('/');
            key.push_str(part.to_str()?);
        }
    }
    (!key.is_empty()).then_some(key)
}

fn load_manifest(manifest: &Path) -> Result<HashMap<String, CacheEntry>> {
    let content = fs::read_to_string(manifest)
        .map_err(|e| Error::file_system(manifest, "read cache manifest", e))?;
    let base_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
    let mut entries = HashMap::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(key), Some(disk), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(Error::configuration(format!(
                "{}:{}: expected '<request-path> <disk-path>', got '{line}'",
                manifest.display(),
                number + 1
            )));
        };

        let key = if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{key}")
        };
        let disk_location = resolve_cache_path(base_dir, Path::new(disk));

        let size = match fs::metadata(&disk_location) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => {
                tracing::warn!(path = %key, file = %disk_location.display(), "manifest entry is not a regular file, skipping");
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %key, file = %disk_location.display(), error = %e, "manifest entry is missing, skipping");
                continue;
            }
        };

        if entries.contains_key(&key) {
            tracing::warn!(path = %key, "duplicate manifest entry, the later line wins");
        }
        entries.insert(
            key.clone(),
            CacheEntry {
                path: key,
                size,
                disk_location,
            },
        );
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_directory_scan_keys_and_sizes() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.html", b"<html></html>");
        let nested = write(dir.path(), "courses/ud923/notes.txt", &[b'x'; 5000]);

        let index = CacheIndex::init(dir.path())?;
        assert_eq!(index.len(), 2);
        assert!(matches!(index.source(), CacheSource::Directory(_)));

        let entry = index.lookup("/courses/ud923/notes.txt").unwrap();
        assert_eq!(entry.size, 5000);
        assert_eq!(entry.disk_location, nested);
        assert_eq!(index.lookup("/index.html").unwrap().size, 13);
        assert!(index.lookup("index.html").is_none());
        assert!(index.lookup("/courses").is_none());
        Ok(())
    }

    #[test]
    fn test_manifest_resolves_relative_paths() -> Result<()> {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "files/a.txt", b"alpha");
        let absolute = write(dir.path(), "elsewhere/b.bin", &[0u8; 64]);
        let manifest = write(
            dir.path(),
            "locals.txt",
            format!(
                "# request path      disk path\n\
                 /a.txt files/a.txt\n\
                 \n\
                 b.bin {}\n\
                 /gone.txt files/gone.txt\n",
                absolute.display()
            )
            .as_bytes(),
        );

        let index = CacheIndex::init(&manifest)?;
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.lookup("/a.txt").unwrap().disk_location,
            dir.path().join("files/a.txt")
        );
        assert_eq!(index.lookup("/b.bin").unwrap().size, 64);
        assert!(index.lookup("/gone.txt").is_none());
        Ok(())
    }

    #[test]
    fn test_malformed_manifest_line() {
        let dir = TempDir::new().unwrap();
        let manifest = write(dir.path(), "locals.txt", b"/only-one-field\n");
        let err = CacheIndex::init(&manifest).unwrap_err();
        assert!(matches!(err, Error::Configuration { ref message } if message.contains(":1:")));
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = CacheIndex::init(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::FileSystem { .. }));
    }

    #[test]
    fn test_empty_directory_is_valid() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let index = CacheIndex::init(dir.path())?;
        assert!(index.is_empty());
        Ok(())
    }
}
