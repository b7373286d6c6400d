//! Persistent key → manifest + blobs store.
//!
//! ## Directory structure
//!
//! ```text
//! <cache root>/
//!   a1b2c3.../            one directory per key
//!     manifest            logical file names, one per line
//!     f0                  content of the first manifest member
//!     f1                  content of the second manifest member
//! ```
//!
//! Blobs are hardlinked to live build outputs whenever the filesystem
//! allows it, both when adding and when reviving, falling back to plain
//! copies across devices. The manifest's mtime doubles as the entry's
//! last-access stamp and drives LRU trimming.

use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const MANIFEST_FILE: &str = "manifest";

/// Aggregate statistics over a cache directory.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Number of entries.
    pub keys: usize,
    /// Total number of stored blobs.
    pub files: usize,
    /// Total blob bytes.
    pub byte_size: u64,
    /// Entries whose blobs are not hardlinked outside the cache.
    pub unused_keys: usize,
    /// Blob bytes held by unused entries.
    pub unused_byte_size: u64,
}

/// Result of a [`FileCache::trim`] pass.
#[derive(Debug, Clone, Serialize)]
pub struct TrimStats {
    /// Number of entries evicted.
    pub deleted_keys: usize,
    /// Blob bytes freed.
    pub freed_bytes: u64,
}

/// A content-addressed file cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

struct Entry {
    key: String,
    dir: PathBuf,
    access: SystemTime,
    files: usize,
    byte_size: u64,
    unused: bool,
}

impl FileCache {
    /// Open a cache at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir, "create_dir_all"))?;
        Ok(Self { dir })
    }

    /// The cache root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_dir(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_graphic() && c != '/' && c != '\\');
        if !valid {
            return Err(Error::invalid_key(key));
        }
        Ok(self.dir.join(key))
    }

    /// Whether an entry exists for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed.
    pub fn mem(&self, key: &str) -> Result<bool> {
        Ok(self.key_dir(key)?.exists())
    }

    /// List all keys present in the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be read.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let rd = fs::read_dir(&self.dir).map_err(|e| Error::io(e, &self.dir, "read_dir"))?;
        for entry in rd {
            let entry = entry.map_err(|e| Error::io(e, &self.dir, "read_dir_entry"))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        Ok(keys)
    }

    /// Store an entry atomically, replacing any existing entry for `key`.
    ///
    /// `manifest` names the entry's logical files and `files` holds the
    /// on-disk sources to capture, in matching order. Sources are
    /// hardlinked into the entry when possible and copied otherwise. On
    /// success a later [`FileCache::revive`] observes the whole entry; on
    /// failure no partial entry is observed.
    ///
    /// # Errors
    ///
    /// Returns an error if lengths mismatch, a source is unreadable, or
    /// staging/promotion fails.
    pub fn add(&self, key: &str, manifest: &[String], files: &[PathBuf]) -> Result<()> {
        if manifest.len() != files.len() {
            return Err(Error::corrupt(
                key,
                format!(
                    "manifest has {} names but {} files were given",
                    manifest.len(),
                    files.len()
                ),
            ));
        }
        let dst = self.key_dir(key)?;
        let tmp = self.dir.join(format!(".tmp-{key}"));
        if tmp.exists() {
            fs::remove_dir_all(&tmp).map_err(|e| Error::io(e, &tmp, "remove_dir_all"))?;
        }
        fs::create_dir_all(&tmp).map_err(|e| Error::io(e, &tmp, "create_dir_all"))?;

        let staged = (|| -> Result<()> {
            let mp = tmp.join(MANIFEST_FILE);
            let mut listing = manifest.join("\n");
            if !listing.is_empty() {
                listing.push('\n');
            }
            fs::write(&mp, listing).map_err(|e| Error::io(e, &mp, "write"))?;
            for (i, src) in files.iter().enumerate() {
                hardlink_or_copy(src, &tmp.join(format!("f{i}")))?;
            }
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        // Promote. Replacement renames the old entry away first so the
        // final rename lands on a fresh path.
        if dst.exists() {
            let old = self.dir.join(format!(".old-{key}"));
            if old.exists() {
                fs::remove_dir_all(&old).map_err(|e| Error::io(e, &old, "remove_dir_all"))?;
            }
            fs::rename(&dst, &old).map_err(|e| Error::io(e, &dst, "rename"))?;
            fs::rename(&tmp, &dst).map_err(|e| Error::io(e, &dst, "rename"))?;
            let _ = fs::remove_dir_all(&old);
        } else {
            fs::rename(&tmp, &dst).map_err(|e| Error::io(e, &dst, "rename"))?;
        }
        tracing::debug!(key, files = files.len(), "Added cache entry");
        Ok(())
    }

    /// Materialize the entry for `key` into `targets`.
    ///
    /// Returns `None` if no entry exists. Otherwise each stored blob is
    /// hardlinked or copied onto the corresponding slot of `targets` and
    /// the entry's manifest names are returned. Existing target files are
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry shape does not match `targets` or
    /// materialization fails.
    pub fn revive(&self, key: &str, targets: &[PathBuf]) -> Result<Option<Vec<String>>> {
        let dir = self.key_dir(key)?;
        let names = match self.read_manifest(key, &dir)? {
            None => return Ok(None),
            Some(names) => names,
        };
        if names.len() != targets.len() {
            return Err(Error::corrupt(
                key,
                format!(
                    "manifest has {} members but {} targets were given",
                    names.len(),
                    targets.len()
                ),
            ));
        }
        for (i, target) in targets.iter().enumerate() {
            let blob = dir.join(format!("f{i}"));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            if target.exists() {
                fs::remove_file(target).map_err(|e| Error::io(e, target, "remove_file"))?;
            }
            hardlink_or_copy(&blob, target)?;
        }
        self.touch(&dir);
        tracing::debug!(key, files = targets.len(), "Revived cache entry");
        Ok(Some(names))
    }

    /// Return the manifest names for `key` without materializing any file.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read.
    pub fn find(&self, key: &str) -> Result<Option<Vec<String>>> {
        let dir = self.key_dir(key)?;
        let names = self.read_manifest(key, &dir)?;
        if names.is_some() {
            self.touch(&dir);
        }
        Ok(names)
    }

    /// Delete the entry for `key`. Returns whether an entry existed.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let dir = self.key_dir(key)?;
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| Error::io(e, &dir, "remove_dir_all"))?;
        Ok(true)
    }

    /// Delete every entry. Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration or removal fails.
    pub fn delete_all(&self) -> Result<usize> {
        let keys = self.keys()?;
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }

    /// Delete entries whose blobs share no hardlink with any live file
    /// outside the cache. Returns the number of entries removed.
    ///
    /// The check is a link-count heuristic: an entry counts as unused when
    /// every blob has a link count of one.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration or removal fails.
    pub fn delete_unused(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if entry.unused {
                fs::remove_dir_all(&entry.dir)
                    .map_err(|e| Error::io(e, &entry.dir, "remove_dir_all"))?;
                tracing::debug!(key = %entry.key, "Removed unused cache entry");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Evict least-recently-used entries until the cache holds at most
    /// `max_byte_size * (100 - pct) / 100` blob bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration or removal fails.
    pub fn trim(&self, max_byte_size: u64, pct: u8) -> Result<TrimStats> {
        let pct = u64::from(pct.min(100));
        let budget = max_byte_size / 100 * (100 - pct) + max_byte_size % 100 * (100 - pct) / 100;
        let mut entries = self.entries()?;
        // Most recently used first; the tail is evicted.
        entries.sort_by(|a, b| b.access.cmp(&a.access));
        let mut kept: u64 = 0;
        let mut stats = TrimStats {
            deleted_keys: 0,
            freed_bytes: 0,
        };
        for entry in entries {
            if kept + entry.byte_size <= budget {
                kept += entry.byte_size;
                continue;
            }
            fs::remove_dir_all(&entry.dir)
                .map_err(|e| Error::io(e, &entry.dir, "remove_dir_all"))?;
            tracing::debug!(key = %entry.key, size = entry.byte_size, "Trimmed cache entry");
            stats.deleted_keys += 1;
            stats.freed_bytes += entry.byte_size;
        }
        Ok(stats)
    }

    /// Aggregate statistics over all entries.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration fails.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats {
            keys: 0,
            files: 0,
            byte_size: 0,
            unused_keys: 0,
            unused_byte_size: 0,
        };
        for entry in self.entries()? {
            stats.keys += 1;
            stats.files += entry.files;
            stats.byte_size += entry.byte_size;
            if entry.unused {
                stats.unused_keys += 1;
                stats.unused_byte_size += entry.byte_size;
            }
        }
        Ok(stats)
    }

    fn read_manifest(&self, key: &str, dir: &Path) -> Result<Option<Vec<String>>> {
        let mp = dir.join(MANIFEST_FILE);
        if !mp.exists() {
            return Ok(None);
        }
        let listing = fs::read_to_string(&mp).map_err(|e| Error::io(e, &mp, "read"))?;
        let names: Vec<String> = listing.lines().map(str::to_string).collect();
        let blobs = count_blobs(dir)?;
        if names.len() != blobs {
            return Err(Error::corrupt(
                key,
                format!("manifest has {} names but {blobs} blobs", names.len()),
            ));
        }
        Ok(Some(names))
    }

    fn touch(&self, dir: &Path) {
        let mp = dir.join(MANIFEST_FILE);
        if let Ok(f) = fs::OpenOptions::new().write(true).open(&mp) {
            let _ = f.set_modified(SystemTime::now());
        }
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for key in self.keys()? {
            let dir = self.dir.join(&key);
            let mp = dir.join(MANIFEST_FILE);
            let access = fs::metadata(&mp)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let mut files = 0;
            let mut byte_size = 0;
            let mut unused = true;
            let rd = fs::read_dir(&dir).map_err(|e| Error::io(e, &dir, "read_dir"))?;
            for e in rd {
                let e = e.map_err(|e| Error::io(e, &dir, "read_dir_entry"))?;
                if e.file_name() == MANIFEST_FILE {
                    continue;
                }
                let md = e
                    .metadata()
                    .map_err(|err| Error::io(err, e.path(), "metadata"))?;
                files += 1;
                byte_size += md.len();
                if link_count(&md) > 1 {
                    unused = false;
                }
            }
            entries.push(Entry {
                key,
                dir,
                access,
                files,
                byte_size,
                unused,
            });
        }
        Ok(entries)
    }
}

fn count_blobs(dir: &Path) -> Result<usize> {
    let mut n = 0;
    let rd = fs::read_dir(dir).map_err(|e| Error::io(e, dir, "read_dir"))?;
    for e in rd {
        let e = e.map_err(|e| Error::io(e, dir, "read_dir_entry"))?;
        if e.file_name() != MANIFEST_FILE {
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(unix)]
fn link_count(md: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.nlink()
}

#[cfg(not(unix))]
fn link_count(_md: &fs::Metadata) -> u64 {
    // No portable link count; treat every entry as used.
    2
}

fn hardlink_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map_err(|e| Error::io(e, dst, "copy"))?;
    Ok(())
}
