//! Engine directory resolution.
//!
//! The core never reads the process environment on its own; the embedding
//! driver reads the variables it recognizes and passes their values in
//! through [`DirsInputs`]. Resolution is pure apart from the final write
//! probe, which rejects read-only candidates.

use crate::{Error, Result};
use std::fs;
use std::path::PathBuf;

/// Environment variable naming the engine directory.
pub const DIR_ENV: &str = "STOKE_DIR";
/// Environment variable naming the cache directory.
pub const CACHE_DIR_ENV: &str = "STOKE_CACHE_DIR";
/// Environment variable naming the log file.
pub const LOG_FILE_ENV: &str = "STOKE_LOG_FILE";

/// Default engine directory name under the working directory.
pub const DEFAULT_DIR_NAME: &str = ".stoke";

/// Already-read configuration inputs.
#[derive(Debug, Clone)]
pub struct DirsInputs {
    /// Explicit engine directory, strongest override.
    pub explicit_dir: Option<PathBuf>,
    /// Value of [`DIR_ENV`], if set.
    pub env_dir: Option<PathBuf>,
    /// Value of [`CACHE_DIR_ENV`], if set.
    pub env_cache_dir: Option<PathBuf>,
    /// Value of [`LOG_FILE_ENV`], if set.
    pub env_log_file: Option<PathBuf>,
    /// The working directory the defaults hang off.
    pub cwd: PathBuf,
}

impl DirsInputs {
    /// Inputs with nothing set but the working directory.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            explicit_dir: None,
            env_dir: None,
            env_cache_dir: None,
            env_log_file: None,
            cwd: cwd.into(),
        }
    }
}

/// Resolved engine directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirs {
    /// The engine directory.
    pub dir: PathBuf,
    /// The cache directory.
    pub cache_dir: PathBuf,
    /// The trash directory for deletions.
    pub trash_dir: PathBuf,
    /// The log file.
    pub log_file: PathBuf,
}

/// Resolve the engine directories from `inputs`.
///
/// Precedence for the engine directory: explicit override, then the
/// environment value, then `<cwd>/.stoke`. The cache directory and log
/// file default to living inside the engine directory unless overridden.
///
/// # Errors
///
/// Returns a configuration error if the engine directory cannot be
/// created or is not writable.
pub fn resolve(inputs: DirsInputs) -> Result<Dirs> {
    let dir = inputs
        .explicit_dir
        .or(inputs.env_dir)
        .unwrap_or_else(|| inputs.cwd.join(DEFAULT_DIR_NAME));
    fs::create_dir_all(&dir).map_err(|e| {
        Error::configuration(format!("cannot create engine directory {}: {e}", dir.display()))
    })?;
    // Some CI environments hand out read-only directories; probe before
    // committing to one.
    let probe = dir.join(".write_probe");
    match fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
        }
        Err(e) => {
            return Err(Error::configuration(format!(
                "engine directory {} is not writable: {e}",
                dir.display()
            )));
        }
    }
    let cache_dir = inputs.env_cache_dir.unwrap_or_else(|| dir.join(".cache"));
    let trash_dir = dir.join(".trash");
    let log_file = inputs.env_log_file.unwrap_or_else(|| dir.join(".log"));
    tracing::debug!(dir = %dir.display(), cache = %cache_dir.display(), "Resolved engine directories");
    Ok(Dirs {
        dir,
        cache_dir,
        trash_dir,
        log_file,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_hang_off_cwd() {
        let tmp = TempDir::new().unwrap();
        let dirs = resolve(DirsInputs::new(tmp.path())).unwrap();
        assert_eq!(dirs.dir, tmp.path().join(DEFAULT_DIR_NAME));
        assert_eq!(dirs.cache_dir, dirs.dir.join(".cache"));
        assert_eq!(dirs.trash_dir, dirs.dir.join(".trash"));
        assert_eq!(dirs.log_file, dirs.dir.join(".log"));
        assert!(dirs.dir.is_dir());
    }

    #[test]
    fn env_dir_overrides_default() {
        let tmp = TempDir::new().unwrap();
        let mut inputs = DirsInputs::new(tmp.path());
        inputs.env_dir = Some(tmp.path().join("elsewhere"));
        let dirs = resolve(inputs).unwrap();
        assert_eq!(dirs.dir, tmp.path().join("elsewhere"));
    }

    #[test]
    fn explicit_dir_beats_env_dir() {
        let tmp = TempDir::new().unwrap();
        let mut inputs = DirsInputs::new(tmp.path());
        inputs.env_dir = Some(tmp.path().join("env"));
        inputs.explicit_dir = Some(tmp.path().join("explicit"));
        let dirs = resolve(inputs).unwrap();
        assert_eq!(dirs.dir, tmp.path().join("explicit"));
    }

    #[test]
    fn cache_dir_override_is_respected() {
        let tmp = TempDir::new().unwrap();
        let mut inputs = DirsInputs::new(tmp.path());
        inputs.env_cache_dir = Some(tmp.path().join("shared-cache"));
        let dirs = resolve(inputs).unwrap();
        assert_eq!(dirs.cache_dir, tmp.path().join("shared-cache"));
    }

    #[test]
    fn log_file_override_is_respected() {
        let tmp = TempDir::new().unwrap();
        let mut inputs = DirsInputs::new(tmp.path());
        inputs.env_log_file = Some(tmp.path().join("build.log"));
        let dirs = resolve(inputs).unwrap();
        assert_eq!(dirs.log_file, tmp.path().join("build.log"));
    }
}
