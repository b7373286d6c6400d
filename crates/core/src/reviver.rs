//! Operation hashing and cache revival.
//!
//! The reviver owns the hashing policy: the hash of an operation is a
//! deterministic digest of its semantic inputs only. File content hashes
//! are memoized per build. Spawn, write, copy and mkdir operations are
//! cache-eligible; reads, deletes, waits and notifications always execute
//! and keep a nil hash.

use crate::op::{Op, OpKind, OpRef, Sink, Status};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stoke_cache::{FileCache, Hash, HashFn};

/// Why an operation could not be hashed.
#[derive(Debug)]
pub enum HashError {
    /// Declared reads that could not be hashed.
    MissingReads(Vec<PathBuf>),
    /// The tool binary itself could not be hashed.
    Tool {
        /// Path of the tool.
        tool: PathBuf,
        /// Why hashing failed.
        reason: String,
    },
}

/// Hashes operations and records/revives them through the file cache.
pub struct Reviver {
    cache: FileCache,
    hash_fn: Box<dyn HashFn>,
    file_hashes: HashMap<PathBuf, Option<Hash>>,
}

impl Reviver {
    /// Create a reviver over `cache` using `hash_fn`.
    #[must_use]
    pub fn new(cache: FileCache, hash_fn: Box<dyn HashFn>) -> Self {
        Self {
            cache,
            hash_fn,
            file_hashes: HashMap::new(),
        }
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Content hash of `path`, memoized for the build. `None` when the
    /// file cannot be read.
    pub fn file_hash(&mut self, path: &Path) -> Option<Hash> {
        if let Some(h) = self.file_hashes.get(path) {
            return h.clone();
        }
        let h = self.hash_fn.file(path).ok();
        self.file_hashes.insert(path.to_path_buf(), h.clone());
        h
    }

    /// Compute the hash of a cache-eligible operation.
    ///
    /// The digest covers the variant tag and the variant's semantic inputs;
    /// sets and maps are folded in their sorted order so the result is
    /// independent of enumeration order.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::MissingReads`] listing every declared read that
    /// could not be hashed, or [`HashError::Tool`] when a spawn's tool
    /// binary is unreadable.
    pub fn hash_op(&mut self, op: &Op) -> std::result::Result<Hash, HashError> {
        let mut buf = Vec::new();
        match &op.kind {
            OpKind::Spawn(s) => {
                put_tag(&mut buf, b"spawn");
                match self.file_hash(&s.cmd.tool) {
                    Some(h) => put_bytes(&mut buf, h.as_bytes()),
                    None => {
                        return Err(HashError::Tool {
                            tool: s.cmd.tool.clone(),
                            reason: "tool file could not be hashed".to_string(),
                        })
                    }
                }
                put_u64(&mut buf, s.cmd.args.len() as u64);
                for arg in &s.cmd.args {
                    put_bytes(&mut buf, arg.as_bytes());
                }
                put_u64(&mut buf, s.env.stamped().len() as u64);
                for (k, v) in s.env.stamped() {
                    put_bytes(&mut buf, k.as_bytes());
                    put_bytes(&mut buf, v.as_bytes());
                }
                put_path(&mut buf, &s.cwd);
                match &s.stdin {
                    None => put_tag(&mut buf, b"no-stdin"),
                    Some(p) => match self.file_hash(p) {
                        Some(h) => put_bytes(&mut buf, h.as_bytes()),
                        None => return Err(HashError::MissingReads(vec![p.clone()])),
                    },
                }
                put_sink(&mut buf, &s.stdout);
                put_sink(&mut buf, &s.stderr);
                put_u64(&mut buf, s.success_exits.len() as u64);
                for code in &s.success_exits {
                    put_u64(&mut buf, *code as u64);
                }
                put_bytes(&mut buf, s.stamp.as_bytes());
                self.put_reads(&mut buf, op)?;
            }
            OpKind::Write(w) => {
                put_tag(&mut buf, b"write");
                put_bytes(&mut buf, w.stamp.as_bytes());
                put_u64(&mut buf, u64::from(w.mode));
                self.put_reads(&mut buf, op)?;
            }
            OpKind::Copy(c) => {
                put_tag(&mut buf, b"copy");
                match self.file_hash(&c.src) {
                    Some(h) => put_bytes(&mut buf, h.as_bytes()),
                    None => return Err(HashError::MissingReads(vec![c.src.clone()])),
                }
                put_path(&mut buf, &c.dst);
                put_u64(&mut buf, u64::from(c.mode));
                match c.linenum {
                    None => put_tag(&mut buf, b"no-linenum"),
                    Some(n) => put_u64(&mut buf, u64::from(n)),
                }
            }
            OpKind::Mkdir(m) => {
                put_tag(&mut buf, b"mkdir");
                put_path(&mut buf, &m.dir);
                put_u64(&mut buf, u64::from(m.mode));
            }
            _ => return Ok(Hash::nil()),
        }
        Ok(self.hash_fn.bytes(&buf))
    }

    fn put_reads(&mut self, buf: &mut Vec<u8>, op: &Op) -> std::result::Result<(), HashError> {
        let mut missing = Vec::new();
        let mut hashes = Vec::new();
        for read in &op.reads {
            match self.file_hash(read) {
                Some(h) => hashes.push(h),
                None => missing.push(read.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(HashError::MissingReads(missing));
        }
        put_u64(buf, hashes.len() as u64);
        for h in hashes {
            put_bytes(buf, h.as_bytes());
        }
        Ok(())
    }

    /// Try to restore `op`'s writes from the cache under its hash key.
    ///
    /// On a hit the operation is marked revived and done; a revived spawn
    /// gets its smallest success exit as the captured exit code. Returns
    /// whether the operation was revived.
    ///
    /// # Errors
    ///
    /// Cache failures are returned for the caller to downgrade; the
    /// operation is left untouched.
    pub fn revive(&mut self, op: &OpRef) -> stoke_cache::Result<bool> {
        let (key, mut targets, manifest_base) = {
            let o = op.borrow();
            debug_assert!(!o.hash.is_nil());
            let base = match &o.kind {
                OpKind::Spawn(s) => s.manifest_root.clone(),
                _ => None,
            };
            (
                o.hash.to_hex(),
                o.writes.iter().cloned().collect::<Vec<_>>(),
                base,
            )
        };
        // An operation that discovers its writes post-exec cannot trust
        // its declared set; derive the targets from the stored manifest,
        // re-rooted under the manifest base.
        if let Some(base) = &manifest_base {
            match self.cache.find(&key)? {
                None => return Ok(false),
                Some(names) => {
                    targets = names.iter().map(|n| base.join(n)).collect();
                }
            }
        }
        match self.cache.revive(&key, &targets)? {
            None => Ok(false),
            Some(_names) => {
                let mut o = op.borrow_mut();
                o.revived = true;
                o.status = Status::Done;
                o.writes = targets.into_iter().collect();
                if let OpKind::Spawn(s) = &mut o.kind {
                    s.exit = Some(s.success_exits.iter().min().copied().unwrap_or(0));
                }
                tracing::debug!(id = o.id, key = %key, "Revived operation");
                Ok(true)
            }
        }
    }

    /// Record a successfully executed operation's writes in the cache.
    ///
    /// Returns `Ok(false)` when the operation produced no storable
    /// manifest (for instance a mkdir, whose only write is a directory).
    /// The caller checks that every declared write exists before calling.
    ///
    /// # Errors
    ///
    /// Cache failures are returned for the caller to downgrade.
    pub fn record(&mut self, op: &OpRef) -> stoke_cache::Result<bool> {
        let (key, files, names) = {
            let o = op.borrow();
            debug_assert!(!o.hash.is_nil());
            let base = match &o.kind {
                OpKind::Spawn(s) => s.manifest_root.clone(),
                _ => None,
            };
            let files: Vec<PathBuf> = o
                .writes
                .iter()
                .filter(|w| w.is_file())
                .cloned()
                .collect();
            let names: Vec<String> = files
                .iter()
                .map(|f| match &base {
                    Some(base) => f
                        .strip_prefix(base)
                        .unwrap_or(f.as_path())
                        .display()
                        .to_string(),
                    None => f.display().to_string(),
                })
                .collect();
            (o.hash.to_hex(), files, names)
        };
        if files.is_empty() {
            return Ok(false);
        }
        self.cache.add(&key, &names, &files)?;
        tracing::debug!(id = op.borrow().id, key = %key, files = files.len(), "Recorded operation");
        Ok(true)
    }
}

fn put_u64(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u64(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

fn put_tag(buf: &mut Vec<u8>, tag: &[u8]) {
    put_bytes(buf, tag);
}

fn put_path(buf: &mut Vec<u8>, p: &Path) {
    put_bytes(buf, p.as_os_str().as_encoded_bytes());
}

fn put_sink(buf: &mut Vec<u8>, sink: &Sink) {
    // Only file sinks affect outputs.
    match sink {
        Sink::Inherit | Sink::Null => put_tag(buf, b"sink"),
        Sink::File(p) => put_path(buf, p),
    }
}
