//! Bounded-parallelism operation executor.
//!
//! Filesystem operations are cheap and performed synchronously on the
//! driver thread when scheduled; spawn operations are dispatched onto a
//! tokio runtime behind a jobs-sized semaphore, with completions delivered
//! back over a channel. Deletions go through a trash directory purged in
//! the background.

use crate::op::{FailureKind, OpKind, OpRef, Sink, Status};
use crate::{Error, Result};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;

/// Deletions are renamed here and purged out of band.
pub struct Trash {
    dir: PathBuf,
    counter: Cell<u64>,
}

impl Trash {
    /// Create a trash rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: Cell::new(0),
        }
    }

    /// The trash directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move `path` into the trash; falls back to direct removal when the
    /// rename cannot cross devices. Missing paths are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the path can neither be renamed nor removed.
    pub fn put(&self, path: &Path) -> Result<()> {
        if fs::symlink_metadata(path).is_err() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(e, &self.dir, "create_dir_all"))?;
        let n = self.counter.get();
        self.counter.set(n + 1);
        let name = match path.file_name() {
            Some(f) => format!("{n}-{}", f.to_string_lossy()),
            None => format!("{n}"),
        };
        let dst = self.dir.join(name);
        if fs::rename(path, &dst).is_ok() {
            return Ok(());
        }
        remove_any(path).map_err(|e| Error::io(e, path, "remove"))
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(_) => return Ok(()),
    };
    if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

enum SpawnOutcome {
    Exited(i32),
    Error(String),
    Aborted,
}

// Plain data shipped to the runtime; the op record stays on the driver.
struct ChildSpec {
    tool: PathBuf,
    args: Vec<String>,
    env: std::collections::BTreeMap<String, String>,
    cwd: PathBuf,
    stdin: Option<PathBuf>,
    stdout: Sink,
    stderr: Sink,
}

/// Runs operations with at most `jobs` children in flight.
pub struct Exec {
    jobs: usize,
    rt: tokio::runtime::Runtime,
    sem: Arc<Semaphore>,
    tx: UnboundedSender<(u64, SpawnOutcome)>,
    rx: UnboundedReceiver<(u64, SpawnOutcome)>,
    pending: HashMap<u64, (OpRef, Instant)>,
    done: VecDeque<OpRef>,
    aborted: Arc<AtomicBool>,
    trash: Trash,
}

impl Exec {
    /// Create an executor. `jobs == 0` means the machine's available
    /// parallelism.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built.
    pub fn new(jobs: usize, trash_dir: impl Into<PathBuf>) -> Result<Self> {
        let jobs = if jobs == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            jobs
        };
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| Error::exec(format!("failed to build runtime: {e}")))?;
        let (tx, rx) = unbounded_channel();
        Ok(Self {
            jobs,
            rt,
            sem: Arc::new(Semaphore::new(jobs)),
            tx,
            rx,
            pending: HashMap::new(),
            done: VecDeque::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            trash: Trash::new(trash_dir),
        })
    }

    /// The jobs budget.
    #[must_use]
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// The trash.
    #[must_use]
    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    /// True while completions may still arrive.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.done.is_empty()
    }

    /// Discard operations not yet executing; they complete as aborted.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Enqueue `op`. Returns immediately; the operation surfaces later
    /// through [`Exec::collect`].
    pub fn schedule(&mut self, op: OpRef) {
        let is_spawn = matches!(op.borrow().kind, OpKind::Spawn(_));
        if is_spawn {
            self.schedule_spawn(op);
        } else {
            self.run_fs(&op);
            self.done.push_back(op);
        }
    }

    /// Return one completed operation, if any. With `block` set and
    /// children in flight, waits for one to complete; otherwise returns
    /// `None` immediately.
    pub fn collect(&mut self, block: bool) -> Option<OpRef> {
        if let Some(op) = self.done.pop_front() {
            return Some(op);
        }
        if self.pending.is_empty() {
            return None;
        }
        let msg = if block {
            self.rx.blocking_recv()
        } else {
            self.rx.try_recv().ok()
        };
        let (id, outcome) = msg?;
        let (op, started) = self
            .pending
            .remove(&id)
            .expect("completion for unknown operation");
        {
            let mut o = op.borrow_mut();
            o.duration = started.elapsed();
            match outcome {
                SpawnOutcome::Exited(code) => {
                    let ok = if let OpKind::Spawn(s) = &mut o.kind {
                        s.exit = Some(code);
                        s.success_exits.is_empty() || s.success_exits.contains(&code)
                    } else {
                        true
                    };
                    o.status = if ok {
                        Status::Done
                    } else {
                        Status::Failed(FailureKind::Exec(Some(format!(
                            "exited with code {code}"
                        ))))
                    };
                }
                SpawnOutcome::Error(msg) => {
                    o.status = Status::Failed(FailureKind::Exec(Some(msg)));
                }
                SpawnOutcome::Aborted => o.status = Status::Aborted,
            }
        }
        Some(op)
    }

    /// Purge trashed entries, synchronously when `block` is set and on the
    /// runtime's blocking pool otherwise.
    pub fn purge_trash(&self, block: bool) {
        let dir = self.trash.dir().to_path_buf();
        if block {
            purge_dir(&dir);
        } else {
            self.rt.spawn_blocking(move || purge_dir(&dir));
        }
    }

    fn schedule_spawn(&mut self, op: OpRef) {
        let (id, spec) = {
            let o = op.borrow();
            let OpKind::Spawn(s) = &o.kind else {
                unreachable!("schedule_spawn on a non-spawn operation")
            };
            (
                o.id,
                ChildSpec {
                    tool: s.cmd.tool.clone(),
                    args: s.cmd.args.clone(),
                    env: s.env.exec_env(),
                    cwd: s.cwd.clone(),
                    stdin: s.stdin.clone(),
                    stdout: s.stdout.clone(),
                    stderr: s.stderr.clone(),
                },
            )
        };
        tracing::debug!(id, tool = %spec.tool.display(), "Scheduling spawn");
        self.pending.insert(id, (op, Instant::now()));
        let sem = self.sem.clone();
        let tx = self.tx.clone();
        let aborted = self.aborted.clone();
        self.rt.spawn(async move {
            let _permit = match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = tx.send((id, SpawnOutcome::Error("executor shut down".into())));
                    return;
                }
            };
            if aborted.load(Ordering::SeqCst) {
                let _ = tx.send((id, SpawnOutcome::Aborted));
                return;
            }
            let _ = tx.send((id, run_child(spec).await));
        });
    }

    fn run_fs(&mut self, op: &OpRef) {
        let started = Instant::now();
        let mut guard = op.borrow_mut();
        let o = &mut *guard;
        let result = match &mut o.kind {
            OpKind::Read(r) => match fs::read(read_target(&o.reads)) {
                Ok(data) => {
                    r.data = data;
                    Ok(())
                }
                Err(e) => Err(format!("read {}: {e}", read_target(&o.reads).display())),
            },
            OpKind::Write(w) => match w.producer.take() {
                None => Err("write producer already consumed".to_string()),
                Some(producer) => producer()
                    .and_then(|bytes| write_file(&w.target, &bytes, w.mode)),
            },
            OpKind::Copy(c) => exec_copy(c),
            OpKind::Mkdir(m) => fs::create_dir_all(&m.dir)
                .map_err(|e| format!("mkdir {}: {e}", m.dir.display()))
                .and_then(|()| set_mode(&m.dir, m.mode)),
            OpKind::Delete(d) => self
                .trash
                .put(&d.path)
                .map_err(|e| format!("delete {}: {e}", d.path.display())),
            OpKind::WaitFiles => Ok(()),
            OpKind::Notify(n) => {
                match n.kind {
                    crate::op::NotifyKind::Info => tracing::info!(msg = %n.msg, "notify"),
                    crate::op::NotifyKind::Warn => tracing::warn!(msg = %n.msg, "notify"),
                    crate::op::NotifyKind::Fail => tracing::error!(msg = %n.msg, "notify"),
                }
                Ok(())
            }
            OpKind::Spawn(_) => unreachable!("spawns go through the runtime"),
        };
        o.duration = started.elapsed();
        o.status = match result {
            Ok(()) => Status::Done,
            Err(msg) => Status::Failed(FailureKind::Exec(Some(msg))),
        };
    }
}

// A read op's single read is its target file.
fn read_target(reads: &std::collections::BTreeSet<PathBuf>) -> &Path {
    reads
        .iter()
        .next()
        .map_or_else(|| Path::new(""), PathBuf::as_path)
}

fn exec_copy(c: &crate::op::CopyOp) -> std::result::Result<(), String> {
    let content = fs::read(&c.src).map_err(|e| format!("read {}: {e}", c.src.display()))?;
    let bytes = match c.linenum {
        None => content,
        Some(n) => {
            let mut prefixed =
                format!("#line {n} \"{}\"\n", c.src.display()).into_bytes();
            prefixed.extend_from_slice(&content);
            prefixed
        }
    };
    write_file(&c.dst, &bytes, c.mode)
}

fn write_file(path: &Path, bytes: &[u8], mode: u32) -> std::result::Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("create_dir_all {}: {e}", parent.display()))?;
    }
    // Unlink first: the previous file may be a hardlink into the cache,
    // and truncating it in place would corrupt the cached blob.
    let _ = fs::remove_file(path);
    fs::write(path, bytes).map_err(|e| format!("write {}: {e}", path.display()))?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::result::Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| format!("chmod {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::result::Result<(), String> {
    Ok(())
}

fn purge_dir(dir: &Path) {
    let Ok(rd) = fs::read_dir(dir) else { return };
    for entry in rd.flatten() {
        if let Err(e) = remove_any(&entry.path()) {
            tracing::warn!(path = %entry.path().display(), error = %e, "Trash purge failed");
        }
    }
}

fn sink_to_stdio(sink: &Sink) -> std::io::Result<Stdio> {
    match sink {
        Sink::Inherit => Ok(Stdio::inherit()),
        Sink::Null => Ok(Stdio::null()),
        Sink::File(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let f = fs::OpenOptions::new().create(true).append(true).open(path)?;
            Ok(Stdio::from(f))
        }
    }
}

async fn run_child(spec: ChildSpec) -> SpawnOutcome {
    let mut cmd = tokio::process::Command::new(&spec.tool);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .current_dir(&spec.cwd);
    match &spec.stdin {
        None => {
            cmd.stdin(Stdio::null());
        }
        Some(path) => match fs::File::open(path) {
            Ok(f) => {
                cmd.stdin(Stdio::from(f));
            }
            Err(e) => return SpawnOutcome::Error(format!("stdin {}: {e}", path.display())),
        },
    }
    match sink_to_stdio(&spec.stdout) {
        Ok(io) => {
            cmd.stdout(io);
        }
        Err(e) => return SpawnOutcome::Error(format!("stdout redirect: {e}")),
    }
    match sink_to_stdio(&spec.stderr) {
        Ok(io) => {
            cmd.stderr(io);
        }
        Err(e) => return SpawnOutcome::Error(format!("stderr redirect: {e}")),
    }
    match cmd.status().await {
        Ok(status) => SpawnOutcome::Exited(status.code().unwrap_or(-1)),
        Err(e) => SpawnOutcome::Error(format!("spawn {}: {e}", spec.tool.display())),
    }
}
