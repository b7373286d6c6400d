//! The memoizer and its stir loop.
//!
//! A [`Memo`] weaves the guard, the reviver, the executor and a fiber
//! ready-queue into the drive loop: submit one allowed operation, collect
//! one completed execution, finish it (record, propagate readiness, run
//! its continuation), run one ready fiber, repeat until everything is
//! idle. All engine state is mutated on the driver thread between
//! executor collections, so none of it needs locking.

use crate::exec::Exec;
use crate::fiber::{Abort, Fiber, FiberResult};
use crate::guard::{FileStatus, Guard};
use crate::op::{
    CopyOp, DeleteOp, FailureKind, Kont, MkdirOp, NotifyKind, NotifyOp, Op, OpKind, OpRef,
    PostExec, ReadOp, Sink, SpawnCmd, SpawnOp, Status, WriteOp,
};
use crate::reviver::{HashError, Reviver};
use crate::tool::{ToolEnv, DEFAULT_UNSTAMPED_VARS};
use crate::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};
use stoke_cache::{FileCache, HashFn};
use walkdir::WalkDir;

/// Advisory events for observers; the engine never depends on them being
/// consumed.
#[derive(Debug)]
pub enum Feedback<'a> {
    /// A spawn operation is about to execute (not revived).
    SpawnStart {
        /// The operation.
        op: &'a OpRef,
    },
    /// An operation finished, in any terminal state.
    OpComplete {
        /// The operation.
        op: &'a OpRef,
    },
    /// A spawn's tool could not be used.
    MissTool {
        /// Path of the tool.
        tool: &'a Path,
        /// Why it was missed.
        reason: &'a str,
    },
    /// A non-fatal cache problem while reviving or recording.
    CacheWarn {
        /// The operation concerned.
        op: &'a OpRef,
        /// Cache error rendering.
        msg: &'a str,
    },
}

/// Feedback consumer.
pub type FeedbackFn = Box<dyn Fn(&Feedback<'_>)>;

/// Aggregate build outcome reported by [`Memo::status`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// One or more operations failed.
    #[error("one or more operations failed")]
    Failures,
    /// Reads that no operation writes and no client declared ready.
    #[error("files never became ready: {0:?}")]
    NeverBecameReady(Vec<PathBuf>),
    /// Operation ids forming a read/write dependency cycle.
    #[error("dependency cycle between operations {0:?}")]
    Cycle(Vec<u64>),
}

/// Options for [`Memo::write`].
pub struct WriteSpec {
    /// Free-form discriminator folded into the hash.
    pub stamp: String,
    /// Files the producer consults.
    pub reads: BTreeSet<PathBuf>,
    /// Unix mode of the produced file.
    pub mode: u32,
}

impl Default for WriteSpec {
    fn default() -> Self {
        Self {
            stamp: String::new(),
            reads: BTreeSet::new(),
            mode: 0o644,
        }
    }
}

/// Options for [`Memo::copy`].
pub struct CopySpec {
    /// Unix mode of the destination.
    pub mode: u32,
    /// Prefix the copy with a `#line` directive carrying this number.
    pub linenum: Option<u32>,
}

impl Default for CopySpec {
    fn default() -> Self {
        Self {
            mode: 0o644,
            linenum: None,
        }
    }
}

/// Options for [`Memo::spawn`] and [`Memo::spawn_all`].
pub struct SpawnSpec {
    /// Free-form discriminator folded into the hash.
    pub stamp: String,
    /// Files the tool reads.
    pub reads: BTreeSet<PathBuf>,
    /// Files the tool writes.
    pub writes: BTreeSet<PathBuf>,
    /// Environment for the child; defaults to the memoizer's environment
    /// with the default unstamped variables.
    pub env: Option<ToolEnv>,
    /// Working directory; defaults to the memoizer's.
    pub cwd: Option<PathBuf>,
    /// Optional file fed to stdin.
    pub stdin: Option<PathBuf>,
    /// Where stdout goes.
    pub stdout: Sink,
    /// Where stderr goes.
    pub stderr: Sink,
    /// Exit codes counted as success.
    pub success_exits: BTreeSet<i32>,
    /// Hook run after execution, before the cache record.
    pub post_exec: Option<PostExec>,
}

impl Default for SpawnSpec {
    fn default() -> Self {
        Self {
            stamp: String::new(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            env: None,
            cwd: None,
            stdin: None,
            stdout: Sink::Inherit,
            stderr: Sink::Inherit,
            success_exits: std::iter::once(0).collect(),
            post_exec: None,
        }
    }
}

/// Configuration for [`Memo::new`].
pub struct MemoConfig {
    /// Initial diagnostic mark.
    pub mark: String,
    /// Working directory; defaults to the process's.
    pub cwd: Option<PathBuf>,
    /// Environment captured for spawned tools.
    pub env: BTreeMap<String, String>,
    /// Cache directory.
    pub cache_dir: PathBuf,
    /// Trash directory for deletions.
    pub trash_dir: PathBuf,
    /// Jobs budget; `0` means the machine's available parallelism.
    pub jobs: usize,
    /// Hash function; defaults to XXH3-64.
    pub hash_fn: Option<Box<dyn HashFn>>,
    /// Feedback consumer.
    pub feedback: Option<FeedbackFn>,
}

impl MemoConfig {
    /// Configuration with defaults for everything but the directories.
    pub fn new(cache_dir: impl Into<PathBuf>, trash_dir: impl Into<PathBuf>) -> Self {
        Self {
            mark: String::new(),
            cwd: None,
            env: BTreeMap::new(),
            cache_dir: cache_dir.into(),
            trash_dir: trash_dir.into(),
            jobs: 0,
            hash_fn: None,
            feedback: None,
        }
    }
}

struct MemoInner {
    start: Instant,
    cpu_start: Duration,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    guard: RefCell<Guard>,
    reviver: RefCell<Reviver>,
    exec: RefCell<Exec>,
    ops: RefCell<Vec<OpRef>>,
    next_id: Cell<u64>,
    fibers: RefCell<VecDeque<Fiber>>,
    ready_roots: RefCell<BTreeSet<PathBuf>>,
    has_failures: Cell<bool>,
    feedback: FeedbackFn,
}

/// The build memoizer.
///
/// Cheap to clone; clones share all state. [`Memo::with_mark`] derives a
/// clone whose operations carry a different diagnostic mark.
#[derive(Clone)]
pub struct Memo {
    inner: Rc<MemoInner>,
    mark: String,
}

impl Memo {
    /// Create a memoizer.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be opened, the executor
    /// runtime cannot be built, or no working directory can be determined.
    pub fn new(config: MemoConfig) -> Result<Memo> {
        let cwd = match config.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir().map_err(|e| Error::io(e, ".", "current_dir"))?,
        };
        let cache = FileCache::create(&config.cache_dir)?;
        let hash_fn = config.hash_fn.unwrap_or_else(stoke_cache::default_hash_fn);
        let exec = Exec::new(config.jobs, &config.trash_dir)?;
        let feedback = config.feedback.unwrap_or_else(|| Box::new(|_| {}));
        Ok(Memo {
            inner: Rc::new(MemoInner {
                start: Instant::now(),
                cpu_start: cpu_now(),
                cwd,
                env: config.env,
                guard: RefCell::new(Guard::new()),
                reviver: RefCell::new(Reviver::new(cache, hash_fn)),
                exec: RefCell::new(exec),
                ops: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                fibers: RefCell::new(VecDeque::new()),
                ready_roots: RefCell::new(BTreeSet::new()),
                has_failures: Cell::new(false),
                feedback,
            }),
            mark: config.mark,
        })
    }

    /// A memoizer sharing all state but marking its operations with
    /// `mark`.
    #[must_use]
    pub fn with_mark(&self, mark: impl Into<String>) -> Memo {
        Memo {
            inner: self.inner.clone(),
            mark: mark.into(),
        }
    }

    /// The current diagnostic mark.
    #[must_use]
    pub fn mark(&self) -> &str {
        &self.mark
    }

    /// The captured working directory.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    /// The captured tool environment.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.inner.env
    }

    /// The executor's jobs budget.
    #[must_use]
    pub fn jobs(&self) -> usize {
        self.inner.exec.borrow().jobs()
    }

    /// Monotonic time elapsed since the memoizer was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.start.elapsed()
    }

    /// CPU time consumed by the process since the memoizer was created.
    #[must_use]
    pub fn cpu_time(&self) -> Duration {
        cpu_now().saturating_sub(self.inner.cpu_start)
    }

    /// True once any operation failed or a continuation misbehaved.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.inner.has_failures.get()
    }

    /// Every operation created so far, for post-mortem reporting.
    #[must_use]
    pub fn ops(&self) -> Vec<OpRef> {
        self.inner.ops.borrow().clone()
    }

    /// Files declared ready by the client rather than produced by an
    /// operation.
    #[must_use]
    pub fn ready_roots(&self) -> BTreeSet<PathBuf> {
        self.inner.ready_roots.borrow().clone()
    }

    /// Declare a pre-existing input file available. Idempotent.
    pub fn file_ready(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.inner.ready_roots.borrow_mut().insert(path.clone());
        self.inner.guard.borrow_mut().set_file_ready(&path);
    }

    /// Enqueue `f` onto the fiber ready-queue. It runs during a later
    /// [`Memo::stir`], with this memoizer (mark included).
    pub fn spawn_fiber(&self, f: impl FnOnce(&Memo) -> FiberResult + 'static) {
        let m = self.clone();
        self.inner
            .fibers
            .borrow_mut()
            .push_back(Box::new(move || f(&m)));
    }

    /// Read a file; the continuation receives its bytes.
    pub fn read(
        &self,
        file: impl Into<PathBuf>,
        k: impl FnOnce(&Memo, Vec<u8>) -> FiberResult + 'static,
    ) -> OpRef {
        let file = file.into();
        self.new_op(
            std::iter::once(file).collect(),
            BTreeSet::new(),
            OpKind::Read(ReadOp::default()),
            Some(Kont::Bytes(Box::new(k))),
        )
    }

    /// Produce `target` from `producer`. The producer is not invoked when
    /// the operation revives from the cache.
    pub fn write(
        &self,
        target: impl Into<PathBuf>,
        spec: WriteSpec,
        producer: impl FnOnce() -> std::result::Result<Vec<u8>, String> + 'static,
    ) -> OpRef {
        let target = target.into();
        self.new_op(
            spec.reads,
            std::iter::once(target.clone()).collect(),
            OpKind::Write(WriteOp {
                target,
                stamp: spec.stamp,
                mode: spec.mode,
                producer: Some(Box::new(producer)),
            }),
            None,
        )
    }

    /// Copy `src` to `dst`.
    pub fn copy(
        &self,
        src: impl Into<PathBuf>,
        dst: impl Into<PathBuf>,
        spec: CopySpec,
    ) -> OpRef {
        let src = src.into();
        let dst = dst.into();
        self.new_op(
            std::iter::once(src.clone()).collect(),
            std::iter::once(dst.clone()).collect(),
            OpKind::Copy(CopyOp {
                src,
                dst,
                mode: spec.mode,
                linenum: spec.linenum,
            }),
            None,
        )
    }

    /// Create directory `dir` (and parents) with `mode`.
    pub fn mkdir(
        &self,
        dir: impl Into<PathBuf>,
        mode: u32,
        k: impl FnOnce(&Memo) -> FiberResult + 'static,
    ) -> OpRef {
        let dir = dir.into();
        self.new_op(
            BTreeSet::new(),
            std::iter::once(dir.clone()).collect(),
            OpKind::Mkdir(MkdirOp { dir, mode }),
            Some(Kont::Unit(Box::new(k))),
        )
    }

    /// Move `path` to the trash.
    pub fn delete(
        &self,
        path: impl Into<PathBuf>,
        k: impl FnOnce(&Memo) -> FiberResult + 'static,
    ) -> OpRef {
        self.new_op(
            BTreeSet::new(),
            BTreeSet::new(),
            OpKind::Delete(DeleteOp { path: path.into() }),
            Some(Kont::Unit(Box::new(k))),
        )
    }

    /// Continue once every file in `files` is ready.
    pub fn wait_files(
        &self,
        files: impl IntoIterator<Item = PathBuf>,
        k: impl FnOnce(&Memo) -> FiberResult + 'static,
    ) -> OpRef {
        self.new_op(
            files.into_iter().collect(),
            BTreeSet::new(),
            OpKind::WaitFiles,
            Some(Kont::Unit(Box::new(k))),
        )
    }

    /// Emit a diagnostic through the operation stream.
    pub fn notify(&self, kind: NotifyKind, msg: impl Into<String>) -> OpRef {
        self.new_op(
            BTreeSet::new(),
            BTreeSet::new(),
            OpKind::Notify(NotifyOp {
                kind,
                msg: msg.into(),
            }),
            None,
        )
    }

    /// Report a failure and return the abort sentinel for the current
    /// continuation to propagate.
    pub fn fail(&self, msg: impl Into<String>) -> Abort {
        self.notify(NotifyKind::Fail, msg);
        self.inner.has_failures.set(true);
        Abort
    }

    /// Run a tool; the continuation receives its exit code.
    pub fn spawn(
        &self,
        cmd: SpawnCmd,
        spec: SpawnSpec,
        k: impl FnOnce(&Memo, i32) -> FiberResult + 'static,
    ) -> OpRef {
        let writes = spec.writes.clone();
        let op = self.spawn_op(cmd, spec, None);
        self.new_op(op.0, writes, OpKind::Spawn(op.1), Some(Kont::Exit(Box::new(k))))
    }

    /// Like [`Memo::spawn`], with writes defaulting to every file found
    /// under `writes_root` after execution.
    pub fn spawn_all(
        &self,
        cmd: SpawnCmd,
        writes_root: impl Into<PathBuf>,
        mut spec: SpawnSpec,
        k: impl FnOnce(&Memo, i32) -> FiberResult + 'static,
    ) -> OpRef {
        let root = writes_root.into();
        let manifest_root = root
            .parent()
            .map_or_else(|| root.clone(), Path::to_path_buf);
        let declared = spec.writes.clone();
        let walk_root = root.clone();
        spec.post_exec = Some(Box::new(move |op: &mut Op| {
            let mut writes = declared;
            for entry in WalkDir::new(&walk_root).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    writes.insert(entry.path().to_path_buf());
                }
            }
            op.writes = writes;
            Ok(())
        }));
        let writes = spec.writes.clone();
        let op = self.spawn_op(cmd, spec, Some(manifest_root));
        self.new_op(op.0, writes, OpKind::Spawn(op.1), Some(Kont::Exit(Box::new(k))))
    }

    fn spawn_op(
        &self,
        cmd: SpawnCmd,
        spec: SpawnSpec,
        manifest_root: Option<PathBuf>,
    ) -> (BTreeSet<PathBuf>, SpawnOp) {
        let env = spec
            .env
            .unwrap_or_else(|| ToolEnv::new(self.inner.env.clone(), DEFAULT_UNSTAMPED_VARS));
        let cwd = spec.cwd.unwrap_or_else(|| self.inner.cwd.clone());
        (
            spec.reads,
            SpawnOp {
                cmd,
                env,
                cwd,
                stdin: spec.stdin,
                stdout: spec.stdout,
                stderr: spec.stderr,
                success_exits: spec.success_exits,
                stamp: spec.stamp,
                post_exec: spec.post_exec,
                exit: None,
                manifest_root,
            },
        )
    }

    /// Drive the loop: submit allowed operations, collect completions,
    /// finish them and run ready fibers, until everything is idle. With
    /// `block` unset, returns as soon as progress would require waiting
    /// on a child.
    pub fn stir(&self, block: bool) {
        loop {
            let allowed = self.inner.guard.borrow_mut().pop_allowed();
            if let Some(op) = allowed {
                self.submit(op);
                continue;
            }
            let completed = self.inner.exec.borrow_mut().collect(false);
            if let Some(op) = completed {
                self.finish(op);
                continue;
            }
            let fiber = self.inner.fibers.borrow_mut().pop_front();
            if let Some(f) = fiber {
                self.run_fiber(f);
                continue;
            }
            if block && self.inner.exec.borrow().has_pending() {
                let completed = self.inner.exec.borrow_mut().collect(true);
                if let Some(op) = completed {
                    self.finish(op);
                    continue;
                }
            }
            break;
        }
    }

    /// Aggregate build outcome. [`BuildError::Failures`] wins over stall
    /// analysis; a stalled build reports either files that can never be
    /// ready or a dependency cycle among the remaining operations.
    ///
    /// # Errors
    ///
    /// See [`BuildError`].
    pub fn status(&self) -> std::result::Result<(), BuildError> {
        let failed = self.inner.has_failures.get()
            || self
                .inner
                .ops
                .borrow()
                .iter()
                .any(|op| matches!(op.borrow().status, Status::Failed(_)));
        if failed {
            return Err(BuildError::Failures);
        }
        let waiting = self.inner.guard.borrow().waiting_ops();
        if waiting.is_empty() {
            return Ok(());
        }

        let mut writers: HashMap<PathBuf, Vec<u64>> = HashMap::new();
        for (op, _) in &waiting {
            let o = op.borrow();
            for w in &o.writes {
                writers.entry(w.clone()).or_default().push(o.id);
            }
        }

        let ready_roots = self.inner.ready_roots.borrow();
        let guard = self.inner.guard.borrow();
        let mut never: BTreeSet<PathBuf> = BTreeSet::new();
        for (_, unmet) in &waiting {
            for read in unmet {
                if !writers.contains_key(read)
                    && !ready_roots.contains(read)
                    && guard.file_status(read) == FileStatus::Unknown
                {
                    never.insert(read.clone());
                }
            }
        }
        if !never.is_empty() {
            return Err(BuildError::NeverBecameReady(never.into_iter().collect()));
        }

        let mut g: DiGraph<u64, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for (op, _) in &waiting {
            let id = op.borrow().id;
            nodes.insert(id, g.add_node(id));
        }
        for (op, unmet) in &waiting {
            let reader = op.borrow().id;
            for read in unmet {
                if let Some(ws) = writers.get(read) {
                    for writer in ws {
                        g.add_edge(nodes[&reader], nodes[writer], ());
                    }
                }
            }
        }
        for scc in tarjan_scc(&g) {
            if scc.len() > 1 || (scc.len() == 1 && g.contains_edge(scc[0], scc[0])) {
                let mut ids: Vec<u64> = scc.iter().map(|n| g[*n]).collect();
                ids.sort_unstable();
                return Err(BuildError::Cycle(ids));
            }
        }
        // Every unmet read has a waiting writer, so a cycle must exist;
        // report the whole stalled set if the search came up empty.
        let mut ids: Vec<u64> = waiting.iter().map(|(op, _)| op.borrow().id).collect();
        ids.sort_unstable();
        Err(BuildError::Cycle(ids))
    }

    /// Discard operations not yet executing and purge the trash.
    pub fn abort(&self) {
        self.inner.exec.borrow().abort();
    }

    /// Purge trashed deletions, synchronously when `block` is set.
    pub fn purge_trash(&self, block: bool) {
        self.inner.exec.borrow().purge_trash(block);
    }

    fn new_op(
        &self,
        reads: BTreeSet<PathBuf>,
        writes: BTreeSet<PathBuf>,
        kind: OpKind,
        kont: Option<Kont>,
    ) -> OpRef {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let mut op = Op::new(id, self.mark.clone(), self.elapsed(), reads, writes, kind);
        op.kont = kont;
        let op = Rc::new(RefCell::new(op));
        self.inner.ops.borrow_mut().push(op.clone());
        self.inner.guard.borrow_mut().add(op.clone());
        op
    }

    fn submit(&self, op: OpRef) {
        if op.borrow().status == Status::Aborted {
            self.finish(op);
            return;
        }
        if op.borrow().is_cache_eligible() {
            let hashed = {
                let o = op.borrow();
                self.inner.reviver.borrow_mut().hash_op(&o)
            };
            match hashed {
                Ok(h) => op.borrow_mut().hash = h,
                Err(HashError::MissingReads(paths)) => {
                    op.borrow_mut().status = Status::Failed(FailureKind::MissingReads(paths));
                    self.finish(op);
                    return;
                }
                Err(HashError::Tool { tool, reason }) => {
                    (self.inner.feedback)(&Feedback::MissTool {
                        tool: tool.as_path(),
                        reason: reason.as_str(),
                    });
                    op.borrow_mut().status = Status::Failed(FailureKind::Exec(Some(format!(
                        "tool {}: {reason}",
                        tool.display()
                    ))));
                    self.finish(op);
                    return;
                }
            }
            let revived = self.inner.reviver.borrow_mut().revive(&op);
            match revived {
                Ok(true) => {
                    self.finish(op);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::info!(error = %e, "Cache revival failed; executing");
                    let msg = e.to_string();
                    (self.inner.feedback)(&Feedback::CacheWarn {
                        op: &op,
                        msg: msg.as_str(),
                    });
                    self.notify(NotifyKind::Info, format!("cache revive failed: {e}"));
                }
            }
        }
        if matches!(op.borrow().kind, OpKind::Spawn(_)) {
            (self.inner.feedback)(&Feedback::SpawnStart { op: &op });
        }
        self.inner.exec.borrow_mut().schedule(op);
    }

    fn finish(&self, op: OpRef) {
        let mut post_err = None;
        {
            let mut guard = op.borrow_mut();
            let o = &mut *guard;
            if o.status == Status::Done && !o.revived {
                let post = match &mut o.kind {
                    OpKind::Spawn(s) => s.post_exec.take(),
                    _ => None,
                };
                if let Some(post) = post {
                    if let Err(e) = post(o) {
                        post_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = post_err {
            op.borrow_mut().status = Status::Failed(FailureKind::Exec(Some(e)));
        }

        let missing: Vec<PathBuf> = {
            let o = op.borrow();
            if o.status == Status::Done && !o.revived {
                o.writes
                    .iter()
                    .filter(|w| fs::symlink_metadata(w).is_err())
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            }
        };
        if !missing.is_empty() {
            op.borrow_mut().status = Status::Failed(FailureKind::MissingWrites(missing));
        }

        let record = {
            let o = op.borrow();
            o.status == Status::Done && !o.revived && o.is_cache_eligible() && !o.hash.is_nil()
        };
        if record {
            let recorded = self.inner.reviver.borrow_mut().record(&op);
            if let Err(e) = recorded {
                tracing::warn!(error = %e, "Cache record failed");
                let msg = e.to_string();
                (self.inner.feedback)(&Feedback::CacheWarn {
                    op: &op,
                    msg: msg.as_str(),
                });
                self.notify(NotifyKind::Warn, format!("cache record failed: {e}"));
            }
        }

        let (done, failed, writes) = {
            let o = op.borrow();
            (
                o.status == Status::Done,
                matches!(o.status, Status::Failed(_)),
                o.writes.clone(),
            )
        };
        {
            let mut guard = self.inner.guard.borrow_mut();
            for write in &writes {
                if done {
                    guard.set_file_ready(write);
                } else {
                    guard.set_file_never(write);
                }
            }
        }
        if failed {
            self.inner.has_failures.set(true);
        }
        if !done {
            op.borrow_mut().kont = None;
        }
        (self.inner.feedback)(&Feedback::OpComplete { op: &op });
        if !done {
            return;
        }
        let kont = op.borrow_mut().kont.take();
        let Some(kont) = kont else { return };
        let m = self.with_mark(op.borrow().mark.clone());
        let run = move || -> FiberResult {
            match kont {
                Kont::Unit(k) => k(&m),
                Kont::Bytes(k) => {
                    let data = match &op.borrow().kind {
                        OpKind::Read(r) => r.data.clone(),
                        _ => Vec::new(),
                    };
                    k(&m, data)
                }
                Kont::Exit(k) => {
                    let exit = op.borrow().spawn_exit().unwrap_or(0);
                    k(&m, exit)
                }
            }
        };
        match catch_unwind(AssertUnwindSafe(run)) {
            Ok(Ok(())) | Ok(Err(Abort)) => {}
            Err(payload) => self.report_panic(payload),
        }
    }

    fn run_fiber(&self, f: Fiber) {
        eprintln!("DEBUG run_fiber called");
        match catch_unwind(AssertUnwindSafe(move || f())) {
            Ok(Ok(())) | Ok(Err(Abort)) => {}
            Err(payload) => {
                eprintln!("DEBUG run_fiber caught panic");
                self.report_panic(payload)
            },
        }
    }

    fn report_panic(&self, payload: Box<dyn std::any::Any + Send>) {
        let msg = panic_msg(&payload);
        tracing::error!(msg = %msg, "Unexpected continuation failure");
        self.inner.has_failures.set(true);
        self.notify(
            NotifyKind::Fail,
            format!("unexpected continuation failure: {msg}"),
        );
    }
}

fn panic_msg(payload: &(dyn std::any::Any + Send)) -> String {
    eprintln!("DEBUG payload type_id = {:?}", payload.type_id());
    eprintln!("DEBUG &str type_id = {:?}", std::any::TypeId::of::<&str>());
    eprintln!("DEBUG String type_id = {:?}", std::any::TypeId::of::<String>());
    eprintln!("DEBUG is &str = {}", payload.is::<&str>());
    eprintln!("DEBUG is String = {}", payload.is::<String>());
    eprintln!("DEBUG is &&str = {}", payload.is::<&&str>());
    eprintln!("DEBUG is Box<str> = {}", payload.is::<Box<str>>());
    eprintln!("DEBUG is std::fmt::Arguments = {}", payload.is::<std::fmt::Arguments>());
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(unix)]
fn cpu_now() -> Duration {
    fn timeval(tv: libc::timeval) -> Duration {
        #[allow(clippy::cast_sign_loss)]
        Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
    }
    let mut ru = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, ru.as_mut_ptr()) };
    if rc != 0 {
        return Duration::ZERO;
    }
    let ru = unsafe { ru.assume_init() };
    timeval(ru.ru_utime) + timeval(ru.ru_stime)
}

#[cfg(not(unix))]
fn cpu_now() -> Duration {
    Duration::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memo(tmp: &TempDir) -> Memo {
        let mut config = MemoConfig::new(tmp.path().join("cache"), tmp.path().join("trash"));
        config.cwd = Some(tmp.path().to_path_buf());
        config.jobs = 2;
        Memo::new(config).unwrap()
    }

    #[test]
    fn op_ids_are_dense_and_monotonic() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        let a = m.notify(NotifyKind::Info, "a");
        let b = m.notify(NotifyKind::Info, "b");
        assert_eq!(a.borrow().id, 0);
        assert_eq!(b.borrow().id, 1);
    }

    #[test]
    fn file_ready_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        let p = tmp.path().join("input");
        m.file_ready(&p);
        m.file_ready(&p);
        assert_eq!(m.ready_roots().len(), 1);
        assert!(m.status().is_ok());
    }

    #[test]
    fn fail_raises_failures_and_returns_abort() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        let abort = m.fail("nope");
        assert_eq!(abort, Abort);
        assert!(m.has_failures());
        m.stir(true);
        assert_eq!(m.status(), Err(BuildError::Failures));
    }

    #[test]
    fn fibers_run_during_stir_with_their_mark() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        m.with_mark("unit.a").spawn_fiber(move |m| {
            seen2.borrow_mut().push(m.mark().to_string());
            Ok(())
        });
        m.stir(true);
        assert_eq!(&*seen.borrow(), &["unit.a".to_string()]);
    }

    #[test]
    fn continuation_panic_is_contained() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        m.spawn_fiber(|_| panic!("boom"));
        m.stir(true);
        assert!(m.has_failures());
        assert_eq!(m.status(), Err(BuildError::Failures));
        // The panic surfaced as a failure notification operation.
        let ops = m.ops();
        eprintln!("DEBUG ops.len() = {}", ops.len());
        for op in &ops {
            let is_notify = matches!(&op.borrow().kind, OpKind::Notify(_));
            eprintln!("DEBUG op is_notify = {}", is_notify);
            if let OpKind::Notify(n) = &op.borrow().kind {
                eprintln!("DEBUG notify kind={:?} msg={}", n.kind, n.msg);
            }
        }
        assert!(ops.iter().any(|op| {
            let o = op.borrow();
            matches!(
                &o.kind,
                OpKind::Notify(n) if n.kind == NotifyKind::Fail && n.msg.contains("boom")
            )
        }));
    }

    #[test]
    fn abort_result_is_not_reported_as_unexpected() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        m.spawn_fiber(|_| Err(Abort));
        m.stir(true);
        assert!(!m.has_failures());
        assert!(m.status().is_ok());
    }

    #[test]
    fn created_stamps_follow_the_monotonic_clock() {
        let tmp = TempDir::new().unwrap();
        let m = memo(&tmp);
        let a = m.notify(NotifyKind::Info, "a");
        std::thread::sleep(Duration::from_millis(5));
        let b = m.notify(NotifyKind::Info, "b");
        assert!(b.borrow().created > a.borrow().created);
        let _ = m.cpu_time();
    }
}
