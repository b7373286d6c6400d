//! Build operations.
//!
//! An operation is a declarative unit of build work: a set of file reads,
//! a set of file writes, a variant-specific payload and a continuation.
//! Operations are created by [`crate::memo::Memo`] methods, gated by the
//! guard until their reads are ready, hashed and possibly revived by the
//! reviver, executed by the executor, and kept in the memoizer's operation
//! list for post-mortem reporting.

use crate::fiber::FiberResult;
use crate::memo::Memo;
use crate::tool::ToolEnv;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use stoke_cache::Hash;

/// Shared handle to an operation record.
pub type OpRef = Rc<RefCell<Op>>;

/// Severity of a notification operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Informational message.
    Info,
    /// Something looks wrong but the build goes on.
    Warn,
    /// A failure report.
    Fail,
}

/// Why an operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Child exited outside its success set, or an I/O error occurred.
    Exec(Option<String>),
    /// Declared reads that could not be hashed.
    MissingReads(Vec<PathBuf>),
    /// Declared writes that never materialized on disk.
    MissingWrites(Vec<PathBuf>),
}

/// Operation lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Created, not yet finished.
    Waiting,
    /// Discarded without execution, typically because a read went to never.
    Aborted,
    /// Executed or revived successfully.
    Done,
    /// Finished unsuccessfully.
    Failed(FailureKind),
}

/// Where a spawned child's output stream goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// Inherit the driver's stream.
    Inherit,
    /// Discard.
    Null,
    /// Append to a file.
    File(PathBuf),
}

/// A tool invocation: the tool's path and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCmd {
    /// Path to the tool executable.
    pub tool: PathBuf,
    /// Arguments, without the leading tool name.
    pub args: Vec<String>,
}

impl SpawnCmd {
    /// Create a command.
    pub fn new(tool: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tool: tool.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Serialize this command's arguments through a response file scheme.
    ///
    /// Returns the contents to write at `file` and the rewritten command
    /// line referencing it.
    #[must_use]
    pub fn to_response_file(
        &self,
        scheme: &crate::tool::ResponseFile,
        file: &std::path::Path,
    ) -> (Vec<u8>, SpawnCmd) {
        let contents = (scheme.to_file)(&self.args);
        let cmd = SpawnCmd {
            tool: self.tool.clone(),
            args: (scheme.cli)(file),
        };
        (contents, cmd)
    }
}

/// Continuation attached to an operation, by result shape.
pub(crate) enum Kont {
    /// Unit-valued completion.
    Unit(Box<dyn FnOnce(&Memo) -> FiberResult>),
    /// Completion carrying file bytes (reads).
    Bytes(Box<dyn FnOnce(&Memo, Vec<u8>) -> FiberResult>),
    /// Completion carrying an exit code (spawns).
    Exit(Box<dyn FnOnce(&Memo, i32) -> FiberResult>),
}

/// Hook run after a successful spawn, before the cache record.
///
/// Used by `spawn_all` to install the walked output file set as the
/// operation's writes. An `Err` fails the operation.
pub type PostExec = Box<dyn FnOnce(&mut Op) -> std::result::Result<(), String>>;

/// Read payload: the file's bytes once executed.
#[derive(Debug, Default)]
pub struct ReadOp {
    /// Bytes read from the file.
    pub data: Vec<u8>,
}

/// Write payload.
pub struct WriteOp {
    /// The file being produced.
    pub target: PathBuf,
    /// Free-form discriminator folded into the hash.
    pub stamp: String,
    /// Unix mode of the produced file.
    pub mode: u32,
    /// Computes the bytes. Consumed at execution; never invoked on
    /// revival.
    pub producer: Option<Box<dyn FnOnce() -> std::result::Result<Vec<u8>, String>>>,
}

/// Copy payload.
#[derive(Debug, Clone)]
pub struct CopyOp {
    /// Source file.
    pub src: PathBuf,
    /// Destination file.
    pub dst: PathBuf,
    /// Unix mode of the destination.
    pub mode: u32,
    /// When set, the copy is prefixed with a `#line` directive carrying
    /// this number and the source path.
    pub linenum: Option<u32>,
}

/// Mkdir payload.
#[derive(Debug, Clone)]
pub struct MkdirOp {
    /// Directory to create.
    pub dir: PathBuf,
    /// Unix mode of the created directory.
    pub mode: u32,
}

/// Delete payload.
#[derive(Debug, Clone)]
pub struct DeleteOp {
    /// Path to delete (file or directory).
    pub path: PathBuf,
}

/// Notification payload.
#[derive(Debug, Clone)]
pub struct NotifyOp {
    /// Severity.
    pub kind: NotifyKind,
    /// Message.
    pub msg: String,
}

/// Spawn payload.
pub struct SpawnOp {
    /// Tool and arguments.
    pub cmd: SpawnCmd,
    /// Environment handed to the child, split for hashing.
    pub env: ToolEnv,
    /// Working directory of the child.
    pub cwd: PathBuf,
    /// Optional file fed to the child's stdin.
    pub stdin: Option<PathBuf>,
    /// Where stdout goes.
    pub stdout: Sink,
    /// Where stderr goes.
    pub stderr: Sink,
    /// Exit codes counted as success. Empty means any exit succeeds.
    pub success_exits: BTreeSet<i32>,
    /// Free-form discriminator folded into the hash.
    pub stamp: String,
    /// Post-execution hook, run before the cache record.
    pub post_exec: Option<PostExec>,
    /// Captured exit code once the child has run.
    pub exit: Option<i32>,
    /// When set, manifest names are recorded relative to this directory
    /// so the entry revives into a relocated checkout.
    pub manifest_root: Option<PathBuf>,
}

/// Variant-specific payload of an operation.
pub enum OpKind {
    /// Read a file.
    Read(ReadOp),
    /// Produce a file from a closure.
    Write(WriteOp),
    /// Copy a file.
    Copy(CopyOp),
    /// Create a directory.
    Mkdir(MkdirOp),
    /// Move a path to the trash.
    Delete(DeleteOp),
    /// Wait until a set of files is ready.
    WaitFiles,
    /// Emit a diagnostic.
    Notify(NotifyOp),
    /// Run a child process.
    Spawn(SpawnOp),
}

impl OpKind {
    /// Variant name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Read(_) => "read",
            OpKind::Write(_) => "write",
            OpKind::Copy(_) => "copy",
            OpKind::Mkdir(_) => "mkdir",
            OpKind::Delete(_) => "delete",
            OpKind::WaitFiles => "wait-files",
            OpKind::Notify(_) => "notify",
            OpKind::Spawn(_) => "spawn",
        }
    }
}

/// An operation record.
///
/// Mutated only by its memoizer; kept alive for the whole build.
pub struct Op {
    /// Dense id, monotonically assigned per memoizer.
    pub id: u64,
    /// Free-form grouping string for diagnostics.
    pub mark: String,
    /// Monotonic timestamp at creation, relative to the memoizer's start.
    pub created: Duration,
    /// Time spent executing, zero for revived operations.
    pub duration: Duration,
    /// Lifecycle state.
    pub status: Status,
    /// Operation hash; nil until set, and always nil for variants that
    /// are not cache-eligible.
    pub hash: Hash,
    /// True when the result was produced by cache revival.
    pub revived: bool,
    /// Files this operation reads.
    pub reads: BTreeSet<PathBuf>,
    /// Files this operation writes.
    pub writes: BTreeSet<PathBuf>,
    /// Variant payload.
    pub kind: OpKind,
    pub(crate) kont: Option<Kont>,
}

impl Op {
    /// Create an operation record in the waiting state.
    #[must_use]
    pub fn new(
        id: u64,
        mark: impl Into<String>,
        created: Duration,
        reads: BTreeSet<PathBuf>,
        writes: BTreeSet<PathBuf>,
        kind: OpKind,
    ) -> Self {
        Self {
            id,
            mark: mark.into(),
            created,
            duration: Duration::ZERO,
            status: Status::Waiting,
            hash: Hash::nil(),
            revived: false,
            reads,
            writes,
            kind,
            kont: None,
        }
    }

    /// Whether this operation may be recorded in and revived from the
    /// cache. Reads, deletes, waits and notifications always execute.
    #[must_use]
    pub fn is_cache_eligible(&self) -> bool {
        matches!(
            self.kind,
            OpKind::Spawn(_) | OpKind::Write(_) | OpKind::Copy(_) | OpKind::Mkdir(_)
        )
    }

    /// The captured exit code of a spawn operation.
    #[must_use]
    pub fn spawn_exit(&self) -> Option<i32> {
        match &self.kind {
            OpKind::Spawn(s) => s.exit,
            _ => None,
        }
    }

    /// True once the operation reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self.status, Status::Waiting)
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("mark", &self.mark)
            .field("status", &self.status)
            .field("hash", &self.hash)
            .field("revived", &self.revived)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}
