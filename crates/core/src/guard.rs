//! File readiness tracking.
//!
//! The guard maps each tracked file path to one of three states and gates
//! registered operations on their reads. A path never regresses out of
//! ready or never; an operation becomes allowed exactly once. Operations
//! whose reads go to never are marked aborted but still surface through
//! the allowed queue so the memoizer can finish them.

use crate::op::{OpRef, Status};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Readiness of a tracked file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Not yet decided.
    Unknown,
    /// The file exists with its final content for this build.
    Ready,
    /// The file will never be ready.
    Never,
}

/// Gates operations on the readiness of their reads.
#[derive(Default)]
pub struct Guard {
    files: HashMap<PathBuf, FileStatus>,
    waiters: HashMap<PathBuf, Vec<u64>>,
    awaited: HashMap<u64, (OpRef, BTreeSet<PathBuf>)>,
    allowed: VecDeque<OpRef>,
}

impl Guard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of `path`.
    #[must_use]
    pub fn file_status(&self, path: &Path) -> FileStatus {
        self.files.get(path).copied().unwrap_or(FileStatus::Unknown)
    }

    /// Register `op`, allowing it immediately when its reads are already
    /// met and aborting it when one of them can never be met.
    pub fn add(&mut self, op: OpRef) {
        let (id, reads) = {
            let o = op.borrow();
            (o.id, o.reads.clone())
        };
        let mut remaining = BTreeSet::new();
        let mut never = false;
        for read in reads {
            match self.file_status(&read) {
                FileStatus::Ready => {}
                FileStatus::Never => never = true,
                FileStatus::Unknown => {
                    remaining.insert(read);
                }
            }
        }
        if never {
            op.borrow_mut().status = Status::Aborted;
            self.allowed.push_back(op);
            return;
        }
        if remaining.is_empty() {
            self.allowed.push_back(op);
            return;
        }
        for read in &remaining {
            self.waiters.entry(read.clone()).or_default().push(id);
        }
        self.awaited.insert(id, (op, remaining));
    }

    /// Transition `path` to ready and allow operations whose last unmet
    /// read this satisfies. Idempotent; a path already in a terminal state
    /// is left untouched.
    pub fn set_file_ready(&mut self, path: &Path) {
        match self.file_status(path) {
            FileStatus::Unknown => {
                self.files.insert(path.to_path_buf(), FileStatus::Ready);
            }
            FileStatus::Ready | FileStatus::Never => return,
        }
        let Some(ids) = self.waiters.remove(path) else {
            return;
        };
        for id in ids {
            let unblocked = match self.awaited.get_mut(&id) {
                Some((_, remaining)) => {
                    remaining.remove(path);
                    remaining.is_empty()
                }
                // Already surfaced through another transition.
                None => false,
            };
            if unblocked {
                let (op, _) = self.awaited.remove(&id).expect("awaited entry just seen");
                self.allowed.push_back(op);
            }
        }
    }

    /// Transition `path` to never; pending operations reading it are
    /// aborted and surfaced through the allowed queue.
    pub fn set_file_never(&mut self, path: &Path) {
        match self.file_status(path) {
            FileStatus::Unknown => {
                self.files.insert(path.to_path_buf(), FileStatus::Never);
            }
            FileStatus::Ready | FileStatus::Never => return,
        }
        tracing::debug!(path = %path.display(), "File will never be ready");
        let Some(ids) = self.waiters.remove(path) else {
            return;
        };
        for id in ids {
            if let Some((op, _)) = self.awaited.remove(&id) {
                op.borrow_mut().status = Status::Aborted;
                self.allowed.push_back(op);
            }
        }
    }

    /// Pop one allowed operation, FIFO over allowance order.
    pub fn pop_allowed(&mut self) -> Option<OpRef> {
        self.allowed.pop_front()
    }

    /// Operations still gated on unmet reads, with those reads.
    #[must_use]
    pub fn waiting_ops(&self) -> Vec<(OpRef, BTreeSet<PathBuf>)> {
        self.awaited.values().cloned().collect()
    }

    /// True when some registered operation is still gated.
    #[must_use]
    pub fn has_waiting(&self) -> bool {
        !self.awaited.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Op, OpKind, ReadOp};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn op(id: u64, reads: &[&str]) -> OpRef {
        let reads = reads.iter().map(PathBuf::from).collect();
        Rc::new(RefCell::new(Op::new(
            id,
            "test",
            Duration::ZERO,
            reads,
            BTreeSet::new(),
            OpKind::Read(ReadOp::default()),
        )))
    }

    #[test]
    fn no_reads_is_immediately_allowed() {
        let mut g = Guard::new();
        g.add(op(1, &[]));
        assert_eq!(g.pop_allowed().unwrap().borrow().id, 1);
        assert!(g.pop_allowed().is_none());
    }

    #[test]
    fn gates_until_last_read_is_ready() {
        let mut g = Guard::new();
        g.add(op(1, &["/a", "/b"]));
        g.set_file_ready(Path::new("/a"));
        assert!(g.pop_allowed().is_none());
        g.set_file_ready(Path::new("/b"));
        let o = g.pop_allowed().unwrap();
        assert_eq!(o.borrow().id, 1);
        assert_eq!(o.borrow().status, Status::Waiting);
    }

    #[test]
    fn ready_reads_at_registration_count() {
        let mut g = Guard::new();
        g.set_file_ready(Path::new("/a"));
        g.add(op(1, &["/a"]));
        assert!(g.pop_allowed().is_some());
    }

    #[test]
    fn never_aborts_waiters_and_new_registrations() {
        let mut g = Guard::new();
        g.add(op(1, &["/a"]));
        g.set_file_never(Path::new("/a"));
        let o = g.pop_allowed().unwrap();
        assert_eq!(o.borrow().status, Status::Aborted);

        g.add(op(2, &["/a"]));
        let o = g.pop_allowed().unwrap();
        assert_eq!(o.borrow().id, 2);
        assert_eq!(o.borrow().status, Status::Aborted);
    }

    #[test]
    fn terminal_states_do_not_regress() {
        let mut g = Guard::new();
        g.set_file_ready(Path::new("/a"));
        g.set_file_never(Path::new("/a"));
        assert_eq!(g.file_status(Path::new("/a")), FileStatus::Ready);

        g.set_file_never(Path::new("/b"));
        g.set_file_ready(Path::new("/b"));
        assert_eq!(g.file_status(Path::new("/b")), FileStatus::Never);
    }

    #[test]
    fn ready_is_idempotent() {
        let mut g = Guard::new();
        g.add(op(1, &["/a"]));
        g.set_file_ready(Path::new("/a"));
        g.set_file_ready(Path::new("/a"));
        assert!(g.pop_allowed().is_some());
        assert!(g.pop_allowed().is_none());
    }

    #[test]
    fn waiting_ops_reports_unmet_reads() {
        let mut g = Guard::new();
        g.add(op(1, &["/a", "/b"]));
        g.set_file_ready(Path::new("/a"));
        let waiting = g.waiting_ops();
        assert_eq!(waiting.len(), 1);
        assert_eq!(
            waiting[0].1,
            std::iter::once(PathBuf::from("/b")).collect::<BTreeSet<_>>()
        );
    }
}
