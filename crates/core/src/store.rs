//! Lazy, typed, per-build values.
//!
//! A [`Store`] maps typed keys to futures. Looking a key up the first time
//! runs its deterministic initializer under a sub-memoizer marked with the
//! key's mark and caches the resulting future; later lookups return the
//! same future. Type safety is enforced at lookup time: a key is bound to
//! the type it was created with, and a mismatch is a structural invariant
//! violation.

use crate::fiber::{FiberResult, Future};
use crate::memo::Memo;
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

type Det<T> = Rc<dyn Fn(&Store, &Memo, Box<dyn FnOnce(&Memo, T) -> FiberResult>) -> FiberResult>;

/// A typed store key carrying its own deterministic initializer.
pub struct StoreKey<T: 'static> {
    id: u64,
    mark: String,
    det: Det<T>,
}

impl<T: 'static> Clone for StoreKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            mark: self.mark.clone(),
            det: self.det.clone(),
        }
    }
}

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(0);

impl<T: 'static> StoreKey<T> {
    /// Create a key. `det` determines the key's value in CPS: it receives
    /// the store, a sub-memoizer marked with `mark`, and the continuation
    /// to call exactly once with the value.
    pub fn new(
        mark: impl Into<String>,
        det: impl Fn(&Store, &Memo, Box<dyn FnOnce(&Memo, T) -> FiberResult>) -> FiberResult
            + 'static,
    ) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            mark: mark.into(),
            det: Rc::new(det),
        }
    }

    /// The key's diagnostic mark.
    #[must_use]
    pub fn mark(&self) -> &str {
        &self.mark
    }
}

struct Binding {
    type_id: TypeId,
    fut: Rc<dyn Any>,
}

struct StoreInner {
    memo: Memo,
    dir: PathBuf,
    bindings: RefCell<HashMap<u64, Binding>>,
}

/// A typed key → future map bound to a memoizer.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    /// Create a store over `memo` with a scratch directory for
    /// initializers that need one.
    #[must_use]
    pub fn new(memo: &Memo, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Rc::new(StoreInner {
                memo: memo.clone(),
                dir: dir.into(),
                bindings: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The store's memoizer.
    #[must_use]
    pub fn memo(&self) -> &Memo {
        &self.inner.memo
    }

    /// The store's scratch directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// The future bound to `key`, materializing it lazily.
    ///
    /// # Panics
    ///
    /// Panics if the binding for the key's id carries a different type;
    /// this indicates a corrupted key registry and is a programming
    /// error.
    #[must_use]
    pub fn get<T: 'static>(&self, key: &StoreKey<T>) -> Future<T> {
        if let Some(binding) = self.inner.bindings.borrow().get(&key.id) {
            assert_eq!(
                binding.type_id,
                TypeId::of::<T>(),
                "store key {} bound to a different type",
                key.mark
            );
            let fut = binding
                .fut
                .clone()
                .downcast::<Future<T>>()
                .unwrap_or_else(|_| panic!("store key {} bound to a different type", key.mark));
            return (*fut).clone();
        }
        let fut: Future<T> = Future::new();
        self.inner.bindings.borrow_mut().insert(
            key.id,
            Binding {
                type_id: TypeId::of::<T>(),
                fut: Rc::new(fut.clone()),
            },
        );
        let sub = self.inner.memo.with_mark(key.mark.clone());
        let det = key.det.clone();
        let store = self.clone();
        let done = fut.clone();
        sub.spawn_fiber(move |m| {
            det(
                &store,
                m,
                Box::new(move |m, v| {
                    done.set(m, v);
                    Ok(())
                }),
            )
        });
        fut
    }
}
