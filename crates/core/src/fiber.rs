//! Cooperative fibers and one-shot futures.
//!
//! A fiber is a continuation-passing computation driven by the memoizer's
//! stir loop: it runs on the driver thread, yields only at explicit
//! memoizer calls, and resumes when the loop drains the ready queue. A
//! [`Future`] is a one-shot cell that fires enqueued waiters exactly once
//! when it transitions out of the undetermined state.

use crate::memo::Memo;
use std::cell::RefCell;
use std::rc::Rc;

/// The distinguished abort value returned by [`Memo::fail`].
///
/// An `Err(Abort)` escaping a continuation is a deliberate, already
/// reported build failure; the loop swallows it without logging an
/// unexpected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

/// What a continuation returns to the stir loop.
pub type FiberResult = std::result::Result<(), Abort>;

/// A queued ready fiber.
pub(crate) type Fiber = Box<dyn FnOnce() -> FiberResult>;

type DetWaiter<T> = Box<dyn FnOnce(&Memo, Rc<T>) -> FiberResult>;
type SetWaiter<T> = Box<dyn FnOnce(&Memo, Option<Rc<T>>) -> FiberResult>;

enum State<T> {
    Undet {
        det: Vec<DetWaiter<T>>,
        set: Vec<SetWaiter<T>>,
    },
    Det(Rc<T>),
    Never,
}

/// A one-shot future whose waiters run as fibers.
///
/// The cell transitions exactly once, from undetermined to either a value
/// or never. Waiters registered with [`Future::await_det`] fire only on a
/// value; waiters registered with [`Future::await_set`] fire on either
/// transition.
pub struct Future<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Future<T> {
    /// Create an undetermined future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Undet {
                det: Vec::new(),
                set: Vec::new(),
            })),
        }
    }

    /// The determined value, if any.
    #[must_use]
    pub fn value(&self) -> Option<Rc<T>> {
        match &*self.state.borrow() {
            State::Det(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// True once the future is in a terminal state.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !matches!(&*self.state.borrow(), State::Undet { .. })
    }

    /// Determine the future with `v`, enqueueing all waiters.
    ///
    /// # Panics
    ///
    /// Panics if the future is already in a terminal state; setting a
    /// future twice is a programming error.
    pub fn set(&self, m: &Memo, v: T) {
        let value = Rc::new(v);
        let prev = self
            .state
            .replace(State::Det(value.clone()));
        match prev {
            State::Undet { det, set } => {
                for w in det {
                    let v = value.clone();
                    m.spawn_fiber(move |m| w(m, v));
                }
                for w in set {
                    let v = value.clone();
                    m.spawn_fiber(move |m| w(m, Some(v)));
                }
            }
            State::Det(_) | State::Never => panic!("future set twice"),
        }
    }

    /// Move the future to never, dropping value waiters and enqueueing
    /// set waiters with `None`.
    ///
    /// # Panics
    ///
    /// Panics if the future is already in a terminal state.
    pub fn set_never(&self, m: &Memo) {
        let prev = self.state.replace(State::Never);
        match prev {
            State::Undet { det, set } => {
                drop(det);
                for w in set {
                    m.spawn_fiber(move |m| w(m, None));
                }
            }
            State::Det(_) | State::Never => panic!("future set twice"),
        }
    }

    /// Run `k` as a fiber once the future determines. Dropped if the
    /// future goes to never.
    pub fn await_det(&self, m: &Memo, k: impl FnOnce(&Memo, Rc<T>) -> FiberResult + 'static) {
        match &mut *self.state.borrow_mut() {
            State::Undet { det, .. } => det.push(Box::new(k)),
            State::Det(v) => {
                let v = v.clone();
                m.spawn_fiber(move |m| k(m, v));
            }
            State::Never => {}
        }
    }

    /// Run `k` as a fiber once the future reaches a terminal state.
    pub fn await_set(
        &self,
        m: &Memo,
        k: impl FnOnce(&Memo, Option<Rc<T>>) -> FiberResult + 'static,
    ) {
        match &mut *self.state.borrow_mut() {
            State::Undet { set, .. } => set.push(Box::new(k)),
            State::Det(v) => {
                let v = v.clone();
                m.spawn_fiber(move |m| k(m, Some(v)));
            }
            State::Never => {
                m.spawn_fiber(move |m| k(m, None));
            }
        }
    }

    /// Turn a CPS fiber into a future by wiring its single completion to
    /// [`Future::set`].
    pub fn of_fiber(
        m: &Memo,
        fiber: impl FnOnce(&Memo, Box<dyn FnOnce(&Memo, T) -> FiberResult>) -> FiberResult + 'static,
    ) -> Self {
        let fut = Self::new();
        let done = fut.clone();
        m.spawn_fiber(move |m| {
            fiber(
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
