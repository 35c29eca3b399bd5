//! Lazily resolved, cancellable futures.
//!
//! A [Future] is a handle to a value that is computed at most once. It is
//! created in the *pending* state with a compute function, and moves to one of
//! three terminal states the first time it is settled:
//!
//! ```text
//! Pending ──▶ Realized(value)
//!    │──────▶ Failed(error)
//!    └──────▶ Cancelled
//! ```
//!
//! There are no other transitions. The compute function runs on the first call
//! to [Future::wait]; every later call returns a clone of the cached value or
//! error.
//!
//! Cloning a `Future` does not clone the computation: all clones share one
//! state, so any number of observers (direct waits or [Future::then]
//! continuations) see the result of a single computation.
//!
//! # Example
//!
//! ```
//! use std::{cell::Cell, rc::Rc};
//! use trawl::future::Future;
//!
//! let calls = Rc::new(Cell::new(0));
//! let fut = {
//!     let calls = calls.clone();
//!     Future::new(move || {
//!         calls.set(calls.get() + 1);
//!         Ok(40)
//!     })
//! };
//!
//! let fut = fut.then(|v| Some(*v + 2));
//!
//! assert_eq!(fut.wait().unwrap(), 42);
//! assert_eq!(fut.wait().unwrap(), 42);
//! assert_eq!(calls.get(), 1);
//! ```
//!
//! # Shadowed futures
//!
//! Sometimes the value is delivered by somebody else: the compute function
//! only has to drive an event loop, and whatever completes the work settles the
//! future through a [Resolver]. [Future::shadowed] builds such a pair. If the
//! compute function returns and the resolver never fired, `wait()` fails with
//! [Error::DerefFailure].
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use crate::error::Error;

/// A continuation run over a value.
///
/// It may modify the value in place and may return a replacement. Returning
/// `None` keeps the (possibly modified) value.
pub type Continuation<T> = Box<dyn FnOnce(&mut T) -> Option<T>>;

type ComputeFn<T> = Box<dyn FnOnce() -> Result<Settle<T>, Error>>;
type CancelFn = Box<dyn FnOnce() -> bool>;

/// What a compute function produced.
pub enum Settle<T> {
    /// The value of the future.
    Value(T),
    /// Resolve to whatever the given future resolves to.
    Follow(Future<T>),
    /// Nothing was returned directly; a [Resolver] is expected to have settled
    /// the future.
    Shadowed,
}

enum State<T> {
    Pending,
    Realized(T),
    Failed(Error),
    Cancelled,
}

struct Inner<T> {
    state: State<T>,
    compute: Option<ComputeFn<T>>,
    cancel: Option<CancelFn>,
    /// A [Resolver] has claimed the future; it can no longer be cancelled.
    claimed: bool,
}

/// A value that may not exist yet.
///
/// See the [module-level documentation](self) for more information.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

/// Settles a [Future] from outside its compute function.
///
/// A resolver only holds a weak reference: once every handle to the future is
/// gone, settling through it does nothing.
pub struct Resolver<T> {
    inner: Weak<RefCell<Inner<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Inner<T> {
    fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending)
    }
}

/// Move `inner` to a terminal state. Returns the closures that were discarded
/// so the caller can drop them after releasing the borrow, or `None` if the
/// future had already been settled.
fn settle<T>(
    inner: &RefCell<Inner<T>>,
    outcome: Result<T, Error>,
) -> Option<(Option<ComputeFn<T>>, Option<CancelFn>)> {
    let mut inner = inner.borrow_mut();

    if !inner.is_pending() {
        return None;
    }

    inner.state = match outcome {
        Ok(v) => State::Realized(v),
        Err(Error::Cancelled) => State::Cancelled,
        Err(e) => State::Failed(e),
    };

    Some((inner.compute.take(), inner.cancel.take()))
}

impl<T: Clone + 'static> Future<T> {
    fn from_parts(compute: Option<ComputeFn<T>>, cancel: Option<CancelFn>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                compute,
                cancel,
                claimed: false,
            })),
        }
    }

    fn from_state(state: State<T>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state,
                compute: None,
                cancel: None,
                claimed: false,
            })),
        }
    }

    /// Create a pending future whose value is produced by `f`.
    ///
    /// `f` is not called until the first [Future::wait]. Returning
    /// `Err(Error::Cancelled)` marks the future as cancelled.
    pub fn new(f: impl FnOnce() -> Result<T, Error> + 'static) -> Self {
        Self::from_parts(Some(Box::new(move || f().map(Settle::Value))), None)
    }

    /// Like [Future::new], but with a function that attempts to abort the
    /// underlying operation when [Future::cancel] is called. The cancel
    /// function returns whether the abort succeeded.
    pub fn with_cancel(
        f: impl FnOnce() -> Result<T, Error> + 'static,
        cancel: impl FnOnce() -> bool + 'static,
    ) -> Self {
        Self::from_parts(
            Some(Box::new(move || f().map(Settle::Value))),
            Some(Box::new(cancel)),
        )
    }

    /// Create a pending future from a compute function that returns a
    /// [Settle] and an optional cancel function.
    pub fn from_fn(
        f: impl FnOnce() -> Result<Settle<T>, Error> + 'static,
        cancel: Option<Box<dyn FnOnce() -> bool>>,
    ) -> Self {
        Self::from_parts(Some(Box::new(f)), cancel)
    }

    /// Create a future that is settled through the returned [Resolver].
    ///
    /// `drive` is called on the first [Future::wait] and must cause the
    /// resolver to fire, typically by pumping an event loop.
    pub fn shadowed(
        drive: impl FnOnce() -> Result<(), Error> + 'static,
        cancel: impl FnOnce() -> bool + 'static,
    ) -> (Self, Resolver<T>) {
        let fut = Self::from_parts(
            Some(Box::new(move || drive().map(|_| Settle::Shadowed))),
            Some(Box::new(cancel)),
        );
        let resolver = fut.resolver();

        (fut, resolver)
    }

    /// A future that is already realized with `value`.
    pub fn ready(value: T) -> Self {
        Self::from_state(State::Realized(value))
    }

    /// A future that has already failed with `err`. Passing
    /// [Error::Cancelled] yields a cancelled future.
    pub fn failed(err: Error) -> Self {
        Self::from_state(match err {
            Error::Cancelled => State::Cancelled,
            e => State::Failed(e),
        })
    }

    /// Obtain a [Resolver] for this future.
    pub fn resolver(&self) -> Resolver<T> {
        Resolver {
            inner: Rc::downgrade(&self.inner),
        }
    }

    fn settle(&self, outcome: Result<T, Error>) {
        // Dropped outside of the borrow: the closures may own other futures.
        let _discarded = settle(&self.inner, outcome);
    }

    fn cached(&self) -> Option<Result<T, Error>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Realized(v) => Some(Ok(v.clone())),
            State::Failed(e) => Some(Err(e.clone())),
            State::Cancelled => Some(Err(Error::Cancelled)),
        }
    }

    /// Block until the future has a value, computing it if needed.
    ///
    /// The compute function runs at most once. Whatever it produced, value or
    /// error, is cached and handed back by every subsequent call.
    pub fn wait(&self) -> Result<T, Error> {
        if let Some(outcome) = self.cached() {
            return outcome;
        }

        let compute = self.inner.borrow_mut().compute.take();

        if let Some(compute) = compute {
            match compute() {
                Ok(Settle::Value(v)) => self.settle(Ok(v)),
                Ok(Settle::Follow(other)) => {
                    if Rc::ptr_eq(&other.inner, &self.inner) {
                        self.settle(Err(Error::Logic("cannot resolve to itself".into())));
                    } else {
                        self.settle(other.wait());
                    }
                }
                Ok(Settle::Shadowed) => {}
                Err(e) => self.settle(Err(e)),
            }
        }

        match self.cached() {
            Some(outcome) => outcome,
            None => {
                self.settle(Err(Error::DerefFailure));
                Err(Error::DerefFailure)
            }
        }
    }

    /// Cancel the future.
    ///
    /// Returns `false` if the future is already realized, failed or cancelled,
    /// or if a [Resolver] has claimed it. Otherwise the future becomes
    /// cancelled straight away and its compute function will never run; the
    /// return value is then that of the cancel function, or `false` when there
    /// is none.
    pub fn cancel(&self) -> bool {
        let (compute, cancel) = {
            let mut inner = self.inner.borrow_mut();

            if !inner.is_pending() || inner.claimed {
                return false;
            }

            inner.state = State::Cancelled;
            (inner.compute.take(), inner.cancel.take())
        };

        drop(compute);

        cancel.is_some_and(|f| f())
    }

    /// Returns `true` if the future has been cancelled.
    pub fn cancelled(&self) -> bool {
        matches!(self.inner.borrow().state, State::Cancelled)
    }

    /// Returns `true` once the future has left the pending state, whether it
    /// was realized, failed or cancelled.
    pub fn realized(&self) -> bool {
        !self.inner.borrow().is_pending()
    }

    /// Register a continuation.
    ///
    /// The returned future waits on this one and then runs `f` over the value.
    /// Errors (including cancellation) are propagated without calling `f`.
    /// Cancelling the returned future cancels this one.
    pub fn then(&self, f: impl FnOnce(&mut T) -> Option<T> + 'static) -> Future<T> {
        let source = self.clone();
        let cancel_source = self.clone();

        Self::from_fn(
            move || {
                let mut value = source.wait()?;
                let value = f(&mut value).unwrap_or(value);

                Ok(Settle::Value(value))
            },
            Some(Box::new(move || cancel_source.cancel())),
        )
    }
}

impl<T> Resolver<T> {
    /// Realize the future with `value`. Returns `false` if the future was
    /// already settled or no longer exists.
    pub fn resolve(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Fail the future with `err`. [Error::Cancelled] marks it cancelled.
    pub fn reject(&self, err: Error) -> bool {
        self.finish(Err(err))
    }

    /// Commit to settling the future: from now on [Future::cancel] is
    /// rejected and leaves the state untouched. The cancel function is
    /// discarded.
    ///
    /// Returns `false` if the future was already settled, claimed, or no
    /// longer exists.
    pub fn claim(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };

        let cancel = {
            let mut inner = inner.borrow_mut();

            if !inner.is_pending() || inner.claimed {
                return false;
            }

            inner.claimed = true;
            inner.cancel.take()
        };

        drop(cancel);

        true
    }

    fn finish(&self, outcome: Result<T, Error>) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };

        settle(&inner, outcome).is_some()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.try_borrow() {
            Ok(inner) => match inner.state {
                State::Pending => "pending",
                State::Realized(_) => "realized",
                State::Failed(_) => "failed",
                State::Cancelled => "cancelled",
            },
            Err(_) => "busy",
        };

        f.debug_struct("Future").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        io,
        rc::Rc,
    };

    use super::{Future, Settle};
    use crate::error::Error;

    fn counted(calls: &Rc<Cell<u32>>, value: &'static str) -> Future<&'static str> {
        let calls = calls.clone();
        Future::new(move || {
            calls.set(calls.get() + 1);
            Ok(value)
        })
    }

    #[test]
    fn wait_computes_once() {
        let calls = Rc::new(Cell::new(0));
        let f = counted(&calls, "foo");

        assert!(!f.realized());
        assert_eq!(f.wait().unwrap(), "foo");
        assert_eq!(f.wait().unwrap(), "foo");
        assert_eq!(calls.get(), 1);
        assert!(f.realized());
        assert!(!f.cancel());
        assert!(!f.cancelled());
    }

    #[test]
    fn clones_share_computation() {
        let calls = Rc::new(Cell::new(0));
        let f = counted(&calls, "foo");
        let g = f.clone();

        assert_eq!(g.wait().unwrap(), "foo");
        assert!(f.realized());
        assert_eq!(f.wait().unwrap(), "foo");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cancel_prevents_compute() {
        let calls = Rc::new(Cell::new(0));
        let f = counted(&calls, "foo");

        assert!(!f.cancel());
        assert!(f.cancelled());
        assert!(f.realized());
        assert!(matches!(f.wait(), Err(Error::Cancelled)));
        assert_eq!(calls.get(), 0);
        assert!(!f.cancel());
    }

    #[test]
    fn cancel_returns_cancel_fn_result() {
        let aborted = Rc::new(Cell::new(false));
        let f = {
            let aborted = aborted.clone();
            Future::with_cancel(
                || Ok(1),
                move || {
                    aborted.set(true);
                    true
                },
            )
        };

        assert!(f.cancel());
        assert!(aborted.get());
        assert!(f.cancelled());
        assert!(matches!(f.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn cannot_cancel_failed() {
        let f: Future<u32> = Future::new(|| Err(Error::validation("nope")));

        assert!(f.wait().is_err());
        assert!(!f.cancel());
        assert!(!f.cancelled());
    }

    #[test]
    fn compute_error_is_repeated() {
        let calls = Rc::new(Cell::new(0));
        let f: Future<u32> = {
            let calls = calls.clone();
            Future::new(move || {
                calls.set(calls.get() + 1);
                Err(Error::other(io::Error::other("foo")))
            })
        };

        let first = f.wait().unwrap_err();
        let second = f.wait().unwrap_err();

        match (&first, &second) {
            (Error::Other(a), Error::Other(b)) => assert!(Rc::ptr_eq(a, b)),
            _ => panic!("unexpected errors: {first:?} {second:?}"),
        }
        assert_eq!(first.to_string(), "foo");
        assert_eq!(calls.get(), 1);
        assert!(!f.cancelled());
        assert!(f.realized());
    }

    #[test]
    fn compute_signalling_cancellation_cancels() {
        let f: Future<u32> = Future::new(|| Err(Error::Cancelled));

        assert!(matches!(f.wait(), Err(Error::Cancelled)));
        assert!(f.cancelled());
        assert!(matches!(f.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn unresolved_shadow_is_deref_failure() {
        let (f, _resolver) = Future::<u32>::shadowed(|| Ok(()), || true);

        assert!(matches!(f.wait(), Err(Error::DerefFailure)));
        assert!(matches!(f.wait(), Err(Error::DerefFailure)));
    }

    #[test]
    fn shadow_resolved_by_drive() {
        let slot = Rc::new(RefCell::new(None));
        let (f, resolver) = {
            let slot = slot.clone();
            Future::shadowed(
                move || {
                    let resolver: super::Resolver<&str> = slot.borrow_mut().take().unwrap();
                    resolver.resolve("foo");
                    Ok(())
                },
                || false,
            )
        };
        *slot.borrow_mut() = Some(resolver.clone());

        assert_eq!(f.wait().unwrap(), "foo");
        assert!(!resolver.resolve("bar"));
        assert_eq!(f.wait().unwrap(), "foo");
    }

    #[test]
    fn resolver_settles_without_compute() {
        let calls = Rc::new(Cell::new(0));
        let f = counted(&calls, "foo");

        assert!(f.resolver().resolve("bar"));
        assert!(f.realized());
        assert_eq!(f.wait().unwrap(), "bar");
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn resolver_cancellation_marks_cancelled() {
        let f: Future<u32> = Future::new(|| Ok(1));

        assert!(f.resolver().reject(Error::Cancelled));
        assert!(f.cancelled());
        assert!(!f.cancel());
    }

    #[test]
    fn claimed_future_cannot_be_cancelled() {
        let aborted = Rc::new(Cell::new(false));
        let f: Future<u32> = {
            let aborted = aborted.clone();
            Future::with_cancel(|| Ok(1), move || {
                aborted.set(true);
                true
            })
        };
        let resolver = f.resolver();

        assert!(resolver.claim());
        assert!(!resolver.claim());
        assert!(!f.cancel());
        assert!(!f.cancelled());
        assert!(!f.realized());
        assert!(!aborted.get());

        assert!(resolver.resolve(7));
        assert_eq!(f.wait().unwrap(), 7);
    }

    #[test]
    fn resolve_to_itself_is_logic_error() {
        let slot: Rc<RefCell<Option<Future<u32>>>> = Rc::new(RefCell::new(None));
        let f = {
            let slot = slot.clone();
            Future::from_fn(
                move || Ok(Settle::Follow(slot.borrow_mut().take().unwrap())),
                None,
            )
        };
        *slot.borrow_mut() = Some(f.clone());

        assert!(matches!(f.wait(), Err(Error::Logic(_))));
    }

    #[test]
    fn follow_adopts_other_result() {
        let other = Future::new(|| Ok(7));
        let f = {
            let other = other.clone();
            Future::from_fn(move || Ok(Settle::Follow(other)), None)
        };

        assert_eq!(f.wait().unwrap(), 7);
        assert!(other.realized());
    }

    #[test]
    fn then_runs_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let f = Future::new(|| Ok(BTreeMap::from([("status", 200)])));

        let a = {
            let order = order.clone();
            move |v: &mut BTreeMap<&'static str, i32>| {
                order.borrow_mut().push("a");
                v.insert("x", 1);
                None
            }
        };
        let b = {
            let order = order.clone();
            move |v: &mut BTreeMap<&'static str, i32>| {
                order.borrow_mut().push("b");
                assert_eq!(v.get("x"), Some(&1));
                Some(BTreeMap::from([("status", 304)]))
            }
        };

        let g = f.then(a).then(b);

        assert!(!g.realized());
        assert_eq!(g.wait().unwrap(), BTreeMap::from([("status", 304)]));
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        assert_eq!(f.wait().unwrap(), BTreeMap::from([("status", 200)]));
    }

    #[test]
    fn then_propagates_errors() {
        let called = Rc::new(Cell::new(false));
        let f: Future<u32> = Future::new(|| Err(Error::validation("bad")));
        let g = {
            let called = called.clone();
            f.then(move |_| {
                called.set(true);
                None
            })
        };

        assert!(matches!(g.wait(), Err(Error::Validation(_))));
        assert!(!called.get());
    }

    #[test]
    fn cancelling_then_cancels_source() {
        let aborted = Rc::new(Cell::new(false));
        let f = {
            let aborted = aborted.clone();
            Future::with_cancel(
                || Ok(1),
                move || {
                    aborted.set(true);
                    true
                },
            )
        };
        let g = f.then(|v| Some(*v + 1));

        assert!(g.cancel());
        assert!(aborted.get());
        assert!(f.cancelled());
        assert!(g.cancelled());
    }

    #[test]
    fn completed_futures() {
        let f = Future::ready(3);
        assert!(f.realized());
        assert!(!f.cancel());
        assert_eq!(f.wait().unwrap(), 3);

        let c: Future<u32> = Future::failed(Error::Cancelled);
        assert!(c.cancelled());
        assert!(!c.cancel());
    }
}
