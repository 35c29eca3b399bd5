//! Driving many transfers from one thread.
//!
//! A [Multiplexer] owns a [Transport] and a table of in-flight requests.
//! [Multiplexer::submit] registers a request and hands back a [Future] for its
//! [Response] without blocking. Waiting on any of those futures runs the poll
//! loop, which keeps going until *every* pending transfer has finished, so one
//! `wait()` generally resolves all futures submitted before it.
//!
//! # Capacity
//!
//! The table is bounded by [Config::max_handles]. When a submission brings the
//! table to that size, `submit` runs the loop to a full drain before returning.
//! This makes the bound a burst threshold rather than a sliding window: the
//! transport never holds more than `max_handles` live handles, but a drain
//! waits for all of them.
//!
//! # Example
//!
//! ```
//! use trawl::{
//!     message::{Admission, Request, Response},
//!     multi::{Config, Multiplexer},
//!     transport::mock::MockServer,
//! };
//!
//! let server = MockServer::new();
//! server.enqueue([Response::with_status(200), Response::with_status(404)]);
//!
//! let mux = Multiplexer::with_config(server.transport(), Config::default().max_handles(10));
//!
//! let a = mux.submit(Request::get("http://example.com/a").admission(Admission::Lazy)).unwrap();
//! let b = mux.submit(Request::get("http://example.com/b").admission(Admission::Lazy)).unwrap();
//! assert!(server.received().is_empty());
//!
//! assert_eq!(a.wait().unwrap().status, Some(200));
//! assert!(b.realized());
//! assert_eq!(b.wait().unwrap().status, Some(404));
//! ```
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    thread,
    time::Duration,
};

use log::{debug, trace, warn};
use slab::Slab;

use crate::{
    error::Error,
    future::Future,
    message::{Admission, Body, Request, Response},
    transport::{Completion, Delivery, Token, Transport},
};

mod entry;

use entry::RequestEntry;

/// Pause after a failed readiness poll, instead of spinning.
const POLL_ERROR_BACKOFF: Duration = Duration::from_micros(250);

/// Multiplexer settings. Requests may override both through
/// [ClientOptions](crate::message::ClientOptions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Table size at which `submit` drains the loop.
    pub max_handles: usize,
    /// Upper bound on a single readiness poll.
    pub select_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_handles: 100,
            select_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Set the table size at which `submit` drains.
    pub fn max_handles(mut self, max: usize) -> Self {
        self.max_handles = max;
        self
    }

    /// Set the upper bound on a single readiness poll.
    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = timeout;
        self
    }
}

struct Multi<T> {
    transport: T,
    handles: Slab<RequestEntry>,
    serial: u64,
    active: bool,
    config: Config,
}

impl<T: Transport> Multi<T> {
    fn entry_mut(&mut self, token: Token) -> Option<&mut RequestEntry> {
        self.handles
            .get_mut(token.key)
            .filter(|e| e.serial == token.serial)
    }

    /// Remove an entry from the table and close its native handle.
    fn take(&mut self, token: Token) -> Option<RequestEntry> {
        self.entry_mut(token)?;

        let entry = self.handles.remove(token.key);
        self.transport.remove(token);

        Some(entry)
    }

    fn route(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Header(token, line) => {
                if let Some(e) = self.entry_mut(token) {
                    e.header_lines.push(line);
                }
            }
            Delivery::Body(token, bytes) => {
                if let Some(e) = self.entry_mut(token) {
                    e.body.extend_from_slice(&bytes);
                }
            }
        }
    }
}

/// One turn of the loop: an optional readiness poll, one non-blocking
/// advance, then completion of every finished transfer.
///
/// The table is not borrowed while completion callbacks run, so they may
/// submit or wait on further requests.
fn step<T: Transport>(inner: &RefCell<Multi<T>>, timeout: Option<Duration>) {
    let finished = {
        let mut multi = inner.borrow_mut();
        let multi = &mut *multi;

        if let Some(timeout) = timeout.filter(|_| multi.active) {
            trace!("polling for up to {timeout:?}");

            if let Err(e) = multi.transport.wait(timeout) {
                warn!("readiness poll failed: {e}");
                thread::sleep(POLL_ERROR_BACKOFF);
            }
        }

        let mut deliveries = Vec::new();
        multi.active = multi.transport.perform(&mut deliveries);

        for delivery in deliveries {
            multi.route(delivery);
        }

        let mut finished = Vec::new();

        while let Some(completion) = multi.transport.info_read() {
            match multi.take(completion.token) {
                Some(entry) => finished.push((entry, completion)),
                None => debug!(
                    "ignoring completion of released handle {:?}",
                    completion.token
                ),
            }
        }

        finished
    };

    for (entry, completion) in finished {
        complete(entry, completion);
    }
}

fn complete(entry: RequestEntry, completion: Completion) {
    let token = completion.token;

    trace!(
        "completing {token:?} ({:?}) {}",
        entry.admission,
        entry.url
    );

    let (res, chain, resolver) = entry.into_response(completion);

    // Past this point the future can no longer be cancelled.
    resolver.claim();

    let res = chain.run(res);

    if !resolver.resolve(res) {
        debug!("future for {token:?} was settled elsewhere");
    }
}

/// Pump the loop until the table is empty and nothing is in progress.
fn execute<T: Transport>(inner: &RefCell<Multi<T>>, timeout: Duration) {
    loop {
        {
            let multi = inner.borrow();

            if multi.handles.is_empty() && !multi.active {
                return;
            }
        }

        step(inner, Some(timeout));
    }
}

/// Runs concurrent transfers over a [Transport].
///
/// Dropping the multiplexer drains every pending transfer first, so no future
/// it handed out is left pending.
pub struct Multiplexer<T: Transport + 'static> {
    inner: Rc<RefCell<Multi<T>>>,
}

impl<T: Transport + 'static> Multiplexer<T> {
    /// Create a multiplexer over `transport` with the default [Config].
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, Config::default())
    }

    /// Create a multiplexer over `transport` with the given [Config].
    pub fn with_config(transport: T, config: Config) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Multi {
                transport,
                handles: Slab::new(),
                serial: 0,
                active: false,
                config,
            })),
        }
    }

    /// The multiplexer-wide settings. Requests may override them.
    pub fn config(&self) -> Config {
        self.inner.borrow().config.clone()
    }

    /// Number of submitted requests that have not finished yet.
    pub fn len(&self) -> usize {
        self.inner.borrow().handles.len()
    }

    /// Returns `true` when no submitted request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submit a request.
    ///
    /// The request body is read in full, then the transfer is registered with
    /// the transport. [Admission::Eager] requests are advanced once straight
    /// away; lazy ones wait for the loop. If the table has reached its
    /// capacity, every pending transfer is driven to completion before this
    /// returns.
    ///
    /// The returned future resolves to the [Response] after the request's
    /// completion callbacks ran. Transfer failures are reported through
    /// [Response::error]; an `Err` here means the request was rejected and
    /// nothing was registered.
    pub fn submit(&self, mut request: Request) -> Result<Future<Response>, Error> {
        if request.client.max_handles == Some(0) {
            return Err(Error::validation("max_handles must be at least 1"));
        }

        request.body = Body::Bytes(std::mem::take(&mut request.body).into_bytes()?);

        let then = std::mem::take(&mut request.then);
        let url = request.effective_url();
        let admission = request.client.admission;

        let (fut, token, max_handles, select_timeout) = {
            let mut multi = self.inner.borrow_mut();
            let multi = &mut *multi;

            let max_handles = request.client.max_handles.unwrap_or(multi.config.max_handles);
            let select_timeout = request
                .client
                .select_timeout
                .unwrap_or(multi.config.select_timeout);

            let slot = multi.handles.vacant_entry();
            let token = Token {
                key: slot.key(),
                serial: multi.serial + 1,
            };

            multi.transport.add(token, &request)?;
            multi.serial = token.serial;

            let (fut, resolver) = Future::shadowed(
                drive(Rc::downgrade(&self.inner), select_timeout),
                release(Rc::downgrade(&self.inner), token),
            );

            slot.insert(RequestEntry {
                serial: token.serial,
                url,
                admission,
                header_lines: Vec::new(),
                body: Vec::new(),
                then,
                resolver,
            });

            (fut, token, max_handles, select_timeout)
        };

        debug!(
            "submitted {token:?}: {} {}",
            request.http_method,
            request.effective_url()
        );

        if admission == Admission::Eager {
            step(&self.inner, None);
        }

        let pending = self.len();

        if pending >= max_handles {
            debug!("{pending} pending transfers reached capacity {max_handles}, draining");
            execute(&self.inner, select_timeout);
        }

        Ok(fut)
    }

    /// Drive every pending transfer to completion.
    ///
    /// Does nothing when no request is pending.
    pub fn drain(&self) {
        let timeout = self.inner.borrow().config.select_timeout;

        execute(&self.inner, timeout);
    }
}

fn drive<T: Transport + 'static>(
    mux: Weak<RefCell<Multi<T>>>,
    timeout: Duration,
) -> impl FnOnce() -> Result<(), Error> {
    move || {
        if let Some(inner) = mux.upgrade() {
            execute(&inner, timeout);
        }

        Ok(())
    }
}

fn release<T: Transport + 'static>(
    mux: Weak<RefCell<Multi<T>>>,
    token: Token,
) -> impl FnOnce() -> bool {
    move || {
        let Some(inner) = mux.upgrade() else {
            return false;
        };

        let entry = inner.borrow_mut().take(token);

        match entry {
            Some(entry) => {
                debug!("cancelled {token:?} {}", entry.url);
                true
            }
            None => false,
        }
    }
}

impl<T: Transport + 'static> Drop for Multiplexer<T> {
    fn drop(&mut self) {
        if !self.is_empty() {
            debug!("draining {} pending transfers before shutdown", self.len());
        }

        self.drain();
    }
}
