//! Native transfer engines.
//!
//! A [Transport] owns the native handles for in-flight transfers and moves
//! them forward without blocking. The [Multiplexer](crate::multi::Multiplexer)
//! drives it with a loop of:
//!
//! 1. [Transport::wait]: block until a handle is ready, or a timeout expires.
//! 2. [Transport::perform]: advance every transfer as far as it can go without
//!    blocking, handing received header lines and body bytes back through the
//!    `out` parameter.
//! 3. [Transport::info_read]: collect the transfers that have finished.
//!
//! The following transports are provided:
//!
//! - `socket`: plain HTTP/1.1 over non-blocking TCP sockets, polled with
//!   `epoll`.
//! - `mock`: a scripted in-memory transport with instrumentation, for tests
//!   and canned responses.
use std::{io, time::Duration};

use crate::{
    error::{Error, TransferError},
    message::{Request, TransferStats},
};

pub mod mock;
pub mod socket;

mod epoll;
mod http1;
mod options;
mod sock_addr;

/// Identifies a transfer handle.
///
/// `key` is the slot in the multiplexer's handle table and is reused once a
/// handle is released; `serial` is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
    pub key: usize,
    pub serial: u64,
}

/// Data received for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A raw header line without its line terminator. The status line is
    /// delivered first.
    Header(Token, String),
    /// A chunk of (decoded) body.
    Body(Token, Vec<u8>),
}

/// A finished transfer.
#[derive(Debug, Clone)]
pub struct Completion {
    pub token: Token,
    pub result: Result<(), TransferError>,
    pub stats: TransferStats,
}

/// A native transfer engine.
pub trait Transport {
    /// Create a native handle for `request`. Nothing may be sent until the
    /// next call to [Transport::perform].
    ///
    /// Only invalid requests are reported here; network failures are reported
    /// through [Transport::info_read].
    fn add(&mut self, token: Token, request: &Request) -> Result<(), Error>;

    /// Close the native handle for `token`. Unknown tokens are ignored.
    fn remove(&mut self, token: Token);

    /// Advance every transfer as far as it can go without waiting on the
    /// network. Returns `true` while any transfer is still in progress.
    ///
    /// Engines may do bounded local work here; the socket transport also
    /// resolves host names, which blocks (see [socket]).
    fn perform(&mut self, out: &mut Vec<Delivery>) -> bool;

    /// Block until at least one handle can make progress or `timeout`
    /// elapses. Returns the number of ready handles.
    fn wait(&mut self, timeout: Duration) -> io::Result<usize>;

    /// Pop the next finished transfer.
    fn info_read(&mut self) -> Option<Completion>;
}
