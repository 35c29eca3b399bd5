//! # `trawl`: a single-threaded transfer multiplexer
//!
//! This crate is the transport core of an HTTP client. It drives many
//! concurrent HTTP transfers from one thread over a bounded pool of native
//! transfer handles, using non-blocking readiness polling. There is no async
//! runtime and no parallelism: "concurrency" means interleaving in-flight
//! transfers within one loop.
//!
//! The pieces are:
//!
//! - [future]: a lazily resolved, cancellable [Future](future::Future) that
//!   computes its value at most once.
//! - [multi]: the [Multiplexer](multi::Multiplexer), which owns a table of
//!   in-flight requests, applies backpressure when the table is full, and
//!   settles each request's future when its transfer finishes.
//! - [transport]: the native engines the multiplexer drives. A socket
//!   transport speaking plain HTTP/1.1 over `epoll`, and a scripted mock.
//! - [message]: requests, responses and their headers.
//! - [error]: the crate's error types.
//!
//! ## Example
//!
//! ```
//! use trawl::{
//!     message::{Request, Response},
//!     multi::Multiplexer,
//!     transport::mock::MockServer,
//! };
//!
//! let server = MockServer::new();
//! server.enqueue([Response::with_status(200), Response::with_status(201)]);
//!
//! let mux = Multiplexer::new(server.transport());
//! let a = mux.submit(Request::get("http://example.com/a")).unwrap();
//! let b = mux
//!     .submit(Request::new("POST", "http://example.com/b").body("hello"))
//!     .unwrap();
//!
//! // Waiting on one future runs the loop until every transfer is done.
//! assert_eq!(a.wait().unwrap().status, Some(200));
//! assert!(b.realized());
//! assert_eq!(b.wait().unwrap().status, Some(201));
//! ```
//!
//! Against a real server, use
//! [SocketTransport](transport::socket::SocketTransport) instead:
//!
//! ```no_run
//! use trawl::{message::Request, multi::Multiplexer, transport::socket::SocketTransport};
//!
//! let mux = Multiplexer::new(SocketTransport::new().unwrap());
//! let res = mux.submit(Request::get("http://example.com/")).unwrap();
//! println!("{:?}", res.wait().unwrap().status);
//! ```
pub mod error;
pub mod future;
pub mod message;
pub mod multi;
pub mod transport;
