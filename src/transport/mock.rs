//! Scripted in-memory transport.
//!
//! [MockServer] plays the part of the network: responses are queued on it
//! with [MockServer::enqueue] or built from the request by a function queued
//! with [MockServer::enqueue_fn], and every request that reaches it is
//! recorded.
//! A [MockTransport] created from the server is handed to the multiplexer,
//! while the test keeps the server to inspect what happened.
//!
//! A transfer is sent on the first [Transport::perform] after it was added, but
//! only finishes once a readiness poll ([Transport::wait]) has happened since
//! it was sent. Eager submissions therefore reach the server immediately but
//! stay in flight until somebody pumps the loop, like a real network.
//!
//! ```
//! use trawl::{
//!     message::{Request, Response},
//!     multi::Multiplexer,
//!     transport::mock::MockServer,
//! };
//!
//! let server = MockServer::new();
//! server.enqueue([Response::with_status(200)]);
//!
//! let mux = Multiplexer::new(server.transport());
//! let res = mux.submit(Request::get("http://example.com/")).unwrap();
//!
//! assert_eq!(res.wait().unwrap().status, Some(200));
//! assert_eq!(server.received().len(), 1);
//! ```
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    io,
    rc::Rc,
    time::Duration,
};

use log::trace;

use super::{Completion, Delivery, Token, Transport};
use crate::{
    error::{Error, TransferError},
    message::{Headers, Request, Response, TransferStats},
};

/// A request as seen by the [MockServer].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

type Responder = Box<dyn FnOnce(&ReceivedRequest) -> Result<Response, TransferError>>;

enum Reply {
    Canned(Result<Response, TransferError>),
    Computed(Responder),
}

#[derive(Default)]
struct ServerState {
    replies: VecDeque<Reply>,
    received: Vec<ReceivedRequest>,
    live: usize,
    peak: usize,
}

/// The remote end of a [MockTransport].
#[derive(Clone, Default)]
pub struct MockServer {
    state: Rc<RefCell<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that talks to this server.
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            server: self.clone(),
            handles: BTreeMap::new(),
            done: VecDeque::new(),
            polls: 0,
        }
    }

    /// Queue responses, handed out in order to the requests that arrive.
    /// Requests arriving with nothing queued get a `500`.
    pub fn enqueue(&self, responses: impl IntoIterator<Item = Response>) {
        self.state
            .borrow_mut()
            .replies
            .extend(responses.into_iter().map(|r| Reply::Canned(Ok(r))));
    }

    /// Queue a reply built from the request it answers.
    pub fn enqueue_fn(
        &self,
        f: impl FnOnce(&ReceivedRequest) -> Result<Response, TransferError> + 'static,
    ) {
        self.state
            .borrow_mut()
            .replies
            .push_back(Reply::Computed(Box::new(f)));
    }

    /// Queue a transfer failure.
    pub fn enqueue_error(&self, err: TransferError) {
        self.state
            .borrow_mut()
            .replies
            .push_back(Reply::Canned(Err(err)));
    }

    /// Every request that has reached the server so far.
    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.state.borrow().received.clone()
    }

    /// Forget received requests and queued responses.
    pub fn flush(&self) {
        let mut state = self.state.borrow_mut();
        state.replies.clear();
        state.received.clear();
    }

    /// Number of native handles currently open.
    pub fn live_handles(&self) -> usize {
        self.state.borrow().live
    }

    /// Largest number of native handles that were open at once.
    pub fn peak_handles(&self) -> usize {
        self.state.borrow().peak
    }

    fn receive(&self, req: ReceivedRequest) -> Result<Response, TransferError> {
        let reply = {
            let mut state = self.state.borrow_mut();
            state.received.push(req.clone());
            state.replies.pop_front()
        };

        match reply {
            Some(Reply::Canned(reply)) => reply,
            Some(Reply::Computed(f)) => f(&req),
            None => Ok(Response::with_status(500)),
        }
    }

    fn open(&self) {
        let mut state = self.state.borrow_mut();
        state.live += 1;
        state.peak = state.peak.max(state.live);
    }

    fn close(&self) {
        self.state.borrow_mut().live -= 1;
    }
}

enum Phase {
    Queued,
    InFlight {
        sent_at: u64,
        reply: Result<Response, TransferError>,
    },
    Finished,
}

struct MockHandle {
    request: ReceivedRequest,
    phase: Phase,
}

/// A [Transport] that answers from a [MockServer].
pub struct MockTransport {
    server: MockServer,
    handles: BTreeMap<Token, MockHandle>,
    done: VecDeque<Completion>,
    polls: u64,
}

fn reply_lines(res: &Response) -> Vec<String> {
    let status = res.status.unwrap_or(200);
    let mut lines = vec![match &res.reason {
        Some(reason) => format!("HTTP/1.1 {status} {reason}"),
        None => format!("HTTP/1.1 {status}"),
    }];

    for (name, values) in &res.headers {
        lines.extend(values.iter().map(|v| format!("{name}: {v}")));
    }

    lines
}

impl MockTransport {
    fn finish(
        &mut self,
        token: Token,
        url: String,
        reply: Result<Response, TransferError>,
        out: &mut Vec<Delivery>,
    ) {
        let mut stats = TransferStats {
            url,
            ..TransferStats::default()
        };

        let result = reply.map(|res| {
            stats.http_code = res.status.unwrap_or(200);

            out.extend(
                reply_lines(&res)
                    .into_iter()
                    .map(|line| Delivery::Header(token, line)),
            );

            if let Some(body) = res.body {
                stats.size_download = body.len();
                out.push(Delivery::Body(token, body));
            }
        });

        trace!("mock transfer {token:?} finished: {result:?}");

        self.done.push_back(Completion {
            token,
            result,
            stats,
        });
    }
}

impl Transport for MockTransport {
    fn add(&mut self, token: Token, request: &Request) -> Result<(), Error> {
        let body = request
            .body
            .as_bytes()
            .ok_or_else(|| Error::validation("request body has not been read"))?
            .to_vec();

        self.handles.insert(
            token,
            MockHandle {
                request: ReceivedRequest {
                    method: request.http_method.clone(),
                    url: request.effective_url(),
                    headers: request.headers.clone(),
                    body,
                },
                phase: Phase::Queued,
            },
        );
        self.server.open();

        Ok(())
    }

    fn remove(&mut self, token: Token) {
        if self.handles.remove(&token).is_some() {
            self.server.close();
        }
    }

    fn perform(&mut self, out: &mut Vec<Delivery>) -> bool {
        let mut finished = Vec::new();

        for (token, handle) in self.handles.iter_mut() {
            match std::mem::replace(&mut handle.phase, Phase::Finished) {
                Phase::Queued => {
                    handle.phase = Phase::InFlight {
                        sent_at: self.polls,
                        reply: self.server.receive(handle.request.clone()),
                    };
                }
                Phase::InFlight { sent_at, reply } if self.polls > sent_at => {
                    finished.push((*token, handle.request.url.clone(), reply));
                }
                phase => handle.phase = phase,
            }
        }

        for (token, url, reply) in finished {
            self.finish(token, url, reply, out);
        }

        self.handles
            .values()
            .any(|h| !matches!(h.phase, Phase::Finished))
    }

    fn wait(&mut self, _timeout: Duration) -> io::Result<usize> {
        self.polls += 1;

        Ok(self
            .handles
            .values()
            .filter(|h| matches!(h.phase, Phase::InFlight { .. }))
            .count())
    }

    fn info_read(&mut self) -> Option<Completion> {
        self.done.pop_front()
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        for _ in 0..self.handles.len() {
            self.server.close();
        }
    }
}
