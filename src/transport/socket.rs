//! Plain HTTP/1.1 over non-blocking TCP sockets.
//!
//! Every handle owns one connection, opened on the first
//! [perform](Transport::perform) after it was added and closed when the
//! transfer finishes. Sockets are registered with an `epoll` instance; the
//! interest follows the phase of the transfer (writable while connecting and
//! sending the request, readable while receiving the response), which makes
//! [wait](Transport::wait) a readiness poll over every in-flight transfer.
//!
//! Host names are resolved with the system resolver (`getaddrinfo`) when the
//! transfer is first performed. That lookup blocks the calling thread, and
//! with it every other transfer of the loop, and is not bounded by
//! `timeout` or `connect_timeout`. IP literals are used as they are and never
//! block.
//!
//! Only `http://` URLs are supported. Failures are reported as
//! [TransferError]s carrying the classic libcurl result codes (see
//! [code](crate::error::code)).
//!
//! The following options are understood in `client.transport`:
//!
//! - `timeout`: seconds allowed for the whole transfer.
//! - `connect_timeout`: seconds allowed for establishing the connection.
//! - `debug`: `true` to log every step of the transfer at `debug` level.
use std::{
    collections::{BTreeMap, VecDeque},
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    time::{Duration, Instant},
};

use log::{debug, log, trace, warn, Level};

use super::{
    epoll::{Epoll, Interest},
    http1::{parse_url, serialize_request, ResponseReader, Target},
    options::{self, TransferOptions},
    sock_addr::CSockAddr,
    Completion, Delivery, Token, Transport,
};
use crate::{
    error::{code, Error, TransferError},
    message::{Request, TransferStats},
};

const RECV_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Dialing,
    Connecting,
    Sending,
    Receiving,
    Finished,
}

struct Conn {
    token: Token,
    url: String,
    target: Result<Target, TransferError>,
    request: Vec<u8>,
    written: usize,
    reader: ResponseReader,
    options: TransferOptions,
    phase: Phase,
    addrs: VecDeque<SocketAddr>,
    fd: Option<OwnedFd>,
    peer: Option<SocketAddr>,
    last_connect_err: Option<io::Error>,
    started: Option<Instant>,
    connected: Option<Instant>,
    downloaded: usize,
}

fn mk_sock(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let sock = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };

    if sock == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(sock) })
}

/// Start or continue a non-blocking connect. `Ok(true)` once connected.
fn connect(fd: &OwnedFd, addr: SocketAddr) -> io::Result<bool> {
    let caddr: CSockAddr = addr.into();

    if unsafe { libc::connect(fd.as_raw_fd(), caddr.as_ptr(), caddr.len()) } == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();

    match err.raw_os_error() {
        Some(libc::EISCONN) => Ok(true),
        Some(libc::EINPROGRESS | libc::EALREADY | libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

/// Addresses to try for `target`. Only names go through the (blocking)
/// system resolver.
fn resolve(target: &Target) -> Result<VecDeque<SocketAddr>, TransferError> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(VecDeque::from([SocketAddr::new(ip, target.port)]));
    }

    (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map(|addrs| addrs.collect())
        .map_err(|e| {
            TransferError::with_message(
                code::COULDNT_RESOLVE_HOST,
                format!("Could not resolve host: {} ({e})", target.host),
            )
        })
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN | libc::EINTR))
}

impl Conn {
    fn log(&self, msg: std::fmt::Arguments<'_>) {
        let level = if self.options.debug {
            Level::Debug
        } else {
            Level::Trace
        };

        log!(level, "transfer {:?} {}: {}", self.token, self.url, msg);
    }

    fn deadline(&self) -> Option<Instant> {
        let started = self.started?;

        let connect = match self.phase {
            Phase::Dialing | Phase::Connecting => self.options.connect_timeout,
            _ => None,
        };

        [self.options.timeout, connect]
            .into_iter()
            .flatten()
            .map(|d| started + d)
            .min()
    }

    fn close(&mut self, epoll: &Epoll) {
        if let Some(fd) = self.fd.take() {
            if let Err(e) = epoll.delete(fd.as_raw_fd()) {
                warn!("could not deregister transfer {:?}: {e}", self.token);
            }
        }
    }

    /// Advance the transfer as far as possible. `Ok(true)` once finished.
    fn step(&mut self, epoll: &Epoll, out: &mut Vec<Delivery>) -> Result<bool, TransferError> {
        loop {
            match self.phase {
                Phase::Queued => {
                    self.started = Some(Instant::now());

                    let target = self.target.clone()?;

                    self.addrs = resolve(&target)?;
                    self.phase = Phase::Dialing;
                }
                Phase::Dialing => {
                    let Some(addr) = self.addrs.pop_front() else {
                        let reason = self
                            .last_connect_err
                            .as_ref()
                            .map_or_else(|| "no address".to_string(), ToString::to_string);

                        return Err(TransferError::with_message(
                            code::COULDNT_CONNECT,
                            format!("Failed to connect to {}: {reason}", self.url),
                        ));
                    };

                    self.log(format_args!("connecting to {addr}"));

                    let fd = mk_sock(&addr).map_err(|e| {
                        TransferError::with_message(code::COULDNT_CONNECT, e.to_string())
                    })?;

                    epoll
                        .add(fd.as_raw_fd(), Interest::Writable, self.token.key as u64)
                        .map_err(|e| {
                            TransferError::with_message(code::COULDNT_CONNECT, e.to_string())
                        })?;

                    self.fd = Some(fd);
                    self.peer = Some(addr);
                    self.phase = Phase::Connecting;
                }
                Phase::Connecting => {
                    let (Some(fd), Some(addr)) = (&self.fd, self.peer) else {
                        self.phase = Phase::Dialing;
                        continue;
                    };

                    match connect(fd, addr) {
                        Ok(true) => {
                            self.connected = Some(Instant::now());
                            self.phase = Phase::Sending;
                            self.log(format_args!("connected"));
                        }
                        Ok(false) => return Ok(false),
                        Err(e) => {
                            self.log(format_args!("connect to {addr} failed: {e}"));
                            self.close(epoll);
                            self.last_connect_err = Some(e);
                            self.phase = Phase::Dialing;
                        }
                    }
                }
                Phase::Sending => {
                    let fd = self.fd.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1);

                    while self.written < self.request.len() {
                        let rest = &self.request[self.written..];
                        let n = unsafe {
                            libc::send(
                                fd,
                                rest.as_ptr() as *const _,
                                rest.len() as _,
                                libc::MSG_NOSIGNAL,
                            )
                        };

                        if n == -1 {
                            let err = io::Error::last_os_error();

                            if would_block(&err) {
                                return Ok(false);
                            }

                            return Err(TransferError::with_message(
                                code::SEND_ERROR,
                                format!("Failed sending data to the peer: {err}"),
                            ));
                        }

                        self.written += n as usize;
                    }

                    self.log(format_args!("sent {} bytes", self.written));

                    epoll
                        .modify(fd, Interest::Readable, self.token.key as u64)
                        .map_err(|e| TransferError::with_message(code::RECV_ERROR, e.to_string()))?;

                    self.phase = Phase::Receiving;
                }
                Phase::Receiving => {
                    let fd = self.fd.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1);
                    let mut buf = [0u8; RECV_BUF_SIZE];

                    loop {
                        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) };

                        if n == -1 {
                            let err = io::Error::last_os_error();

                            if would_block(&err) {
                                return Ok(false);
                            }

                            return Err(TransferError::with_message(
                                code::RECV_ERROR,
                                format!("Failure when receiving data from the peer: {err}"),
                            ));
                        }

                        if n == 0 {
                            self.reader.eof()?;
                            return Ok(true);
                        }

                        let n = n as usize;
                        self.downloaded += n;

                        if self.reader.feed(&buf[..n], self.token, out)? {
                            return Ok(true);
                        }
                    }
                }
                Phase::Finished => return Ok(true),
            }
        }
    }

    fn stats(&self) -> TransferStats {
        let started = self.started.unwrap_or_else(Instant::now);

        TransferStats {
            url: self.url.clone(),
            http_code: self.reader.status(),
            primary_ip: self.peer.map(|a| a.ip().to_string()),
            primary_port: self.peer.map(|a| a.port()),
            connect_time: self.connected.map(|c| c - started),
            total_time: started.elapsed(),
            size_upload: self.written,
            size_download: self.downloaded,
        }
    }
}

/// A [Transport] speaking HTTP/1.1 over TCP.
pub struct SocketTransport {
    epoll: Epoll,
    conns: BTreeMap<usize, Conn>,
    done: VecDeque<Completion>,
}

impl SocketTransport {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            conns: BTreeMap::new(),
            done: VecDeque::new(),
        })
    }

    fn in_flight(&self) -> impl Iterator<Item = &Conn> {
        self.conns.values().filter(|c| c.phase != Phase::Finished)
    }
}

impl Transport for SocketTransport {
    fn add(&mut self, token: Token, request: &Request) -> Result<(), Error> {
        let options = options::apply(&request.client.transport)?;
        let body = request
            .body
            .as_bytes()
            .ok_or_else(|| Error::validation("request body has not been read"))?;

        let url = request.effective_url();
        let target = parse_url(&url);
        let wire = match &target {
            Ok(t) => serialize_request(&request.http_method, t, &request.headers, body),
            Err(_) => Vec::new(),
        };

        if let Some(mut stale) = self.conns.remove(&token.key) {
            stale.close(&self.epoll);
        }

        trace!("adding transfer {token:?}: {} {url}", request.http_method);

        self.conns.insert(
            token.key,
            Conn {
                token,
                url,
                target,
                request: wire,
                written: 0,
                reader: ResponseReader::new(request.http_method.eq_ignore_ascii_case("HEAD")),
                options,
                phase: Phase::Queued,
                addrs: VecDeque::new(),
                fd: None,
                peer: None,
                last_connect_err: None,
                started: None,
                connected: None,
                downloaded: 0,
            },
        );

        Ok(())
    }

    fn remove(&mut self, token: Token) {
        if self.conns.get(&token.key).is_some_and(|c| c.token == token) {
            if let Some(mut conn) = self.conns.remove(&token.key) {
                conn.close(&self.epoll);
            }
        }
    }

    fn perform(&mut self, out: &mut Vec<Delivery>) -> bool {
        let epoll = &self.epoll;
        let now = Instant::now();

        for conn in self.conns.values_mut() {
            if conn.phase == Phase::Finished {
                continue;
            }

            let result = match conn.step(epoll, out) {
                Ok(false) => match conn.deadline() {
                    Some(deadline) if deadline <= now => Err(TransferError::with_message(
                        code::OPERATION_TIMEDOUT,
                        format!(
                            "Operation timed out after {} milliseconds",
                            conn.started.map_or(0, |s| s.elapsed().as_millis())
                        ),
                    )),
                    _ => continue,
                },
                Ok(true) => Ok(()),
                Err(e) => Err(e),
            };

            match &result {
                Ok(()) => conn.log(format_args!("finished with {}", conn.reader.status())),
                Err(e) => debug!("transfer {:?} {} failed: {e}", conn.token, conn.url),
            }

            conn.close(epoll);
            conn.phase = Phase::Finished;

            self.done.push_back(Completion {
                token: conn.token,
                result,
                stats: conn.stats(),
            });
        }

        self.in_flight().next().is_some()
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        if self.in_flight().next().is_none() {
            return Ok(0);
        }

        let now = Instant::now();
        let timeout = self
            .in_flight()
            .filter_map(Conn::deadline)
            .map(|d| d.saturating_duration_since(now))
            .fold(timeout, Duration::min);

        Ok(self.epoll.wait(timeout)?.count())
    }

    fn info_read(&mut self) -> Option<Completion> {
        self.done.pop_front()
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        for conn in self.conns.values_mut() {
            conn.close(&self.epoll);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        thread::{self, JoinHandle},
        time::Duration,
    };

    use super::{resolve, SocketTransport};
    use crate::{
        error::code,
        message::Request,
        transport::{http1::parse_url, Completion, Delivery, Token, Transport},
    };

    const T1: Token = Token { key: 0, serial: 1 };

    fn read_request(conn: &mut TcpStream) -> String {
        let mut req = Vec::new();
        let mut buf = [0; 1024];

        while !req.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = conn.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            req.extend_from_slice(&buf[..n]);
        }

        String::from_utf8(req).unwrap()
    }

    /// Serve `replies` to consecutive connections, returning the requests seen.
    fn serve(replies: Vec<Vec<&'static [u8]>>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let mut seen = Vec::new();

            for parts in replies {
                let (mut conn, _) = listener.accept().unwrap();
                seen.push(read_request(&mut conn));

                for part in parts {
                    conn.write_all(part).unwrap();
                    conn.flush().unwrap();
                    thread::sleep(Duration::from_millis(10));
                }
            }

            seen
        });

        (url, handle)
    }

    fn run(transport: &mut SocketTransport, out: &mut Vec<Delivery>) -> Completion {
        loop {
            transport.perform(out);

            if let Some(done) = transport.info_read() {
                return done;
            }

            transport.wait(Duration::from_secs(1)).unwrap();
        }
    }

    fn body(out: &[Delivery]) -> Vec<u8> {
        out.iter()
            .filter_map(|d| match d {
                Delivery::Body(_, b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn content_length_response() {
        let (url, server) = serve(vec![vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhe",
            b"llo",
        ]]);
        let mut transport = SocketTransport::new().unwrap();
        let mut out = Vec::new();

        let req = Request::new("POST", format!("{url}/foo?x=1"))
            .header("X-Foo", "bar")
            .body("data");
        transport.add(T1, &req).unwrap();

        let done = run(&mut transport, &mut out);
        assert_eq!(done.token, T1);
        assert!(done.result.is_ok());
        assert_eq!(done.stats.http_code, 200);
        assert!(done.stats.size_upload > 0);
        assert_eq!(done.stats.primary_ip.as_deref(), Some("127.0.0.1"));
        assert!(done.stats.connect_time.is_some());
        assert_eq!(body(&out), b"hello");
        assert_eq!(
            out.first(),
            Some(&Delivery::Header(T1, "HTTP/1.1 200 OK".into()))
        );

        assert!(!transport.perform(&mut out));
        transport.remove(T1);

        let seen = server.join().unwrap();
        assert!(seen[0].starts_with("POST /foo?x=1 HTTP/1.1\r\n"));
        assert!(seen[0].contains("X-Foo: bar\r\n"));
        assert!(seen[0].contains("Content-Length: 4\r\n"));
    }

    #[test]
    fn chunked_and_close_delimited_responses() {
        let (url, server) = serve(vec![
            vec![
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n",
                b"0\r\n\r\n",
            ],
            vec![b"HTTP/1.0 201 Created\r\n\r\nxyz"],
        ]);
        let mut transport = SocketTransport::new().unwrap();

        let mut out = Vec::new();
        transport.add(T1, &Request::get(&url)).unwrap();
        let done = run(&mut transport, &mut out);
        assert!(done.result.is_ok());
        assert_eq!(body(&out), b"abc");
        transport.remove(T1);

        let t2 = Token { key: 0, serial: 2 };
        let mut out = Vec::new();
        transport.add(t2, &Request::get(&url)).unwrap();
        let done = run(&mut transport, &mut out);
        assert_eq!(done.token, t2);
        assert!(done.result.is_ok());
        assert_eq!(done.stats.http_code, 201);
        assert_eq!(body(&out), b"xyz");

        server.join().unwrap();
    }

    #[test]
    fn ip_literals_skip_the_resolver() {
        let target = parse_url("http://[::1]:8080/").unwrap();
        let addrs = resolve(&target).unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0], "[::1]:8080".parse().unwrap());

        let target = parse_url("http://127.0.0.1/").unwrap();
        assert_eq!(
            resolve(&target).unwrap().into_iter().collect::<Vec<_>>(),
            vec!["127.0.0.1:80".parse().unwrap()]
        );

        let target = parse_url("http://localhost:81/").unwrap();
        assert!(resolve(&target).unwrap().iter().all(|a| a.port() == 81));
    }

    #[test]
    fn refused_connection_is_transfer_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut transport = SocketTransport::new().unwrap();

        transport
            .add(T1, &Request::get(format!("http://{addr}/")))
            .unwrap();
        let done = run(&mut transport, &mut Vec::new());

        assert_eq!(done.result.unwrap_err().code, code::COULDNT_CONNECT);
        assert_eq!(done.stats.http_code, 0);
        assert_eq!(done.stats.url, format!("http://{addr}/"));
    }

    #[test]
    fn unsupported_scheme_and_bad_options() {
        let mut transport = SocketTransport::new().unwrap();

        transport
            .add(T1, &Request::get("https://example.com/"))
            .unwrap();
        let done = run(&mut transport, &mut Vec::new());
        assert_eq!(done.result.unwrap_err().code, code::UNSUPPORTED_PROTOCOL);

        assert!(transport
            .add(T1, &Request::get("http://example.com/").option("bogus", "1"))
            .is_err());
    }

    #[test]
    fn times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let mut transport = SocketTransport::new().unwrap();

        transport
            .add(T1, &Request::get(url).option("timeout", "0.2"))
            .unwrap();
        let done = run(&mut transport, &mut Vec::new());

        assert_eq!(done.result.unwrap_err().code, code::OPERATION_TIMEDOUT);
        drop(listener);
    }

    #[test]
    fn removed_transfer_is_never_started() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let mut transport = SocketTransport::new().unwrap();

        transport.add(T1, &Request::get(url)).unwrap();
        transport.remove(T1);

        assert!(!transport.perform(&mut Vec::new()));
        assert!(transport.info_read().is_none());
        assert!(listener.accept().is_err());
    }
}
