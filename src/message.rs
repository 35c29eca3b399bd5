//! Requests and responses.
//!
//! A [Request] describes one transfer: the method, where to send it, headers,
//! a body, transport options for the [Multiplexer](crate::multi::Multiplexer)
//! and a [Chain] of completion callbacks. A [Response] is what the transfer
//! produced, including failures reported by the transport.
//!
//! ```
//! use trawl::message::{Admission, Request};
//!
//! let req = Request::get("http://127.0.0.1:8080/index.html")
//!     .header("accept", "text/html")
//!     .admission(Admission::Lazy)
//!     .then(|res| {
//!         res.headers.remove("set-cookie");
//!         None
//!     });
//!
//! assert_eq!(req.effective_url(), "http://127.0.0.1:8080/index.html");
//! ```
use std::{collections::BTreeMap, fmt, io::Read, str::FromStr, time::Duration};

use crate::{
    error::{Error, TransferError},
    future::Continuation,
};

/// Header map: name to one or more values, ordered by name.
pub type Headers = BTreeMap<String, Vec<String>>;

/// How a request is admitted into the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Admission {
    /// Start the transfer as soon as it is submitted.
    #[default]
    Eager,
    /// Register the transfer but only send it once the pool is full or a
    /// future is waited on.
    Lazy,
}

impl FromStr for Admission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eager" => Ok(Self::Eager),
            "lazy" | "batch" => Ok(Self::Lazy),
            _ => Err(Error::validation(format!("unknown admission mode {s:?}"))),
        }
    }
}

/// Transport options carried by a request.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Overrides the multiplexer's capacity for this request's admission.
    pub max_handles: Option<usize>,
    /// Overrides the multiplexer's readiness-poll timeout for loops driven by
    /// this request.
    pub select_timeout: Option<Duration>,
    /// Admission mode.
    pub admission: Admission,
    /// Engine specific options, applied by the transport.
    pub transport: BTreeMap<String, String>,
}

/// A request body.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Chunks(Vec<Vec<u8>>),
    Reader(Box<dyn Read>),
}

impl Body {
    /// Read the whole body into a single byte buffer.
    pub fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Bytes(b) => Ok(b),
            Body::Chunks(chunks) => Ok(chunks.concat()),
            Body::Reader(mut r) => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }

    /// The body bytes, if the body has already been read into memory.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Empty => Some(&[]),
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::Chunks(c) => write!(f, "Chunks({} chunks)", c.len()),
            Body::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Bytes(value.into_bytes())
    }
}

/// Completion callbacks, run in registration order.
///
/// Each link may modify the response and may return a replacement that the
/// following links (and the caller) see instead.
pub struct Chain<T> {
    links: Vec<Continuation<T>>,
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Self { links: Vec::new() }
    }
}

impl<T> Chain<T> {
    /// Append a callback to the end of the chain.
    pub fn push(&mut self, f: impl FnOnce(&mut T) -> Option<T> + 'static) {
        self.links.push(Box::new(f));
    }

    /// Append every callback of `other`, after the ones already registered.
    pub fn append(&mut self, mut other: Chain<T>) {
        self.links.append(&mut other.links);
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Run every callback over `value` and return the final value.
    pub fn run(self, mut value: T) -> T {
        for link in self.links {
            if let Some(replacement) = link(&mut value) {
                value = replacement;
            }
        }

        value
    }
}

impl<T> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("len", &self.len()).finish()
    }
}

/// A request to be sent by a transport.
#[derive(Debug)]
pub struct Request {
    pub http_method: String,
    /// Used together with `uri` when `url` is not set. Defaults to `http`.
    pub scheme: Option<String>,
    /// Path of the resource, e.g. `/index.html`.
    pub uri: String,
    /// Absolute URL. Takes precedence over `scheme`, `host` and `uri`.
    pub url: Option<String>,
    pub query_string: Option<String>,
    pub headers: Headers,
    pub body: Body,
    pub client: ClientOptions,
    pub then: Chain<Response>,
}

impl Request {
    /// Create a request for `method` and absolute `url`.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            http_method: method.into(),
            scheme: None,
            uri: String::new(),
            url: Some(url.into()),
            query_string: None,
            headers: Headers::new(),
            body: Body::Empty,
            client: ClientOptions::default(),
            then: Chain::default(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Create a request with no URL, addressed by `host` header and `uri`.
    pub fn to_host(method: impl Into<String>, host: &str, uri: impl Into<String>) -> Self {
        let mut req = Self::new(method, "");
        req.url = None;
        req.uri = uri.into();
        req.header("host", host)
    }

    /// Add a header value. Repeated names accumulate values.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn admission(mut self, admission: Admission) -> Self {
        self.client.admission = admission;
        self
    }

    pub fn max_handles(mut self, max: usize) -> Self {
        self.client.max_handles = Some(max);
        self
    }

    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.client.select_timeout = Some(timeout);
        self
    }

    /// Set an engine specific transport option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client.transport.insert(key.into(), value.into());
        self
    }

    /// Add a completion callback after any already registered.
    pub fn then(mut self, f: impl FnOnce(&mut Response) -> Option<Response> + 'static) -> Self {
        self.then.push(f);
        self
    }

    /// The URL the request is sent to.
    ///
    /// This is `url` when set, otherwise it is assembled from `scheme`, the
    /// `host` header, `uri` and `query_string`.
    pub fn effective_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let mut url = format!("{}://", self.scheme.as_deref().unwrap_or("http"));

        if let Some(host) = header(&self.headers, "host") {
            url.push_str(&host);
        }

        url.push_str(&self.uri);

        if let Some(qs) = &self.query_string {
            url.push('?');
            url.push_str(qs);
        }

        url
    }
}

/// Diagnostics captured by the transport when a transfer finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    /// The URL that was requested.
    pub url: String,
    /// Status code seen on the wire, `0` if no response head was read.
    pub http_code: u16,
    pub primary_ip: Option<String>,
    pub primary_port: Option<u16>,
    /// Time from the first step of the transfer until it connected.
    pub connect_time: Option<Duration>,
    /// Time from the first step of the transfer until it finished.
    pub total_time: Duration,
    pub size_upload: usize,
    pub size_download: usize,
}

/// The outcome of a transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub effective_url: Option<String>,
    pub transfer_stats: TransferStats,
    /// Present only when the transfer failed.
    pub error: Option<TransferError>,
}

impl Response {
    /// A response with just a status code, as typically returned by a mock.
    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Turn a failed transfer into an `Err`.
    pub fn into_result(self) -> Result<Self, Error> {
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(self),
        }
    }
}

/// Parse raw `Name: Value` lines into a header map.
///
/// A line without a colon is kept as a header with an empty value.
pub fn headers_from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Headers {
    let mut headers = Headers::new();

    for line in lines {
        let (name, value) = line.split_once(':').unwrap_or((line, ""));

        headers
            .entry(name.trim().to_string())
            .or_default()
            .push(value.trim().to_string());
    }

    headers
}

/// All values of header `name`, looked up case-insensitively.
pub fn header_lines<'a>(headers: &'a Headers, name: &str) -> &'a [String] {
    if let Some(values) = headers.get(name) {
        return values;
    }

    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
        .unwrap_or(&[])
}

/// The values of header `name` joined with `", "`.
pub fn header(headers: &Headers, name: &str) -> Option<String> {
    match header_lines(headers, name) {
        [] => None,
        values => Some(values.join(", ")),
    }
}

pub fn first_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    header_lines(headers, name).first().map(String::as_str)
}

pub fn has_header(headers: &Headers, name: &str) -> bool {
    !header_lines(headers, name).is_empty()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parses_header_lines() {
        let headers = headers_from_lines(["Foo: bar", "Foo: baz", "Abc: 123", "Def"]);

        assert_eq!(headers["Foo"], vec!["bar", "baz"]);
        assert_eq!(headers["Abc"], vec!["123"]);
        assert_eq!(headers["Def"], vec![""]);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = headers_from_lines(["Content-Type: text/html", "X-Foo: a", "x-foo: b"]);

        assert_eq!(
            header(&headers, "content-type").as_deref(),
            Some("text/html")
        );
        assert_eq!(first_header(&headers, "X-FOO"), Some("a"));
        assert!(has_header(&headers, "CONTENT-TYPE"));
        assert!(!has_header(&headers, "accept"));
        assert_eq!(header(&headers, "accept"), None);
    }

    #[test]
    fn effective_url_from_parts() {
        let mut req = Request::to_host("GET", "example.com:8080", "/foo");
        req.query_string = Some("a=1".into());

        assert_eq!(req.effective_url(), "http://example.com:8080/foo?a=1");

        req.scheme = Some("https".into());
        assert_eq!(req.effective_url(), "https://example.com:8080/foo?a=1");

        req.url = Some("http://other/".into());
        assert_eq!(req.effective_url(), "http://other/");
    }

    #[test]
    fn reads_bodies() {
        assert_eq!(Body::Empty.into_bytes().unwrap(), b"");
        assert_eq!(Body::from("foo").into_bytes().unwrap(), b"foo");
        assert_eq!(
            Body::Chunks(vec![b"foo".to_vec(), b"bar".to_vec()])
                .into_bytes()
                .unwrap(),
            b"foobar"
        );
        assert_eq!(
            Body::Reader(Box::new(Cursor::new(b"baz".to_vec())))
                .into_bytes()
                .unwrap(),
            b"baz"
        );
    }

    #[test]
    fn chain_runs_in_registration_order() {
        let mut chain = Chain::default();
        chain.push(|res: &mut Response| {
            res.reason = Some("first".into());
            None
        });
        chain.push(|res: &mut Response| {
            assert_eq!(res.reason.as_deref(), Some("first"));
            None
        });

        let mut tail = Chain::default();
        tail.push(|_: &mut Response| Some(Response::with_status(304)));
        chain.append(tail);

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.run(Response::with_status(200)).status, Some(304));
    }

    #[test]
    fn parses_admission() {
        assert_eq!("batch".parse::<Admission>().unwrap(), Admission::Lazy);
        assert_eq!("eager".parse::<Admission>().unwrap(), Admission::Eager);
        assert!("sometimes".parse::<Admission>().is_err());
    }

    #[test]
    fn failed_response_into_result() {
        let res = Response {
            error: Some(TransferError::new(7)),
            ..Response::default()
        };

        assert!(matches!(res.into_result(), Err(Error::Transfer(e)) if e.code == 7));
        assert!(Response::with_status(200).into_result().is_ok());
    }
}
