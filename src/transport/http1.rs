//! Just enough HTTP/1.1 to run a transfer: URL splitting, request
//! serialization, and an incremental reader that knows where a response ends.
use super::{Delivery, Token};
use crate::{
    error::{code, TransferError},
    message::{has_header, Headers},
};

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Target {
    pub host: String,
    pub port: u16,
    /// `host[:port]` as written in the URL.
    pub authority: String,
    /// Path and query.
    pub path: String,
}

pub(super) fn parse_url(url: &str) -> Result<Target, TransferError> {
    let malformed = || TransferError::with_message(code::URL_MALFORMAT, format!("malformed url {url:?}"));

    let (scheme, rest) = url.split_once("://").ok_or_else(malformed)?;

    if !scheme.eq_ignore_ascii_case("http") {
        return Err(TransferError::with_message(
            code::UNSUPPORTED_PROTOCOL,
            format!("protocol \"{scheme}\" not supported"),
        ));
    }

    let rest = rest.split('#').next().unwrap_or_default();
    let split = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(split);
    let authority = authority.rsplit('@').next().unwrap_or_default();

    if authority.is_empty() {
        return Err(malformed());
    }

    let (host, port) = match authority.strip_prefix('[') {
        Some(v6) => {
            let (host, tail) = v6.split_once(']').ok_or_else(malformed)?;
            (host, tail.strip_prefix(':'))
        }
        None => match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        },
    };

    let port = match port {
        Some(p) => p.parse().map_err(|_| malformed())?,
        None => 80,
    };

    let path = match path {
        "" => "/".to_string(),
        p if p.starts_with('?') => format!("/{p}"),
        p => p.to_string(),
    };

    Ok(Target {
        host: host.to_string(),
        port,
        authority: authority.to_string(),
        path,
    })
}

pub(super) fn serialize_request(
    method: &str,
    target: &Target,
    headers: &Headers,
    body: &[u8],
) -> Vec<u8> {
    let mut req = Vec::with_capacity(256 + body.len());
    req.extend_from_slice(method.as_bytes());
    req.push(b' ');
    req.extend_from_slice(target.path.as_bytes());
    req.extend_from_slice(b" HTTP/1.1\r\n");

    if !has_header(headers, "host") {
        req.extend_from_slice(b"Host: ");
        req.extend_from_slice(target.authority.as_bytes());
        req.extend_from_slice(b"\r\n");
    }

    for (name, values) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }

        for value in values {
            req.extend_from_slice(name.as_bytes());
            req.extend_from_slice(b": ");
            req.extend_from_slice(value.as_bytes());
            req.extend_from_slice(b"\r\n");
        }
    }

    if !body.is_empty() {
        req.extend_from_slice(b"Content-Length: ");
        req.extend_from_slice(body.len().to_string().as_bytes());
        req.extend_from_slice(b"\r\n");
    }

    if !has_header(headers, "connection") {
        req.extend_from_slice(b"Connection: close\r\n");
    }

    req.extend_from_slice(b"\r\n");
    req.extend_from_slice(body);

    req
}

/// Find the position of `\r\n\r\n` in data, returns index of the first `\r`.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

struct Head {
    status: u16,
    lines: Vec<String>,
    content_length: Option<usize>,
    chunked: bool,
}

fn parse_head(data: &[u8]) -> Option<Head> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?;

    if !version.starts_with("HTTP/") {
        return None;
    }

    let status = parts.next()?.parse().ok()?;

    let mut head = Head {
        status,
        lines: vec![status_line.to_string()],
        content_length: None,
        chunked: false,
    };

    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let (name, value) = (name.trim(), value.trim());

            if name.eq_ignore_ascii_case("content-length") {
                head.content_length = Some(value.parse().ok()?);
            }

            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                head.chunked = true;
            }
        }

        head.lines.push(line.to_string());
    }

    Some(head)
}

enum ChunkResult {
    Data { start: usize, end: usize, consumed: usize },
    Last,
    NeedMore,
    Invalid,
}

fn decode_chunk(data: &[u8]) -> ChunkResult {
    let Some(crlf) = find_crlf(data) else {
        return ChunkResult::NeedMore;
    };

    let size = std::str::from_utf8(&data[..crlf])
        .ok()
        .and_then(|line| line.split(';').next())
        .and_then(|hex| usize::from_str_radix(hex.trim(), 16).ok());

    let Some(size) = size else {
        return ChunkResult::Invalid;
    };

    if size == 0 {
        return ChunkResult::Last;
    }

    let start = crlf + 2;
    let Some((end, consumed)) = start
        .checked_add(size)
        .and_then(|end| Some((end, end.checked_add(2)?)))
    else {
        return ChunkResult::Invalid;
    };

    if data.len() < consumed {
        return ChunkResult::NeedMore;
    }

    ChunkResult::Data {
        start,
        end,
        consumed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(usize),
    Chunked,
    UntilClose,
    Done,
}

/// Incremental response reader.
///
/// Bytes read from the socket are fed in as they arrive; header lines and
/// decoded body chunks come out as [Delivery] values.
pub(super) struct ResponseReader {
    buf: Vec<u8>,
    state: State,
    head_request: bool,
    status: u16,
}

impl ResponseReader {
    pub fn new(head_request: bool) -> Self {
        Self {
            buf: Vec::new(),
            state: State::Head,
            head_request,
            status: 0,
        }
    }

    /// Status code of the final response head, `0` before it was read.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed received bytes. Returns `true` once the response is complete.
    pub fn feed(
        &mut self,
        data: &[u8],
        token: Token,
        out: &mut Vec<Delivery>,
    ) -> Result<bool, TransferError> {
        self.buf.extend_from_slice(data);

        loop {
            match self.state {
                State::Head => {
                    let Some(end) = find_header_end(&self.buf) else {
                        break;
                    };

                    let head = parse_head(&self.buf[..end])
                        .ok_or_else(|| TransferError::new(code::WEIRD_SERVER_REPLY))?;
                    self.buf.drain(..end + 4);

                    // Interim responses carry no body and are followed by the real one.
                    if (100..200).contains(&head.status) {
                        continue;
                    }

                    self.status = head.status;
                    out.extend(head.lines.into_iter().map(|l| Delivery::Header(token, l)));

                    self.state = if self.head_request || matches!(head.status, 204 | 304) {
                        State::Done
                    } else if head.chunked {
                        State::Chunked
                    } else if let Some(len) = head.content_length {
                        State::Length(len)
                    } else {
                        State::UntilClose
                    };

                    if self.state == State::Length(0) {
                        self.state = State::Done;
                    }
                }
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        break;
                    }

                    let n = remaining.min(self.buf.len());
                    out.push(Delivery::Body(token, self.buf.drain(..n).collect()));

                    self.state = match remaining - n {
                        0 => State::Done,
                        rem => State::Length(rem),
                    };
                }
                State::Chunked => match decode_chunk(&self.buf) {
                    ChunkResult::Data {
                        start,
                        end,
                        consumed,
                    } => {
                        out.push(Delivery::Body(token, self.buf[start..end].to_vec()));
                        self.buf.drain(..consumed);
                    }
                    ChunkResult::Last => {
                        self.buf.clear();
                        self.state = State::Done;
                    }
                    ChunkResult::NeedMore => break,
                    ChunkResult::Invalid => {
                        return Err(TransferError::with_message(
                            code::RECV_ERROR,
                            "invalid chunk size",
                        ))
                    }
                },
                State::UntilClose => {
                    if !self.buf.is_empty() {
                        out.push(Delivery::Body(token, std::mem::take(&mut self.buf)));
                    }
                    break;
                }
                State::Done => break,
            }
        }

        Ok(self.is_done())
    }

    /// The peer closed the connection.
    pub fn eof(&mut self) -> Result<(), TransferError> {
        match self.state {
            State::Done => Ok(()),
            State::UntilClose => {
                self.state = State::Done;
                Ok(())
            }
            State::Head if self.status == 0 && self.buf.is_empty() => Err(
                TransferError::with_message(code::RECV_ERROR, "Empty reply from server"),
            ),
            _ => Err(TransferError::with_message(
                code::RECV_ERROR,
                "transfer closed with outstanding read data remaining",
            )),
        }
    }
}
