use crate::{
    future::Resolver,
    message::{headers_from_lines, Admission, Chain, Response},
    transport::Completion,
};

/// Book-keeping for one submitted request.
pub(super) struct RequestEntry {
    pub serial: u64,
    pub url: String,
    pub admission: Admission,
    /// Raw header lines in the order they were received.
    pub header_lines: Vec<String>,
    pub body: Vec<u8>,
    pub then: Chain<Response>,
    pub resolver: Resolver<Response>,
}

/// Split `HTTP/1.1 200 OK` into its code and reason.
fn parse_status_line(line: &str) -> Option<(u16, Option<String>)> {
    let rest = line.strip_prefix("HTTP/")?;
    let mut parts = rest.splitn(3, ' ');
    let _version = parts.next()?;
    let code = parts.next()?.trim().parse().ok()?;
    let reason = parts
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    Some((code, reason))
}

impl RequestEntry {
    /// Turn a finished transfer into the response handed to the callbacks.
    pub fn into_response(self, completion: Completion) -> (Response, Chain<Response>, Resolver<Response>) {
        let effective_url = if completion.stats.url.is_empty() {
            self.url
        } else {
            completion.stats.url.clone()
        };

        let mut res = Response {
            effective_url: Some(effective_url),
            transfer_stats: completion.stats,
            ..Response::default()
        };

        match completion.result {
            Ok(()) => {
                // Every status line starts a new head: informational and
                // redirect heads are superseded by the last one.
                let start = self
                    .header_lines
                    .iter()
                    .rposition(|l| l.starts_with("HTTP/"));

                let fields = match start {
                    Some(i) => {
                        if let Some((code, reason)) = parse_status_line(&self.header_lines[i]) {
                            res.status = Some(code);
                            res.reason = reason;
                        }
                        &self.header_lines[i + 1..]
                    }
                    None => &self.header_lines[..],
                };

                res.headers = headers_from_lines(fields.iter().map(String::as_str));
                res.body = Some(self.body);
            }
            Err(e) => res.error = Some(e),
        }

        (res, self.then, self.resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_status_line, RequestEntry};
    use crate::{
        error::{code, TransferError},
        future::Future,
        message::{Admission, Chain, Response, TransferStats},
        transport::{Completion, Token},
    };

    fn entry(lines: &[&str], body: &[u8]) -> (RequestEntry, Future<Response>) {
        let fut = Future::new(|| Ok(Response::default()));
        let entry = RequestEntry {
            serial: 1,
            url: "http://example.com/".into(),
            admission: Admission::Eager,
            header_lines: lines.iter().map(|l| l.to_string()).collect(),
            body: body.to_vec(),
            then: Chain::default(),
            resolver: fut.resolver(),
        };

        (entry, fut)
    }

    fn completion(result: Result<(), TransferError>) -> Completion {
        Completion {
            token: Token { key: 0, serial: 1 },
            result,
            stats: TransferStats {
                url: "http://example.com/final".into(),
                http_code: 200,
                ..TransferStats::default()
            },
        }
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            parse_status_line("HTTP/1.1 404 Not Found"),
            Some((404, Some("Not Found".into())))
        );
        assert_eq!(parse_status_line("HTTP/1.1 204"), Some((204, None)));
        assert_eq!(parse_status_line("HTTP/2 200 "), Some((200, None)));
        assert_eq!(parse_status_line("Content-Type: text/plain"), None);
        assert_eq!(parse_status_line("HTTP/1.1 abc"), None);
    }

    #[test]
    fn builds_response_from_last_head() {
        let (entry, _fut) = entry(
            &[
                "HTTP/1.1 100 Continue",
                "HTTP/1.1 200 OK",
                "Content-Type: text/plain",
                "X-Foo: a",
                "X-Foo: b",
            ],
            b"hi",
        );

        let (res, chain, _) = entry.into_response(completion(Ok(())));

        assert_eq!(res.status, Some(200));
        assert_eq!(res.reason.as_deref(), Some("OK"));
        assert_eq!(res.headers["X-Foo"], vec!["a", "b"]);
        assert!(!res.headers.contains_key("HTTP/1.1 100 Continue"));
        assert_eq!(res.body.as_deref(), Some(&b"hi"[..]));
        assert_eq!(
            res.effective_url.as_deref(),
            Some("http://example.com/final")
        );
        assert!(res.error.is_none());
        assert!(chain.is_empty());
    }

    #[test]
    fn failed_transfer_carries_only_the_error() {
        let (entry, _fut) = entry(&["HTTP/1.1 200 OK"], b"partial");
        let err = TransferError::new(code::RECV_ERROR);

        let (res, _, _) = entry.into_response(completion(Err(err.clone())));

        assert_eq!(res.status, None);
        assert_eq!(res.body, None);
        assert!(res.headers.is_empty());
        assert_eq!(res.error, Some(err));
        assert_eq!(res.transfer_stats.http_code, 200);
    }
}
