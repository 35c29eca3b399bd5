//! Error types.
//!
//! Every fallible operation in trawl returns [Error]. The type is `Clone`
//! because a failed [Future](crate::future::Future) hands the same error back
//! on every call to `wait()`.
//!
//! Transfer failures reported by the native engine are the exception: they are
//! stored on the [Response](crate::message::Response) as a [TransferError]
//! rather than returned, so that a refused connection looks like any other
//! response to the caller.
use std::{io, rc::Rc};

/// Errors produced by futures and the multiplexer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The native transfer engine reported a non-success result.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The future was cancelled before it produced a value.
    #[error("future was cancelled")]
    Cancelled,

    /// The compute function returned without settling the future.
    #[error("waiting did not resolve future")]
    DerefFailure,

    /// A value or request did not have the required shape.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A future tried to resolve to itself.
    #[error("logic error: {0}")]
    Logic(String),

    /// I/O error while preparing a request.
    #[error("io error: {0}")]
    Io(Rc<io::Error>),

    /// Any other error raised by a compute function.
    #[error("{0}")]
    Other(Rc<dyn std::error::Error>),
}

impl Error {
    /// Wrap an arbitrary error so it can be cached by a future.
    pub fn other(err: impl std::error::Error + 'static) -> Self {
        Self::Other(Rc::new(err))
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns `true` for the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Rc::new(value))
    }
}

/// Classic libcurl result codes used by the bundled transports.
pub mod code {
    pub const UNSUPPORTED_PROTOCOL: i32 = 1;
    pub const URL_MALFORMAT: i32 = 3;
    pub const COULDNT_RESOLVE_HOST: i32 = 6;
    pub const COULDNT_CONNECT: i32 = 7;
    pub const WEIRD_SERVER_REPLY: i32 = 8;
    pub const OPERATION_TIMEDOUT: i32 = 28;
    pub const SEND_ERROR: i32 = 55;
    pub const RECV_ERROR: i32 = 56;

    /// Human-readable description of a result code, if it is a known one.
    pub fn describe(code: i32) -> Option<&'static str> {
        Some(match code {
            UNSUPPORTED_PROTOCOL => "Unsupported protocol",
            URL_MALFORMAT => "URL using bad/illegal format or missing URL",
            COULDNT_RESOLVE_HOST => "Couldn't resolve host name",
            COULDNT_CONNECT => "Couldn't connect to server",
            WEIRD_SERVER_REPLY => "Weird server reply",
            OPERATION_TIMEDOUT => "Timeout was reached",
            SEND_ERROR => "Failed sending data to the peer",
            RECV_ERROR => "Failure when receiving data from the peer",
            _ => return None,
        })
    }
}

/// A non-success result from the native transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transfer error {code}{}", message_suffix(.message))]
pub struct TransferError {
    /// The native result code.
    pub code: i32,
    /// A human-readable message, when one is available.
    pub message: Option<String>,
}

impl TransferError {
    /// Build an error for `code`, filling the message from [code::describe].
    pub fn new(code: i32) -> Self {
        Self {
            code,
            message: code::describe(code).map(str::to_owned),
        }
    }

    /// Build an error with an explicit message.
    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}
