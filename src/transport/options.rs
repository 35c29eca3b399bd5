//! Per-transfer options of the socket transport.
//!
//! Options arrive as strings in [ClientOptions::transport] and are applied
//! through a fixed table of handlers, one per key.
//!
//! [ClientOptions::transport]: crate::message::ClientOptions::transport
use std::{collections::BTreeMap, time::Duration};

use crate::error::Error;

#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct TransferOptions {
    /// Limit on the whole transfer.
    pub timeout: Option<Duration>,
    /// Limit on establishing the connection.
    pub connect_timeout: Option<Duration>,
    /// Log every step of the transfer at `debug` level.
    pub debug: bool,
}

type Handler = fn(&mut TransferOptions, &str) -> Result<(), Error>;

const HANDLERS: &[(&str, Handler)] = &[
    ("timeout", set_timeout),
    ("connect_timeout", set_connect_timeout),
    ("debug", set_debug),
];

fn set_timeout(o: &mut TransferOptions, v: &str) -> Result<(), Error> {
    o.timeout = Some(seconds("timeout", v)?);
    Ok(())
}

fn set_connect_timeout(o: &mut TransferOptions, v: &str) -> Result<(), Error> {
    o.connect_timeout = Some(seconds("connect_timeout", v)?);
    Ok(())
}

fn set_debug(o: &mut TransferOptions, v: &str) -> Result<(), Error> {
    o.debug = v
        .parse()
        .map_err(|_| Error::validation(format!("debug: expected a bool, got {v:?}")))?;
    Ok(())
}

fn seconds(key: &str, v: &str) -> Result<Duration, Error> {
    v.parse::<f64>()
        .ok()
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| Error::validation(format!("{key}: expected seconds, got {v:?}")))
}

pub(super) fn apply(options: &BTreeMap<String, String>) -> Result<TransferOptions, Error> {
    let mut opts = TransferOptions::default();

    for (key, value) in options {
        let (_, handler) = HANDLERS
            .iter()
            .find(|(name, _)| name == key)
            .ok_or_else(|| Error::validation(format!("unknown transport option {key:?}")))?;

        handler(&mut opts, value)?;
    }

    Ok(opts)
}
