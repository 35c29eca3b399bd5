use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{error, info};
use trawl::{
    message::{header, Admission, Request},
    multi::{Config, Multiplexer},
    transport::socket::SocketTransport,
};

/// A trawl fetch example.
///
/// This example fetches every URL given on the command line concurrently and
/// prints the status line of each response.
#[derive(Parser, Debug)]
struct Args {
    /// Number of pending transfers that triggers a full drain.
    #[arg(short, long, default_value_t = 100)]
    max_handles: usize,

    /// Upper bound on a single readiness poll, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    select_timeout_ms: u64,

    /// When to start transfers: `eager` or `lazy`.
    #[arg(short, long, default_value = "eager", value_parser = parse_admission)]
    admission: Admission,

    /// Seconds allowed for each transfer.
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Print response bodies.
    #[arg(short, long)]
    body: bool,

    /// The URLs to fetch.
    #[arg(required = true)]
    urls: Vec<String>,
}

fn parse_admission(s: &str) -> Result<Admission, String> {
    s.parse().map_err(|e: trawl::error::Error| e.to_string())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let config = Config::default()
        .max_handles(args.max_handles)
        .select_timeout(Duration::from_millis(args.select_timeout_ms));

    let mux = Multiplexer::with_config(
        SocketTransport::new().context("Could not create socket transport")?,
        config,
    );

    let mut pending = Vec::new();

    for url in &args.urls {
        let mut req = Request::get(url.as_str())
            .header("User-Agent", "trawl-fetch")
            .admission(args.admission);

        if let Some(t) = args.timeout {
            req = req.option("timeout", t.to_string());
        }

        let fut = mux
            .submit(req)
            .map_err(|e| anyhow!("Could not submit {url}: {e}"))?;

        pending.push((url, fut));
    }

    for (url, fut) in pending {
        let res = fut
            .wait()
            .map_err(|e| anyhow!("Could not fetch {url}: {e}"))?;

        if let Some(e) = &res.error {
            error!("{url}: {e}");
            continue;
        }

        println!(
            "{url}: {} {} ({} bytes, {:?})",
            res.status.unwrap_or_default(),
            res.reason.as_deref().unwrap_or(""),
            res.transfer_stats.size_download,
            res.transfer_stats.total_time,
        );

        if let Some(ty) = header(&res.headers, "content-type") {
            info!("{url}: content-type {ty}");
        }

        if args.body {
            if let Some(body) = &res.body {
                println!("{}", String::from_utf8_lossy(body));
            }
        }
    }

    Ok(())
}
