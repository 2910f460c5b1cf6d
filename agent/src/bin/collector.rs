/// Collector side of the port transport.
///
/// Reads a protocol stream from the file given as the only argument (stdin
/// otherwise), keeps the latest change per logical key and prints every
/// namespace's `[key, display]` pairs as JSON once the stream ends.
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_subscriber::EnvFilter;

use confwatch::collector::Collector;
use confwatch::config::DEFAULT_LOG_LEVEL;
use confwatch::event::{ChangeEvent, Namespace};
use confwatch::protocol::{StreamDecoder, WireMessage};

const READ_BUF: usize = 8192;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let input = std::env::args_os().nth(1).map(PathBuf::from);
    let mut collector = Collector::new();

    let result = match &input {
        Some(path) => match tokio::fs::File::open(path).await {
            Ok(file) => ingest(file, &mut collector).await,
            Err(e) => Err(e).with_context(|| format!("failed to open {}", path.display())),
        },
        None => ingest(tokio::io::stdin(), &mut collector).await,
    };
    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }

    println!("{}", Value::Object(dump(&collector)));
}

/// Feeds the whole stream into `collector`. Returns the number of stored
/// changes.
async fn ingest<R: AsyncRead + Unpin>(mut reader: R, collector: &mut Collector) -> Result<usize> {
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; READ_BUF];
    let mut stored = 0;
    loop {
        let n = reader.read(&mut buf).await.context("failed to read stream")?;
        if n == 0 {
            break;
        }
        for message in decoder.feed(&buf[..n]) {
            if accept(collector, &message) {
                stored += 1;
            }
        }
    }
    tracing::info!(stored, version = ?decoder.version(), "stream ended");
    Ok(stored)
}

fn accept(collector: &mut Collector, message: &str) -> bool {
    let wire: WireMessage = match serde_json::from_str(message) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("skipping undecodable message: {e}");
            return false;
        }
    };
    let Some(namespace) = Namespace::from_wire(&wire.ns) else {
        tracing::warn!("skipping message for unknown namespace {:?}", wire.ns);
        return false;
    };
    collector
        .handle(&ChangeEvent::new(namespace, wire.data))
        .is_some()
}

fn dump(collector: &Collector) -> Map<String, Value> {
    collector
        .namespaces()
        .map(|ns| {
            let pairs = collector
                .dump_all(ns)
                .into_iter()
                .map(|(key, display)| Value::Array(vec![Value::String(key), display]))
                .collect();
            (ns.as_str().to_string(), Value::Array(pairs))
        })
        .collect()
}
