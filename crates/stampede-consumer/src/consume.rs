use std::io;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;

#[derive(Debug, Deserialize)]
struct Item {
    result: String,
}

/// Totals over all streams of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub streams: usize,
    pub items: usize,
    pub failures: usize,
}

/// Reads one stream to its end, returning the number of items received.
async fn consume_stream(client: &reqwest::Client, url: &str, stream: usize) -> Result<usize> {
    let response = client
        .get(url)
        .send()
        .await
        .context("failed to open stream")?
        .error_for_status()?;

    let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
    let mut lines = body.lines();
    let mut items = 0;

    while let Some(line) = lines.next_line().await.context("stream broke off")? {
        if line.is_empty() {
            continue;
        }
        let item: Item = serde_json::from_str(&line).context("malformed stream item")?;
        items += 1;
        tracing::debug!(stream, items, len = item.result.len(), "Received item");
    }

    Ok(items)
}

/// Runs `consumers` streams against `url` concurrently.
pub async fn run(url: &str, consumers: usize) -> Result<Summary> {
    let client = reqwest::Client::new();
    let mut streams = JoinSet::new();

    for stream in 0..consumers {
        let client = client.clone();
        let url = url.to_owned();
        streams.spawn(async move { (stream, consume_stream(&client, &url, stream).await) });
    }

    let mut summary = Summary::default();
    while let Some(joined) = streams.join_next().await {
        let (stream, result) = joined.context("stream task panicked")?;
        summary.streams += 1;
        match result {
            Ok(items) => {
                tracing::info!(stream, items, "Stream finished");
                summary.items += items;
            }
            Err(err) => {
                tracing::error!(stream, "Stream failed: {err:#}");
                summary.failures += 1;
            }
        }
    }

    Ok(summary)
}
