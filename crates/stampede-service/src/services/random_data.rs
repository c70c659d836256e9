//! Fanning one stream request out into many coalesced fetches.

use std::sync::Arc;

use rand::seq::SliceRandom;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::fetcher::CoalescingFetcher;

/// Produces streams of response bodies for randomly picked upstream URLs.
#[derive(Debug, Clone)]
pub struct RandomDataService {
    fetcher: Arc<CoalescingFetcher>,
    urls: Arc<[String]>,
    number_of_requests: usize,
}

impl RandomDataService {
    pub fn new(fetcher: CoalescingFetcher, urls: Vec<String>, number_of_requests: usize) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            urls: urls.into(),
            number_of_requests,
        }
    }

    pub fn number_of_requests(&self) -> usize {
        self.number_of_requests
    }

    /// Starts one stream.
    ///
    /// Every one of the `number_of_requests` slots picks a URL uniformly at random and resolves
    /// it through the [`CoalescingFetcher`], concurrently with all other slots. Bodies arrive in
    /// completion order. Slots resolving to an error contribute nothing, so the stream yields at
    /// most `number_of_requests` items. It ends once every slot is done.
    ///
    /// Dropping the receiver cancels all outstanding slots.
    pub fn random_data_stream(&self) -> mpsc::Receiver<String> {
        // every slot publishes at most once, so sends never wait on the consumer
        let (output, receiver) = mpsc::channel(self.number_of_requests.max(1));

        let urls: Vec<String> = {
            let mut rng = rand::thread_rng();
            (0..self.number_of_requests)
                .filter_map(|_| self.urls.choose(&mut rng).cloned())
                .collect()
        };

        metric!(counter("fanout.streams") += 1);
        metric!(gauge("fanout.slots") = urls.len() as u64);
        tracing::debug!(slots = urls.len(), "Starting random data stream");

        let fetcher = self.fetcher.clone();
        tokio::spawn(
            fan_out(fetcher, urls, output).bind_hub(Hub::new_from_top(Hub::current())),
        );

        receiver
    }
}

async fn fan_out(fetcher: Arc<CoalescingFetcher>, urls: Vec<String>, output: mpsc::Sender<String>) {
    let mut slots = JoinSet::new();
    for url in urls {
        let fetcher = fetcher.clone();
        let output = output.clone();
        slots.spawn(
            async move { fetcher.fetch(&url, &output).await }
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
    }

    let mut finished = 0usize;
    loop {
        tokio::select! {
            biased;

            _ = output.closed() => {
                tracing::debug!(
                    outstanding = slots.len(),
                    "Stream closed by consumer, cancelling slots"
                );
                slots.abort_all();
                break;
            }
            joined = slots.join_next() => match joined {
                Some(Ok(resolution)) => {
                    finished += 1;
                    tracing::trace!(resolution = resolution.as_str(), "Slot finished");
                }
                Some(Err(err)) if err.is_panic() => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Fetch slot panicked"
                    );
                }
                Some(Err(_)) => {}
                None => break,
            },
        }
    }

    tracing::debug!(finished, "Random data stream finished");
}
