//! Feed Supervisor - Lifecycle Management for Price Sources
//!
//! Runs every configured `PriceSource` in its own tokio task and restarts
//! a source that gives up, after a fixed backoff. A crash is reported to
//! the router as a Disconnected signal so routing reacts immediately
//! instead of waiting for the message timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::domain::price::DataSource;
use crate::ports::price_source::PriceSource;
use crate::usecases::ingest::IngestHandle;

/// Tracks the state of a single feed task.
#[derive(Debug)]
struct FeedStatus {
    name: &'static str,
    source: DataSource,
    running: AtomicBool,
    restarts: AtomicU32,
}

/// Supervises all price source tasks.
pub struct FeedSupervisor {
    feeds: Vec<(Arc<dyn PriceSource>, Arc<FeedStatus>)>,
    ingest: IngestHandle,
    shutdown_tx: broadcast::Sender<()>,
    restart_backoff: Duration,
}

impl FeedSupervisor {
    pub fn new(
        ingest: IngestHandle,
        shutdown_tx: broadcast::Sender<()>,
        restart_backoff: Duration,
    ) -> Self {
        Self {
            feeds: Vec::new(),
            ingest,
            shutdown_tx,
            restart_backoff,
        }
    }

    /// Register a source to be spawned.
    pub fn add(&mut self, feed: Arc<dyn PriceSource>) {
        let status = Arc::new(FeedStatus {
            name: feed.name(),
            source: feed.source(),
            running: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
        });
        self.feeds.push((feed, status));
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Spawn all feed tasks and return join handles.
    #[instrument(skip(self))]
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.feeds.len());

        for (feed, status) in &self.feeds {
            let feed = Arc::clone(feed);
            let status = Arc::clone(status);
            let handle = self.ingest.for_source(status.source);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let backoff = self.restart_backoff;

            handles.push(tokio::spawn(async move {
                loop {
                    status.running.store(true, Ordering::Relaxed);
                    let outcome = feed.run(handle.clone(), shutdown_rx.resubscribe()).await;
                    status.running.store(false, Ordering::Relaxed);

                    match outcome {
                        Ok(()) => {
                            info!(feed = status.name, "Feed exited normally");
                            return;
                        }
                        Err(e) => {
                            let restarts = status.restarts.fetch_add(1, Ordering::Relaxed) + 1;
                            error!(
                                feed = status.name,
                                source = %status.source,
                                restarts,
                                error = %format!("{e:#}"),
                                "Feed crashed"
                            );
                            handle.disconnected(format!("{} adapter crashed: {e}", status.name));
                        }
                    }

                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        () = tokio::time::sleep(backoff) => {
                            warn!(feed = status.name, "Restarting feed");
                        }
                    }
                }
            }));
        }

        info!(feed_count = handles.len(), "Feed tasks spawned");
        handles
    }

    #[cfg(test)]
    fn is_running(&self, source: DataSource) -> bool {
        self.feeds
            .iter()
            .any(|(_, s)| s.source == source && s.running.load(Ordering::Relaxed))
    }

    /// Total restarts across all feeds.
    pub fn restart_count(&self) -> u32 {
        self.feeds
            .iter()
            .map(|(_, s)| s.restarts.load(Ordering::Relaxed))
            .sum()
    }
}
