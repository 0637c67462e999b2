//! Ingest - Bounded Queues Between Adapters and the Router
//!
//! Each source gets its own bounded queue. A full queue drops its oldest
//! message instead of blocking the producer, and counts the drop.
//! Connectivity signals travel on a separate unbounded channel so they are
//! never lost behind a burst of messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::domain::health::ConnectivitySignal;
use crate::domain::price::{DataSource, RawMessage};

/// Drop-oldest queue for one source.
#[derive(Debug)]
pub struct IngestQueue {
  source: DataSource,
  capacity: usize,
  buffer: Mutex<VecDeque<RawMessage>>,
  /// Wakes the consumer; holds a permit when nobody is waiting.
  notify: Notify,
  dropped: AtomicU64,
}

impl IngestQueue {
  pub fn new(source: DataSource, capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      source,
      capacity,
      buffer: Mutex::new(VecDeque::with_capacity(capacity)),
      notify: Notify::new(),
      dropped: AtomicU64::new(0),
    }
  }

  pub const fn source(&self) -> DataSource {
    self.source
  }

  pub const fn capacity(&self) -> usize {
    self.capacity
  }

  /// Enqueue without blocking. Returns `true` if an older message was
  /// evicted to make room.
  pub fn push(&self, raw: RawMessage) -> bool {
    let evicted = {
      let mut buffer = self.lock();
      let evicted = if buffer.len() >= self.capacity {
        buffer.pop_front()
      } else {
        None
      };
      buffer.push_back(raw);
      evicted
    };

    if let Some(old) = &evicted {
      let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
      debug!(
        source = %self.source,
        symbol = %old.symbol(),
        dropped_total = total,
        "Ingest queue full, dropped oldest message"
      );
    }
    self.notify.notify_one();
    evicted.is_some()
  }

  /// Take up to `max` messages, oldest first.
  pub fn drain(&self, max: usize) -> Vec<RawMessage> {
    let mut buffer = self.lock();
    let n = max.min(buffer.len());
    buffer.drain(..n).collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Messages evicted since creation.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Wait until a push happens (or already happened since the last wait).
  pub async fn wait(&self) {
    self.notify.notified().await;
  }

  /// Leave a wake-up permit behind, e.g. after a partial drain.
  pub fn rearm(&self) {
    self.notify.notify_one();
  }

  fn lock(&self) -> MutexGuard<'_, VecDeque<RawMessage>> {
    // Each critical section leaves the deque consistent, so a poisoned
    // lock is still safe to use.
    self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Producer side shared by all adapters.
#[derive(Debug, Clone)]
pub struct IngestHandle {
  primary: Arc<IngestQueue>,
  fallback: Arc<IngestQueue>,
  signals: mpsc::UnboundedSender<ConnectivitySignal>,
}

impl IngestHandle {
  /// Handle bound to one source.
  pub fn for_source(&self, source: DataSource) -> SourceHandle {
    let queue = match source {
      DataSource::Primary => Arc::clone(&self.primary),
      DataSource::Fallback => Arc::clone(&self.fallback),
    };
    SourceHandle {
      source,
      queue,
      signals: self.signals.clone(),
    }
  }
}

/// Producer handle for a single source.
#[derive(Debug, Clone)]
pub struct SourceHandle {
  source: DataSource,
  queue: Arc<IngestQueue>,
  signals: mpsc::UnboundedSender<ConnectivitySignal>,
}

impl SourceHandle {
  pub const fn source(&self) -> DataSource {
    self.source
  }

  /// Enqueue a parsed message. Never blocks.
  pub fn push(&self, raw: RawMessage) {
    trace!(source = %self.source, symbol = %raw.symbol(), kind = raw.kind(), "Enqueue");
    self.queue.push(raw);
  }

  pub fn connected(&self) {
    self.signal(ConnectivitySignal::connected(self.source));
  }

  pub fn disconnected(&self, detail: impl Into<String>) {
    self.signal(ConnectivitySignal::disconnected(self.source, detail));
  }

  pub fn error(&self, detail: impl Into<String>) {
    self.signal(ConnectivitySignal::error(self.source, detail));
  }

  /// Whether the router is gone.
  pub fn is_closed(&self) -> bool {
    self.signals.is_closed()
  }

  fn signal(&self, signal: ConnectivitySignal) {
    if self.signals.send(signal).is_err() {
      debug!(source = %self.source, "Router stopped, connectivity signal discarded");
    }
  }
}

/// Consumer side, owned by the router task.
#[derive(Debug)]
pub struct IngestReceiver {
  pub primary: Arc<IngestQueue>,
  pub fallback: Arc<IngestQueue>,
  pub signals: mpsc::UnboundedReceiver<ConnectivitySignal>,
}

impl IngestReceiver {
  pub fn queue(&self, source: DataSource) -> &IngestQueue {
    match source {
      DataSource::Primary => &self.primary,
      DataSource::Fallback => &self.fallback,
    }
  }

  /// Whether both queues are empty.
  pub fn is_idle(&self) -> bool {
    self.primary.is_empty() && self.fallback.is_empty()
  }
}

/// Create the producer and consumer ends with `capacity` slots per source.
pub fn channel(capacity: usize) -> (IngestHandle, IngestReceiver) {
  let primary = Arc::new(IngestQueue::new(DataSource::Primary, capacity));
  let fallback = Arc::new(IngestQueue::new(DataSource::Fallback, capacity));
  let (signals_tx, signals_rx) = mpsc::unbounded_channel();

  (
    IngestHandle {
      primary: Arc::clone(&primary),
      fallback: Arc::clone(&fallback),
      signals: signals_tx,
    },
    IngestReceiver {
      primary,
      fallback,
      signals: signals_rx,
    },
  )
}
