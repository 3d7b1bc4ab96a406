// ABOUTME: Bounded per-bundle log history with live fanout to subscribers
// ABOUTME: Replay and registration share one lock so late joiners see no gap and no duplicate

use crate::providers::StreamType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Origin of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lines the engine writes itself (start, exit, stop failures)
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::System => "system",
        }
    }
}

impl From<StreamType> for LogSource {
    fn from(stream: StreamType) -> Self {
        match stream {
            StreamType::Stdout => LogSource::Stdout,
            StreamType::Stderr => LogSource::Stderr,
        }
    }
}

/// One line of bot output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub message: String,
}

/// Handle identifying one subscriber of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Inner {
    lines: VecDeque<LogLine>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<LogLine>>,
    next_id: u64,
    closed: bool,
}

/// Ring buffer of recent lines plus the set of live subscribers
pub struct LogBuffer {
    capacity: usize,
    replay_lines: usize,
    inner: Mutex<Inner>,
}

impl LogBuffer {
    pub fn new(capacity: usize, replay_lines: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            replay_lines: replay_lines.min(capacity),
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity.min(256)),
                subscribers: HashMap::new(),
                next_id: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking subscriber send cannot leave the buffer inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a line and deliver it to every current subscriber.
    ///
    /// Delivery failures are swallowed; the subscriber stays registered
    /// until it unsubscribes.
    pub fn append(&self, source: LogSource, message: impl Into<String>) -> LogLine {
        self.append_at(source, message, Utc::now())
    }

    /// Same as `append`, with the time the line was captured
    pub fn append_at(
        &self,
        source: LogSource,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> LogLine {
        let line = LogLine {
            timestamp,
            source,
            message: message.into(),
        };

        let mut inner = self.lock();
        if inner.lines.len() >= self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.clone());

        for (id, sender) in &inner.subscribers {
            if sender.send(line.clone()).is_err() {
                debug!("Log subscriber {:?} is gone, dropping line", id);
            }
        }

        line
    }

    /// Register a subscriber.
    ///
    /// Returns the replay (the most recent lines, oldest first) together with
    /// a receiver for every line appended afterwards. Subscribing to a closed
    /// buffer yields the replay and a receiver that ends immediately.
    pub fn subscribe(&self) -> (SubscriptionId, Vec<LogLine>, mpsc::UnboundedReceiver<LogLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;

        let skip = inner.lines.len().saturating_sub(self.replay_lines);
        let replay = inner.lines.iter().skip(skip).cloned().collect();

        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }

        (id, replay, rx)
    }

    /// Remove a subscriber. Returns false when it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    /// Drop every subscriber so their receivers end
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Copy of the full retained history
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lock().lines.iter().cloned().collect()
    }
}

/// Live view of one bundle's log: the replay captured on subscribe plus
/// every later line. Unsubscribes itself when dropped.
pub struct LogSubscription {
    id: SubscriptionId,
    replay: Vec<LogLine>,
    receiver: mpsc::UnboundedReceiver<LogLine>,
    buffer: Weak<LogBuffer>,
}

impl LogSubscription {
    pub fn attach(buffer: &Arc<LogBuffer>) -> Self {
        let (id, replay, receiver) = buffer.subscribe();
        Self {
            id,
            replay,
            receiver,
            buffer: Arc::downgrade(buffer),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Lines retained before this subscription started, oldest first
    pub fn replay(&self) -> &[LogLine] {
        &self.replay
    }

    pub fn take_replay(&mut self) -> Vec<LogLine> {
        std::mem::take(&mut self.replay)
    }

    /// Next live line, or `None` once the buffer is closed
    pub async fn recv(&mut self) -> Option<LogLine> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogLine> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.upgrade() {
            buffer.unsubscribe(self.id);
        }
    }
}

/// Pending partial lines above this size are flushed as a line of their own
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// Turns arbitrarily chunked output into complete lines
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(self.take());
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_PENDING_BYTES {
                    lines.push(self.take_complete());
                }
            }
        }
        lines
    }

    /// Flush whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// Flush the pending bytes, keeping back a character cut off at the end
    fn take_complete(&mut self) -> String {
        let cut = char_boundary(&self.pending);
        let rest = self.pending.split_off(cut);
        let line = self.take();
        self.pending = rest;
        line
    }

    fn take(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence
fn char_boundary(bytes: &[u8]) -> usize {
    let tail = bytes.len().saturating_sub(3);
    for start in (tail..bytes.len()).rev() {
        if bytes[start] & 0xC0 != 0x80 {
            return match std::str::from_utf8(&bytes[start..]) {
                Err(e) if e.error_len().is_none() => start,
                _ => bytes.len(),
            };
        }
    }
    bytes.len()
}
