//! Live status push for a single work item.
//!
//! Viewers of the same work item share one poll task through [`StatusHub`].
//! The poll task re-reads the item on a fixed interval and broadcasts an
//! `update` on every tick until the item reaches a terminal status or the
//! read fails. Subscriptions are reference counted: the last viewer to
//! disconnect cancels the poll task.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::db::DbHandle;
use super::models::{WorkItem, WorkItemStatus};

/// Per-topic broadcast buffer. Slow viewers past this many ticks skip ahead.
const CHANNEL_CAPACITY: usize = 16;

/// Lower bound on the poll interval; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ── Event types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        status: WorkItemStatus,
        timestamp: String,
    },
    Update {
        status: WorkItemStatus,
        #[serde(rename = "workItem")]
        work_item: Box<WorkItem>,
        timestamp: String,
    },
    Complete {
        status: WorkItemStatus,
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl StreamEvent {
    fn status(status: WorkItemStatus) -> Self {
        Self::Status {
            status,
            timestamp: timestamp(),
        }
    }

    fn update(item: WorkItem) -> Self {
        Self::Update {
            status: item.status,
            work_item: Box::new(item),
            timestamp: timestamp(),
        }
    }

    fn complete(status: WorkItemStatus) -> Self {
        Self::Complete {
            status,
            timestamp: timestamp(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: timestamp(),
        }
    }

    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Update { .. } => "update",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// The channel closes after this event.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

// ── Hub ───────────────────────────────────────────────────────────────

struct Topic {
    tx: broadcast::Sender<StreamEvent>,
    subscribers: usize,
    generation: u64,
    poller: JoinHandle<()>,
}

struct HubInner {
    db: DbHandle,
    interval: Duration,
    topics: Mutex<HashMap<String, Topic>>,
    next_generation: AtomicU64,
}

impl HubInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the topic only if it is still the one identified by `generation`.
    fn remove_topic(&self, work_item_id: &str, generation: u64) -> Option<Topic> {
        let mut topics = self.topics();
        match topics.get(work_item_id) {
            Some(topic) if topic.generation == generation => topics.remove(work_item_id),
            _ => None,
        }
    }

    fn release(&self, work_item_id: &str, generation: u64) {
        let removed = {
            let mut topics = self.topics();
            let Some(topic) = topics.get_mut(work_item_id) else {
                return;
            };
            if topic.generation != generation {
                return;
            }
            topic.subscribers = topic.subscribers.saturating_sub(1);
            if topic.subscribers > 0 {
                return;
            }
            topics.remove(work_item_id)
        };
        // Abort outside the lock: the poller's lease takes it again on drop.
        if let Some(topic) = removed {
            topic.poller.abort();
            debug!(work_item_id, "Last viewer left; status poller cancelled");
        }
    }
}

/// Held by a poll task for its topic. The topic is removed when the lease
/// ends, including when the task panics or is aborted, so its sender is
/// dropped and viewers see the channel close.
struct TopicLease {
    hub: Weak<HubInner>,
    work_item_id: String,
    generation: u64,
}

impl TopicLease {
    fn end(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_topic(&self.work_item_id, self.generation);
        }
    }
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        self.end();
    }
}

/// Registry of per-work-item status topics.
#[derive(Clone)]
pub struct StatusHub {
    inner: Arc<HubInner>,
}

/// One viewer's handle on a topic. Dropping it releases the viewer.
pub struct Subscription {
    work_item_id: String,
    generation: u64,
    rx: broadcast::Receiver<StreamEvent>,
    hub: Weak<HubInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.release(&self.work_item_id, self.generation);
        }
    }
}

impl StatusHub {
    pub fn new(db: DbHandle, interval: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                db,
                interval: interval.max(MIN_POLL_INTERVAL),
                topics: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Join the topic for `work_item_id`, starting its poller if needed.
    pub fn subscribe(&self, work_item_id: &str) -> Subscription {
        let mut topics = self.inner.topics();
        if let Some(topic) = topics
            .get_mut(work_item_id)
            .filter(|topic| !topic.poller.is_finished())
        {
            topic.subscribers += 1;
            return Subscription {
                work_item_id: work_item_id.to_string(),
                generation: topic.generation,
                rx: topic.tx.subscribe(),
                hub: Arc::downgrade(&self.inner),
            };
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let lease = TopicLease {
            hub: Arc::downgrade(&self.inner),
            work_item_id: work_item_id.to_string(),
            generation,
        };
        let poller = tokio::spawn(poll_loop(
            lease,
            self.inner.db.clone(),
            tx.clone(),
            self.inner.interval,
        ));
        topics.insert(
            work_item_id.to_string(),
            Topic {
                tx,
                subscribers: 1,
                generation,
                poller,
            },
        );
        debug!(work_item_id, "Status poller started");
        Subscription {
            work_item_id: work_item_id.to_string(),
            generation,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live topics (one poll task each).
    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }

    pub fn subscriber_count(&self, work_item_id: &str) -> usize {
        self.inner
            .topics()
            .get(work_item_id)
            .map(|t| t.subscribers)
            .unwrap_or(0)
    }

    /// Event stream for one viewer.
    ///
    /// Starts with the current persisted status. An item that is already
    /// terminal yields `status` then `complete` and never joins a topic.
    pub async fn watch(&self, work_item_id: &str) -> BoxStream<'static, StreamEvent> {
        let id = work_item_id.to_string();
        let current = self.inner.db.call(move |db| db.get_work_item(&id)).await;
        match current {
            Ok(Some(item)) if item.status.is_terminal() => stream::iter(vec![
                StreamEvent::status(item.status),
                StreamEvent::complete(item.status),
            ])
            .boxed(),
            Ok(Some(item)) => {
                let subscription = self.subscribe(work_item_id);
                stream::once(async move { StreamEvent::status(item.status) })
                    .chain(live_events(subscription))
                    .boxed()
            }
            Ok(None) => {
                stream::iter(vec![StreamEvent::error(format!("Work item {} not found", work_item_id))])
                    .boxed()
            }
            Err(e) => {
                warn!(work_item_id, error = %e, "Initial status read failed");
                stream::iter(vec![StreamEvent::error(e.to_string())]).boxed()
            }
        }
    }
}

/// Forward broadcast events until a final event or the topic closes.
fn live_events(subscription: Subscription) -> impl Stream<Item = StreamEvent> + Send + 'static {
    stream::unfold(Some(subscription), |state| async move {
        let mut sub = state?;
        loop {
            match sub.rx.recv().await {
                Ok(event) => {
                    let next = if event.is_final() { None } else { Some(sub) };
                    return Some((event, next));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(work_item_id = %sub.work_item_id, skipped, "Viewer lagged; skipping ticks");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(work_item_id = %sub.work_item_id, "Status poller ended without a final event");
                    return Some((StreamEvent::error("Status stream closed unexpectedly"), None));
                }
            }
        }
    })
}

async fn poll_loop(
    lease: TopicLease,
    db: DbHandle,
    tx: broadcast::Sender<StreamEvent>,
    interval: Duration,
) {
    let work_item_id = lease.work_item_id.clone();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; viewers already got the initial status.
    ticker.tick().await;

    let final_events = loop {
        ticker.tick().await;
        let id = work_item_id.clone();
        match db.call(move |db| db.get_work_item(&id)).await {
            Ok(Some(item)) if item.status.is_terminal() => {
                let status = item.status;
                break vec![StreamEvent::update(item), StreamEvent::complete(status)];
            }
            Ok(Some(item)) => {
                let _ = tx.send(StreamEvent::update(item));
            }
            Ok(None) => {
                break vec![StreamEvent::error(format!(
                    "Work item {} not found",
                    work_item_id
                ))];
            }
            Err(e) => {
                warn!(work_item_id = %work_item_id, error = %e, "Status poll failed");
                break vec![StreamEvent::error(e.to_string())];
            }
        }
    };

    // Detach before the final send so no viewer joins after it.
    lease.end();
    for event in final_events {
        let _ = tx.send(event);
    }
    debug!(work_item_id = %work_item_id, "Status poller finished");
}

/// Wrap an event stream as a `text/event-stream` response.
pub fn sse_response(
    events: BoxStream<'static, StreamEvent>,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|e| {
            serde_json::json!({"type": "error", "message": e.to_string(), "timestamp": timestamp()})
                .to_string()
        });
        Ok(Event::default().event(event.name()).data(data))
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(keep_alive))
}
