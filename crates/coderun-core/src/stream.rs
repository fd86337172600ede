use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::Stream;
use tokio::sync::watch;

use crate::{Event, EventKind, SessionId};

#[derive(Default)]
struct Buffer {
    events: Vec<Event>,
    closed: bool,
}

/// Append-only, per-session event log with live fan-out.
///
/// Events are numbered from 1 at publish time. Subscribers read straight
/// from the buffer by sequence number and park on a `watch` channel when
/// they have caught up, so any number of them can join at any point and
/// still see every event exactly once.
pub struct EventStream {
    session_id: SessionId,
    buffer: Mutex<Buffer>,
    wake: watch::Sender<()>,
}

impl EventStream {
    pub fn new(session_id: SessionId) -> Arc<Self> {
        let (wake, _) = watch::channel(());
        Arc::new(Self {
            session_id,
            buffer: Mutex::new(Buffer::default()),
            wake,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // A panic while holding the lock cannot leave the Vec half-pushed
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event. Returns `None` once the stream is closed.
    pub fn publish(&self, kind: EventKind, payload: impl Into<String>) -> Option<Event> {
        let event = {
            let mut buffer = self.lock();
            if buffer.closed {
                return None;
            }
            let event = Event {
                session_id: self.session_id,
                seq: buffer.events.len() as u64 + 1,
                kind,
                payload: payload.into(),
                timestamp: Utc::now(),
            };
            buffer.events.push(event.clone());
            event
        };
        self.wake.send_replace(());
        Some(event)
    }

    /// Mark the stream finished; subscriptions end after the last event
    pub fn close(&self) {
        self.lock().closed = true;
        self.wake.send_replace(());
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Sequence number of the newest event, 0 when empty
    pub fn last_seq(&self) -> u64 {
        self.lock().events.len() as u64
    }

    /// Snapshot of buffered events with `seq >= from`
    pub fn events_from(&self, from: u64) -> Vec<Event> {
        let start = from.max(1) as usize - 1;
        self.lock().events.get(start..).map(<[Event]>::to_vec).unwrap_or_default()
    }

    /// Follow the stream starting at `from` (0 and 1 both mean "from the beginning")
    pub fn subscribe(self: &Arc<Self>, from: u64) -> Subscription {
        Subscription {
            stream: Arc::clone(self),
            next_seq: from.max(1),
            wake: self.wake.subscribe(),
        }
    }
}

/// Cursor over an [`EventStream`]
pub struct Subscription {
    stream: Arc<EventStream>,
    next_seq: u64,
    wake: watch::Receiver<()>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.stream.session_id
    }

    /// Sequence number the next call to [`next`](Self::next) will return
    pub fn position(&self) -> u64 {
        self.next_seq
    }

    /// Next event, waiting for it if necessary. `None` once the stream is
    /// closed and fully read.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            // Mark the current version seen before checking the buffer so a
            // publish in between still wakes us below.
            self.wake.borrow_and_update();
            {
                let buffer = self.stream.lock();
                if let Some(event) = buffer.events.get(self.next_seq as usize - 1) {
                    self.next_seq += 1;
                    return Some(event.clone());
                }
                if buffer.closed {
                    return None;
                }
            }
            if self.wake.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Events available right now without waiting
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let ready = self.stream.events_from(self.next_seq);
        self.next_seq += ready.len() as u64;
        ready
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}
