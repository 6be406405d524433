//! Per-session event feed for reconnection support.
//!
//! Holds the session's unacknowledged events in sequence order and
//! publishes a cursor so any number of connections can replay from a
//! client-supplied point and then follow live events.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;

use crate::types::{Event, Session};

/// Snapshot of a feed's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedCursor {
    /// Highest sequence number pushed.
    pub head: u64,
    /// Highest sequence number acknowledged.
    pub acked: u64,
    /// Set once the session is closed or expired.
    pub closed: bool,
}

/// Ordered event feed for one session.
///
/// Only the session's single writer calls `push`, after the event has been
/// durably committed, so readers never observe an event the store could
/// lose.
pub struct EventFeed {
    pending: RwLock<VecDeque<Event>>,
    cursor: watch::Sender<FeedCursor>,
}

impl EventFeed {
    /// Create a feed seeded from a session's persisted state.
    #[must_use]
    pub fn new(session: &Session) -> Self {
        let (cursor, _) = watch::channel(FeedCursor {
            head: session.head(),
            acked: session.last_acked,
            closed: false,
        });
        Self {
            pending: RwLock::new(session.pending.iter().cloned().collect()),
            cursor,
        }
    }

    /// Append a committed event.
    pub fn push(&self, event: Event) {
        let seq = event.seq;
        {
            let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
            debug_assert!(pending.back().is_none_or(|last| last.seq + 1 == seq));
            pending.push_back(event);
        }
        self.cursor.send_modify(|c| c.head = c.head.max(seq));
    }

    /// Drop events up to and including `through`.
    pub fn ack(&self, through: u64) {
        {
            let mut pending = self.pending.write().unwrap_or_else(PoisonError::into_inner);
            while pending.front().is_some_and(|e| e.seq <= through) {
                pending.pop_front();
            }
        }
        self.cursor.send_modify(|c| c.acked = c.acked.max(through.min(c.head)));
    }

    /// Mark the feed closed; streams end once they drain what they can send.
    pub fn close(&self) {
        self.cursor.send_modify(|c| c.closed = true);
    }

    /// Resolves once the feed has been closed.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the wait cannot fail while borrowed.
        let _ = rx.wait_for(|c| c.closed).await;
    }

    /// Current cursor.
    #[must_use]
    pub fn cursor(&self) -> FeedCursor {
        *self.cursor.borrow()
    }

    /// Subscribe to cursor changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FeedCursor> {
        self.cursor.subscribe()
    }

    /// Up to `limit` pending events with sequence numbers greater than `from`.
    #[must_use]
    pub fn after(&self, from: u64, limit: usize) -> Vec<Event> {
        self.pending
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.seq > from)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of events awaiting acknowledgement.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stream that replays events after `from`, then follows live pushes.
    ///
    /// At most `window` events beyond the last acknowledgement are handed
    /// out; further events stay queued in the feed until an ack arrives.
    /// The stream yields one event per poll, so a slow consumer holds the
    /// feed back instead of buffering.
    #[must_use]
    pub fn replay_then_live(self: Arc<Self>, from: u64, window: usize) -> BoxStream<'static, Event> {
        let rx = self.subscribe();
        let state = Delivery {
            feed: self,
            rx,
            sent: from,
            window: u64::try_from(window.max(1)).unwrap_or(u64::MAX),
            buffer: VecDeque::new(),
        };

        stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.buffer.pop_front() {
                    st.sent = event.seq;
                    return Some((event, st));
                }

                let cur = *st.rx.borrow_and_update();
                // Events at or below the ack point are gone; resume after it.
                st.sent = st.sent.max(cur.acked);

                let room = (cur.acked + st.window).saturating_sub(st.sent);
                if st.sent < cur.head && room > 0 {
                    let limit = usize::try_from(room).unwrap_or(usize::MAX);
                    let batch = st.feed.after(st.sent, limit);
                    if !batch.is_empty() {
                        st.buffer.extend(batch);
                        continue;
                    }
                }

                if cur.closed {
                    return None;
                }
                if st.rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}

struct Delivery {
    feed: Arc<EventFeed>,
    rx: watch::Receiver<FeedCursor>,
    sent: u64,
    window: u64,
    buffer: VecDeque<Event>,
}
