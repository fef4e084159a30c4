use std::collections::VecDeque;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use super::{ProgressEvent, SessionId, SessionStore};

/// One subscriber's view of a session's progress log.
///
/// Delivers every event from the starting index in order, without gaps or
/// repeats, and ends after the terminal event or at the deadline.
/// Dropping it unsubscribes.
pub struct Subscription {
    store: SessionStore,
    session: SessionId,
    next: usize,
    backlog: VecDeque<ProgressEvent>,
    receiver: broadcast::Receiver<ProgressEvent>,
    deadline: Instant,
    finished: bool,
}

impl Subscription {
    pub(super) fn new(
        store: SessionStore,
        session: SessionId,
        from: usize,
        backlog: Vec<ProgressEvent>,
        receiver: broadcast::Receiver<ProgressEvent>,
        deadline: Instant,
    ) -> Self {
        Self {
            store,
            session,
            next: from,
            backlog: backlog.into(),
            receiver,
            deadline,
            finished: false,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    fn deliver(&mut self, event: ProgressEvent) -> Option<ProgressEvent> {
        if event.index < self.next {
            return None;
        }
        self.next = event.index + 1;
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Re-read the log from the next undelivered index.
    fn refill(&mut self) -> bool {
        match self.store.events_since(&self.session, self.next) {
            Some(events) => {
                self.backlog.extend(events);
                true
            }
            None => false,
        }
    }

    /// Next event, or `None` when the stream is over.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(event) = self.backlog.pop_front() {
                if let Some(event) = self.deliver(event) {
                    return Some(event);
                }
                continue;
            }

            match tokio::time::timeout_at(self.deadline, self.receiver.recv()).await {
                Err(_) => {
                    tracing::debug!(session_id = %self.session, next = self.next, "Progress stream timed out");
                    self.finished = true;
                }
                Ok(Ok(event)) => {
                    if let Some(event) = self.deliver(event) {
                        return Some(event);
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(session_id = %self.session, skipped, "Subscriber lagged, re-reading log");
                    self.refill();
                }
                Ok(Err(RecvError::Closed)) => {
                    // Session evicted; drain whatever is still readable.
                    if !self.refill() || self.backlog.is_empty() {
                        self.finished = true;
                    }
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next_event()
                .await
                .map(|event| (event, subscription))
        })
    }
}
