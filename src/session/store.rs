use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::stream::Subscription;
use super::{EventKind, ProgressEvent, SessionId};
use crate::config::SessionSection;
use crate::errors::PipelineError;
use crate::files::FileChange;

const CHANNEL_CAPACITY: usize = 256;

struct SessionEntry {
    events: Vec<ProgressEvent>,
    next_index: usize,
    /// Set by `open`, cleared by `seal`.
    running: bool,
    sealed_at: Option<Instant>,
    pruned: bool,
    updated_at: Instant,
    files: Option<Arc<Vec<FileChange>>>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            events: Vec::new(),
            next_index: 0,
            running: false,
            sealed_at: None,
            pruned: false,
            updated_at: now,
            files: None,
            sender,
        }
    }

    fn push(&mut self, kind: EventKind) -> ProgressEvent {
        let event = ProgressEvent {
            index: self.next_index,
            kind,
        };
        self.next_index += 1;
        self.events.push(event.clone());
        self.updated_at = Instant::now();
        // No receivers is fine; late subscribers backfill from `events`.
        let _ = self.sender.send(event.clone());
        event
    }

    fn since(&self, from: usize) -> Vec<ProgressEvent> {
        self.events
            .iter()
            .filter(|e| e.index >= from)
            .cloned()
            .collect()
    }
}

/// Process-wide session state: one append-only progress log, one file set
/// and one broadcast channel per session.
///
/// Cheap to clone; all clones share the same map. A session is sealed by
/// its terminal event. After the grace window a sealed session keeps only
/// that terminal event; after the TTL the whole entry is evicted.
#[derive(Clone)]
pub struct SessionStore {
    entries: Arc<Mutex<HashMap<SessionId, SessionEntry>>>,
    grace: Duration,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::from_config(&SessionSection::default())
    }
}

impl SessionStore {
    pub fn new(grace: Duration, ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            grace,
            ttl,
        }
    }

    pub fn from_config(config: &SessionSection) -> Self {
        Self::new(config.grace(), config.ttl())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a session as running. A sealed session is reset for a fresh
    /// attempt, keeping its files and continuing its index sequence; a
    /// session that is still running is rejected.
    pub fn open(&self, id: &SessionId) -> Result<(), PipelineError> {
        let mut entries = self.lock();
        let now = Instant::now();
        let entry = entries.entry(id.clone()).or_insert_with(|| SessionEntry::new(now));
        if entry.running {
            return Err(PipelineError::validation(format!(
                "A build is already running for session {}",
                id
            )));
        }
        if entry.sealed_at.is_some() {
            let files = entry.files.take();
            let next_index = entry.next_index;
            *entry = SessionEntry::new(now);
            entry.files = files;
            entry.next_index = next_index;
        }
        entry.running = true;
        entry.updated_at = now;
        tracing::debug!(session_id = %id, "Session opened");
        Ok(())
    }

    /// Append an informational event. Returns `None` once the session is
    /// sealed; nothing follows a terminal event.
    pub fn append(&self, id: &SessionId, message: impl Into<String>) -> Option<ProgressEvent> {
        let message = message.into();
        let mut entries = self.lock();
        let entry = entries
            .entry(id.clone())
            .or_insert_with(|| SessionEntry::new(Instant::now()));
        if entry.sealed_at.is_some() {
            tracing::warn!(session_id = %id, %message, "Dropping progress after terminal event");
            return None;
        }
        let event = entry.push(EventKind::Info(message));
        tracing::debug!(session_id = %id, index = event.index, "Progress: {}", event.wire_message());
        Some(event)
    }

    /// Append the terminal event. Returns `None` if already sealed.
    pub fn seal(&self, id: &SessionId, terminal: EventKind) -> Option<ProgressEvent> {
        debug_assert!(!matches!(terminal, EventKind::Info(_)));
        let mut entries = self.lock();
        let entry = entries
            .entry(id.clone())
            .or_insert_with(|| SessionEntry::new(Instant::now()));
        if entry.sealed_at.is_some() {
            return None;
        }
        let event = entry.push(terminal);
        entry.running = false;
        entry.sealed_at = Some(Instant::now());
        tracing::info!(session_id = %id, index = event.index, "Session sealed: {}", event.wire_message());
        Some(event)
    }

    pub fn complete(&self, id: &SessionId, url: impl Into<String>) -> Option<ProgressEvent> {
        self.seal(id, EventKind::Complete { url: url.into() })
    }

    pub fn fail(&self, id: &SessionId, reason: impl Into<String>) -> Option<ProgressEvent> {
        self.seal(
            id,
            EventKind::Error {
                reason: reason.into(),
            },
        )
    }

    /// Replace the session's file set wholesale.
    pub fn put_files(&self, id: &SessionId, files: Vec<FileChange>) {
        let mut entries = self.lock();
        let entry = entries
            .entry(id.clone())
            .or_insert_with(|| SessionEntry::new(Instant::now()));
        tracing::debug!(session_id = %id, files = files.len(), "Session files stored");
        entry.files = Some(Arc::new(files));
        entry.updated_at = Instant::now();
    }

    /// Snapshot of the session's file set. Later `put_files` calls never
    /// mutate a snapshot already handed out.
    pub fn files(&self, id: &SessionId) -> Option<Arc<Vec<FileChange>>> {
        self.lock().get(id).and_then(|e| e.files.clone())
    }

    /// Events with `index >= from`, or `None` for an unknown session.
    pub fn events_since(&self, id: &SessionId, from: usize) -> Option<Vec<ProgressEvent>> {
        self.lock().get(id).map(|e| e.since(from))
    }

    pub fn is_sealed(&self, id: &SessionId) -> bool {
        self.lock().get(id).is_some_and(|e| e.sealed_at.is_some())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Follow a session from index `from`. Subscribing to a session nobody
    /// has written to yet creates it, so a client may connect before the
    /// build starts.
    pub fn subscribe(&self, id: &SessionId, from: usize, timeout: Duration) -> Subscription {
        let mut entries = self.lock();
        let entry = entries
            .entry(id.clone())
            .or_insert_with(|| SessionEntry::new(Instant::now()));
        // Snapshot and receiver are taken under one lock so no event falls
        // between them.
        let receiver = entry.sender.subscribe();
        let backlog = entry.since(from);
        drop(entries);

        tracing::debug!(session_id = %id, from, backlog = backlog.len(), "Subscriber attached");
        Subscription::new(
            self.clone(),
            id.clone(),
            from,
            backlog,
            receiver,
            Instant::now() + timeout,
        )
    }

    pub fn evict(&self, id: &SessionId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Session evicted");
        }
        removed
    }

    /// Apply the grace and TTL policies as of `now`. Returns the number of
    /// sessions removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|id, entry| {
            if now.saturating_duration_since(entry.updated_at) >= self.ttl && !entry.running {
                tracing::debug!(session_id = %id, "Session expired");
                return false;
            }
            if let Some(sealed_at) = entry.sealed_at
                && !entry.pruned
                && now.saturating_duration_since(sealed_at) >= self.grace
            {
                entry.events.retain(ProgressEvent::is_terminal);
                entry.pruned = true;
            }
            true
        });
        let removed = before - entries.len();
        if removed > 0 {
            tracing::info!(removed, remaining = entries.len(), "Session sweep");
        }
        removed
    }

    /// Run `sweep` every `interval` until the returned task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep(Instant::now());
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
