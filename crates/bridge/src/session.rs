//! Session lifecycle and identity.
//!
//! A session binds one HTTP client to one stdio subprocess. The registry
//! allocates ids, tracks per-session state (queue, attached SSE sinks,
//! activity clock), enforces the session cap, and sweeps expired entries.
//! Destruction is announced over a typed event channel; the proxy core
//! observes it and kills the bound subprocess.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_sessions: usize,
    pub session_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Destroyed {
        session_id: String,
        handle_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLookupError {
    NotFound,
    Expired,
}

/// Where a server-initiated message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sse,
    Queued,
}

#[derive(Debug)]
struct SseSink {
    id: u64,
    tx: UnboundedSender<Value>,
}

/// Queue and sinks share one lock: the attach-time drain is atomic with
/// respect to concurrent dispatches, which is what keeps ordering and the
/// no-duplicate/no-drop guarantee.
#[derive(Debug)]
struct Channels {
    queue: VecDeque<Value>,
    sinks: Vec<SseSink>,
    next_sink_id: u64,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub server_name: String,
    pub created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    handle_id: RwLock<Option<String>>,
    initialized: AtomicBool,
    init_request_id: Mutex<Option<String>>,
    channels: Mutex<Channels>,
}

impl Session {
    fn new(server_name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            server_name: server_name.to_string(),
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            handle_id: RwLock::new(None),
            initialized: AtomicBool::new(false),
            init_request_id: Mutex::new(None),
            channels: Mutex::new(Channels {
                queue: VecDeque::new(),
                sinks: Vec::new(),
                next_sink_id: 0,
            }),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn expired(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn handle_id(&self) -> Option<String> {
        self.handle_id.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Flips false → true; later calls are no-ops.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Remember the id of the in-flight `initialize` request so its response
    /// can be recognized even after the HTTP waiter gave up.
    pub fn set_init_request_id(&self, id_key: String) {
        *self.init_request_id.lock() = Some(id_key);
    }

    /// True (once) if `id_key` is the pending initialize response id.
    pub fn take_init_request_id(&self, id_key: &str) -> bool {
        let mut pending = self.init_request_id.lock();
        if pending.as_deref() == Some(id_key) {
            *pending = None;
            true
        } else {
            false
        }
    }

    /// Deliver a server-initiated message: to the oldest live SSE sink if
    /// one is attached, otherwise onto the FIFO queue. Never duplicated
    /// across sinks.
    pub fn dispatch(&self, message: Value) -> Delivery {
        let mut channels = self.channels.lock();
        let mut message = Some(message);
        channels.sinks.retain(|sink| {
            let Some(msg) = message.take() else {
                return true;
            };
            match sink.tx.send(msg) {
                Ok(()) => true,
                Err(e) => {
                    // Receiver gone; reclaim the message and prune the sink.
                    message = Some(e.0);
                    false
                }
            }
        });
        match message {
            None => Delivery::Sse,
            Some(msg) => {
                channels.queue.push_back(msg);
                Delivery::Queued
            }
        }
    }

    /// Attach an SSE sink. Queued messages are flushed to it, in order,
    /// before anything that arrives after the attach.
    pub fn attach_sse(&self) -> (u64, UnboundedReceiver<Value>) {
        let mut channels = self.channels.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        for message in channels.queue.drain(..) {
            // Receiver is in hand; an unbounded send cannot fail here.
            let _ = tx.send(message);
        }
        channels.next_sink_id += 1;
        let sink_id = channels.next_sink_id;
        channels.sinks.push(SseSink { id: sink_id, tx });
        (sink_id, rx)
    }

    /// Idempotent.
    pub fn detach_sse(&self, sink_id: u64) {
        self.channels.lock().sinks.retain(|s| s.id != sink_id);
    }

    pub fn sse_count(&self) -> usize {
        self.channels.lock().sinks.len()
    }

    pub fn queue_len(&self) -> usize {
        self.channels.lock().queue.len()
    }

    /// Close every attached sink and drop queued messages.
    fn close(&self) {
        let mut channels = self.channels.lock();
        channels.sinks.clear();
        channels.queue.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub initialized: usize,
    pub active_last_minute: usize,
    pub sse_streams: usize,
    pub average_queue_length: f64,
    pub oldest_created_at: Option<DateTime<Utc>>,
    pub newest_created_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    by_handle: Arc<RwLock<HashMap<String, String>>>,
    events: UnboundedSender<RegistryEvent>,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings) -> (Self, UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: Arc::new(RwLock::new(HashMap::new())),
                by_handle: Arc::new(RwLock::new(HashMap::new())),
                events,
                settings,
            },
            rx,
        )
    }

    pub fn session_timeout(&self) -> Duration {
        self.settings.session_timeout
    }

    /// Create a session. At the cap, expired sessions are swept first; if
    /// the registry is still full the creation is rejected.
    pub fn create(&self, server_name: &str) -> Result<Arc<Session>, crate::error::BridgeError> {
        if self.sessions.read().len() >= self.settings.max_sessions {
            self.sweep_expired();
        }
        {
            let sessions = self.sessions.read();
            if sessions.len() >= self.settings.max_sessions {
                return Err(crate::error::BridgeError::Runtime(format!(
                    "session limit reached ({})",
                    self.settings.max_sessions
                )));
            }
        }

        let session = Arc::new(Session::new(server_name));
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        tracing::info!(session = %session.id, server = %server_name, "session created");
        Ok(session)
    }

    /// Look up a session, lazily evicting it when expired and refreshing
    /// its activity clock otherwise.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionLookupError> {
        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(SessionLookupError::NotFound)?;

        if session.expired(self.settings.session_timeout) {
            self.destroy(id);
            return Err(SessionLookupError::Expired);
        }

        session.touch();
        Ok(session)
    }

    pub fn bind_handle(&self, session: &Session, handle_id: &str) {
        *session.handle_id.write() = Some(handle_id.to_string());
        self.by_handle
            .write()
            .insert(handle_id.to_string(), session.id.clone());
    }

    pub fn session_for_handle(&self, handle_id: &str) -> Option<Arc<Session>> {
        let session_id = self.by_handle.read().get(handle_id).cloned()?;
        self.sessions.read().get(&session_id).cloned()
    }

    /// Destroy a session: close its SSE sinks, clear the queue, drop the
    /// registry entry, and announce it. Safe to call repeatedly.
    pub fn destroy(&self, id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        let handle_id = session.handle_id();
        if let Some(handle) = &handle_id {
            self.by_handle.write().remove(handle);
        }
        session.close();
        tracing::info!(session = %id, "session destroyed");
        let _ = self.events.send(RegistryEvent::Destroyed {
            session_id: id.to_string(),
            handle_id,
        });
        true
    }

    pub fn destroy_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.destroy(&id);
        }
    }

    pub fn sweep_expired(&self) -> usize {
        let timeout = self.settings.session_timeout;
        let expired: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.expired(timeout))
            .map(|(id, _)| id.clone())
            .collect();
        let count = expired.len();
        for id in &expired {
            tracing::info!(session = %id, "sweeping expired session");
            self.destroy(id);
        }
        count
    }

    /// Periodic expiry sweep, every `min(60 s, timeout / 2)`.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) {
        let registry = self.clone();
        let period = registry
            .settings
            .session_timeout
            .checked_div(2)
            .unwrap_or(Duration::from_secs(30))
            .min(Duration::from_secs(60))
            .max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_expired();
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read();
        let total = sessions.len();
        let mut initialized = 0;
        let mut active_last_minute = 0;
        let mut sse_streams = 0;
        let mut queued = 0usize;
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for session in sessions.values() {
            if session.is_initialized() {
                initialized += 1;
            }
            if session.idle_for() <= Duration::from_secs(60) {
                active_last_minute += 1;
            }
            sse_streams += session.sse_count();
            queued += session.queue_len();
            oldest = Some(oldest.map_or(session.created_at, |o| o.min(session.created_at)));
            newest = Some(newest.map_or(session.created_at, |n| n.max(session.created_at)));
        }

        RegistryStats {
            total,
            initialized,
            active_last_minute,
            sse_streams,
            average_queue_length: if total == 0 {
                0.0
            } else {
                queued as f64 / total as f64
            },
            oldest_created_at: oldest,
            newest_created_at: newest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(max: usize, timeout: Duration) -> SessionRegistry {
        SessionRegistry::new(SessionSettings {
            max_sessions: max,
            session_timeout: timeout,
        })
        .0
    }

    #[test]
    fn create_and_get_refreshes_activity() {
        let registry = registry(10, Duration::from_secs(60));
        let session = registry.create("echo").expect("create");
        let found = registry.get(&session.id).expect("get");
        assert_eq!(found.id, session.id);
        assert!(matches!(
            registry.get("missing"),
            Err(SessionLookupError::NotFound)
        ));
    }

    #[tokio::test]
    async fn expired_session_is_lazily_evicted() {
        let registry = registry(10, Duration::from_millis(10));
        let session = registry.create("echo").expect("create");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            registry.get(&session.id),
            Err(SessionLookupError::Expired)
        ));
        // Gone after the eviction.
        assert!(matches!(
            registry.get(&session.id),
            Err(SessionLookupError::NotFound)
        ));
    }

    #[tokio::test]
    async fn capacity_sweeps_expired_before_rejecting() {
        let registry = registry(1, Duration::from_millis(10));
        let _stale = registry.create("echo").expect("create");
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The stale session is swept to make room.
        let fresh = registry.create("echo").expect("create after sweep");
        assert_eq!(registry.len(), 1);

        // A live session at the cap rejects the next create.
        let err = registry.create("echo").unwrap_err();
        assert!(err.to_string().contains("session limit"), "{err}");
        drop(fresh);
    }

    #[test]
    fn dispatch_queues_without_sink_and_attach_drains_in_order() {
        let registry = registry(10, Duration::from_secs(60));
        let session = registry.create("echo").expect("create");

        assert_eq!(session.dispatch(json!({"n": 1})), Delivery::Queued);
        assert_eq!(session.dispatch(json!({"n": 2})), Delivery::Queued);

        let (_sink, mut rx) = session.attach_sse();
        assert_eq!(session.dispatch(json!({"n": 3})), Delivery::Sse);

        assert_eq!(rx.try_recv().expect("queued 1"), json!({"n": 1}));
        assert_eq!(rx.try_recv().expect("queued 2"), json!({"n": 2}));
        assert_eq!(rx.try_recv().expect("live 3"), json!({"n": 3}));
    }

    #[test]
    fn dispatch_delivers_to_exactly_one_sink() {
        let registry = registry(10, Duration::from_secs(60));
        let session = registry.create("echo").expect("create");

        let (_a, mut rx_a) = session.attach_sse();
        let (_b, mut rx_b) = session.attach_sse();
        session.dispatch(json!({"n": 1}));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dead_sink_is_pruned_and_next_sink_gets_the_message() {
        let registry = registry(10, Duration::from_secs(60));
        let session = registry.create("echo").expect("create");

        let (_a, rx_a) = session.attach_sse();
        let (_b, mut rx_b) = session.attach_sse();
        drop(rx_a);

        assert_eq!(session.dispatch(json!({"n": 1})), Delivery::Sse);
        assert_eq!(rx_b.try_recv().expect("delivered"), json!({"n": 1}));
        assert_eq!(session.sse_count(), 1);
    }

    #[test]
    fn detach_is_idempotent() {
        let registry = registry(10, Duration::from_secs(60));
        let session = registry.create("echo").expect("create");
        let (sink, _rx) = session.attach_sse();
        session.detach_sse(sink);
        session.detach_sse(sink);
        assert_eq!(session.sse_count(), 0);
    }

    #[test]
    fn destroy_closes_sinks_and_emits_event() {
        let (registry, mut events) = SessionRegistry::new(SessionSettings {
            max_sessions: 10,
            session_timeout: Duration::from_secs(60),
        });
        let session = registry.create("echo").expect("create");
        registry.bind_handle(&session, "session-x");
        let (_sink, mut rx) = session.attach_sse();

        assert!(registry.destroy(&session.id));
        assert!(rx.try_recv().is_err());
        assert!(registry.session_for_handle("session-x").is_none());

        let RegistryEvent::Destroyed {
            session_id,
            handle_id,
        } = events.try_recv().expect("destroyed event");
        assert_eq!(session_id, session.id);
        assert_eq!(handle_id.as_deref(), Some("session-x"));

        // Destruction is idempotent.
        assert!(!registry.destroy(&session.id));
    }

    #[test]
    fn stats_reflect_sessions() {
        let registry = registry(10, Duration::from_secs(60));
        let a = registry.create("echo").expect("create");
        let b = registry.create("echo").expect("create");
        a.mark_initialized();
        b.dispatch(json!({"n": 1}));
        let (_sink, _rx) = a.attach_sse();

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.initialized, 1);
        assert_eq!(stats.active_last_minute, 2);
        assert_eq!(stats.sse_streams, 1);
        assert!((stats.average_queue_length - 0.5).abs() < f64::EPSILON);
        assert!(stats.oldest_created_at.is_some());
    }
}
