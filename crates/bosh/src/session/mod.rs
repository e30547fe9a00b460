//! HTTP binding sessions.
//!
//! A session outlives the many short HTTP requests a client makes. It holds
//! open requests ("connections") until there is something to answer them
//! with, and buffers outbound stanzas while no request is open. At no point
//! are both the buffer and the connection queue non-empty.

mod manager;
mod timer;

pub use manager::{SessionManager, SessionStats, DEFAULT_HOLD, DEFAULT_WAIT};
pub use timer::InactivityTimer;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::body::{self, Stanza};
use crate::connection::Connection;
use crate::error::BoshError;
use crate::stream_id::StreamId;
use crate::substrate::FailoverDeliverer;

/// Transport parameters negotiated when the session was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Longest time, in seconds, a request may be held before answering.
    pub wait: u32,
    /// Most requests held at once. `None` (or zero) means no bound.
    pub hold: Option<u32>,
    pub language: String,
    /// Session was started over a secure channel.
    pub secure: bool,
    /// Shortest time allowed between two polls.
    pub max_polling_interval: Duration,
    /// Silence after which the session is evicted.
    pub inactivity_timeout: Duration,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            wait: 60,
            hold: None,
            language: body::DEFAULT_LANGUAGE.to_string(),
            secure: false,
            max_polling_interval: Duration::ZERO,
            inactivity_timeout: Duration::from_secs(1800),
        }
    }
}

/// Observer of session lifecycle events.
///
/// Connection events are delivered while the session is locked, in the order
/// the queue changed. Implementations may read [`Session::connection_count`]
/// and [`Session::is_closed`] but must not admit, deliver, or close from a
/// connection callback. `session_closed` runs unlocked.
pub trait SessionListener: Send + Sync {
    fn connection_opened(&self, _session: &Arc<Session>, _rid: u64) {}
    fn connection_closed(&self, _session: &Arc<Session>, _rid: u64) {}
    fn session_closed(&self, _session: &Arc<Session>) {}
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Where an outbound stanza went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Answered the held request `rid`.
    Sent { rid: u64 },
    /// No usable request was held; kept for the next one.
    Buffered,
    /// The session is closed; the stanza went to the failover deliverer.
    Failover,
}

#[derive(Debug, Clone, Copy)]
enum ConnectionEvent {
    Opened(u64),
    Closed(u64),
}

#[derive(Debug, Default)]
struct SessionState {
    connections: VecDeque<Connection>,
    pending: Vec<Stanza>,
    last_poll: Option<Instant>,
    closed: bool,
}

type Listeners = Vec<(ListenerId, Arc<dyn SessionListener>)>;

/// One client's HTTP binding.
pub struct Session {
    stream_id: StreamId,
    params: SessionParams,
    failover: Arc<dyn FailoverDeliverer>,
    state: Mutex<SessionState>,
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
    // Mirrors of state, readable without the lock.
    open_connections: AtomicUsize,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        stream_id: StreamId,
        params: SessionParams,
        failover: Arc<dyn FailoverDeliverer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            params,
            failover,
            state: Mutex::new(SessionState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            open_connections: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn wait(&self) -> u32 {
        self.params.wait
    }

    /// Effective hold bound; `None` when unbounded.
    pub fn hold(&self) -> Option<u32> {
        self.params.hold.filter(|h| *h > 0)
    }

    pub fn language(&self) -> &str {
        &self.params.language
    }

    pub fn is_secure(&self) -> bool {
        self.params.secure
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.params.inactivity_timeout
    }

    pub fn max_polling_interval(&self) -> Duration {
        self.params.max_polling_interval
    }

    /// Number of held requests.
    pub fn connection_count(&self) -> usize {
        self.open_connections.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of stanzas waiting for the next request.
    pub fn pending_stanzas(&self) -> usize {
        self.lock_state().pending.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, listener));
        id
    }

    /// Returns false if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Admit a new request to the session.
    ///
    /// If stanzas are buffered they are flushed to `connection` at once and
    /// the connection is never queued. Otherwise the connection is held,
    /// evicting the oldest held ones first when the hold bound is reached.
    ///
    /// A poll (`is_poll`) closer than the polling interval to the previous
    /// one is a policy violation that should end the session. The poll
    /// timestamp is updated on every poll attempt, including rejected ones.
    pub fn admit(
        self: &Arc<Self>,
        mut connection: Connection,
        is_poll: bool,
    ) -> Result<(), BoshError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(BoshError::SessionClosed(self.stream_id.clone()));
        }

        if is_poll {
            self.check_polling_interval(&mut state)?;
        }

        if self.params.secure && !connection.is_secure() {
            warn!(
                stream_id = %self.stream_id,
                rid = connection.rid(),
                "Rejected insecure connection on secure session"
            );
            return Err(BoshError::insecure_connection());
        }

        connection.bind(&self.stream_id);
        let rid = connection.rid();
        let mut events = prune_abandoned(&mut state);

        if !state.pending.is_empty() {
            let payload = body::deliverable(&state.pending);
            if let Err(e) = connection.deliver_body(payload) {
                self.finish(&state, &events);
                return Err(e);
            }

            debug!(
                stream_id = %self.stream_id,
                rid = rid,
                stanzas = state.pending.len(),
                "Flushed buffered stanzas"
            );
            state.pending.clear();
            events.push(ConnectionEvent::Opened(rid));
            events.push(ConnectionEvent::Closed(rid));
        } else {
            if let Some(hold) = self.hold() {
                while state.connections.len() >= hold as usize {
                    let Some(mut oldest) = state.connections.pop_front() else {
                        break;
                    };
                    debug!(
                        stream_id = %self.stream_id,
                        rid = oldest.rid(),
                        "Hold exceeded, releasing oldest connection"
                    );
                    oldest.close_with(body::empty_body());
                    events.push(ConnectionEvent::Closed(oldest.rid()));
                }
            }
            state.connections.push_back(connection);
            events.push(ConnectionEvent::Opened(rid));
        }

        self.finish(&state, &events);
        Ok(())
    }

    /// Send a stanza to the client.
    ///
    /// Held requests are tried oldest first; ones that can no longer carry a
    /// response are released and skipped. With none left, the stanza is
    /// buffered for the next admitted request.
    pub fn deliver(self: &Arc<Self>, stanza: Stanza) -> Delivery {
        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            warn!(stream_id = %self.stream_id, "Delivery on closed session, using failover");
            self.failover.deliver(&self.stream_id, stanza);
            return Delivery::Failover;
        }

        let payload = body::deliverable(std::iter::once(&stanza));
        let mut events = Vec::new();
        let mut outcome = Delivery::Buffered;

        while let Some(mut connection) = state.connections.pop_front() {
            let rid = connection.rid();
            events.push(ConnectionEvent::Closed(rid));
            match connection.deliver_body(payload.clone()) {
                Ok(()) => {
                    outcome = Delivery::Sent { rid };
                    break;
                }
                Err(_) => {
                    debug!(stream_id = %self.stream_id, rid = rid, "Skipping consumed connection");
                }
            }
        }

        if outcome == Delivery::Buffered {
            state.pending.push(stanza);
            debug!(
                stream_id = %self.stream_id,
                buffered = state.pending.len(),
                "No open connection, buffered stanza"
            );
        }

        self.finish(&state, &events);
        outcome
    }

    /// Release held requests whose requester stopped waiting.
    ///
    /// Each released request is reported to listeners as closed. Returns how
    /// many were released.
    pub fn release_abandoned(self: &Arc<Self>) -> usize {
        let mut state = self.lock_state();
        if state.closed {
            return 0;
        }

        let events = prune_abandoned(&mut state);
        if !events.is_empty() {
            debug!(
                stream_id = %self.stream_id,
                released = events.len(),
                "Released abandoned connections"
            );
        }
        self.finish(&state, &events);
        events.len()
    }

    /// Terminate the session. Calling this again does nothing.
    ///
    /// Held requests are answered with a terminate body, buffered stanzas go
    /// to the failover deliverer, and every listener hears `session_closed`
    /// exactly once.
    pub fn close(self: &Arc<Self>, server_shutting_down: bool) {
        let (pending, held) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            self.closed.store(true, Ordering::Release);
            self.open_connections.store(0, Ordering::Release);
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.connections),
            )
        };

        let _span = tracing::info_span!(
            "bosh.session.close",
            stream_id = %self.stream_id,
            server_shutting_down = server_shutting_down,
        )
        .entered();

        let condition = server_shutting_down.then_some("system-shutdown");
        for mut connection in held {
            connection.close_with(body::terminate_body(condition));
        }

        if !pending.is_empty() {
            warn!(count = pending.len(), "Handing buffered stanzas to failover");
            for stanza in pending {
                self.failover.deliver(&self.stream_id, stanza);
            }
        }

        let listeners = std::mem::take(&mut *self.lock_listeners());
        for (_, listener) in &listeners {
            listener.session_closed(self);
        }

        info!("Session closed");
    }

    fn check_polling_interval(&self, state: &mut SessionState) -> Result<(), BoshError> {
        let now = Instant::now();
        match state.last_poll.replace(now) {
            Some(previous) if now.duration_since(previous) < self.params.max_polling_interval => {
                warn!(
                    stream_id = %self.stream_id,
                    since_last_ms = now.duration_since(previous).as_millis() as u64,
                    "Too frequent polling"
                );
                Err(BoshError::polling_too_frequent())
            }
            _ => Ok(()),
        }
    }

    /// Publish the queue size, then notify listeners of connection events.
    fn finish(self: &Arc<Self>, state: &SessionState, events: &[ConnectionEvent]) {
        self.open_connections
            .store(state.connections.len(), Ordering::Release);
        if events.is_empty() {
            return;
        }

        let listeners: Vec<_> = self
            .lock_listeners()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for event in events {
            for listener in &listeners {
                match *event {
                    ConnectionEvent::Opened(rid) => listener.connection_opened(self, rid),
                    ConnectionEvent::Closed(rid) => listener.connection_closed(self, rid),
                }
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop held requests nobody is waiting on any more.
fn prune_abandoned(state: &mut SessionState) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    state.connections.retain_mut(|connection| {
        if connection.is_abandoned() {
            connection.close();
            events.push(ConnectionEvent::Closed(connection.rid()));
            false
        } else {
            true
        }
    });
    events
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("stream_id", &self.stream_id)
            .field("params", &self.params)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
