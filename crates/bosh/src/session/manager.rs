//! Session Manager
//!
//! Entry point of the HTTP binding. Creates sessions, resolves them by
//! stream id, admits follow-up requests, and keeps each session's
//! inactivity countdown in step with its held connections.
//!
//! Spans:
//! - `bosh.session.create` - Session creation
//! - `bosh.session.close` - Session termination (see [`Session::close`])
//! - `bosh.session.evict` - Inactivity eviction (see [`InactivityTimer`])

use boshconf::HttpBindConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Delivery, InactivityTimer, Session, SessionListener, SessionParams};
use crate::body::{CreationResponse, RequestBody, Stanza};
use crate::connection::{Connection, PendingResponse};
use crate::error::BoshError;
use crate::stream_id::{RandomStreamIdFactory, StreamId, StreamIdFactory};
use crate::substrate::{FailoverDeliverer, ServerSurrogate};

/// `wait` used when the client omits it or sends garbage.
pub const DEFAULT_WAIT: u32 = 60;
/// `hold` used when the client omits it or sends garbage.
pub const DEFAULT_HOLD: u32 = 1;

const MAX_STREAM_ID_ATTEMPTS: usize = 8;

type Registry = DashMap<StreamId, Arc<Session>>;

/// Statistics about live sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total number of sessions.
    pub total: usize,
    /// Sessions holding at least one request.
    pub connected: usize,
    /// Sessions holding none.
    pub idle: usize,
}

/// Registry and lifecycle driver for HTTP binding sessions.
pub struct SessionManager {
    config: HttpBindConfig,
    runtime: Handle,
    sessions: Arc<Registry>,
    timer: Arc<InactivityTimer>,
    surrogate: Arc<dyn ServerSurrogate>,
    failover: Arc<dyn FailoverDeliverer>,
    stream_ids: Arc<dyn StreamIdFactory>,
}

impl SessionManager {
    /// Create a manager whose eviction tasks run on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime. Use
    /// [`SessionManager::with_runtime`] from other threads.
    pub fn new(
        config: HttpBindConfig,
        surrogate: Arc<dyn ServerSurrogate>,
        failover: Arc<dyn FailoverDeliverer>,
    ) -> Self {
        Self::with_runtime(config, surrogate, failover, Handle::current())
    }

    pub fn with_runtime(
        config: HttpBindConfig,
        surrogate: Arc<dyn ServerSurrogate>,
        failover: Arc<dyn FailoverDeliverer>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            timer: Arc::new(InactivityTimer::new(runtime.clone())),
            runtime,
            surrogate,
            failover,
            stream_ids: Arc::new(RandomStreamIdFactory),
        }
    }

    /// Replace the stream id source.
    pub fn with_stream_ids(mut self, stream_ids: Arc<dyn StreamIdFactory>) -> Self {
        self.stream_ids = stream_ids;
        self
    }

    pub fn config(&self) -> &HttpBindConfig {
        &self.config
    }

    pub fn timer(&self) -> &InactivityTimer {
        &self.timer
    }

    /// Session registered under `stream_id`, if any.
    pub fn lookup(&self, stream_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(stream_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Like [`lookup`](Self::lookup), but a miss is an error.
    pub fn session(&self, stream_id: &str) -> Result<Arc<Session>, BoshError> {
        self.lookup(stream_id)
            .ok_or_else(|| BoshError::SessionNotFound(StreamId::from(stream_id)))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Start a new session from the client's first request.
    ///
    /// Unset or invalid `wait`/`hold` fall back to defaults, and a `hold` of
    /// zero or less leaves the session unbounded. The creation response is
    /// delivered on `connection` and the inactivity countdown starts right
    /// away.
    pub fn create_session(
        &self,
        request: &RequestBody,
        mut connection: Connection,
    ) -> Result<Arc<Session>, BoshError> {
        let params = SessionParams {
            wait: request.int_attribute("wait", DEFAULT_WAIT),
            hold: request.hold(DEFAULT_HOLD),
            language: request.language().to_string(),
            secure: connection.is_secure(),
            max_polling_interval: self.config.polling_interval(),
            inactivity_timeout: self.config.inactivity_timeout(),
        };

        connection.set_compression_policy(self.surrogate.compression_policy());

        let session = self.register(params)?;
        let _span = tracing::info_span!(
            "bosh.session.create",
            stream_id = %session.stream_id(),
        )
        .entered();

        self.surrogate.client_session_created(session.stream_id());
        session.add_listener(Arc::new(Lifecycle {
            sessions: Arc::clone(&self.sessions),
            timer: Arc::clone(&self.timer),
            surrogate: Arc::clone(&self.surrogate),
        }));

        let features = self.surrogate.stream_features(&session);
        let response = CreationResponse {
            stream_id: session.stream_id(),
            requests: self.config.max_requests,
            inactivity: session.inactivity_timeout().as_secs(),
            polling: self.config.polling_interval,
            wait: session.wait(),
            features: &features,
        }
        .to_xml();

        connection.bind(session.stream_id());
        if let Err(e) = connection.deliver_body(response) {
            // The session stays; it is evicted if the client never returns.
            warn!(error = %e, "Client left before the creation response");
        }

        self.timer.arm(&session);

        info!(
            wait = session.wait(),
            hold = ?session.hold(),
            secure = session.is_secure(),
            language = %session.language(),
            "Created session"
        );

        Ok(session)
    }

    /// Admit a follow-up request and route the stanzas it carries.
    ///
    /// An empty payload is a poll. Admission errors propagate untouched; a
    /// policy error with [`BoshError::closes_session`] set means the caller
    /// should close the session. The returned [`PendingResponse`] resolves
    /// when the session answers the request. Dropping or closing it releases
    /// the held request, which restarts the inactivity countdown once no
    /// other request is held.
    pub fn forward_request(
        &self,
        rid: u64,
        session: &Arc<Session>,
        secure: bool,
        payload: Vec<Stanza>,
    ) -> Result<PendingResponse, BoshError> {
        let is_poll = payload.is_empty();
        let (connection, pending) = Connection::new(rid, secure);
        let abandonment = connection.abandonment();

        session.admit(connection, is_poll)?;
        self.watch_abandonment(session, abandonment);

        debug!(
            stream_id = %session.stream_id(),
            rid = rid,
            stanzas = payload.len(),
            "Forwarding request"
        );
        for stanza in payload {
            self.surrogate.send(stanza, session.stream_id());
        }

        Ok(pending)
    }

    /// Send a stanza to the client behind `stream_id`.
    pub fn deliver(&self, stream_id: &str, stanza: Stanza) -> Result<Delivery, BoshError> {
        let session = self.session(stream_id)?;
        Ok(session.deliver(stanza))
    }

    /// Terminate a session on the messaging server's behalf.
    pub fn close_session(&self, stream_id: &str) -> Result<(), BoshError> {
        let session = self.session(stream_id)?;
        session.close(false);
        Ok(())
    }

    /// Close every session because the server is going away.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        info!(count = sessions.len(), "Closing all sessions for shutdown");
        for session in sessions {
            session.close(true);
        }
        self.timer.cancel_all();
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        let mut connected = 0;
        let mut idle = 0;

        for entry in self.sessions.iter() {
            if entry.value().connection_count() > 0 {
                connected += 1;
            } else {
                idle += 1;
            }
        }

        SessionStats {
            total: connected + idle,
            connected,
            idle,
        }
    }

    /// Release the held request from `session` once its requester stops waiting.
    fn watch_abandonment(&self, session: &Arc<Session>, abandonment: CancellationToken) {
        let session: Weak<Session> = Arc::downgrade(session);
        self.runtime.spawn(async move {
            abandonment.cancelled().await;
            if let Some(session) = session.upgrade() {
                session.release_abandoned();
            }
        });
    }

    /// Allocate an unused stream id and register a session under it.
    fn register(&self, params: SessionParams) -> Result<Arc<Session>, BoshError> {
        for _ in 0..MAX_STREAM_ID_ATTEMPTS {
            let stream_id = self.stream_ids.create_stream_id();
            match self.sessions.entry(stream_id) {
                Entry::Occupied(entry) => {
                    warn!(stream_id = %entry.key(), "Stream id already in use, retrying");
                }
                Entry::Vacant(entry) => {
                    let session = Session::new(
                        entry.key().clone(),
                        params,
                        Arc::clone(&self.failover),
                    );
                    entry.insert(Arc::clone(&session));
                    return Ok(session);
                }
            }
        }

        Err(BoshError::StreamIdExhausted(MAX_STREAM_ID_ATTEMPTS))
    }
}

/// Keeps the registry and eviction timer in step with one session.
struct Lifecycle {
    sessions: Arc<Registry>,
    timer: Arc<InactivityTimer>,
    surrogate: Arc<dyn ServerSurrogate>,
}

impl SessionListener for Lifecycle {
    fn connection_opened(&self, session: &Arc<Session>, _rid: u64) {
        self.timer.cancel(session);
    }

    fn connection_closed(&self, session: &Arc<Session>, _rid: u64) {
        if session.connection_count() == 0 {
            self.timer.arm(session);
        }
    }

    fn session_closed(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(session.stream_id(), |_, registered| Arc::ptr_eq(registered, session));
        self.timer.cancel(session);
        self.surrogate.client_session_closed(session.stream_id());
        info!(
            stream_id = %session.stream_id(),
            remaining = self.sessions.len(),
            "Session removed"
        );
    }
}
