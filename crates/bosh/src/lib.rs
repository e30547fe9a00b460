//! bosh - XEP-0124 HTTP Binding Session Layer
//!
//! Keeps a long-lived messaging session alive over a series of short HTTP
//! requests. The transport parses each request into a [`RequestBody`] and
//! hands it here together with a [`Connection`]; the session layer decides
//! when and with what that request is answered.
//!
//! # Features
//!
//! - **Sessions**: hold requests up to the negotiated `hold`, buffer
//!   outbound stanzas while none are held
//! - **Policy**: secure-channel enforcement and polling-rate limits
//! - **Eviction**: idle sessions are closed after the inactivity timeout
//! - **Failover**: stanzas that can no longer reach the client go to a
//!   [`FailoverDeliverer`]
//!
//! # Example
//!
//! ```rust,ignore
//! use bosh::{Connection, RequestBody, SessionManager, Stanza};
//!
//! let manager = SessionManager::new(config.httpbind, surrogate, failover);
//!
//! // First request of a client
//! let (conn, pending) = Connection::new(rid, true);
//! let session = manager.create_session(&body, conn)?;
//! let creation = pending.recv().await?;
//!
//! // Later requests
//! let session = manager.session(sid)?;
//! let pending = manager.forward_request(rid, &session, true, body.into_payload())?;
//! let response = pending.respond_within(Duration::from_secs(session.wait() as u64)).await;
//!
//! // Messaging server pushing to the client
//! manager.deliver(sid, Stanza::from("<message/>"))?;
//! ```

pub mod body;
pub mod connection;
pub mod error;
pub mod session;
pub mod stream_id;
pub mod substrate;

// Re-export commonly used types at crate root
pub use body::{RequestBody, Stanza};
pub use connection::{CompressionPolicy, Connection, ConnectionState, PendingResponse, Response};
pub use error::BoshError;
pub use session::{
    Delivery, InactivityTimer, ListenerId, Session, SessionListener, SessionManager,
    SessionParams, SessionStats,
};
pub use stream_id::{RandomStreamIdFactory, StreamId, StreamIdFactory};
pub use substrate::{DiscardingFailover, FailoverDeliverer, ServerSurrogate};

pub use boshconf::HttpBindConfig;
