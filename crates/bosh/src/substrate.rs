//! Interfaces to the messaging server behind the HTTP binding.
//!
//! The session layer only announces lifecycle changes, forwards inbound
//! stanzas, and asks for a few values. Routing and stream negotiation live
//! on the other side of these traits.

use crate::body::Stanza;
use crate::connection::CompressionPolicy;
use crate::session::Session;
use crate::stream_id::StreamId;

/// The messaging server as seen by the session layer.
pub trait ServerSurrogate: Send + Sync {
    /// A client session now exists under `stream_id`.
    fn client_session_created(&self, stream_id: &StreamId);

    /// The client session under `stream_id` is gone.
    fn client_session_closed(&self, stream_id: &StreamId);

    /// Route a stanza sent by the client.
    fn send(&self, stanza: Stanza, stream_id: &StreamId);

    /// Feature negotiation fragment (e.g. SASL mechanisms) for the creation response.
    fn stream_features(&self, session: &Session) -> String;

    /// Compression policy applied to the connection that creates a session.
    fn compression_policy(&self) -> CompressionPolicy {
        CompressionPolicy::Disabled
    }
}

/// Takes stanzas that can no longer reach the client through its session.
pub trait FailoverDeliverer: Send + Sync {
    fn deliver(&self, stream_id: &StreamId, stanza: Stanza);
}

/// Failover sink that logs and drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardingFailover;

impl FailoverDeliverer for DiscardingFailover {
    fn deliver(&self, stream_id: &StreamId, stanza: Stanza) {
        tracing::warn!(
            stream_id = %stream_id,
            bytes = stanza.as_xml().len(),
            "Dropping undeliverable stanza"
        );
    }
}
