//! Held HTTP requests.
//!
//! A [`Connection`] is the server side of one request/response exchange. It
//! is single-use: once a body has been delivered, or the connection closed,
//! it cannot carry anything else. The HTTP layer keeps the matching
//! [`PendingResponse`] and awaits whatever the session sends.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::body;
use crate::error::BoshError;
use crate::stream_id::StreamId;

/// Whether the response may be compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    #[default]
    Disabled,
    Optional,
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a body.
    Pending,
    /// A body was handed to the requester.
    Delivered,
    /// Discarded without a body, or the requester went away.
    Closed,
}

/// What the requester receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub body: String,
    pub compression: CompressionPolicy,
}

/// Sending half of a held request.
#[derive(Debug)]
pub struct Connection {
    rid: u64,
    secure: bool,
    compression: CompressionPolicy,
    state: ConnectionState,
    stream_id: Option<StreamId>,
    tx: Option<oneshot::Sender<Response>>,
    abandoned: CancellationToken,
}

impl Connection {
    /// Create a connection for request `rid` and the half the HTTP layer waits on.
    pub fn new(rid: u64, secure: bool) -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let abandoned = CancellationToken::new();
        let connection = Self {
            rid,
            secure,
            compression: CompressionPolicy::default(),
            state: ConnectionState::Pending,
            stream_id: None,
            tx: Some(tx),
            abandoned: abandoned.clone(),
        };
        (
            connection,
            PendingResponse {
                rid,
                rx,
                abandoned,
            },
        )
    }

    pub fn rid(&self) -> u64 {
        self.rid
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == ConnectionState::Pending
    }

    /// Session this connection belongs to, once admitted.
    pub fn stream_id(&self) -> Option<&StreamId> {
        self.stream_id.as_ref()
    }

    pub(crate) fn bind(&mut self, stream_id: &StreamId) {
        self.stream_id = Some(stream_id.clone());
    }

    pub fn compression_policy(&self) -> CompressionPolicy {
        self.compression
    }

    pub fn set_compression_policy(&mut self, policy: CompressionPolicy) {
        self.compression = policy;
    }

    /// True when nobody is waiting for this connection's response any more.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_cancelled()
            || self.tx.as_ref().map(|tx| tx.is_closed()).unwrap_or(true)
    }

    /// Token cancelled once the [`PendingResponse`] stops waiting.
    pub fn abandonment(&self) -> CancellationToken {
        self.abandoned.clone()
    }

    /// Answer the request with `body`.
    ///
    /// Fails with [`BoshError::ConnectionConsumed`] if the connection was
    /// already used or its requester is gone; in both cases the connection
    /// ends up closed.
    pub fn deliver_body(&mut self, body: String) -> Result<(), BoshError> {
        let tx = match (self.state, self.tx.take()) {
            (ConnectionState::Pending, Some(tx)) => tx,
            _ => return Err(BoshError::ConnectionConsumed { rid: self.rid }),
        };

        let response = Response {
            body,
            compression: self.compression,
        };
        match tx.send(response) {
            Ok(()) => {
                self.state = ConnectionState::Delivered;
                Ok(())
            }
            Err(_) => {
                self.state = ConnectionState::Closed;
                Err(BoshError::ConnectionConsumed { rid: self.rid })
            }
        }
    }

    /// Discard the connection without a body.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Pending {
            self.tx = None;
            self.state = ConnectionState::Closed;
        }
    }

    /// Answer with a final body if still pending, then close.
    pub fn close_with(&mut self, body: String) {
        if self.deliver_body(body).is_ok() {
            self.state = ConnectionState::Closed;
        }
    }
}

/// Receiving half of a held request.
///
/// Dropping it, or calling [`close`](Self::close), tells the session that
/// nobody will read a response for this request.
#[derive(Debug)]
pub struct PendingResponse {
    rid: u64,
    rx: oneshot::Receiver<Response>,
    abandoned: CancellationToken,
}

impl PendingResponse {
    pub fn rid(&self) -> u64 {
        self.rid
    }

    /// Wait for the session to answer.
    pub async fn recv(mut self) -> Result<Response, BoshError> {
        let rid = self.rid;
        (&mut self.rx).await.map_err(|_| BoshError::ConnectionClosed { rid })
    }

    /// Take the response if one has already arrived.
    pub fn try_recv(&mut self) -> Option<Response> {
        self.rx.try_recv().ok()
    }

    /// Stop waiting.
    ///
    /// Later deliveries on the connection fail. A response sent before this
    /// call is returned rather than lost.
    pub fn close(&mut self) -> Option<Response> {
        self.rx.close();
        self.abandoned.cancel();
        self.rx.try_recv().ok()
    }

    /// Wait at most `wait` for an answer.
    ///
    /// A timeout or a close without delivery both produce an empty body,
    /// which is what the client expects when its held request expires.
    pub async fn respond_within(mut self, wait: Duration) -> Response {
        let outcome = tokio::time::timeout(wait, &mut self.rx).await;
        let received = match outcome {
            Ok(result) => result.ok(),
            Err(_) => self.close(),
        };

        received.unwrap_or_else(|| Response {
            body: body::empty_body(),
            compression: CompressionPolicy::default(),
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.rx.close();
        self.abandoned.cancel();
    }
}
