//! Stream identifiers.
//!
//! A stream id names a session in the registry and is echoed to the client as
//! both `sid` and `authid`.

use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Identifier of one HTTP binding session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Source of fresh stream identifiers.
///
/// Ids need not be globally unique; the session manager retries when an id
/// is already registered.
pub trait StreamIdFactory: Send + Sync {
    fn create_stream_id(&self) -> StreamId;
}

/// Random ids from UUID v4, in simple (hyphenless) form.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStreamIdFactory;

impl StreamIdFactory for RandomStreamIdFactory {
    fn create_stream_id(&self) -> StreamId {
        StreamId(Uuid::new_v4().simple().to_string())
    }
}
