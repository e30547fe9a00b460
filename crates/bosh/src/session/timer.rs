//! Inactivity eviction.
//!
//! Each armed session gets one spawned task that sleeps for the session's
//! inactivity timeout and then closes it. Arming again or cancelling stops
//! the previous task. The table entry lock serializes arm and cancel for
//! the same stream id, so at most one live task exists per session.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Session;
use crate::stream_id::StreamId;

#[derive(Debug)]
struct ScheduledEviction {
    generation: u64,
    cancel: CancellationToken,
}

/// Evicts sessions that stay idle for too long.
#[derive(Debug)]
pub struct InactivityTimer {
    runtime: Handle,
    tasks: Arc<DashMap<StreamId, ScheduledEviction>>,
    generation: AtomicU64,
}

impl InactivityTimer {
    /// Create a timer whose tasks run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// (Re)start the eviction countdown for `session`.
    ///
    /// Any previous countdown is cancelled. Closed sessions are not armed.
    pub fn arm(&self, session: &Arc<Session>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        match self.tasks.entry(session.stream_id().clone()) {
            Entry::Occupied(mut entry) => {
                entry.get().cancel.cancel();
                if session.is_closed() {
                    entry.remove();
                    return;
                }
                entry.insert(self.schedule(session, generation));
            }
            Entry::Vacant(entry) => {
                if session.is_closed() {
                    return;
                }
                entry.insert(self.schedule(session, generation));
            }
        }

        debug!(
            stream_id = %session.stream_id(),
            timeout_secs = session.inactivity_timeout().as_secs(),
            "Armed inactivity timer"
        );
    }

    /// Stop the countdown for `session`, if one is running.
    pub fn cancel(&self, session: &Session) {
        if let Some((_, task)) = self.tasks.remove(session.stream_id()) {
            task.cancel.cancel();
            debug!(stream_id = %session.stream_id(), "Cancelled inactivity timer");
        }
    }

    /// Stop every countdown.
    pub fn cancel_all(&self) {
        self.tasks.retain(|_, task| {
            task.cancel.cancel();
            false
        });
    }

    pub fn is_armed(&self, stream_id: &str) -> bool {
        self.tasks.contains_key(stream_id)
    }

    /// Number of running countdowns.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn schedule(&self, session: &Arc<Session>, generation: u64) -> ScheduledEviction {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tasks = Arc::clone(&self.tasks);
        let session = Arc::clone(session);
        let timeout = session.inactivity_timeout();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => evict(&session, &tasks, generation),
            }
        });

        ScheduledEviction { generation, cancel }
    }
}

fn evict(session: &Arc<Session>, tasks: &DashMap<StreamId, ScheduledEviction>, generation: u64) {
    let _span = tracing::info_span!(
        "bosh.session.evict",
        stream_id = %session.stream_id(),
    )
    .entered();
    info!(
        idle_secs = session.inactivity_timeout().as_secs(),
        "Evicting inactive session"
    );

    session.close(false);
    // A newer countdown may have replaced this one; leave it alone.
    tasks.remove_if(session.stream_id(), |_, task| task.generation == generation);
}
