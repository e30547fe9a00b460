//! Integration tests for the session manager
//!
//! Drives sessions through the public API the way an HTTP transport would:
//! creation, follow-up requests, server pushes, eviction and shutdown.

use bosh::error::FORBIDDEN;
use bosh::{
    BoshError, CompressionPolicy, Connection, Delivery, DiscardingFailover, HttpBindConfig,
    RequestBody, ServerSurrogate, Session, SessionManager, SessionStats, Stanza, StreamId,
    StreamIdFactory,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SASL_FEATURES: &str =
    "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>";

/// Messaging server stand-in that records everything the session layer tells it
#[derive(Default)]
struct RecordingSurrogate {
    created: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, String)>>,
    compression: CompressionPolicy,
}

impl RecordingSurrogate {
    fn compressing() -> Self {
        Self {
            compression: CompressionPolicy::Optional,
            ..Self::default()
        }
    }

    fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ServerSurrogate for RecordingSurrogate {
    fn client_session_created(&self, stream_id: &StreamId) {
        self.created.lock().unwrap().push(stream_id.to_string());
    }

    fn client_session_closed(&self, stream_id: &StreamId) {
        self.closed.lock().unwrap().push(stream_id.to_string());
    }

    fn send(&self, stanza: Stanza, stream_id: &StreamId) {
        self.sent
            .lock()
            .unwrap()
            .push((stream_id.to_string(), stanza.into_xml()));
    }

    fn stream_features(&self, _session: &Session) -> String {
        SASL_FEATURES.to_string()
    }

    fn compression_policy(&self) -> CompressionPolicy {
        self.compression
    }
}

/// Hands out a fixed sequence of ids, then "dup" forever
struct ScriptedIds(Mutex<VecDeque<&'static str>>);

impl ScriptedIds {
    fn new(ids: &[&'static str]) -> Self {
        Self(Mutex::new(ids.iter().copied().collect()))
    }
}

impl StreamIdFactory for ScriptedIds {
    fn create_stream_id(&self) -> StreamId {
        StreamId::from(self.0.lock().unwrap().pop_front().unwrap_or("dup"))
    }
}

fn manager_with(config: HttpBindConfig) -> (SessionManager, Arc<RecordingSurrogate>) {
    let surrogate = Arc::new(RecordingSurrogate::default());
    let manager = SessionManager::new(config, surrogate.clone(), Arc::new(DiscardingFailover));
    (manager, surrogate)
}

fn manager() -> (SessionManager, Arc<RecordingSurrogate>) {
    manager_with(HttpBindConfig::default())
}

fn create(manager: &SessionManager, body: RequestBody, secure: bool) -> (Arc<Session>, String) {
    let (conn, mut pending) = Connection::new(1, secure);
    let session = manager.create_session(&body, conn).unwrap();
    let response = pending.try_recv().expect("creation response delivered");
    (session, response.body)
}

async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

// --- Creation ---

#[tokio::test]
async fn test_creation_response_uses_defaults() {
    let (manager, surrogate) = manager();
    let (session, body) = create(&manager, RequestBody::new(), false);

    let sid = session.stream_id().as_str();
    assert!(body.starts_with("<body xmlns='http://jabber.org/protocol/httpbind'"));
    assert!(body.contains(&format!("authid='{sid}' sid='{sid}' secure='true'")));
    assert!(body.contains("requests='2'"));
    assert!(body.contains("inactivity='1800'"));
    assert!(body.contains("polling='5'"));
    assert!(body.contains("wait='60'"));
    assert!(body.contains(SASL_FEATURES));
    assert!(body.contains("<bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/>"));
    assert!(body.contains("<session xmlns=\"urn:ietf:params:xml:ns:xmpp-session\"/>"));

    assert_eq!(session.wait(), 60);
    assert_eq!(session.hold(), Some(1));
    assert_eq!(session.language(), "en");
    assert!(!session.is_secure());

    assert_eq!(surrogate.created(), vec![sid.to_string()]);
    assert!(manager.lookup(sid).is_some());
    assert!(manager.timer().is_armed(sid));
}

#[tokio::test]
async fn test_creation_reads_client_attributes() {
    let (manager, _) = manager();
    let body = RequestBody::new()
        .with_attribute("wait", "30")
        .with_attribute("hold", "2")
        .with_attribute("xml:lang", "fr");
    let (session, response) = create(&manager, body, true);

    assert_eq!(session.wait(), 30);
    assert_eq!(session.hold(), Some(2));
    assert_eq!(session.language(), "fr");
    assert!(session.is_secure());
    assert!(response.contains("wait='30'"));
}

#[tokio::test]
async fn test_invalid_attributes_fall_back_to_defaults() {
    let (manager, _) = manager();
    let body = RequestBody::new()
        .with_attribute("wait", "soon")
        .with_attribute("hold", "many");
    let (session, _) = create(&manager, body, false);

    assert_eq!(session.wait(), 60);
    assert_eq!(session.hold(), Some(1));
}

#[tokio::test]
async fn test_non_positive_hold_is_unbounded() {
    let (manager, _) = manager();
    let body = RequestBody::new()
        .with_attribute("wait", "-5")
        .with_attribute("hold", "-3");
    let (session, _) = create(&manager, body, false);

    assert_eq!(session.wait(), 60);
    assert_eq!(session.hold(), None);

    let _held: Vec<_> = (2..6)
        .map(|rid| {
            manager
                .forward_request(rid, &session, false, vec![Stanza::from("<x/>")])
                .unwrap()
        })
        .collect();
    assert_eq!(session.connection_count(), 4);
}

#[tokio::test]
async fn test_creation_uses_configured_limits() {
    let (manager, _) = manager_with(HttpBindConfig {
        inactivity_timeout: 90,
        max_requests: 3,
        polling_interval: 10,
    });
    let (_, body) = create(&manager, RequestBody::new(), false);

    assert!(body.contains("requests='3'"));
    assert!(body.contains("inactivity='90'"));
    assert!(body.contains("polling='10'"));
}

#[tokio::test]
async fn test_creation_response_carries_compression_policy() {
    let surrogate = Arc::new(RecordingSurrogate::compressing());
    let manager = SessionManager::new(
        HttpBindConfig::default(),
        surrogate,
        Arc::new(DiscardingFailover),
    );

    let (conn, mut pending) = Connection::new(1, false);
    manager.create_session(&RequestBody::new(), conn).unwrap();
    assert_eq!(
        pending.try_recv().unwrap().compression,
        CompressionPolicy::Optional
    );
}

#[tokio::test]
async fn test_creation_survives_departed_client() {
    let (manager, surrogate) = manager();
    let (conn, pending) = Connection::new(1, false);
    drop(pending);

    let session = manager.create_session(&RequestBody::new(), conn).unwrap();
    assert!(manager.lookup(session.stream_id().as_str()).is_some());
    assert_eq!(surrogate.created().len(), 1);
}

#[tokio::test]
async fn test_stream_id_collision_retries() {
    let (manager, surrogate) = manager();
    let manager = manager.with_stream_ids(Arc::new(ScriptedIds::new(&["a", "a", "b"])));

    let (first, _) = create(&manager, RequestBody::new(), false);
    let (second, _) = create(&manager, RequestBody::new(), false);
    assert_eq!(first.stream_id().as_str(), "a");
    assert_eq!(second.stream_id().as_str(), "b");

    // "a" is still the first session
    assert!(Arc::ptr_eq(&manager.session("a").unwrap(), &first));

    let _third = create(&manager, RequestBody::new(), false);
    let (conn, _pending) = Connection::new(1, false);
    let err = manager.create_session(&RequestBody::new(), conn).unwrap_err();
    assert!(matches!(err, BoshError::StreamIdExhausted(_)));

    assert_eq!(manager.len(), 3);
    assert_eq!(surrogate.created(), vec!["a", "b", "dup"]);
}

// --- Follow-up requests ---

#[tokio::test]
async fn test_forward_request_routes_stanzas() {
    let (manager, surrogate) = manager();
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    let body = RequestBody::new()
        .with_stanza("<message to='a@example.org'/>")
        .with_stanza("<presence/>");
    let _pending = manager
        .forward_request(2, &session, false, body.into_payload())
        .unwrap();

    assert_eq!(
        surrogate.sent(),
        vec![
            (sid.clone(), "<message to='a@example.org'/>".to_string()),
            (sid.clone(), "<presence/>".to_string()),
        ]
    );
    assert_eq!(session.connection_count(), 1);
    assert!(!manager.timer().is_armed(&sid));
}

#[tokio::test]
async fn test_delivery_answers_held_request_and_rearms() {
    let (manager, _) = manager();
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    let pending = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    assert!(!manager.timer().is_armed(&sid));

    let outcome = manager.deliver(&sid, Stanza::from("<message/>")).unwrap();
    assert_eq!(outcome, Delivery::Sent { rid: 2 });

    let response = pending.recv().await.unwrap();
    assert_eq!(
        response.body,
        "<body xmlns='http://jabber.org/protocol/httpbind'><message/></body>"
    );
    assert_eq!(session.connection_count(), 0);
    assert!(manager.timer().is_armed(&sid));
}

#[tokio::test]
async fn test_buffered_stanzas_answer_next_request() {
    let (manager, _) = manager();
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    assert_eq!(
        manager.deliver(&sid, Stanza::from("<a/>")).unwrap(),
        Delivery::Buffered
    );
    assert_eq!(
        manager.deliver(&sid, Stanza::from("<b/>")).unwrap(),
        Delivery::Buffered
    );

    let mut pending = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    assert!(pending.try_recv().unwrap().body.contains("<a/><b/>"));
    assert_eq!(session.connection_count(), 0);
    assert!(manager.timer().is_armed(&sid));
}

#[tokio::test]
async fn test_too_frequent_polling_is_terminal() {
    let (manager, _) = manager();
    let (session, _) = create(&manager, RequestBody::new(), false);

    let _first = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    let err = manager
        .forward_request(3, &session, false, Vec::new())
        .unwrap_err();

    assert!(err.is_policy_violation());
    assert!(err.closes_session());
    assert_eq!(err.status(), FORBIDDEN);
}

#[tokio::test]
async fn test_secure_session_rejects_insecure_request() {
    let (manager, _) = manager();
    let (session, _) = create(&manager, RequestBody::new(), true);

    let err = manager
        .forward_request(2, &session, false, vec![Stanza::from("<x/>")])
        .unwrap_err();
    assert!(err.is_policy_violation());
    assert!(!err.closes_session());
    assert!(!session.is_closed());
    assert_eq!(session.connection_count(), 0);
}

#[tokio::test]
async fn test_hold_one_conversation() {
    let (manager, surrogate) = manager();
    let body = RequestBody::new()
        .with_attribute("wait", "60")
        .with_attribute("hold", "1");
    let (session, _) = create(&manager, body, false);
    let sid = session.stream_id().to_string();

    let c1 = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    assert_eq!(session.connection_count(), 1);

    manager.deliver(&sid, Stanza::from("<s1/>")).unwrap();
    assert!(c1.recv().await.unwrap().body.contains("<s1/>"));
    assert_eq!(session.connection_count(), 0);

    let c2 = manager
        .forward_request(3, &session, false, vec![Stanza::from("<out/>")])
        .unwrap();
    assert_eq!(session.connection_count(), 1);
    manager.deliver(&sid, Stanza::from("<s2/>")).unwrap();
    assert!(c2.recv().await.unwrap().body.contains("<s2/>"));

    let mut c3 = manager
        .forward_request(4, &session, false, vec![Stanza::from("<out2/>")])
        .unwrap();
    assert_eq!(session.connection_count(), 1);
    assert!(c3.try_recv().is_none());
    assert_eq!(surrogate.sent().len(), 2);
}

// --- Lookup and termination ---

#[tokio::test]
async fn test_unknown_session() {
    let (manager, _) = manager();

    assert!(manager.lookup("nope").is_none());
    assert!(matches!(
        manager.session("nope"),
        Err(BoshError::SessionNotFound(_))
    ));
    assert!(matches!(
        manager.deliver("nope", Stanza::from("<x/>")),
        Err(BoshError::SessionNotFound(_))
    ));
    assert!(manager.close_session("nope").is_err());
}

#[tokio::test]
async fn test_close_session_terminates_and_deregisters() {
    let (manager, surrogate) = manager();
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    let held = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    manager.close_session(&sid).unwrap();

    let response = held.recv().await.unwrap();
    assert!(response.body.contains("type='terminate'"));
    assert!(!response.body.contains("condition="));

    assert!(session.is_closed());
    assert!(manager.lookup(&sid).is_none());
    assert!(!manager.timer().is_armed(&sid));
    assert_eq!(surrogate.closed(), vec![sid.clone()]);

    // Closing again through the session itself is a no-op
    session.close(false);
    assert_eq!(surrogate.closed().len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let (manager, surrogate) = manager();
    let (a, _) = create(&manager, RequestBody::new(), false);
    let (b, _) = create(&manager, RequestBody::new(), false);

    let held = manager.forward_request(2, &a, false, Vec::new()).unwrap();
    manager.shutdown();

    assert!(held
        .recv()
        .await
        .unwrap()
        .body
        .contains("condition='system-shutdown'"));
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(manager.is_empty());
    assert!(manager.timer().is_empty());
    assert_eq!(surrogate.closed().len(), 2);
}

#[tokio::test]
async fn test_stats() {
    let (manager, _) = manager();
    let (a, _) = create(&manager, RequestBody::new(), false);
    let (_b, _) = create(&manager, RequestBody::new(), false);
    let _held = manager.forward_request(2, &a, false, Vec::new()).unwrap();

    assert_eq!(
        manager.stats(),
        SessionStats {
            total: 2,
            connected: 1,
            idle: 1,
        }
    );
}

// --- Inactivity eviction ---

fn short_timeout() -> HttpBindConfig {
    HttpBindConfig {
        inactivity_timeout: 30,
        ..HttpBindConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_evicted() {
    let (manager, surrogate) = manager_with(short_timeout());
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    tokio::time::sleep(Duration::from_secs(29)).await;
    settle().await;
    assert!(manager.lookup(&sid).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert!(session.is_closed());
    assert!(manager.lookup(&sid).is_none());
    assert!(manager.timer().is_empty());
    assert_eq!(surrogate.closed(), vec![sid]);
}

#[tokio::test(start_paused = true)]
async fn test_held_request_keeps_session_alive() {
    let (manager, _) = manager_with(short_timeout());
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    let held = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert!(!session.is_closed());

    // Countdown restarts once the request is answered
    manager.deliver(&sid, Stanza::from("<ping/>")).unwrap();
    assert!(held.recv().await.is_ok());

    tokio::time::sleep(Duration::from_secs(20)).await;
    settle().await;
    assert!(!session.is_closed());

    tokio::time::sleep(Duration::from_secs(15)).await;
    settle().await;
    assert!(session.is_closed());
    assert!(manager.lookup(&sid).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_expired_wait_restarts_countdown() {
    let (manager, surrogate) = manager_with(short_timeout());
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    let held = manager.forward_request(2, &session, false, Vec::new()).unwrap();
    assert!(!manager.timer().is_armed(&sid));

    // The client never comes back after its held request expires
    let response = held.respond_within(Duration::from_secs(60)).await;
    assert_eq!(response.body, bosh::body::empty_body());
    settle().await;
    assert_eq!(session.connection_count(), 0);
    assert!(manager.timer().is_armed(&sid));

    tokio::time::sleep(Duration::from_secs(29)).await;
    settle().await;
    assert!(!session.is_closed());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;
    assert!(session.is_closed());
    assert!(manager.lookup(&sid).is_none());
    assert_eq!(surrogate.closed(), vec![sid]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_request_restarts_countdown() {
    let (manager, _) = manager_with(short_timeout());
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    let first = manager
        .forward_request(2, &session, false, vec![Stanza::from("<a/>")])
        .unwrap();
    let second = manager
        .forward_request(3, &session, false, vec![Stanza::from("<b/>")])
        .unwrap();
    assert_eq!(session.connection_count(), 1);

    // The first was already answered with an empty body when the second
    // pushed it out of the hold; dropping it changes nothing.
    drop(first);
    settle().await;
    assert_eq!(session.connection_count(), 1);
    assert!(!manager.timer().is_armed(&sid));

    drop(second);
    settle().await;
    assert_eq!(session.connection_count(), 0);
    assert!(manager.timer().is_armed(&sid));

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;
    assert!(session.is_closed());
    assert!(manager.lookup(&sid).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_evicted_session_hands_buffer_to_failover() {
    #[derive(Default)]
    struct Sink(Mutex<Vec<Stanza>>);

    impl bosh::FailoverDeliverer for Sink {
        fn deliver(&self, _stream_id: &StreamId, stanza: Stanza) {
            self.0.lock().unwrap().push(stanza);
        }
    }

    let sink = Arc::new(Sink::default());
    let manager = SessionManager::new(
        short_timeout(),
        Arc::new(RecordingSurrogate::default()),
        sink.clone(),
    );
    let (session, _) = create(&manager, RequestBody::new(), false);
    let sid = session.stream_id().to_string();

    manager.deliver(&sid, Stanza::from("<unread/>")).unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    assert!(session.is_closed());
    assert_eq!(*sink.0.lock().unwrap(), vec![Stanza::from("<unread/>")]);

    // Stale handles fail over too
    assert_eq!(session.deliver(Stanza::from("<late/>")), Delivery::Failover);
    assert_eq!(sink.0.lock().unwrap().len(), 2);
}
