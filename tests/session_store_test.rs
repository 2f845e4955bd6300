mod common;

use common::{FakeTransport, Journal, RecordingSessionLogger};
use mongo_mcp_core::SessionStoreError;
use mongo_mcp_core::session::SessionStore;
use pretty_assertions::assert_eq;
use std::time::Duration;

const IDLE: Duration = Duration::from_millis(1000);
const NOTIFICATION: Duration = Duration::from_millis(600);

const ABOUT_TO_CLOSE: &str = "Session is about to be closed due to inactivity";
const CLOSED: &str = "Session closed due to inactivity";

fn store() -> SessionStore<FakeTransport> {
    SessionStore::new(IDLE, NOTIFICATION).unwrap()
}

#[test]
fn test_timeout_validation() {
    let ms = Duration::from_millis;

    assert!(matches!(
        SessionStore::<FakeTransport>::new(ms(100), ms(100)),
        Err(SessionStoreError::InvalidTimeouts { .. })
    ));
    assert!(SessionStore::<FakeTransport>::new(ms(50), ms(100)).is_err());
    assert!(SessionStore::<FakeTransport>::new(ms(100), ms(0)).is_err());

    let store = SessionStore::<FakeTransport>::new(ms(1000), ms(100)).unwrap();
    assert_eq!(store.idle_timeout(), ms(1000));
    assert_eq!(store.notification_timeout(), ms(100));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_and_unknown_sessions() {
    let journal = Journal::default();
    let store = store();

    store
        .set_session("s1", FakeTransport::new("s1", journal.clone()), RecordingSessionLogger::new())
        .unwrap();
    let err = store
        .set_session("s1", FakeTransport::new("s1-again", journal.clone()), RecordingSessionLogger::new())
        .unwrap_err();
    assert_eq!(err, SessionStoreError::DuplicateSession("s1".to_string()));
    assert_eq!(store.session_count(), 1);

    let err = store.close_session("nope", true).await.unwrap_err();
    assert_eq!(err, SessionStoreError::UnknownSession("nope".to_string()));
    assert!(store.get_session("nope").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_notified_then_closed() {
    let journal = Journal::default();
    let logger = RecordingSessionLogger::new();
    let store = store();
    store
        .set_session("s1", FakeTransport::new("s1", journal.clone()), logger.clone())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(logger.contains(ABOUT_TO_CLOSE));
    assert!(!logger.contains(CLOSED));
    assert!(store.contains("s1"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(logger.contains(CLOSED));
    assert!(!store.contains("s1"));
    assert_eq!(journal.entries(), vec!["close transport s1"]);

    let (_, context, _) = &logger.messages()[0];
    assert_eq!(context, "sessionStore");
}

#[tokio::test(start_paused = true)]
async fn test_get_session_resets_timers() {
    let journal = Journal::default();
    let logger = RecordingSessionLogger::new();
    let store = store();
    store
        .set_session("s1", FakeTransport::new("s1", journal.clone()), logger.clone())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let transport = store.get_session("s1").unwrap();
    assert_eq!(transport.id, "s1");

    // 1000ms since registration, 500ms since the last access
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(logger.messages().is_empty());
    assert!(store.contains("s1"));

    // `contains` is not activity
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(logger.contains(ABOUT_TO_CLOSE));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!store.contains("s1"));
    assert_eq!(journal.entries(), vec!["close transport s1"]);
}

#[tokio::test(start_paused = true)]
async fn test_manual_close_cancels_timers() {
    let journal = Journal::default();
    let logger = RecordingSessionLogger::new();
    let store = store();
    store
        .set_session("s1", FakeTransport::new("s1", journal.clone()), logger.clone())
        .unwrap();

    store.close_session("s1", false).await.unwrap();
    assert_eq!(store.session_count(), 0);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(logger.messages().is_empty());
    // The caller kept ownership of the transport
    assert!(journal.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_failure_still_unregisters() {
    let journal = Journal::default();
    let store = store();
    store
        .set_session("s1", FakeTransport::failing("s1", journal.clone()), RecordingSessionLogger::new())
        .unwrap();

    store.close_session("s1", true).await.unwrap();

    assert!(!store.contains("s1"));
    assert_eq!(journal.entries(), vec!["close transport s1"]);
}

#[tokio::test(start_paused = true)]
async fn test_close_all_sessions() {
    let journal = Journal::default();
    let store = store();
    for id in ["a", "b", "c"] {
        store
            .set_session(id, FakeTransport::new(id, journal.clone()), RecordingSessionLogger::new())
            .unwrap();
    }

    store.close_all_sessions().await;

    assert_eq!(store.session_count(), 0);
    let mut closed = journal.entries();
    closed.sort();
    assert_eq!(closed, vec!["close transport a", "close transport b", "close transport c"]);

    // Closing twice finds nothing left to close
    store.close_all_sessions().await;
    assert_eq!(journal.entries().len(), 3);
}
