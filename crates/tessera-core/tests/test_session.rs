//! Sessions, sync workers and connection loss

mod common;

use common::*;
use std::time::Duration;
use tempfile::TempDir;
use tessera_core::sync::{ErrorState, ROOT_BLOB_INDEX, SyncRequest};
use tessera_core::{Error, Session, SyncOutcome};
use tessera_protocol::DataLayout;

fn connected(upstream: &std::sync::Arc<MockUpstream>) -> (TempDir, Session) {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let credentials = credentials(&config, "session-key");
    let session = Session::with_transport(config, upstream.clone(), credentials).unwrap();
    wait_authenticated(session.connection());
    (dir, session)
}

#[test]
fn test_track_and_sync_graph() {
    let upstream = MockUpstream::new(7);
    let (_dir, session) = connected(&upstream);

    let graph = session.open_graph("g-tracked").unwrap();
    graph.lock().append_blobs(&blobs(6, 0x42)).unwrap();
    session.track_graph(graph.clone()).unwrap();
    assert_eq!(session.tracked_graphs(), vec!["g-tracked".to_string()]);
    assert!(matches!(
        session.track_graph(graph.clone()),
        Err(Error::Config(_))
    ));

    let outcome = session.sync_graph("g-tracked").unwrap();
    // A Reconnected event may have synced the graph first
    assert!(matches!(
        outcome,
        SyncOutcome::Acknowledged(_) | SyncOutcome::UpToDate
    ));
    assert_eq!(graph.lock().sync_head(), ROOT_BLOB_INDEX + 6);
    assert_eq!(upstream.graph_heads("g-tracked").unwrap().blobs, ROOT_BLOB_INDEX + 6);

    assert!(session.untrack_graph("g-tracked").unwrap());
    assert!(!session.untrack_graph("g-tracked").unwrap());
    assert!(session.sync_graph("g-tracked").is_err());
}

#[test]
fn test_unsolicited_update_reaches_tracked_graph() {
    let upstream = MockUpstream::new(7);
    let (_dir, session) = connected(&upstream);

    let graph = session.open_graph("g-shared").unwrap();
    session.track_graph(graph.clone()).unwrap();

    let mut source = small_graph("g-shared");
    source.append_blobs(&blobs(5, 0x77)).unwrap();
    let payload = source
        .build_payload(&source.local_heads(), DataLayout::for_protocol_version(7))
        .unwrap();
    let (message, segments) = payload.into_message("graph_update").unwrap();
    upstream.push(message, segments);

    assert!(eventually(|| graph.lock().write_head() == ROOT_BLOB_INDEX + 5));
    let g = graph.lock();
    assert_eq!(g.sync_head(), ROOT_BLOB_INDEX + 5);
    assert!(g.is_subscribed());
    assert_eq!(
        g.blob_bytes(ROOT_BLOB_INDEX, ROOT_BLOB_INDEX + 5).unwrap(),
        &blobs(5, 0x77)[..]
    );
}

#[test]
fn test_reconnect_resubscribes_and_syncs() {
    let upstream = MockUpstream::new(7);
    let (_dir, session) = connected(&upstream);

    let graph = session.open_graph("g-reconnect").unwrap();
    graph.lock().append_blobs(&blobs(2, 1)).unwrap();
    session.track_graph(graph.clone()).unwrap();
    session.sync_graph("g-reconnect").unwrap();
    assert_eq!(graph.lock().sync_head(), ROOT_BLOB_INDEX + 2);

    graph.lock().append_blobs(&blobs(3, 2)).unwrap();
    upstream.drop_connection();

    // Only the Reconnected event can sync: the periodic interval is an hour
    assert!(eventually(|| {
        upstream
            .graph_heads("g-reconnect")
            .is_some_and(|h| h.blobs == ROOT_BLOB_INDEX + 5)
    }));
    assert!(eventually(|| graph.lock().sync_head() == ROOT_BLOB_INDEX + 5));
    assert!(graph.lock().is_subscribed());
}

#[test]
fn test_clear_invalid_request_resumes_sync() {
    let upstream = MockUpstream::new(7);
    let (_dir, session) = connected(&upstream);

    let graph = session.open_graph("g-paused").unwrap();
    graph.lock().append_blobs(&blobs(1, 9)).unwrap();
    upstream.set_behavior(UpdateBehavior::Reject("no".into()));
    session.track_graph(graph.clone()).unwrap();

    // Either this request or a Reconnected sync hits the rejection first
    match session.sync_graph("g-paused") {
        Ok(SyncOutcome::Invalidated(_)) | Err(Error::GraphInvalidState(_)) => {}
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(matches!(graph.lock().error_state(), ErrorState::Invalid(_)));
    assert_eq!(graph.lock().sync_head(), 0);

    upstream.set_behavior(UpdateBehavior::Accept);
    session
        .send_request("g-paused", SyncRequest::ClearInvalid)
        .unwrap();
    assert!(eventually(|| graph.lock().sync_head() == ROOT_BLOB_INDEX + 1));
}

#[test]
fn test_transport_drop_cancels_online_tasks() {
    let upstream = MockUpstream::new(7);
    let (_dir, session) = connected(&upstream);
    let tasks = session.tasks();

    let online: Vec<_> = (0..5).map(|_| tasks.add_task(true, None)).collect();
    let offline: Vec<_> = (0..2).map(|_| tasks.add_task(false, None)).collect();

    upstream.drop_connection();

    for task in &online {
        let result = tasks.await_result(task, Some(Duration::from_secs(5)), None);
        assert!(matches!(result, Err(Error::Disconnected)));
    }
    for task in &offline {
        assert!(tasks.find_task(task.id(), false).is_some());
    }
}
