//! Integration tests for the connection manager.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tidemark_sync_engine::{
    BucketStorage, LockType, StatusHandle, StreamingSyncImplementation, SubscribeOptions,
    SyncLocks, SyncOptions,
};
use tidemark_sync_protocol::ControlOp;
use tidemark_testkit::prelude::*;
use tokio::time::timeout;

fn params(team: &str) -> Map<String, Value> {
    match json!({ "team": team }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn options_for(team: &str) -> SyncOptions {
    fast_options().with_params(params(team))
}

fn team_of(request: &tidemark_sync_engine::HttpRequest) -> Value {
    request.body.as_ref().unwrap()["parameters"]["team"].clone()
}

#[tokio::test]
async fn rapid_connects_use_latest_options() {
    let harness = TestHarness::new();

    tokio::join!(
        harness
            .manager
            .connect(harness.connector.clone(), options_for("first")),
        harness
            .manager
            .connect(harness.connector.clone(), options_for("second")),
    );

    let requests = harness.http.stream_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(team_of(&requests[0]), "second");
    assert!(harness.manager.status().connected);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn reconnect_replaces_connection() {
    let harness = TestHarness::new();
    harness
        .manager
        .connect(harness.connector.clone(), options_for("first"))
        .await;
    harness
        .manager
        .connect(harness.connector.clone(), options_for("second"))
        .await;

    let requests = harness.http.stream_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(team_of(&requests[1]), "second");
    let sync = harness.manager.sync_implementation().unwrap();
    assert_eq!(sync.options().params, Some(params("second")));

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_resets_status() {
    let harness = TestHarness::new();
    harness.connect().await;
    assert!(harness.manager.status().connected);

    // Concurrent disconnects share one teardown.
    tokio::join!(harness.manager.disconnect(), harness.manager.disconnect());

    let status = harness.manager.status();
    assert!(!status.connected);
    assert!(!status.connecting);
    assert!(harness.manager.sync_implementation().is_none());
    assert!(harness.storage.control_calls().contains(&ControlOp::Stop));

    // Disconnecting again is a no-op.
    harness.manager.disconnect().await;
}

#[tokio::test]
async fn disconnected_state_machine_never_reconnects() {
    let harness = TestHarness::new();
    let locks = Arc::new(SyncLocks::new());
    let status = StatusHandle::new();
    let sync = Arc::new(StreamingSyncImplementation::new(
        Arc::new(BucketStorage::new(harness.storage.clone())),
        harness.connector.clone(),
        harness.http.clone(),
        fast_options(),
        status.clone(),
        Arc::clone(&locks),
        Vec::new(),
    ));

    // A connect that lost the race against disconnect must not start a loop.
    sync.disconnect().await;
    sync.connect().await.unwrap();

    assert!(sync.is_closed());
    assert!(!sync.is_running());
    assert!(!locks.is_locked(LockType::Sync));
    assert!(!status.current().connecting);
    tokio::task::yield_now().await;
    assert!(harness.http.stream_requests().is_empty());
}

#[tokio::test]
async fn request_carries_credentials_and_user_agent() {
    let harness = TestHarness::new();
    harness
        .manager
        .connect(
            harness.connector.clone(),
            fast_options().with_user_agent("tidemark-test/1"),
        )
        .await;

    let request = &harness.http.stream_requests()[0];
    assert_eq!(request.url, format!("{TEST_ENDPOINT}/sync/stream"));
    assert_eq!(request.token, "token-1");
    assert_eq!(request.user_agent, "tidemark-test/1");
    let body = request.body.as_ref().unwrap();
    assert_eq!(body["client_id"], "test-client");
    assert_eq!(body["include_checksum"], true);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn signed_out_connector_reports_error() {
    let harness = TestHarness::new();
    harness.connector.set_signed_in(false);
    harness
        .manager
        .connect(
            harness.connector.clone(),
            fast_options().with_retry_delay(Duration::from_secs(60)),
        )
        .await;

    let status = harness.manager.status();
    assert!(!status.connected);
    assert!(status
        .data_flow
        .download_error
        .unwrap()
        .contains("no credentials"));
    assert!(harness.http.stream_requests().is_empty());

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn subscriptions_are_reference_counted() {
    let harness = TestHarness::new();
    let first = harness
        .manager
        .subscribe("lists", Some(json!({ "owner": "me" })), SubscribeOptions::new())
        .await
        .unwrap();
    let second = harness
        .manager
        .subscribe("lists", Some(json!({ "owner": "me" })), SubscribeOptions::new())
        .await
        .unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(harness.manager.active_subscriptions().len(), 1);
    assert_eq!(harness.manager.outstanding_subscription_handles().len(), 2);

    first.unsubscribe().await.unwrap();
    assert_eq!(harness.manager.active_subscriptions().len(), 1);
    assert_eq!(harness.storage.announced_subscriptions().len(), 1);

    second.unsubscribe().await.unwrap();
    assert!(harness.manager.active_subscriptions().is_empty());
    assert!(harness.storage.announced_subscriptions().is_empty());
    assert!(harness.manager.outstanding_subscription_handles().is_empty());

    let announcements = harness
        .storage
        .control_calls()
        .into_iter()
        .filter(|op| *op == ControlOp::UpdateSubscriptions)
        .count();
    assert_eq!(announcements, 3);
}

#[tokio::test]
async fn distinct_parameters_are_distinct_subscriptions() {
    let harness = TestHarness::new();
    let mine = harness
        .manager
        .subscribe("lists", Some(json!({ "owner": "me" })), SubscribeOptions::new())
        .await
        .unwrap();
    let theirs = harness
        .manager
        .subscribe(
            "lists",
            Some(json!({ "owner": "them" })),
            SubscribeOptions::new()
                .with_ttl(Duration::from_secs(3600))
                .with_priority(1),
        )
        .await
        .unwrap();

    let active = harness.manager.active_subscriptions();
    assert_eq!(active.len(), 2);
    assert!(active
        .iter()
        .any(|s| s.ttl == Some(3600) && s.priority == Some(1)));

    mine.unsubscribe().await.unwrap();
    theirs.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn subscriptions_are_sent_with_start() {
    let harness = TestHarness::new();
    let handle = harness
        .manager
        .subscribe("lists", None, SubscribeOptions::new())
        .await
        .unwrap();
    harness.connect().await;

    let start = harness
        .storage
        .control_log()
        .into_iter()
        .find(|(op, _)| *op == ControlOp::Start)
        .map(|(_, payload)| payload.as_text().unwrap())
        .unwrap();
    let start: Value = serde_json::from_str(&start).unwrap();
    assert_eq!(start["active_streams"][0]["name"], "lists");

    harness.manager.disconnect().await;
    handle.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn subscription_changes_reach_active_iteration() {
    let harness = TestHarness::new();
    harness.connect().await;
    let sync = harness.manager.sync_implementation().unwrap();
    eventually(|| sync.is_iteration_active()).await;

    let handle = harness
        .manager
        .subscribe("lists", None, SubscribeOptions::new())
        .await
        .unwrap();
    eventually(|| harness.storage.announced_subscriptions().len() == 1).await;
    assert_eq!(sync.subscriptions().len(), 1);

    handle.unsubscribe().await.unwrap();
    eventually(|| harness.storage.announced_subscriptions().is_empty()).await;

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn close_completes_status_streams() {
    let harness = TestHarness::new();
    let mut changes = harness.manager.status_stream();
    harness.connect().await;
    harness.manager.close().await;

    let drained = timeout(Duration::from_secs(5), async {
        while changes.next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn status_stream_reports_connection() {
    let harness = TestHarness::new();
    let mut changes = harness.manager.status_stream();
    harness.connect().await;

    let connected = timeout(Duration::from_secs(5), async {
        while let Some(status) = changes.next().await {
            if status.connected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(connected);

    harness.manager.disconnect().await;
}
