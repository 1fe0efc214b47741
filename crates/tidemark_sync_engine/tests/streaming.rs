//! Integration tests for the streaming sync state machine.

use std::time::Duration;
use tidemark_sync_engine::SyncOptions;
use tidemark_sync_protocol::{
    BucketChecksum, Checkpoint, ControlOp, Instruction, OplogEntry, StreamingSyncLine,
    StreamingSyncRequest, UpdateType,
};
use tidemark_testkit::prelude::*;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn patient_options() -> SyncOptions {
    fast_options().with_retry_delay(Duration::from_secs(60))
}

fn milk() -> OplogEntry {
    OplogEntry::put("1", "todos", "t1", r#"{"title":"milk"}"#, 42)
}

#[tokio::test]
async fn streamed_checkpoint_is_applied() {
    let harness = TestHarness::new();
    harness.http.push_stream(StreamScript::lines_then_open([
        checkpoint_line("1", vec![BucketChecksum::new("global[]", 42)]),
        data_line("global[]", vec![milk()]),
        checkpoint_complete_line("1"),
    ]));

    harness.connect().await;
    timeout(WAIT, harness.manager.wait_for_first_sync(None))
        .await
        .unwrap()
        .unwrap();

    let status = harness.manager.status();
    assert_eq!(status.has_synced, Some(true));
    assert!(status.last_synced_at.is_some());
    assert!(!status.data_flow.downloading);
    assert!(status.data_flow.download_error.is_none());
    assert_eq!(harness.storage.row("todos", "t1").unwrap()["title"], "milk");

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn checksum_mismatch_drops_bucket_and_reconnects() {
    let harness = TestHarness::new();
    harness.http.push_stream(StreamScript::lines_then_open([
        checkpoint_line("1", vec![BucketChecksum::new("global[]", 41)]),
        data_line("global[]", vec![milk()]),
        checkpoint_complete_line("1"),
    ]));

    harness.manager.connect(harness.connector.clone(), patient_options()).await;
    harness.http.wait_for_streams(2).await;

    assert_ne!(harness.manager.status().has_synced, Some(true));
    assert!(harness.storage.row("todos", "t1").is_none());
    assert_eq!(harness.storage.bucket_op_count("global[]"), 0);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn partial_checkpoint_syncs_priority_first() {
    let harness = TestHarness::new();
    let (lines, script) = StreamScript::channel();
    harness.http.push_stream(script);
    harness.connect().await;

    let checkpoint = Checkpoint::new(
        "2",
        vec![
            BucketChecksum::new("urgent[]", 1).with_priority(0),
            BucketChecksum::new("later[]", 2).with_priority(3),
        ],
    );
    let checkpoint = StreamingSyncLine::Checkpoint(checkpoint).encode().unwrap();
    lines.send(checkpoint).unwrap();
    lines
        .send(data_line(
            "urgent[]",
            vec![OplogEntry::put("1", "todos", "a", "{}", 1)],
        ))
        .unwrap();
    lines
        .send(data_line(
            "later[]",
            vec![OplogEntry::put("2", "todos", "b", "{}", 2)],
        ))
        .unwrap();
    lines.send(partial_checkpoint_complete_line("2", 0)).unwrap();

    timeout(WAIT, harness.manager.wait_for_first_sync(Some(0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(harness.manager.status().has_synced, Some(false));
    assert!(harness.storage.row("todos", "a").is_some());
    assert!(harness.storage.row("todos", "b").is_none());

    lines.send(checkpoint_complete_line("2")).unwrap();
    timeout(WAIT, harness.manager.wait_for_first_sync(None))
        .await
        .unwrap()
        .unwrap();
    assert!(harness.storage.row("todos", "b").is_some());

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn pending_upload_delays_checkpoint() {
    let harness = TestHarness::new();
    harness
        .storage
        .insert_crud(UpdateType::Put, "todos", "mine", None, None);
    let checkpoint = Checkpoint::new("1", vec![BucketChecksum::new("global[]", 42)])
        .with_write_checkpoint("1");
    harness.http.push_stream(StreamScript::lines_then_open([
        StreamingSyncLine::Checkpoint(checkpoint).encode().unwrap(),
        data_line("global[]", vec![milk()]),
        checkpoint_complete_line("1"),
    ]));

    harness.connect().await;
    timeout(WAIT, harness.manager.wait_for_first_sync(None))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(harness.storage.crud_len(), 0);
    assert!(harness.storage.row("todos", "t1").is_some());
    assert!(harness.storage.row("todos", "mine").is_some());
    assert_eq!(harness.storage.local_target_op(), "1");

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn duplicate_stream_is_protocol_error() {
    let harness = TestHarness::new();
    harness.storage.script_control(
        ControlOp::Start,
        vec![
            Instruction::EstablishSyncStream {
                request: StreamingSyncRequest::default(),
            },
            Instruction::EstablishSyncStream {
                request: StreamingSyncRequest::default(),
            },
        ],
    );

    harness.manager.connect(harness.connector.clone(), patient_options()).await;
    eventually(|| harness.manager.status().data_flow.download_error.is_some()).await;

    let error = harness.manager.status().data_flow.download_error.unwrap();
    assert!(error.contains("EstablishSyncStream"));
    assert!(!harness.manager.status().connected);
    assert!(harness.storage.control_calls().contains(&ControlOp::Stop));

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn unauthorized_invalidates_credentials() {
    let harness = TestHarness::new();
    harness.http.push_stream(StreamScript::Status {
        status: 401,
        body: "token expired".to_string(),
    });

    harness.manager.connect(harness.connector.clone(), patient_options()).await;

    let status = harness.manager.status();
    assert!(status
        .data_flow
        .download_error
        .unwrap()
        .contains("unauthorized"));
    assert_eq!(harness.connector.invalidation_count(), 1);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn server_error_is_reported() {
    let harness = TestHarness::new();
    harness.http.push_stream(StreamScript::Status {
        status: 503,
        body: "maintenance".to_string(),
    });

    harness.manager.connect(harness.connector.clone(), patient_options()).await;

    let error = harness.manager.status().data_flow.download_error.unwrap();
    assert!(error.contains("503"));
    assert_eq!(harness.connector.invalidation_count(), 0);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn expiring_token_is_prefetched() {
    let harness = TestHarness::new();
    harness
        .http
        .push_stream(StreamScript::lines_then_open([token_expires_in_line(10)]));

    harness.connect().await;
    eventually(|| {
        harness
            .storage
            .control_calls()
            .contains(&ControlOp::RefreshedToken)
    })
    .await;

    assert_eq!(harness.connector.fetch_count(), 2);
    assert_eq!(harness.http.stream_requests().len(), 1);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn expired_token_reconnects_with_new_credentials() {
    let harness = TestHarness::new();
    harness
        .http
        .push_stream(StreamScript::lines_then_open([token_expires_in_line(0)]));

    harness.manager.connect(harness.connector.clone(), patient_options()).await;
    timeout(WAIT, harness.http.wait_for_streams(2)).await.unwrap();

    let requests = harness.http.stream_requests();
    assert_eq!(requests[0].token, "token-1");
    assert_eq!(requests[1].token, "token-2");
    assert_eq!(harness.connector.invalidation_count(), 1);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn transport_error_is_retried() {
    let harness = TestHarness::new();
    harness
        .http
        .push_stream(StreamScript::Unreachable("connection refused".to_string()));

    harness.connect().await;
    let error = harness.manager.status().data_flow.download_error;
    assert!(error.unwrap().contains("connection refused"));

    // The next attempt succeeds and clears the error.
    eventually(|| {
        let status = harness.manager.status();
        status.connected && status.data_flow.download_error.is_none()
    })
    .await;
    assert_eq!(harness.http.stream_requests().len(), 2);

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn ended_stream_reconnects() {
    let harness = TestHarness::new();
    harness
        .http
        .push_stream(StreamScript::lines([token_expires_in_line(3600)]));

    harness.manager.connect(harness.connector.clone(), patient_options()).await;
    timeout(WAIT, harness.http.wait_for_streams(2)).await.unwrap();
    assert!(harness.manager.status().data_flow.download_error.is_none());

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn hidden_disconnect_reconnects_immediately() {
    let harness = TestHarness::new();
    harness.storage.script_control(
        ControlOp::LineText,
        vec![Instruction::CloseSyncStream {
            hide_disconnect: true,
        }],
    );
    harness
        .http
        .push_stream(StreamScript::lines_then_open([token_expires_in_line(3600)]));

    harness.manager.connect(harness.connector.clone(), patient_options()).await;
    timeout(WAIT, harness.http.wait_for_streams(2)).await.unwrap();
    assert!(harness.manager.status().data_flow.download_error.is_none());

    harness.manager.disconnect().await;
}

#[tokio::test]
async fn unknown_lines_are_ignored() {
    let harness = TestHarness::new();
    harness
        .http
        .push_stream(StreamScript::lines_then_open([r#"{"something_new":{}}"#]));

    harness.connect().await;
    eventually(|| harness.storage.control_calls().contains(&ControlOp::LineText)).await;

    let status = harness.manager.status();
    assert!(status.connected);
    assert!(status.data_flow.download_error.is_none());
    assert_eq!(harness.http.stream_requests().len(), 1);

    harness.manager.disconnect().await;
}
