//! End-to-end tests across the correlation engine, command client, router,
//! and control loops, with a scripted fake agent on the far end of the
//! registry.

mod helpers;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use fleet_control::{
    commands::{CommandError, DEFAULT_TIMEOUT},
    protocol::{actions, Envelope, MessageKind},
    scheduler::BackupScheduler,
    store::{BackupJob, Store},
};
use helpers::{test_cipher, test_plane, test_plane_with_retries};
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

fn response_frame(id: i64, action: &str, payload: serde_json::Value) -> String {
    json!({
        "type": "response",
        "id": id,
        "action": action,
        "payload": payload,
        "timestamp": Utc::now().timestamp_millis(),
    })
    .to_string()
}

#[tokio::test]
async fn command_round_trip_through_router() {
    let mut plane = test_plane().await;

    let wait = tokio::spawn({
        let commands = plane.commands.clone();
        async move {
            commands
                .send_and_wait(1, actions::GET_SERVICES, None, DEFAULT_TIMEOUT)
                .await
        }
    });

    // the fake agent receives the request and replies via the router
    let frame = plane.wire_rx.recv().await.unwrap();
    let request: Envelope = serde_json::from_str(&frame).unwrap();
    assert_eq!(request.kind, MessageKind::Request);
    assert_eq!(request.action, "get-services");

    plane
        .router
        .handle_frame(1, &response_frame(request.id, "get-services", json!({"services": ["nginx"]})))
        .await;

    let reply = wait.await.unwrap().unwrap();
    assert_eq!(reply.payload.unwrap()["services"][0], "nginx");
}

#[tokio::test(start_paused = true)]
async fn every_retry_carries_the_original_wire_id() {
    let mut plane = test_plane().await;
    plane.commands.spawn_retry_worker(plane.retry_rx);

    // fire-and-forget has a 10s window; never answer it
    let id = plane
        .commands
        .send_fire_and_forget(1, actions::RESTART_SERVICE, Some(json!({"name": "nginx"})))
        .unwrap();

    let mut wire_ids = Vec::new();
    for _ in 0..4 {
        let frame = plane.wire_rx.recv().await.unwrap();
        let envelope: Envelope = serde_json::from_str(&frame).unwrap();
        wire_ids.push(envelope.id);
    }

    // first attempt plus three retries, all with the identical identifier
    assert_eq!(wire_ids, vec![id, id, id, id]);

    // after exhaustion the failure is reported exactly once
    let failure = plane.failed_rx.recv().await.unwrap();
    assert_eq!(failure.id, id);
    assert_eq!(failure.retries, 3);
    assert_eq!(plane.engine.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_reply_to_an_early_retry_still_resolves_the_wait() {
    let mut plane = test_plane_with_retries(3).await;
    plane.commands.spawn_retry_worker(plane.retry_rx);

    let wait = tokio::spawn({
        let commands = plane.commands.clone();
        async move {
            commands
                .send_and_wait(
                    1,
                    actions::GET_SERVER_INFO,
                    None,
                    Duration::from_secs(5),
                )
                .await
        }
    });

    // swallow the first attempt, let one retry go out
    let first: Envelope =
        serde_json::from_str(&plane.wire_rx.recv().await.unwrap()).unwrap();
    let retry: Envelope =
        serde_json::from_str(&plane.wire_rx.recv().await.unwrap()).unwrap();
    assert_eq!(first.id, retry.id);

    // the agent finally answers (conceptually to the first attempt)
    plane
        .router
        .handle_frame(1, &response_frame(first.id, "get-server-info", json!({"os": "linux"})))
        .await;

    let reply = wait.await.unwrap().unwrap();
    assert_eq!(reply.id, first.id);

    // a duplicate reply to the retry is unmatched and harmless
    plane
        .router
        .handle_frame(1, &response_frame(retry.id, "get-server-info", json!({"os": "linux"})))
        .await;
}

#[tokio::test]
async fn not_connected_timeout_and_success_are_distinguishable() {
    let mut plane = test_plane_with_retries(0).await;

    // not connected
    let err = plane
        .commands
        .send_and_wait(77, actions::GET_PROCESSES, None, DEFAULT_TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NotConnected(77)));

    // timeout (no retries configured, tiny window)
    let err = plane
        .commands
        .send_and_wait(1, actions::GET_PROCESSES, None, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::TimedOut { retries: 0, .. }));

    // success
    let wait = tokio::spawn({
        let commands = plane.commands.clone();
        async move {
            commands
                .send_and_wait(1, actions::GET_PROCESSES, None, DEFAULT_TIMEOUT)
                .await
        }
    });
    // skip the frame from the timed-out attempt
    let _ = plane.wire_rx.recv().await.unwrap();
    let frame = plane.wire_rx.recv().await.unwrap();
    let request: Envelope = serde_json::from_str(&frame).unwrap();
    plane
        .router
        .handle_frame(1, &response_frame(request.id, "get-processes", json!([])))
        .await;

    assert!(wait.await.unwrap().is_ok());
}

#[tokio::test]
async fn triggered_backup_completes_via_unsolicited_event() {
    let mut plane = test_plane().await;
    let cipher = test_cipher();

    let job = BackupJob {
        id: Uuid::new_v4(),
        agent_id: 1,
        name: "nightly".into(),
        schedule_cron: "0 2 * * *".into(),
        source_path: "/srv/data".into(),
        repo_url: "rest:https://backups.example".into(),
        encrypted_password: cipher.encrypt("repo-pass"),
        encrypted_ssh_key: cipher.encrypt("ssh-key"),
        is_active: true,
        created_at_utc: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        last_run_at_utc: None,
        last_run_status: None,
    };
    plane.store.add_backup_job(job.clone()).await;

    let scheduler = BackupScheduler::new(
        plane.store.clone(),
        plane.registry.clone(),
        plane.commands.clone(),
        cipher,
    );

    // day1 02:00 has passed: the job triggers
    let now = Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 30).unwrap();
    scheduler.check_due_jobs(now).await;

    let frame = plane.wire_rx.recv().await.unwrap();
    let request: Envelope = serde_json::from_str(&frame).unwrap();
    assert_eq!(request.action, "trigger-backup");
    let task_id = request.payload.as_ref().unwrap()["taskId"]
        .as_str()
        .unwrap()
        .to_string();

    // log row is pending until the agent reports back
    let logs = plane.store.logs_for_job(job.id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "pending");

    // the agent reports completion as an unsolicited event with the task id
    let event = json!({
        "type": "event",
        "id": 0,
        "action": "backup-completed",
        "payload": {
            "taskId": task_id,
            "result": {
                "status": "ok",
                "snapshotId": "abc123",
                "filesNew": 17,
                "dataAdded": 1048576,
                "duration": 42.5,
                "errorMessage": null
            }
        },
        "timestamp": Utc::now().timestamp_millis(),
    })
    .to_string();
    plane.router.handle_frame(1, &event).await;

    let logs = plane.store.logs_for_job(job.id).await;
    assert_eq!(logs[0].status, "success");
    assert_eq!(logs[0].snapshot_id.as_deref(), Some("abc123"));

    let job_row = plane.store.backup_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_row.last_run_status.as_deref(), Some("success"));
    assert!(job_row.last_run_at_utc.is_some());
}

#[tokio::test]
async fn command_failure_is_broadcast_to_operators() {
    let plane = test_plane_with_retries(0).await;
    fleet_control::commands::spawn_failure_listener(plane.hub.clone(), plane.failed_rx);
    let mut ui_rx = plane.hub.subscribe();

    let err = plane
        .commands
        .send_and_wait(1, actions::GET_SERVICES, None, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::TimedOut { .. }));

    let event = ui_rx.recv().await.unwrap();
    assert_eq!(event.event, "CommandFailed");
    assert_eq!(event.group, "server-1");
    assert_eq!(event.payload["action"], "get-services");
}
