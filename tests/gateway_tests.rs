//! WebSocket gateway tests against a live server on an ephemeral port

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use shellvisor::exec::ExecState;

use common::{
    config, connect, is_finished, is_result_for, json, next_text, orchestrator, read_until, send, spawn_gateway,
    Scripted,
};

#[tokio::test]
async fn test_execute_command_returns_result_frame() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=alice&session=s1").await;

    send(&mut ws, r#"{"command": "vm-execute", "args": {"command": "echo hello"}}"#).await;
    let frames = read_until(&mut ws, |t| is_result_for(t, "vm-execute")).await;
    let result = json(frames.last().unwrap());
    assert_eq!(result["result"]["state"], "completed");
    assert_eq!(result["result"]["exit_code"], 0);
    assert_eq!(result["result"]["output"], "hello\n");
}

#[tokio::test]
async fn test_streaming_output_and_busy_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=bob&session=s1").await;

    send(&mut ws, r#"{"command": "vm-execute-stream", "args": {"command": "echo start; sleep 30"}}"#).await;
    read_until(&mut ws, |t| t == "start\n").await;

    send(&mut ws, r#"{"command": "vm-execute-stream", "args": {"command": "echo second"}}"#).await;
    let frames = read_until(&mut ws, |t| json(t).get("error").is_some()).await;
    assert_eq!(json(frames.last().unwrap())["error"]["kind"], "busy");

    send(&mut ws, r#"{"command": "vm-cancel"}"#).await;
    let frames = read_until(&mut ws, is_finished).await;
    assert_eq!(json(frames.last().unwrap())["exec_finished"]["state"], "killed");
}

#[tokio::test]
async fn test_stdin_prompt_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=carol&session=s1").await;

    send(
        &mut ws,
        r#"{"command": "vm-execute-stream", "args": {"command": "printf 'Password: '; read pw; echo \"len ${#pw}\""}}"#,
    )
    .await;
    let frames = read_until(&mut ws, |t| json(t).get("stdin_request").is_some()).await;
    assert_eq!(json(frames.last().unwrap())["stdin_request"], "Password:");

    send(&mut ws, r#"{"command": "vm-send-input", "args": {"data": "hunter2"}}"#).await;
    let frames = read_until(&mut ws, is_finished).await;
    let requests = frames.iter().filter(|t| json(t).get("stdin_request").is_some()).count();
    assert_eq!(requests, 0);
    assert!(frames.iter().any(|t| t.contains("len 7")));
}

#[tokio::test]
async fn test_closing_connection_keeps_execution_and_reattach_can_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(Arc::clone(&orch)).await;

    let mut ws = connect(addr, "user=dave&session=s1").await;
    send(&mut ws, r#"{"command": "vm-execute-stream", "args": {"command": "sleep 30"}}"#).await;
    read_until(&mut ws, |t| is_result_for(t, "vm-execute-stream")).await;
    ws.close(None).await.unwrap();
    drop(ws);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orch.status("dave").await.execution.unwrap().state, ExecState::Running);

    let mut ws = connect(addr, "user=dave&session=s2").await;
    send(&mut ws, r#"{"command": "vm-cancel"}"#).await;
    let frames = read_until(&mut ws, is_finished).await;
    assert_eq!(json(frames.last().unwrap())["exec_finished"]["state"], "killed");
}

#[tokio::test]
async fn test_chat_fragments_reach_every_connection_of_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&["Hel", "lo", "!"])));
    let addr = spawn_gateway(orch).await;

    let mut first = connect(addr, "user=erin&session=chat").await;
    let mut second = connect(addr, "user=erin&session=chat").await;
    // Both subscriptions are in place once each connection answers a command
    for ws in [&mut first, &mut second] {
        send(ws, r#"{"command": "vm-status"}"#).await;
        read_until(ws, |t| is_result_for(t, "vm-status")).await;
    }

    send(&mut first, "hi there").await;
    let a = read_until(&mut first, |t| t == "!").await;
    let b = read_until(&mut second, |t| t == "!").await;
    assert_eq!(a, vec!["Hel", "lo", "!"]);
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_memory_commands() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=fay&session=s1").await;

    send(&mut ws, r#"{"command": "set-memory", "args": {"key": "lang", "value": "rust"}}"#).await;
    send(&mut ws, r#"{"command": "set-memory", "args": {"key": "name", "value": "Fay", "protected": true}}"#).await;
    for _ in 0..2 {
        read_until(&mut ws, |t| is_result_for(t, "set-memory")).await;
    }

    send(&mut ws, r#"{"command": "clear-memory"}"#).await;
    let frames = read_until(&mut ws, |t| is_result_for(t, "clear-memory")).await;
    assert_eq!(json(frames.last().unwrap())["result"]["removed"], 1);

    send(&mut ws, r#"{"command": "get-memory"}"#).await;
    let frames = read_until(&mut ws, |t| is_result_for(t, "get-memory")).await;
    let memory = json(frames.last().unwrap())["result"].clone();
    assert_eq!(memory["name"], "Fay");
    assert!(memory.get("lang").is_none());
}

#[tokio::test]
async fn test_list_directory_is_scoped_to_the_user() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    std::fs::create_dir_all(cfg.upload_dir.join("gil/docs")).unwrap();
    std::fs::write(cfg.upload_dir.join("gil/notes.txt"), "abc").unwrap();
    let orch = orchestrator(cfg, Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=gil&session=s1").await;

    send(&mut ws, r#"{"command": "list-directory"}"#).await;
    let frames = read_until(&mut ws, |t| is_result_for(t, "list-directory")).await;
    let entries = json(frames.last().unwrap())["result"].clone();
    assert_eq!(entries[0]["name"], "docs");
    assert_eq!(entries[0]["is_dir"], true);
    assert_eq!(entries[1]["name"], "notes.txt");
    assert_eq!(entries[1]["size"], 3);

    send(&mut ws, r#"{"command": "list-directory", "args": {"path": "../other"}}"#).await;
    let frames = read_until(&mut ws, |t| json(t).get("error").is_some()).await;
    assert_eq!(json(frames.last().unwrap())["error"]["kind"], "bad_request");
}

#[tokio::test]
async fn test_notifications_delivered_on_connect() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    orch.notify("hank", "backup finished").await.unwrap();
    orch.notify("hank", "disk at 90%").await.unwrap();
    let addr = spawn_gateway(Arc::clone(&orch)).await;

    let mut ws = connect(addr, "user=hank&session=s1").await;
    assert_eq!(next_text(&mut ws).await.unwrap(), "[notification] backup finished");
    assert_eq!(next_text(&mut ws).await.unwrap(), "[notification] disk at 90%");

    send(&mut ws, r#"{"command": "notify", "args": {"text": "to self"}}"#).await;
    let frames = read_until(&mut ws, |t| t == "[notification] to self").await;
    assert!(frames.iter().all(|t| json(t).get("error").is_none()));
}

#[tokio::test]
async fn test_unknown_command_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(config(dir.path()), Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=ivy&session=s1").await;

    send(&mut ws, r#"{"command": "format-disk"}"#).await;
    let error = json(&next_text(&mut ws).await.unwrap());
    assert_eq!(error["error"]["kind"], "bad_request");

    // The connection stays usable
    send(&mut ws, r#"{"command": "vm-status"}"#).await;
    read_until(&mut ws, |t| is_result_for(t, "vm-status")).await;
}

#[tokio::test]
async fn test_bad_token_is_rejected_with_policy_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.auth_token = Some("sesame".to_string());
    let orch = orchestrator(cfg, Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;

    let mut ws = connect(addr, "user=jo&session=s1&token=wrong").await;
    let error = json(&next_text(&mut ws).await.unwrap());
    assert_eq!(error["error"]["kind"], "unauthorized");

    let close = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no close frame");
    match close {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected policy close, got {other:?}"),
    }

    let mut ok = connect(addr, "user=jo&session=s1&token=sesame").await;
    send(&mut ok, r#"{"command": "vm-status"}"#).await;
    read_until(&mut ok, |t| is_result_for(t, "vm-status")).await;
}

#[tokio::test]
async fn test_frame_flood_is_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.frames_per_second = 1.0;
    let orch = orchestrator(cfg, Arc::new(Scripted::content(&[])));
    let addr = spawn_gateway(orch).await;
    let mut ws = connect(addr, "user=kim&session=s1").await;

    // Burst is four frames at one frame per second
    for _ in 0..8 {
        send(&mut ws, r#"{"command": "vm-status"}"#).await;
    }
    let mut limited = 0;
    let mut answered = 0;
    while limited + answered < 8 {
        let frame = json(&next_text(&mut ws).await.unwrap());
        if frame["error"]["kind"] == "rate_limited" {
            limited += 1;
        } else if frame["command"] == "vm-status" {
            answered += 1;
        }
    }
    assert!(limited >= 3);
    assert!(answered >= 4);
}
