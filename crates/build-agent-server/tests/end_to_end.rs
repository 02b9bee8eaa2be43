//! Drives a real agent over HTTP and WebSockets.
#![cfg(unix)]

use std::{net::SocketAddr, path::Path, time::Duration};

use axum::{Json, Router, extract::State, routing::post};
use build_agent_client::{BoundedRetryingClient, ClientRequest, Method, RetryConfig};
use build_agent_core::OutputFrame;
use build_agent_server::{AgentConfig, AgentServer, CallbackConfig};
use build_agent_session::SessionConfig;
use build_agent_transport::protocol::decode_frame;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_test::assert_ok;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(10);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config(log_folder: Option<&Path>) -> AgentConfig {
    AgentConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        shell: Some("/bin/sh".to_string()),
        session: SessionConfig {
            log_folder: log_folder.map(Path::to_path_buf),
            ..SessionConfig::default()
        },
        ..AgentConfig::default()
    }
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = assert_ok!(connect_async(format!("ws://{addr}{path}")).await);
    ws
}

/// Wait until `count` observers are registered on `context`. The upgrade
/// completes before the server attaches the socket.
async fn wait_for_observers(server: &AgentServer, context: &str, count: usize) {
    timeout(WAIT, async {
        loop {
            let attached = server
                .registry()
                .get(context)
                .map_or(0, |session| session.observer_count());
            if attached >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn next_message(ws: &mut Ws) -> Option<Message> {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
            Some(Ok(message)) => return Some(message),
        }
    }
}

async fn next_json(ws: &mut Ws) -> Value {
    match next_message(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text message, got {other:?}"),
    }
}

async fn execute(ws: &mut Ws, command: &str) {
    let message = json!({ "type": "execute", "command": command }).to_string();
    ws.send(Message::text(message)).await.unwrap();
}

/// Read until `task_started`, returning its id and the output seen so far.
async fn task_started(ws: &mut Ws) -> (u64, String) {
    let mut output = String::new();
    loop {
        let message = next_json(ws).await;
        match message["type"].as_str() {
            Some("task_started") => return (message["task_id"].as_u64().unwrap(), output),
            Some("output") => output.push_str(message["data"].as_str().unwrap()),
            _ => panic!("unexpected message {message}"),
        }
    }
}

/// Read binary output frames until their text contains `needle`.
async fn frames_until(ws: &mut Ws, needle: &str) -> Vec<OutputFrame> {
    let mut frames = Vec::new();
    let mut text = Vec::new();
    while !String::from_utf8_lossy(&text).contains(needle) {
        match next_message(ws).await {
            Some(Message::Binary(bytes)) => {
                let frame = assert_ok!(decode_frame(&bytes));
                text.extend_from_slice(&frame.data);
                frames.push(frame);
            }
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }
    frames
}

/// Read status events until `status`, returning the ones seen.
async fn until_status(ws: &mut Ws, status: &str) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = next_json(ws).await;
        let done = event["newStatus"] == status;
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn echo_hi_is_streamed_reported_and_logged() {
    let logs = tempfile::tempdir().unwrap();
    let server = assert_ok!(AgentServer::start(config(Some(logs.path()))).await);
    let addr = server.local_addr();

    let mut status = connect(addr, "/socket/process-status-updates/e2e").await;
    let mut control = connect(addr, "/socket/text/e2e").await;
    wait_for_observers(&server, "/e2e", 2).await;

    execute(&mut control, "echo hi").await;
    let (task_id, _) = task_started(&mut control).await;

    let events = until_status(&mut status, "COMPLETED").await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["previousStatus"], "CREATED");
    assert_eq!(events[0]["newStatus"], "RUNNING");
    assert_eq!(events[1]["previousStatus"], "RUNNING");
    assert!(events.iter().all(|event| event["taskId"] == task_id));

    let transcript = std::fs::read_to_string(logs.path().join("e2e.log")).unwrap();
    assert!(transcript.contains("% echo hi"));
    assert!(transcript.contains("hi"));
    assert!(transcript.contains("# Finished with status: COMPLETED"));

    assert_ok!(timeout(WAIT, server.shutdown()).await.unwrap());
    assert!(next_message(&mut status).await.is_none());
}

#[tokio::test]
async fn sequential_tasks_get_distinct_ids() {
    let server = assert_ok!(AgentServer::start(config(None)).await);
    let addr = server.local_addr();

    let mut status = connect(addr, "/socket/process-status-updates/twice").await;
    let mut control = connect(addr, "/socket/text/twice").await;
    wait_for_observers(&server, "/twice", 2).await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        execute(&mut control, "true").await;
        let (task_id, _) = task_started(&mut control).await;
        let events = until_status(&mut status, "COMPLETED").await;
        assert_eq!(events[0]["newStatus"], "RUNNING");
        assert!(events.iter().all(|event| event["taskId"] == task_id));
        ids.push(task_id);
    }
    assert_ne!(ids[0], ids[1]);

    assert_ok!(server.shutdown().await);
}

#[tokio::test]
async fn late_spectator_gets_binary_replay() {
    let server = assert_ok!(AgentServer::start(config(None)).await);
    let addr = server.local_addr();

    let mut status = connect(addr, "/socket/process-status-updates/replay").await;
    let mut control = connect(addr, "/socket/term/replay").await;
    wait_for_observers(&server, "/replay", 2).await;

    execute(&mut control, "printf abc").await;
    until_status(&mut status, "COMPLETED").await;

    let mut spectator = connect(addr, "/socket/term/replay/ro").await;
    let frames = frames_until(&mut spectator, "abc").await;
    let seqs: Vec<u64> = frames.iter().map(|frame| frame.seq).collect();
    assert_eq!(seqs, (0..frames.len() as u64).collect::<Vec<_>>());

    let input = json!({ "type": "kill" }).to_string();
    spectator.send(Message::text(input)).await.unwrap();
    assert_eq!(next_json(&mut spectator).await["type"], "error");

    assert_ok!(server.shutdown().await);
}

#[tokio::test]
async fn reconnecting_spectator_resumes_after_its_last_frame() {
    let server = assert_ok!(AgentServer::start(config(None)).await);
    let addr = server.local_addr();

    let mut status = connect(addr, "/socket/process-status-updates/resume").await;
    let mut control = connect(addr, "/socket/term/resume").await;
    wait_for_observers(&server, "/resume", 2).await;

    execute(&mut control, "printf first").await;
    until_status(&mut status, "COMPLETED").await;

    let mut spectator = connect(addr, "/socket/term/resume/ro").await;
    let seen = frames_until(&mut spectator, "first").await;
    let last_seen = seen.last().unwrap().seq;
    drop(spectator);

    execute(&mut control, "printf second").await;
    until_status(&mut status, "COMPLETED").await;

    let path = format!("/socket/term/resume/ro?replayFrom={last_seen}");
    let mut spectator = connect(addr, &path).await;
    let resumed = frames_until(&mut spectator, "second").await;
    assert_eq!(resumed[0].seq, last_seen + 1);
    assert!(resumed.windows(2).all(|pair| pair[1].seq == pair[0].seq + 1));
    let text: Vec<u8> = resumed
        .iter()
        .flat_map(|frame| frame.data.iter().copied())
        .collect();
    assert!(!String::from_utf8_lossy(&text).contains("first"));

    assert_ok!(server.shutdown().await);
}

#[tokio::test]
async fn new_controller_preempts_the_old_one() {
    let server = assert_ok!(AgentServer::start(config(None)).await);
    let addr = server.local_addr();

    let mut first = connect(addr, "/socket/text/shared").await;
    wait_for_observers(&server, "/shared", 1).await;
    let _second = connect(addr, "/socket/text/shared").await;

    assert_eq!(next_json(&mut first).await["type"], "preempted");
    assert!(next_message(&mut first).await.is_none());

    assert_ok!(server.shutdown().await);
}

#[tokio::test]
async fn serves_index_and_uploads() {
    let files = tempfile::tempdir().unwrap();
    let server = assert_ok!(AgentServer::start(config(None)).await);
    let addr = server.local_addr();
    let client = assert_ok!(BoundedRetryingClient::new(RetryConfig::no_retry()));

    let index = assert_ok!(
        client
            .invoke(&ClientRequest::get(format!("http://{addr}/")), 64 * 1024)
            .await
    );
    assert_eq!(index.status, 200);
    assert!(index.text().contains("xterm"));

    let destination = files.path().join("nested/dir/artifact.txt");
    let upload = ClientRequest::new(
        Method::PUT,
        format!("http://{addr}/servlet/upload{}", destination.display()),
    )
    .body("artifact contents");
    let response = assert_ok!(client.invoke(&upload, 1024).await);
    assert_eq!(response.status, 200);
    assert_eq!(
        std::fs::read_to_string(&destination).unwrap(),
        "artifact contents"
    );

    assert_ok!(server.shutdown().await);
}

#[tokio::test]
async fn status_transitions_are_posted_to_the_callback() {
    let (tx, mut received) = mpsc::unbounded_channel::<Value>();
    let receiver = Router::new()
        .route(
            "/status",
            post(
                |State(tx): State<mpsc::UnboundedSender<Value>>, Json(event): Json<Value>| async move {
                    let _ = tx.send(event);
                },
            ),
        )
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let callback_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, receiver).await.unwrap();
    });

    let server = assert_ok!(
        AgentServer::start(AgentConfig {
            status_callback: Some(CallbackConfig::new(format!("http://{callback_addr}/status"))),
            ..config(None)
        })
        .await
    );
    let mut control = connect(server.local_addr(), "/socket/text/cb").await;
    wait_for_observers(&server, "/cb", 1).await;

    execute(&mut control, "exit 3").await;
    let (task_id, _) = task_started(&mut control).await;

    let mut statuses = Vec::new();
    while statuses.last().map(String::as_str) != Some("FAILED") {
        let event = timeout(WAIT, received.recv()).await.unwrap().unwrap();
        assert_eq!(event["context"], "/cb");
        assert_eq!(event["taskId"], task_id);
        statuses.push(event["newStatus"].as_str().unwrap().to_string());
    }
    assert_eq!(statuses, ["RUNNING", "FAILED"]);

    assert_ok!(server.shutdown().await);
}
