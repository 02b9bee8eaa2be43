//! WebSocket attach endpoints.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use build_agent_core::{OutputFrame, OutputSubscription, ReplayFrom};
use build_agent_pty::PtyDimensions;
use build_agent_session::{
    ControlAttachment, ObserverGuard, ObserverId, Session, SessionError, SessionRegistry,
    SpectateAttachment, StatusAttachment,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::{
    path::{AttachKind, AttachTarget, OutputMode},
    protocol::{ClientMessage, ServerMessage, encode_frame},
    router::AppState,
};

/// Lookups retried when the resolved session is destroyed under us.
const ATTACH_ATTEMPTS: usize = 3;

type Sink = SplitSink<WebSocket, Message>;

/// Query parameters of an attach request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachParams {
    /// Sequence number of the last frame the client saw; replay resumes
    /// after it.
    pub replay_from: Option<u64>,
}

impl AttachParams {
    /// Where output starts, `fallback` when the client gave no position.
    #[must_use]
    pub const fn replay(&self, fallback: ReplayFrom) -> ReplayFrom {
        match self.replay_from {
            Some(last_seen) => ReplayFrom::After(last_seen),
            None => fallback,
        }
    }
}

/// Upgrade handler for every attach path.
///
/// Mounted as the router fallback; paths that match no endpoint get 404.
pub async fn attach_handler(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Query<AttachParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(target) = state.paths.resolve(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    tracing::info!(context = %target.context, kind = ?target.kind, "Observer connecting");
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, registry, target, params))
}

async fn handle_socket(
    socket: WebSocket,
    registry: SessionRegistry,
    target: AttachTarget,
    params: AttachParams,
) {
    match target.kind {
        AttachKind::Status => {
            match attach_with_retry(&registry, &target.context, Session::attach_status) {
                Ok(attachment) => serve_status(socket, attachment).await,
                Err(e) => refuse(socket, &e).await,
            }
        }
        AttachKind::Terminal {
            mode,
            read_only: true,
        } => {
            // Spectators see everything retained unless they ask otherwise.
            let replay = params.replay(ReplayFrom::Start);
            match attach_with_retry(&registry, &target.context, |session| {
                session.attach_spectate(replay)
            }) {
                Ok(attachment) => serve_terminal(socket, Observer::from(attachment), mode).await,
                Err(e) => refuse(socket, &e).await,
            }
        }
        AttachKind::Terminal {
            mode,
            read_only: false,
        } => {
            match attach_with_retry(&registry, &target.context, |session| {
                session.attach_control(params.replay(ReplayFrom::Live))
            }) {
                Ok(attachment) => serve_terminal(socket, Observer::from(attachment), mode).await,
                Err(e) => refuse(socket, &e).await,
            }
        }
    }
    tracing::info!(context = %target.context, "Observer disconnected");
}

fn attach_with_retry<T>(
    registry: &SessionRegistry,
    context: &str,
    attach: impl Fn(&Arc<Session>) -> Result<T, SessionError>,
) -> Result<T, SessionError> {
    for _ in 0..ATTACH_ATTEMPTS {
        match attach(&registry.get_or_create(context)) {
            Err(SessionError::Closed) => tracing::debug!(context, "Session closed, retrying"),
            result => return result,
        }
    }
    Err(SessionError::Closed)
}

async fn refuse(socket: WebSocket, error: &SessionError) {
    tracing::warn!("Attach refused: {error}");
    let (mut sink, _) = socket.split();
    let _ = send_message(&mut sink, &ServerMessage::error(error)).await;
    let _ = sink.close().await;
}

/// A terminal observer, controlling or read-only.
struct Observer {
    session: Arc<Session>,
    output: OutputSubscription,
    control: Option<(ObserverId, oneshot::Receiver<()>)>,
    guard: ObserverGuard,
}

impl From<ControlAttachment> for Observer {
    fn from(attachment: ControlAttachment) -> Self {
        Self {
            session: Arc::clone(attachment.guard.session()),
            output: attachment.output,
            control: Some((attachment.holder, attachment.preempted)),
            guard: attachment.guard,
        }
    }
}

impl From<SpectateAttachment> for Observer {
    fn from(attachment: SpectateAttachment) -> Self {
        Self {
            session: Arc::clone(attachment.guard.session()),
            output: attachment.output,
            control: None,
            guard: attachment.guard,
        }
    }
}

enum Flow {
    Continue,
    Close,
}

async fn serve_terminal(socket: WebSocket, observer: Observer, mode: OutputMode) {
    let Observer {
        session,
        output,
        control,
        guard,
    } = observer;
    let (mut sink, mut stream) = socket.split();

    if output.gap() {
        let gap = ServerMessage::ReplayGap {
            requested: output.requested().unwrap_or_default(),
            first_available: output.first_available(),
        };
        if send_message(&mut sink, &gap).await.is_err() {
            return;
        }
    }

    let (holder, mut preempted) = match control {
        Some((holder, preempted)) => (Some(holder), Some(preempted)),
        None => (None, None),
    };
    let mut frames = output.into_stream();

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => {
                    if send_frame(&mut sink, mode, &frame).await.is_err() {
                        break;
                    }
                }
                None => {
                    tracing::debug!(context = %session.context(), "Output stream ended");
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(message)) => {
                    let flow = handle_message(&session, holder, mode, message, &mut sink).await;
                    if matches!(flow, Flow::Close) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!("WebSocket error: {e}");
                    break;
                }
                None => break,
            },
            () = wait_preempted(&mut preempted) => {
                let _ = send_message(&mut sink, &ServerMessage::Preempted).await;
                break;
            }
        }
    }

    drop(guard);
    let _ = sink.close().await;
}

/// Resolves once control is taken away. Never resolves for spectators or
/// when the slot is simply released.
async fn wait_preempted(preempted: &mut Option<oneshot::Receiver<()>>) {
    let Some(receiver) = preempted.as_mut() else {
        return std::future::pending().await;
    };
    let result = receiver.await;
    *preempted = None;
    if result.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn handle_message(
    session: &Arc<Session>,
    holder: Option<ObserverId>,
    mode: OutputMode,
    message: Message,
    sink: &mut Sink,
) -> Flow {
    let text = match message {
        Message::Text(text) => text.as_str().to_owned(),
        // Binary terminals take raw keystrokes.
        Message::Binary(data) if mode == OutputMode::Binary => {
            let reply = match holder {
                Some(holder) => session
                    .write_input(holder, data)
                    .await
                    .err()
                    .map(ServerMessage::error),
                None => Some(ServerMessage::error("Read-only observer")),
            };
            return reply_with(sink, reply).await;
        }
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => text,
            Err(_) => return Flow::Continue,
        },
        Message::Close(_) => return Flow::Close,
        _ => return Flow::Continue,
    };

    let reply = match ClientMessage::parse(&text) {
        Ok(ClientMessage::Ping) => Some(ServerMessage::Pong),
        Ok(message) => match holder {
            Some(holder) => apply_control(session, holder, message).await,
            None => Some(ServerMessage::error("Read-only observer")),
        },
        Err(e) => {
            tracing::warn!("Invalid client message: {e}");
            Some(ServerMessage::error(e))
        }
    };
    reply_with(sink, reply).await
}

async fn apply_control(
    session: &Arc<Session>,
    holder: ObserverId,
    message: ClientMessage,
) -> Option<ServerMessage> {
    let result = match message {
        ClientMessage::Execute { command } => session
            .execute(&command)
            .await
            .map(|task_id| Some(ServerMessage::TaskStarted { task_id })),
        ClientMessage::Input { .. } => match message.decode_input() {
            Ok(Some(bytes)) => session
                .write_input(holder, bytes.into())
                .await
                .map(|()| None),
            Ok(None) => Ok(None),
            Err(e) => return Some(ServerMessage::error(e)),
        },
        ClientMessage::Resize { cols, rows } => session
            .resize(holder, PtyDimensions { cols, rows })
            .map(|()| None),
        ClientMessage::Kill => session.kill(holder).map(|_| None),
        ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
    };
    result.unwrap_or_else(|e| {
        tracing::debug!(context = %session.context(), "Control request failed: {e}");
        Some(ServerMessage::error(e))
    })
}

async fn reply_with(sink: &mut Sink, reply: Option<ServerMessage>) -> Flow {
    match reply {
        Some(reply) if send_message(sink, &reply).await.is_err() => Flow::Close,
        _ => Flow::Continue,
    }
}

async fn send_frame(sink: &mut Sink, mode: OutputMode, frame: &OutputFrame) -> Result<(), axum::Error> {
    match mode {
        OutputMode::Binary => sink.send(Message::Binary(encode_frame(frame))).await,
        OutputMode::Text => send_message(sink, &ServerMessage::output(frame)).await,
    }
}

async fn send_message(sink: &mut Sink, message: &ServerMessage) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            Ok(())
        }
    }
}

async fn serve_status(socket: WebSocket, attachment: StatusAttachment) {
    let StatusAttachment { mut events, guard } = attachment;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Failed to serialize status event: {e}"),
                },
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(guard);
    let _ = sink.close().await;
}
