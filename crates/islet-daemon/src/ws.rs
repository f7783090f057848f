//! WebSocket hub: live log fan-out and interactive terminals.
//!
//! Both endpoints authenticate via a `token` query parameter (or the
//! Authorization header) before the upgrade; tenancy is checked after the
//! upgrade so the client receives a proper close code (4004) instead of a
//! bare HTTP error. The log endpoint replays the stored tail and then
//! follows the sandbox's broker; the terminal endpoint bridges binary frames
//! to a PTY session with JSON control frames for resize and ping.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use islet_db::{SandboxRecord, SandboxStatus};
use islet_kernel::{ContainerRuntime, LogEvent};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::auth::Identity;
use crate::server::{require_bearer, ApiError, AppState};

/// Close code when the sandbox does not exist for this tenant.
const CLOSE_NOT_FOUND: u16 = 4004;
/// Close code when a terminal is requested for a non-running sandbox.
const CLOSE_NOT_RUNNING: u16 = 4003;
/// Close code when a slow viewer overflows its backlog.
const CLOSE_OVERFLOW: u16 = 1009;

const REPLAY_TAIL: u32 = 100;
const TERMINAL_COLS: u16 = 80;
const TERMINAL_ROWS: u16 = 24;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    #[serde(default)]
    token: Option<String>,
}

pub async fn logs_ws<R>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<Uuid>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response
where
    R: ContainerRuntime,
{
    let identity = match authenticate(&state, &query, &headers).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };
    ws.on_upgrade(move |socket| serve_logs(state, identity, id, socket))
}

pub async fn terminal_ws<R>(
    State(state): State<Arc<AppState<R>>>,
    Path(id): Path<Uuid>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response
where
    R: ContainerRuntime,
{
    let identity = match authenticate(&state, &query, &headers).await {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };
    ws.on_upgrade(move |socket| serve_terminal(state, identity, id, socket))
}

async fn authenticate<R>(
    state: &AppState<R>,
    query: &WsAuthQuery,
    headers: &HeaderMap,
) -> Result<Identity, ApiError>
where
    R: ContainerRuntime,
{
    let token = match query.token.as_deref() {
        Some(token) => token.to_string(),
        None => require_bearer(headers)?.to_string(),
    };
    Ok(state.gate.authenticate(&token).await?)
}

async fn load_owned<R>(
    state: &AppState<R>,
    identity: &Identity,
    id: Uuid,
) -> Option<SandboxRecord>
where
    R: ContainerRuntime,
{
    state
        .kernel
        .db()
        .fetch_sandbox(identity.user_id, id)
        .await
        .ok()
        .flatten()
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// ----------------------------------------------------------------------
// Log endpoint
// ----------------------------------------------------------------------

async fn serve_logs<R>(state: Arc<AppState<R>>, identity: Identity, id: Uuid, mut socket: WebSocket)
where
    R: ContainerRuntime,
{
    let Some(sandbox) = load_owned(&state, &identity, id).await else {
        close_with(&mut socket, CLOSE_NOT_FOUND, "sandbox not found").await;
        return;
    };

    let status_frame = json!({
        "event": "status",
        "data": {
            "status": sandbox.status.as_str(),
            "phase": sandbox.phase.as_str(),
            "provisionProgress": sandbox.provision_progress,
        },
    });
    if socket.send(Message::Text(status_frame.to_string())).await.is_err() {
        return;
    }

    match state.kernel.db().list_sandbox_logs(id, REPLAY_TAIL).await {
        Ok(entries) => {
            for entry in entries {
                let frame = log_frame(entry.stream.as_str(), &entry.text, entry.timestamp);
                if socket.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
        }
        Err(err) => debug!(sandbox_id = %id, error = %err, "log replay failed"),
    }

    // Live tail only while the sandbox is running; otherwise this socket is
    // a passive status observer.
    let mut live = if sandbox.status == SandboxStatus::Running {
        state.kernel.sandboxes().broker().subscribe(id)
    } else {
        None
    };

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text)
                            && socket
                                .send(Message::Text(json!({"type": "pong"}).to_string()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = next_live_event(&mut live) => {
                match event {
                    LiveEvent::Log(event) => {
                        let frame =
                            log_frame(event.stream.as_str(), &event.text, event.timestamp);
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    LiveEvent::Lagged => {
                        close_with(&mut socket, CLOSE_OVERFLOW, "log backlog overflow").await;
                        return;
                    }
                    LiveEvent::Ended => {
                        live = None;
                    }
                }
            }
        }
    }
}

enum LiveEvent {
    Log(LogEvent),
    Lagged,
    Ended,
}

async fn next_live_event(rx: &mut Option<broadcast::Receiver<LogEvent>>) -> LiveEvent {
    match rx {
        Some(inner) => match inner.recv().await {
            Ok(event) => LiveEvent::Log(event),
            Err(broadcast::error::RecvError::Lagged(_)) => LiveEvent::Lagged,
            Err(broadcast::error::RecvError::Closed) => LiveEvent::Ended,
        },
        None => futures::future::pending().await,
    }
}

fn log_frame(stream: &str, text: &str, timestamp: DateTime<Utc>) -> String {
    json!({
        "event": "log",
        "data": {
            "stream": stream,
            "text": text,
            "timestamp": timestamp.to_rfc3339(),
        },
    })
    .to_string()
}

// ----------------------------------------------------------------------
// Terminal endpoint
// ----------------------------------------------------------------------

async fn serve_terminal<R>(
    state: Arc<AppState<R>>,
    identity: Identity,
    id: Uuid,
    mut socket: WebSocket,
) where
    R: ContainerRuntime,
{
    let Some(sandbox) = load_owned(&state, &identity, id).await else {
        close_with(&mut socket, CLOSE_NOT_FOUND, "sandbox not found").await;
        return;
    };

    let container_ref = match (&sandbox.status, sandbox.container_ref.as_deref()) {
        (SandboxStatus::Running, Some(container_ref)) => container_ref.to_string(),
        _ => {
            close_with(&mut socket, CLOSE_NOT_RUNNING, "sandbox is not running").await;
            return;
        }
    };

    let session = match state
        .kernel
        .sandboxes()
        .runtime()
        .exec_interactive(&container_ref, TERMINAL_COLS, TERMINAL_ROWS)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            debug!(sandbox_id = %id, error = %err, "terminal exec failed");
            close_with(&mut socket, 1011, "could not open terminal").await;
            return;
        }
    };
    let mut output = session.output;
    let mut control = session.control;

    if socket
        .send(Message::Text(json!({"type": "ready"}).to_string()))
        .await
        .is_err()
    {
        control.close().await;
        return;
    }

    loop {
        tokio::select! {
            chunk = output.next() => {
                match chunk {
                    Some(bytes) => {
                        if socket.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        close_with(&mut socket, 1000, "shell exited").await;
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if control.write_input(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match parse_control(&text) {
                            Some(Control::Resize { cols, rows }) => {
                                let _ = control.resize(cols, rows).await;
                            }
                            Some(Control::Ping) => {
                                if socket
                                    .send(Message::Text(json!({"type": "pong"}).to_string()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            // Not a control frame: raw shell input.
                            None => {
                                if control.write_input(text.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    control.close().await;
}

#[derive(Debug, PartialEq)]
enum Control {
    Resize { cols: u16, rows: u16 },
    Ping,
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    rows: Option<u16>,
}

/// Text frames beginning with `{` are candidate control frames; anything
/// that fails to parse falls through as terminal input.
fn parse_control(text: &str) -> Option<Control> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    let frame: ControlFrame = serde_json::from_str(text).ok()?;
    match frame.kind.as_str() {
        "resize" => Some(Control::Resize {
            cols: frame.cols?,
            rows: frame.rows?,
        }),
        "ping" => Some(Control::Ping),
        _ => None,
    }
}

fn is_ping(text: &str) -> bool {
    matches!(parse_control(text), Some(Control::Ping))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_frames_parse() {
        assert_eq!(
            parse_control(r#"{"type":"resize","cols":120,"rows":40}"#),
            Some(Control::Resize {
                cols: 120,
                rows: 40
            })
        );
    }

    #[test]
    fn ping_frames_parse() {
        assert_eq!(parse_control(r#"{"type":"ping"}"#), Some(Control::Ping));
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping("ls -la"));
    }

    #[test]
    fn malformed_json_falls_through_as_input() {
        assert_eq!(parse_control("{not json"), None);
        assert_eq!(parse_control(r#"{"type":"resize"}"#), None); // missing dims
        assert_eq!(parse_control(r#"{"type":"unknown"}"#), None);
        assert_eq!(parse_control("plain text"), None);
    }

    #[test]
    fn log_frames_carry_the_event_shape() {
        let frame = log_frame("stdout", "hello", Utc::now());
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "log");
        assert_eq!(value["data"]["stream"], "stdout");
        assert_eq!(value["data"]["text"], "hello");
        assert!(value["data"]["timestamp"].is_string());
    }
}
