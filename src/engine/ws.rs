use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::api::{ApiError, SharedState};
use super::broadcaster::LogStream;
use super::models::{LogEntry, LogLevel, LogRole};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// One log line as pushed to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogFrame {
    pub round: u32,
    pub level: LogLevel,
    pub role: LogRole,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<LogEntry> for LogFrame {
    fn from(entry: LogEntry) -> Self {
        Self {
            round: entry.round,
            level: entry.level,
            role: entry.role,
            message: entry.message,
            timestamp: entry.timestamp,
        }
    }
}

/// `GET /api/jobs/{id}/logs`: stream the job's log entries until it ends.
pub async fn job_logs(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.db.call(move |db| db.require_job(id)).await?;
    if job.status.is_terminal() {
        return Ok(ws.on_upgrade(|mut socket| async move {
            let _ = socket.send(Message::Close(None)).await;
        }));
    }

    // Subscribe before the handshake so nothing published after this request
    // is missed. If the job finished in between, nobody will close the
    // channel we just opened, so close it here.
    let logs = state.logs.subscribe(id);
    let job = state.db.call(move |db| db.require_job(id)).await?;
    if job.status.is_terminal() {
        state.logs.close(id);
    }

    Ok(ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, logs).await;
    }))
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards log entries, watches client frames and pings periodically in a
/// single select loop. The loop ends when the job's stream closes, the
/// client goes away, or no Pong arrives within [`PONG_TIMEOUT`].
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut logs: LogStream,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("Log socket missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            entry = logs.next() => {
                let Some(entry) = entry else {
                    // Job reached a terminal state.
                    break;
                };
                let frame = match serde_json::to_string(&LogFrame::from(entry)) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize log frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
