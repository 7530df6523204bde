//! Streaming pipeline: Admission -> Session -> (Deferred-Start) ->
//! Transcoder Supervisor -> HTTP response body.
//!
//! Replaces a fixed Xtream quality-failover loop driven straight off
//! `reqwest` with the full Admission Controller, Session Registry, Upstream
//! Probe, Deferred-Start Shim, and Transcoder Supervisor pipeline, fanning
//! one supervisor's output out to every client attached to a shareable
//! session.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use diesel::prelude::*;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::admission::{AdmissionDecision, AdmissionRequest, StreamSessionSummary};
use crate::credentials::CredentialManager;
use crate::db::models::{Channel, Stream as StreamRow};
use crate::db::schema::{channels, streams};
use crate::deferred::{self, DeferredEvent};
use crate::probe;
use crate::profiles::ClientClass;
use crate::session::{ClientBinding, SessionState};
use crate::supervisor::{Frame, SupervisorHandle, TranscoderSupervisor};

use super::state::AppState;

const BROADCAST_CAPACITY: usize = 64;

/// One running Transcoder Supervisor plus the channel fanning its output out
/// to every client attached to its session. A shareable session's second,
/// third, ... client subscribes to this same sender instead of spawning a
/// second upstream connection.
pub struct SupervisorSession {
    pub handle: SupervisorHandle,
    frames: broadcast::Sender<Frame>,
}

/// Decrypt stored Xtream-style credentials and fold them into the stream's
/// base URL. Streams with no stored credentials are used as-is: the operator
/// already supplied a complete, directly fetchable URL.
fn resolve_stream_url(credentials: &CredentialManager, stream: &StreamRow) -> Result<String, StatusCode> {
    match (&stream.username, &stream.password_encrypted) {
        (Some(username), Some(encrypted)) => {
            let password = credentials.decrypt_password(encrypted).map_err(|e| {
                tracing::error!("stream credential decrypt failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
            let separator = if stream.url.contains('?') { '&' } else { '?' };
            Ok(format!(
                "{}{separator}username={}&password={}",
                stream.url,
                urlencoding::encode(username),
                urlencoding::encode(&password)
            ))
        }
        _ => Ok(stream.url.clone()),
    }
}

fn client_class_from_headers(headers: &HeaderMap) -> ClientClass {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(ClientClass::from_user_agent)
        .unwrap_or(ClientClass::Fallback)
}

fn load_channel_and_stream(
    conn: &mut crate::db::DbPooledConnection,
    channel_id: i32,
) -> Result<(Channel, StreamRow), StatusCode> {
    let channel: Channel = channels::table
        .filter(channels::id.eq(channel_id))
        .filter(channels::enabled.eq(1))
        .first(conn)
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let stream: StreamRow = streams::table
        .filter(streams::channel_id.eq(channel_id))
        .filter(streams::enabled.eq(1))
        .order(streams::priority.asc())
        .first(conn)
        .map_err(|_| StatusCode::NOT_FOUND)?;

    Ok((channel, stream))
}

/// Cleans up a client's attachment when its HTTP response body is dropped
/// (client disconnect, Plex tearing down the tuner, or a normal end of
/// stream). A non-shareable session is fully torn down the instant its one
/// client leaves, since nothing else can ever join it; a shareable session is
/// left for the idle sweep, since another client may still be attached.
struct DisconnectGuard {
    state: AppState,
    session_id: String,
    client_id: String,
    stream_id: i32,
    shareable: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.state.sessions.detach(&self.session_id, &self.client_id);
        if self.shareable {
            return;
        }

        self.state.sessions.terminate(&self.session_id);
        if let Some((_, session)) = self.state.supervisors.remove(&self.session_id) {
            session.handle.cancel();
        }

        let state = self.state.clone();
        let stream_id = self.stream_id;
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let mut tracker = state.concurrency.lock().await;
            tracker.release(stream_id, &session_id);
        });
    }
}

/// A boxed byte stream paired with a `DisconnectGuard` that runs when the
/// stream (and therefore the HTTP body built from it) is dropped.
struct GuardedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    _guard: DisconnectGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn broadcast_frame_stream(rx: broadcast::Receiver<Frame>) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(Frame::Bytes(bytes)) => return Some((Ok(Bytes::from(bytes)), rx)),
                Ok(Frame::End) | Ok(Frame::Error(_)) => return None,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    })
}

/// Pump a supervisor's frames into its session's broadcast channel so every
/// attached client sees the same bytes, until the supervisor ends.
fn spawn_fanout(mut supervisor_rx: mpsc::Receiver<Frame>, frames: broadcast::Sender<Frame>) {
    tokio::spawn(async move {
        while let Some(frame) = supervisor_rx.recv().await {
            let is_terminal = matches!(frame, Frame::End | Frame::Error(_));
            let _ = frames.send(frame);
            if is_terminal {
                break;
            }
        }
    });
}

/// Same as `spawn_fanout`, reading from the Deferred-Start Shim's output
/// instead of straight off the supervisor.
fn spawn_deferred_fanout(mut deferred_rx: mpsc::Receiver<DeferredEvent>, frames: broadcast::Sender<Frame>) {
    tokio::spawn(async move {
        while let Some(event) = deferred_rx.recv().await {
            match event {
                DeferredEvent::Chunk(bytes) => {
                    let _ = frames.send(Frame::Bytes(bytes));
                }
                DeferredEvent::HandoverComplete => {}
                DeferredEvent::Closed => {
                    let _ = frames.send(Frame::End);
                    break;
                }
            }
        }
    });
}

struct OpenedStream {
    session_id: String,
    client_id: String,
    stream_id: i32,
    shareable: bool,
    frames_rx: broadcast::Receiver<Frame>,
}

/// Shared pipeline for both `/stream/{channel_id}` and `/preview/{channel_id}`.
/// `force_class`, when set, overrides User-Agent sniffing (the preview
/// endpoint always behaves like a web client). `allow_deferred_start`
/// disables the padding shim for preview, which favors an immediate (even if
/// briefly blank) response over a multi-second null-packet warmup.
async fn open_stream(
    state: &AppState,
    channel_id: i32,
    headers: &HeaderMap,
    remote_addr: SocketAddr,
    force_class: Option<ClientClass>,
    allow_deferred_start: bool,
) -> Result<OpenedStream, (StatusCode, String)> {
    let client_class = force_class.unwrap_or_else(|| client_class_from_headers(headers));
    let client_id = Uuid::new_v4().to_string();
    let client_binding = ClientBinding {
        client_id: client_id.clone(),
        remote_addr: remote_addr.to_string(),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string(),
        bytes_sent: 0,
        attached_at: Instant::now(),
    };

    let mut conn = state
        .get_connection()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("database unavailable: {e}")))?;
    let (_channel, stream_row) =
        load_channel_and_stream(&mut conn, channel_id).map_err(|code| (code, "channel or stream not found".to_string()))?;
    drop(conn);

    let stream_id = stream_row.id.unwrap_or_default();
    let shareable = stream_row.is_shareable();

    let concurrency_snapshot: Vec<StreamSessionSummary> = {
        let tracker = state.concurrency.lock().await;
        tracker.for_stream(stream_id).to_vec()
    };
    let stream_specific_cap = if stream_row.connection_limits > 0 { Some(stream_row.connection_limits as u32) } else { None };

    let decision = state.admission.decide(
        &state.sessions,
        &AdmissionRequest {
            channel_id,
            stream_id,
            client_class,
            shareable,
            stream_specific_cap,
            active_sessions_for_stream: &concurrency_snapshot,
        },
    );

    if decision == AdmissionDecision::Deny {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "tuner capacity exhausted".to_string()));
    }
    if let AdmissionDecision::AdmitWithPreemption { preempted_session_id_index } = decision {
        if let Some(victim) = concurrency_snapshot.get(preempted_session_id_index) {
            state.sessions.terminate(&victim.session_id);
            if let Some((_, session)) = state.supervisors.remove(&victim.session_id) {
                session.handle.cancel();
            }
            let mut tracker = state.concurrency.lock().await;
            tracker.release(stream_id, &victim.session_id);
        }
    }

    let (session_id, joined) = state
        .sessions
        .get_or_create(channel_id, stream_id, shareable, client_binding)
        .ok_or((StatusCode::SERVICE_UNAVAILABLE, "tuner capacity exhausted".to_string()))?;

    if joined {
        return match state.supervisors.get(&session_id) {
            Some(session) => Ok(OpenedStream {
                session_id,
                client_id,
                stream_id,
                shareable,
                frames_rx: session.frames.subscribe(),
            }),
            None => {
                state.sessions.detach(&session_id, &client_id);
                Err((StatusCode::INTERNAL_SERVER_ERROR, "session has no active supervisor".to_string()))
            }
        };
    }

    {
        let mut tracker = state.concurrency.lock().await;
        tracker.record(
            stream_id,
            StreamSessionSummary { session_id: session_id.clone(), client_class, last_byte_write_at: Instant::now() },
        );
    }

    let resolved_url = resolve_stream_url(&state.credentials, &stream_row)
        .map_err(|code| (code, "failed to resolve stream credentials".to_string()))?;

    let probe_result = match probe::probe(&resolved_url, !shareable).await {
        Ok(result) => result,
        Err(e) => {
            cleanup_failed_open(state, &session_id, stream_id).await;
            return Err((StatusCode::BAD_GATEWAY, format!("upstream probe failed: {e}")));
        }
    };

    let argv = match state.profile.build_argv(client_class, &probe_result.resolved_url) {
        Some(argv) => argv,
        None => {
            cleanup_failed_open(state, &session_id, stream_id).await;
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "no transcoder profile resolved for this client".to_string()));
        }
    };

    let config = state.config.snapshot();
    let supervisor = TranscoderSupervisor::new(config.transcoder_binary_path.clone(), argv).with_observer(state.observer.clone());
    let (supervisor_rx, handle) = supervisor.spawn();

    let (frames_tx, frames_rx) = broadcast::channel(BROADCAST_CAPACITY);
    if allow_deferred_start && probe_result.requires_deferred_start {
        let (deferred_tx, deferred_rx) = mpsc::channel(32);
        let observer = state.observer.clone();
        tokio::spawn(deferred::run(supervisor_rx, deferred_tx, Some(observer)));
        spawn_deferred_fanout(deferred_rx, frames_tx.clone());
        state.sessions.set_state(&session_id, SessionState::Deferring);
    } else {
        spawn_fanout(supervisor_rx, frames_tx.clone());
        state.sessions.set_state(&session_id, SessionState::Streaming);
    }

    state.supervisors.insert(session_id.clone(), SupervisorSession { handle, frames: frames_tx });

    Ok(OpenedStream { session_id, client_id, stream_id, shareable, frames_rx })
}

async fn cleanup_failed_open(state: &AppState, session_id: &str, stream_id: i32) {
    state.sessions.terminate(session_id);
    let mut tracker = state.concurrency.lock().await;
    tracker.release(stream_id, session_id);
}

/// `/stream/{channel_id}`: the HDHomeRun tuner endpoint Plex's lineup URLs
/// point at, driven through the full admission/probe/supervisor pipeline.
pub async fn stream_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i32>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Response {
    match open_stream(&state, channel_id, &headers, remote_addr, None, true).await {
        Ok(opened) => attach_guard_and_respond(state, opened),
        Err((status, message)) => (status, message).into_response(),
    }
}

/// `/preview/{channel_id}`: a lightweight feed used by admin tooling, not
/// advertised in the Plex lineup. Always treated as a web client and never
/// padded with the deferred-start shim, since a preview consumer would
/// rather see nothing yet than wait out a multi-second null-packet warmup.
pub async fn preview_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<i32>,
    headers: HeaderMap,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Response {
    match open_stream(&state, channel_id, &headers, remote_addr, Some(ClientClass::Web), false).await {
        Ok(opened) => attach_guard_and_respond(state, opened),
        Err((status, message)) => (status, message).into_response(),
    }
}

fn attach_guard_and_respond(state: AppState, opened: OpenedStream) -> Response {
    let guard = DisconnectGuard {
        state,
        session_id: opened.session_id,
        client_id: opened.client_id,
        stream_id: opened.stream_id,
        shareable: opened.shareable,
    };

    let guarded = GuardedStream { inner: Box::pin(broadcast_frame_stream(opened.frames_rx)), _guard: guard };

    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "video/mp2t")
        .body(Body::from_stream(guarded))
        .expect("response with a streaming body is always constructible")
}
