//! Purpose: Local emulator of the realtime database REST and streaming protocol.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum server over an in-memory tree for development and integration tests.
//! Invariants: Locations are `/<path>.json`; errors are `{"error": "<message>"}`.
//! Invariants: Loopback-only unless explicitly allowed.
//! Notes: Event streams are `text/event-stream` with periodic keep-alive frames.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::info;

use rtchat::api::sse::{KEEP_ALIVE_FRAME, encode_frame};
use rtchat::api::{DbPath, Error, ErrorKind, MemoryStore, Store, is_timeout};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub auth_token: Option<String>,
    pub max_body_bytes: u64,
    pub max_streams: usize,
    pub keep_alive: Duration,
    pub seed: Option<Value>,
}

#[derive(Clone)]
struct AppState {
    store: MemoryStore,
    auth_token: Option<String>,
    keep_alive: Duration,
    stream_slots: Arc<Semaphore>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let store = match config.seed {
        Some(seed) => MemoryStore::with_data(seed),
        None => MemoryStore::new(),
    };
    let state = Arc::new(AppState {
        store,
        auth_token: config.auth_token,
        keep_alive: config.keep_alive,
        stream_slots: Arc::new(Semaphore::new(config.max_streams)),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/*path",
            get(read_location)
                .put(write_location)
                .post(push_location)
                .patch(update_location)
                .delete(remove_location),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    let local_addr = listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read bound address")
            .with_source(err)
    })?;
    info!(addr = %local_addr, "emulator listening");
    eprintln!("rtchat emulator listening on http://{local_addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            // Open event streams keep connections alive; do not wait on them forever.
            match tokio::time::timeout(Duration::from_secs(5), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => info!("shutdown deadline reached with open event streams"),
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if config.max_streams == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-streams must be greater than zero")
            .with_hint("Use a positive value like 64."));
    }

    if config.keep_alive.is_zero() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--keep-alive must be greater than zero")
            .with_hint("Use a duration like 30s."));
    }

    if config.seed.as_ref().is_some_and(|seed| !seed.is_object()) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("seed data must be a JSON object")
            .with_hint("Pass a file whose top level is {\"path\": value, ...}."));
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[derive(Debug, Default, Deserialize)]
struct LocationQuery {
    auth: Option<String>,
    print: Option<String>,
}

impl LocationQuery {
    fn silent(&self) -> bool {
        self.print.as_deref() == Some("silent")
    }
}

fn authorize(query: &LocationQuery, state: &AppState) -> Result<(), Error> {
    let Some(expected) = state.auth_token.as_ref() else {
        return Ok(());
    };
    if query.auth.as_ref() != Some(expected) {
        return Err(Error::new(ErrorKind::Permission).with_message("Permission denied"));
    }
    Ok(())
}

/// Maps a request path like `chats_v2/abc.json` to a database location.
fn location(raw: &str) -> Result<DbPath, Error> {
    let Some(stripped) = raw.strip_suffix(".json") else {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("Not found")
            .with_hint("Database locations end in .json."));
    };
    DbPath::parse(stripped).map_err(|err| {
        let detail = err.message().unwrap_or("invalid path").to_string();
        Error::new(ErrorKind::Usage).with_message(format!("Invalid path: {detail}"))
    })
}

fn parse_body(body: &Bytes) -> Result<Value, Error> {
    serde_json::from_slice(body).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("Invalid data; couldn't parse JSON object, array, or value.")
            .with_source(err)
    })
}

fn prepare(state: &AppState, raw: &str, query: &LocationQuery) -> Result<DbPath, Error> {
    authorize(query, state)?;
    location(raw)
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
}

#[derive(Debug, Serialize)]
struct PushEnvelope {
    name: String,
}

async fn read_location(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
    Query(query): Query<LocationQuery>,
    headers: HeaderMap,
) -> Response {
    let path = match prepare(&state, &raw, &query) {
        Ok(path) => path,
        Err(err) => return error_response(err),
    };
    if wants_event_stream(&headers) {
        return stream_location(state, path);
    }
    match state.store.get(&path) {
        Ok(snapshot) => json_response(snapshot.into_value()),
        Err(err) => error_response(err),
    }
}

async fn write_location(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
    Query(query): Query<LocationQuery>,
    body: Bytes,
) -> Response {
    let result = prepare(&state, &raw, &query).and_then(|path| {
        let value = parse_body(&body)?;
        state.store.set(&path, &value)?;
        Ok(value)
    });
    match result {
        Ok(_) if query.silent() => StatusCode::NO_CONTENT.into_response(),
        Ok(value) => json_response(value),
        Err(err) => error_response(err),
    }
}

async fn push_location(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
    Query(query): Query<LocationQuery>,
    body: Bytes,
) -> Response {
    let result = prepare(&state, &raw, &query).and_then(|path| {
        let value = parse_body(&body)?;
        state.store.push(&path, &value)
    });
    match result {
        Ok(name) => Json(PushEnvelope { name }).into_response(),
        Err(err) => error_response(err),
    }
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
    Query(query): Query<LocationQuery>,
    body: Bytes,
) -> Response {
    let result = prepare(&state, &raw, &query).and_then(|path| {
        let Value::Object(fields) = parse_body(&body)? else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("Invalid data; update requires a JSON object."));
        };
        state.store.update(&path, &fields)?;
        Ok(Value::Object(fields))
    });
    match result {
        Ok(_) if query.silent() => StatusCode::NO_CONTENT.into_response(),
        Ok(fields) => json_response(fields),
        Err(err) => error_response(err),
    }
}

async fn remove_location(
    State(state): State<Arc<AppState>>,
    AxumPath(raw): AxumPath<String>,
    Query(query): Query<LocationQuery>,
) -> Response {
    let result = prepare(&state, &raw, &query).and_then(|path| state.store.remove(&path));
    match result {
        Ok(()) if query.silent() => StatusCode::NO_CONTENT.into_response(),
        Ok(()) => json_response(Value::Null),
        Err(err) => error_response(err),
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn stream_location(state: Arc<AppState>, path: DbPath) -> Response {
    let Ok(permit) = state.stream_slots.clone().try_acquire_owned() else {
        return error_response_with_status(
            Error::new(ErrorKind::Io).with_message("too many open event streams"),
            StatusCode::SERVICE_UNAVAILABLE,
        );
    };
    let mut subscription = match state.store.subscribe(&path) {
        Ok(subscription) => subscription,
        Err(err) => return error_response(err),
    };
    let keep_alive = state.keep_alive;

    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(16);
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        loop {
            let frame = match subscription.next_timeout(keep_alive) {
                Ok(Some(event)) => match encode_frame(&event) {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        return;
                    }
                },
                Ok(None) => return,
                Err(err) if is_timeout(&err) => KEEP_ALIVE_FRAME.to_vec(),
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            };
            // A failed send means the client went away; dropping the
            // subscription unregisters the listener.
            if tx.blocking_send(Ok(Bytes::from(frame))).is_err() {
                return;
            }
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|result| result.map_err(|err| std::io::Error::other(err.to_string())));

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn json_response(payload: Value) -> Response {
    Json(payload).into_response()
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        ErrorKind::Io | ErrorKind::Protocol | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response_with_status(err, status)
}

fn error_response_with_status(err: Error, status: StatusCode) -> Response {
    let body = ErrorEnvelope {
        error: err.message().unwrap_or("error").to_string(),
    };
    (status, Json(body)).into_response()
}
