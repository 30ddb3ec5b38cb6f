//! Purpose: HTTP client for the realtime database REST and streaming protocol.
//! Exports: `RemoteStore`.
//! Role: Production `Store`; every operation is one blocking round-trip.
//! Invariants: Locations map to `<base>/<path>.json` (root: `<base>/.json`).
//! Invariants: The auth token travels as the `auth` query parameter, never in logs.
//! Invariants: Each subscription owns one `rtchat-watch` thread reading the event stream.
#![allow(clippy::result_large_err)]

use std::io::BufReader;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::sse::{SseReader, StreamItem, decode_frame};
use super::store::Store;
use crate::core::error::{ApiResult, Error, ErrorKind};
use crate::core::event::{EventSender, Subscription};
use crate::core::path::DbPath;
use crate::core::record::Snapshot;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// The database sends a keep-alive every 30s; silence well past that is a dead stream.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const STREAM_BUFFER: usize = 32;

#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    base_url: Url,
    auth_token: Option<String>,
    agent: ureq::Agent,
    stream_agent: ureq::Agent,
}

#[derive(Deserialize)]
struct PushEnvelope {
    name: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: String,
}

impl RemoteStore {
    pub fn new(database_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(database_url.into())?;
        let (agent, stream_agent) = build_agents(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT);
        Ok(Self {
            inner: Arc::new(RemoteInner {
                base_url,
                auth_token: None,
                agent,
                stream_agent,
            }),
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        let token = Some(token.into());
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.auth_token = token;
        } else {
            self.inner = Arc::new(RemoteInner {
                base_url: self.inner.base_url.clone(),
                auth_token: token,
                agent: self.inner.agent.clone(),
                stream_agent: self.inner.stream_agent.clone(),
            });
        }
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        let (agent, stream_agent) = build_agents(connect, read);
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.agent = agent;
            inner.stream_agent = stream_agent;
        } else {
            self.inner = Arc::new(RemoteInner {
                base_url: self.inner.base_url.clone(),
                auth_token: self.inner.auth_token.clone(),
                agent,
                stream_agent,
            });
        }
        self
    }

    pub fn database_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn url(&self, path: &DbPath, silent: bool) -> ApiResult<Url> {
        let mut url = build_url(&self.inner.base_url, path)?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(token) = &self.inner.auth_token {
                pairs.append_pair("auth", token);
            }
            if silent {
                pairs.append_pair("print", "silent");
            }
        }
        // Drop the dangling `?` when no pair was added.
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    fn call(&self, method: &str, url: &Url, body: Option<&Value>) -> ApiResult<ureq::Response> {
        let request = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        let response = match body {
            None => request.call(),
            Some(value) => {
                let payload = serde_json::to_string(value).map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to encode request json")
                        .with_source(err)
                })?;
                request
                    .set("Content-Type", "application/json")
                    .send_string(&payload)
            }
        };
        check_response(response)
    }
}

impl Store for RemoteStore {
    fn get(&self, path: &DbPath) -> ApiResult<Snapshot> {
        debug!(method = "GET", path = %path, "database request");
        let url = self.url(path, false)?;
        let value: Value = self
            .call("GET", &url, None)
            .and_then(read_json_response)
            .map_err(|err| err.with_path(path))?;
        Ok(Snapshot::new(path.clone(), value))
    }

    fn set(&self, path: &DbPath, value: &Value) -> ApiResult<()> {
        debug!(method = "PUT", path = %path, "database request");
        let url = self.url(path, true)?;
        self.call("PUT", &url, Some(value))
            .map_err(|err| err.with_path(path))?;
        Ok(())
    }

    fn push(&self, path: &DbPath, value: &Value) -> ApiResult<String> {
        debug!(method = "POST", path = %path, "database request");
        let url = self.url(path, false)?;
        let envelope: PushEnvelope = self
            .call("POST", &url, Some(value))
            .and_then(read_json_response)
            .map_err(|err| err.with_path(path))?;
        Ok(envelope.name)
    }

    fn update(&self, path: &DbPath, fields: &Map<String, Value>) -> ApiResult<()> {
        for key in fields.keys() {
            path.child(key)?;
        }
        debug!(method = "PATCH", path = %path, fields = fields.len(), "database request");
        let url = self.url(path, true)?;
        let body = Value::Object(fields.clone());
        self.call("PATCH", &url, Some(&body))
            .map_err(|err| err.with_path(path))?;
        Ok(())
    }

    fn remove(&self, path: &DbPath) -> ApiResult<()> {
        debug!(method = "DELETE", path = %path, "database request");
        let url = self.url(path, true)?;
        self.call("DELETE", &url, None)
            .map_err(|err| err.with_path(path))?;
        Ok(())
    }

    fn subscribe(&self, path: &DbPath) -> ApiResult<Subscription> {
        let url = self.url(path, false)?;
        let response = check_response(
            self.inner
                .stream_agent
                .request("GET", url.as_str())
                .set("Accept", "text/event-stream")
                .call(),
        )
        .map_err(|err| err.with_path(path))?;

        let (subscription, sender) = Subscription::bounded(path.clone(), STREAM_BUFFER);
        let watched = path.clone();
        thread::Builder::new()
            .name("rtchat-watch".to_string())
            .spawn(move || pump_events(response, sender, &watched))
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start listener thread")
                    .with_path(path)
                    .with_source(err)
            })?;
        info!(path = %path, "subscribed to changes");
        Ok(subscription)
    }
}

fn pump_events(response: ureq::Response, sender: EventSender, path: &DbPath) {
    let mut reader = SseReader::new(BufReader::new(response.into_reader()));
    loop {
        if sender.is_closed() {
            debug!(path = %path, "listener cancelled");
            return;
        }
        let item = reader.next_frame().and_then(|frame| match frame {
            Some(frame) => decode_frame(&frame).map(Some),
            None => Ok(None),
        });
        let err = match item {
            Ok(Some(StreamItem::KeepAlive)) => continue,
            Ok(Some(StreamItem::Event(event))) => {
                if sender.send(Ok(event)) {
                    continue;
                }
                debug!(path = %path, "listener cancelled");
                return;
            }
            Ok(None) => Error::new(ErrorKind::Io)
                .with_message("event stream closed by the database"),
            Err(err) => err,
        };
        if sender.is_closed() {
            return;
        }
        warn!(path = %path, error = %err, "event stream failed");
        sender.send(Err(err.with_path(path)));
        return;
    }
}

fn build_agents(connect: Duration, read: Duration) -> (ureq::Agent, ureq::Agent) {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(connect)
        .timeout_read(read)
        .build();
    let stream_agent = ureq::AgentBuilder::new()
        .timeout_connect(connect)
        .timeout_read(read.max(STREAM_IDLE_TIMEOUT))
        .build();
    (agent, stream_agent)
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid database url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("database url must use http or https scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("database url must not include a path")
            .with_hint("Use a location argument for paths inside the database."));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("database url must not include a query or fragment"));
    }
    url.set_path("/");
    Ok(url)
}

fn build_url(base_url: &Url, path: &DbPath) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("database url cannot be a base")
        })?;
        segments.clear();
        match path.segments().split_last() {
            None => {
                segments.push(".json");
            }
            Some((leaf, parents)) => {
                segments.extend(parents);
                segments.push(&format!("{leaf}.json"));
            }
        }
    }
    Ok(url)
}

fn check_response(result: Result<ureq::Response, ureq::Error>) -> ApiResult<ureq::Response> {
    match result {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
        Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
            .with_message("request failed")
            .with_source(err)),
    }
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: serde::de::DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    error_from_body(status, &body)
}

fn error_from_body(status: u16, body: &str) -> Error {
    let kind = error_kind_from_status(status);
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error,
        Err(_) => format!("database error status {status}"),
    };
    let err = Error::new(kind).with_message(message);
    match kind {
        ErrorKind::Permission => err.with_hint("Check the auth token and the database rules."),
        _ => err,
    }
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 => ErrorKind::Usage,
        401 | 403 => ErrorKind::Permission,
        404 => ErrorKind::NotFound,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
