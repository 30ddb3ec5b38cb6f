//! Purpose: Own the connection to one database and hand out collections.
//! Exports: `SessionConfig`, `Session`, env var names and default collection paths.
//! Role: Entry point for library callers and the CLI.
//! Invariants: `Session::global` initializes at most once per process; later calls
//! reuse the first session and ignore their config.
use std::env;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::debug;

use super::collection::Collection;
use super::remote::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, RemoteStore};
use super::store::Store;
use crate::core::error::{ApiResult, Error, ErrorKind};
use crate::core::path::DbPath;

pub const DATABASE_URL_ENV: &str = "RTCHAT_DATABASE_URL";
pub const AUTH_TOKEN_ENV: &str = "RTCHAT_AUTH_TOKEN";
pub const DEFAULT_CHATS_PATH: &str = "chats_v2";
pub const DEFAULT_CHAT_LOG_PATH: &str = "chat_v2";

static GLOBAL: OnceLock<Session> = OnceLock::new();

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub database_url: String,
    pub auth_token: Option<String>,
    pub chats_path: String,
    pub chat_log_path: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl SessionConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            auth_token: None,
            chats_path: DEFAULT_CHATS_PATH.to_string(),
            chat_log_path: DEFAULT_CHAT_LOG_PATH.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Reads `RTCHAT_DATABASE_URL` (required) and `RTCHAT_AUTH_TOKEN` (optional).
    pub fn from_env() -> ApiResult<Self> {
        let database_url = env::var(DATABASE_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("database url is not configured")
                    .with_hint(format!(
                        "Set {DATABASE_URL_ENV} or pass --database-url (e.g. https://<db>.firebaseio.com)."
                    ))
            })?;
        let mut config = Self::new(database_url.trim());
        config.auth_token = env::var(AUTH_TOKEN_ENV)
            .ok()
            .filter(|value| !value.is_empty());
        Ok(config)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_chats_path(mut self, path: impl Into<String>) -> Self {
        self.chats_path = path.into();
        self
    }

    pub fn with_chat_log_path(mut self, path: impl Into<String>) -> Self {
        self.chat_log_path = path.into();
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }
}

pub struct Session {
    store: Arc<dyn Store>,
    chats_path: DbPath,
    chat_log_path: DbPath,
}

impl Session {
    pub fn connect(config: &SessionConfig) -> ApiResult<Self> {
        let mut store = RemoteStore::new(config.database_url.clone())?
            .with_timeouts(config.connect_timeout, config.read_timeout);
        if let Some(token) = &config.auth_token {
            store = store.with_auth_token(token.clone());
        }
        debug!(database = %store.database_url(), "session connected");
        Self::with_store(Arc::new(store)).with_paths(&config.chats_path, &config.chat_log_path)
    }

    /// Session over an arbitrary store, using the default collection paths.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            chats_path: DbPath::root().child(DEFAULT_CHATS_PATH).unwrap_or_default(),
            chat_log_path: DbPath::root().child(DEFAULT_CHAT_LOG_PATH).unwrap_or_default(),
        }
    }

    pub fn with_paths(mut self, chats: &str, chat_log: &str) -> ApiResult<Self> {
        self.chats_path = DbPath::parse(chats)?;
        self.chat_log_path = DbPath::parse(chat_log)?;
        Ok(self)
    }

    /// Process-wide session, connected on first use from `config`.
    pub fn global(config: &SessionConfig) -> ApiResult<&'static Session> {
        if let Some(session) = GLOBAL.get() {
            debug!("global session already initialized; reusing it");
            return Ok(session);
        }
        Ok(Self::install_global(Self::connect(config)?))
    }

    /// Installs `session` as the process-wide session unless one already exists,
    /// and returns whichever session won.
    pub fn install_global(session: Session) -> &'static Session {
        let mut installed = false;
        let global = GLOBAL.get_or_init(|| {
            installed = true;
            session
        });
        if !installed {
            debug!("global session already initialized; reusing it");
        }
        global
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn collection(&self, path: &str) -> ApiResult<Collection<'_>> {
        Ok(Collection::new(self.store(), DbPath::parse(path)?))
    }

    pub fn chats(&self) -> Collection<'_> {
        Collection::new(self.store(), self.chats_path.clone())
    }

    pub fn chat_log(&self) -> Collection<'_> {
        Collection::new(self.store(), self.chat_log_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionConfig};
    use crate::api::memory::MemoryStore;
    use crate::core::error::ErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn config_defaults_to_chat_collections() {
        let config = SessionConfig::new("https://demo.example.com");
        assert_eq!(config.chats_path, "chats_v2");
        assert_eq!(config.chat_log_path, "chat_v2");
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn connect_rejects_bad_urls_and_paths() {
        let err = Session::connect(&SessionConfig::new("ftp://x")).err().expect("scheme");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let config = SessionConfig::new("http://127.0.0.1:1").with_chats_path("bad.path");
        let err = Session::connect(&config).err().expect("path");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn collections_use_configured_paths() {
        let store = MemoryStore::with_data(json!({"rooms": {"r1": {"users": ["u1"]}}}));
        let session = Session::with_store(Arc::new(store))
            .with_paths("rooms", "log")
            .expect("paths");
        assert_eq!(session.chats().path().to_string(), "/rooms");
        assert_eq!(session.chat_log().path().to_string(), "/log");
        assert_eq!(session.chats().fetch().expect("fetch").len(), 1);
        assert!(session.chat_log().fetch().expect("fetch").is_empty());
    }

    #[test]
    fn global_session_initializes_once() {
        let first = Session::install_global(Session::with_store(Arc::new(MemoryStore::new())));
        let second = Session::global(&SessionConfig::new("not a url")).expect("reused");
        assert!(std::ptr::eq(first, second));
    }
}
