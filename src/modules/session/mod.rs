//! Persistent per-session cookies and data.
//!
//! Each session id maps to one in-memory [`SessionHandle`] per process and
//! one JSON file on disk. A missing or unreadable file is treated as an
//! empty session.

use chrono::{DateTime, Utc};
use cookie::Cookie as RawCookie;
use cookie_store::{Cookie as StoredCookie, CookieDomain, CookieStore};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session id '{0}': use 1-128 characters from [A-Za-z0-9_.-]")]
pub struct InvalidSessionId(pub String);

pub fn validate_session_id(id: &str) -> Result<(), InvalidSessionId> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(InvalidSessionId(id.to_string()))
    }
}

fn root_path() -> String {
    "/".to_string()
}

fn stored_path(cookie: &StoredCookie<'_>) -> String {
    String::from(&cookie.path)
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Persisted form of one cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    /// Set when the cookie came without a `Domain` attribute and only goes
    /// back to the exact host that set it.
    #[serde(default, skip_serializing_if = "is_false")]
    pub host_only: bool,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: root_path(),
            host_only: false,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn host_only(mut self) -> Self {
        self.host_only = true;
        self
    }

    fn from_stored(cookie: &StoredCookie<'static>) -> Self {
        let (domain, host_only) = match &cookie.domain {
            CookieDomain::HostOnly(host) => (host.clone(), true),
            CookieDomain::Suffix(suffix) => (suffix.clone(), false),
            _ => (String::new(), false),
        };
        Self {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            domain,
            path: stored_path(cookie),
            host_only,
        }
    }

    /// Puts the cookie into `store` as if `domain` had just set it.
    fn insert_into(&self, store: &mut CookieStore) -> Result<(), String> {
        HeaderValue::from_str(&format!("{}={}", self.name, self.value))
            .map_err(|_| "not a valid header value".to_string())?;
        let domain = self.domain.trim_start_matches('.');
        let path = if self.path.starts_with('/') {
            self.path.as_str()
        } else {
            "/"
        };
        let origin = Url::parse(&format!("https://{domain}{path}"))
            .map_err(|err| format!("domain '{}': {err}", self.domain))?;

        let mut raw = RawCookie::build((self.name.clone(), self.value.clone())).path(path.to_string());
        if !self.host_only {
            raw = raw.domain(domain.to_string());
        }
        store
            .insert_raw(&raw.build(), &origin)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// On-disk session layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Live session shared by every request using the same id.
pub struct SessionHandle {
    id: String,
    headers: BTreeMap<String, String>,
    cookies: Mutex<CookieStore>,
    data: Mutex<Map<String, Value>>,
    last_persisted: Mutex<Option<DateTime<Utc>>>,
    write_lock: AsyncMutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies().len())
            .finish()
    }
}

impl SessionHandle {
    fn new(id: String, headers: BTreeMap<String, String>, record: Option<SessionRecord>) -> Self {
        let mut store = CookieStore::default();
        let (data, persisted) = match record {
            Some(record) => {
                for cookie in &record.cookies {
                    if let Err(reason) = cookie.insert_into(&mut store) {
                        log::warn!("dropping stored cookie '{}' for session {id}: {reason}", cookie.name);
                    }
                }
                (record.data, Some(record.timestamp))
            }
            None => (Map::new(), None),
        };
        Self {
            id,
            headers,
            cookies: Mutex::new(store),
            data: Mutex::new(data),
            last_persisted: Mutex::new(persisted),
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session-level header overrides fixed when the session was opened.
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Unexpired cookies, ordered by domain, path and name.
    pub fn cookies(&self) -> Vec<SessionCookie> {
        let mut cookies: Vec<SessionCookie> = lock(&self.cookies)
            .iter_unexpired()
            .map(SessionCookie::from_stored)
            .collect();
        cookies.sort_by(|a, b| (&a.domain, &a.path, &a.name).cmp(&(&b.domain, &b.path, &b.name)));
        cookies
    }

    /// Stores `cookie`, replacing one with the same name, domain and path.
    /// Returns `false` when the cookie cannot be sent back as a header.
    pub fn set_cookie(&self, cookie: SessionCookie) -> bool {
        match cookie.insert_into(&mut lock(&self.cookies)) {
            Ok(()) => true,
            Err(reason) => {
                log::warn!("rejecting cookie '{}' for session {}: {reason}", cookie.name, self.id);
                false
            }
        }
    }

    pub fn remove_cookie(&self, name: &str, domain: &str, path: &str) {
        lock(&self.cookies).remove(domain.trim_start_matches('.'), path, name);
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    /// More specific paths come first.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let store = lock(&self.cookies);
        let mut matching = store.matches(url);
        matching.sort_by_cached_key(|cookie| {
            (std::cmp::Reverse(stored_path(cookie).len()), cookie.name().to_string())
        });
        let pairs: Vec<String> = matching
            .iter()
            .map(|cookie| format!("{}={}", cookie.name(), cookie.value()))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    /// Applies `Set-Cookie` header values received from `url`. Cookies the
    /// response host may not set are ignored.
    pub fn absorb_set_cookies(&self, url: &Url, headers: &[String]) {
        let mut store = lock(&self.cookies);
        for raw in headers {
            if let Err(err) = store.parse(raw, url) {
                log::debug!("ignoring set-cookie for session {} from {url}: {raw} ({err})", self.id);
            }
        }
    }

    pub fn data(&self, key: &str) -> Option<Value> {
        lock(&self.data).get(key).cloned()
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        lock(&self.data).insert(key.into(), value);
    }

    pub fn last_persisted(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_persisted)
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            cookies: self.cookies(),
            data: lock(&self.data).clone(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidId(#[from] InvalidSessionId),
    #[error("failed to write session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialise session {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Owner of every session record; the executor only goes through it.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    sessions: AsyncMutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Returns the in-memory handle for `id`, loading it from disk on first
    /// access. Header overrides only apply when the handle is created.
    pub async fn get_session(
        &self,
        id: &str,
        header_overrides: Option<&BTreeMap<String, String>>,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        validate_session_id(id)?;
        if let Some(handle) = self.sessions.lock().await.get(id) {
            return Ok(Arc::clone(handle));
        }

        // Read outside the map lock; a handle inserted meanwhile wins.
        let record = self.load(id).await;
        let fresh = SessionHandle::new(
            id.to_string(),
            header_overrides.cloned().unwrap_or_default(),
            record,
        );
        let mut sessions = self.sessions.lock().await;
        let handle = sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(fresh));
        Ok(Arc::clone(handle))
    }

    async fn load(&self, id: &str) -> Option<SessionRecord> {
        let path = self.session_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::warn!("failed to read session file {}: {err}", path.display());
                return None;
            }
        };
        match serde_json::from_slice::<SessionRecord>(&raw) {
            Ok(record) => {
                log::info!("loaded persistent session data for {id}");
                Some(record)
            }
            Err(err) => {
                log::warn!("ignoring corrupt session file {}: {err}", path.display());
                None
            }
        }
    }

    /// Writes the session's cookies and data to disk. Writes for the same id
    /// are serialised; unknown ids are a no-op.
    pub async fn save_session(&self, id: &str) -> Result<(), SessionError> {
        validate_session_id(id)?;
        let handle = match self.sessions.lock().await.get(id) {
            Some(handle) => Arc::clone(handle),
            None => return Ok(()),
        };
        self.persist(&handle).await
    }

    async fn persist(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let _guard = handle.write_lock.lock().await;
        let record = handle.record();
        let payload = serde_json::to_vec_pretty(&record).map_err(|source| SessionError::Serialize {
            id: handle.id.clone(),
            source,
        })?;

        let path = self.session_path(&handle.id);
        let tmp = self.dir.join(format!("{}.json.tmp", handle.id));
        let io_err = |source| SessionError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        tokio::fs::write(&tmp, payload).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        *lock(&handle.last_persisted) = Some(record.timestamp);
        log::debug!("saved session data for {}", handle.id);
        Ok(())
    }

    /// Saves, then drops the in-memory handle.
    pub async fn close_session(&self, id: &str) -> Result<(), SessionError> {
        validate_session_id(id)?;
        let handle = self.sessions.lock().await.remove(id);
        match handle {
            Some(handle) => self.persist(&handle).await,
            None => Ok(()),
        }
    }

    /// Closes every open session. Failures are logged and the remaining
    /// sessions are still closed; the first error is returned.
    pub async fn close_all(&self) -> Result<(), SessionError> {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.lock().await.drain().map(|(_, h)| h).collect();
        let mut first_error = None;
        for handle in handles {
            if let Err(err) = self.persist(&handle).await {
                log::error!("failed to save session {}: {err}", handle.id);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
