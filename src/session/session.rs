use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use uuid::Uuid;

/// A value stored in a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
}

impl From<bool> for SessionValue {
    fn from(value: bool) -> Self {
        SessionValue::Bool(value)
    }
}

impl From<i64> for SessionValue {
    fn from(value: i64) -> Self {
        SessionValue::Int(value)
    }
}

impl From<f64> for SessionValue {
    fn from(value: f64) -> Self {
        SessionValue::Float(value)
    }
}

impl From<String> for SessionValue {
    fn from(value: String) -> Self {
        SessionValue::Text(value)
    }
}

impl From<&str> for SessionValue {
    fn from(value: &str) -> Self {
        SessionValue::Text(value.to_owned())
    }
}

impl From<Bytes> for SessionValue {
    fn from(value: Bytes) -> Self {
        SessionValue::Bytes(value)
    }
}

/// Shared handle to one session.
///
/// Cloning shares the backing storage; the storage is freed when the last
/// handle drops, so a session held by a request handler stays valid even
/// after the store has evicted it. The null session (no backing storage)
/// reads empty and ignores writes.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Option<Arc<SessionInner>>,
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    state: RwLock<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    values: HashMap<Bytes, SessionValue>,
    last_access: u64,
}

impl Session {
    /// New session with a fresh random id.
    pub(crate) fn create() -> Self {
        let inner = SessionInner {
            id: Uuid::new_v4().to_string(),
            state: RwLock::new(SessionState { values: HashMap::new(), last_access: now_millis() }),
        };
        Self { inner: Some(Arc::new(inner)) }
    }

    /// The null session.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Session id; empty for the null session.
    pub fn id(&self) -> &str {
        self.inner.as_ref().map(|inner| inner.id.as_str()).unwrap_or("")
    }

    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<SessionValue>) {
        if let Some(inner) = &self.inner {
            inner.state.write().values.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<SessionValue> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.state.read().values.get(key).cloned())
    }

    pub fn remove(&self, key: &[u8]) {
        if let Some(inner) = &self.inner {
            inner.state.write().values.remove(key);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.state.read().values.contains_key(key))
    }

    /// Snapshot of all values.
    pub fn get_all(&self) -> HashMap<Bytes, SessionValue> {
        self.inner
            .as_ref()
            .map(|inner| inner.state.read().values.clone())
            .unwrap_or_default()
    }

    /// Milliseconds since the epoch of the last access; 0 for the null
    /// session.
    pub fn last_access(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|inner| inner.state.read().last_access)
            .unwrap_or(0)
    }

    /// Record an access now.
    pub fn touch(&self) {
        if let Some(inner) = &self.inner {
            inner.state.write().last_access = now_millis();
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_access(&self, value: u64) {
        if let Some(inner) = &self.inner {
            inner.state.write().last_access = value;
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
