use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cookie::Cookie;
use crate::protocol::{Request, Response};
use crate::session::session::{now_millis, Session};
use crate::settings::SessionSettings;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-scoped session store keyed by a session cookie.
///
/// Sessions idle for longer than `expirationTime` are removed by a periodic
/// sweep; every removal is announced on the [`SessionStore::deleted`]
/// channel. Handles returned by the store stay valid after eviction.
pub struct SessionStore {
    inner: Arc<StoreInner>,
    sweeper: JoinHandle<()>,
}

struct StoreInner {
    settings: SessionSettings,
    sessions: Mutex<HashMap<String, Session>>,
    deleted_tx: broadcast::Sender<String>,
}

impl SessionStore {
    pub fn new(settings: SessionSettings) -> Self {
        let (deleted_tx, _) = broadcast::channel(16);
        let inner = Arc::new(StoreInner {
            settings,
            sessions: Mutex::new(HashMap::new()),
            deleted_tx,
        });
        let sweeper = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                loop {
                    tokio::time::sleep(SWEEP_INTERVAL).await;
                    sweep_at(&inner, now_millis());
                }
            }
        });
        Self { inner, sweeper }
    }

    /// Resolve the session of a request, refreshing the session cookie on
    /// the response. The id set on the response cookie wins over the one the
    /// request carried, because that is the id the next request will
    /// present. With `allow_create` a missing or unknown id mints a new
    /// session; otherwise the null session is returned.
    pub fn get_session(
        &self,
        request: &Request,
        response: &mut Response<'_>,
        allow_create: bool,
    ) -> Session {
        let cookie_name = self.inner.settings.cookie_name.as_bytes();
        let candidate = response
            .cookie(cookie_name)
            .map(|cookie| cookie.value().clone())
            .filter(|value| !value.is_empty())
            .or_else(|| request.cookie(cookie_name).cloned())
            .unwrap_or_default();
        let id = String::from_utf8_lossy(&candidate).into_owned();

        let existing = if id.is_empty() {
            None
        } else {
            self.inner.sessions.lock().get(&id).cloned()
        };
        if let Some(session) = existing {
            self.refresh_cookie(response, session.id());
            session.touch();
            return session;
        }

        if allow_create {
            let session = Session::create();
            debug!(id = session.id(), "created new session");
            self.inner
                .sessions
                .lock()
                .insert(session.id().to_owned(), session.clone());
            self.refresh_cookie(response, session.id());
            return session;
        }
        Session::null()
    }

    /// Session for a known id, or the null session. Touches the session.
    pub fn lookup(&self, id: &str) -> Session {
        let session = self
            .inner
            .sessions
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_default();
        session.touch();
        session
    }

    /// Remove a session, announcing the deletion.
    pub fn remove_session(&self, session: &Session) {
        if session.is_null() {
            return;
        }
        let mut sessions = self.inner.sessions.lock();
        let _ = self.inner.deleted_tx.send(session.id().to_owned());
        sessions.remove(session.id());
    }

    /// Remove every session idle for longer than `expirationTime`. Runs
    /// periodically in the background; callable directly as well.
    pub fn sweep(&self) {
        sweep_at(&self.inner, now_millis());
    }

    /// Receiver for session-deleted notifications (expired and explicitly
    /// removed sessions alike).
    pub fn deleted(&self) -> broadcast::Receiver<String> {
        self.inner.deleted_tx.subscribe()
    }

    fn refresh_cookie(&self, response: &mut Response<'_>, id: &str) {
        let settings = &self.inner.settings;
        let mut cookie = Cookie::new(settings.cookie_name.clone(), id.to_owned());
        cookie.set_max_age((settings.expiration_time / 1000) as i64);
        cookie.set_path(settings.cookie_path.clone());
        cookie.set_comment(settings.cookie_comment.clone());
        cookie.set_domain(settings.cookie_domain.clone());
        cookie.set_same_site(Bytes::from_static(b"Lax"));
        response.set_cookie(cookie);
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn sweep_at(inner: &StoreInner, now: u64) {
    let mut sessions = inner.sessions.lock();
    let expiration = inner.settings.expiration_time;
    sessions.retain(|id, session| {
        let expired = now.saturating_sub(session.last_access()) > expiration;
        if expired {
            debug!(id, "session expired");
            let _ = inner.deleted_tx.send(id.clone());
        }
        !expired
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestStatus;
    use crate::settings::ServerSettings;
    use bytes::BytesMut;
    use tokio::io::DuplexStream;

    fn parse_request(bytes: &[u8]) -> Request {
        let mut request =
            Request::new(&ServerSettings::default(), "127.0.0.1:9000".parse().unwrap());
        let mut buf = BytesMut::from(bytes);
        while !buf.is_empty() && request.status().is_receiving() {
            request.feed(&mut buf);
        }
        assert_eq!(request.status(), RequestStatus::Complete);
        request
    }

    fn stream() -> DuplexStream {
        let (_, server) = tokio::io::duplex(1024);
        server
    }

    fn store() -> SessionStore {
        SessionStore::new(SessionSettings::default())
    }

    #[tokio::test]
    async fn creates_session_and_sets_cookie() {
        let store = store();
        let request = parse_request(b"GET / HTTP/1.1\r\n\r\n");
        let mut server = stream();
        let mut response = Response::new(&mut server);

        let session = store.get_session(&request, &mut response, true);
        assert!(!session.is_null());

        let cookie = response.cookie(b"sessionid").unwrap();
        assert_eq!(&cookie.value()[..], session.id().as_bytes());
        assert_eq!(cookie.max_age(), 3600);
        assert_eq!(&cookie.same_site()[..], b"Lax");
        assert!(!cookie.secure());
        assert!(!cookie.http_only());
    }

    #[tokio::test]
    async fn request_cookie_resolves_to_same_session() {
        let store = store();
        let request = parse_request(b"GET / HTTP/1.1\r\n\r\n");
        let mut server = stream();
        let mut response = Response::new(&mut server);
        let session = store.get_session(&request, &mut response, true);

        let follow_up = parse_request(
            format!("GET / HTTP/1.1\r\nCookie: sessionid={}\r\n\r\n", session.id()).as_bytes(),
        );
        let mut server = stream();
        let mut response = Response::new(&mut server);
        let resolved = store.get_session(&follow_up, &mut response, false);
        assert_eq!(resolved.id(), session.id());
    }

    #[tokio::test]
    async fn response_cookie_wins_over_request_cookie() {
        let store = store();
        let request = parse_request(b"GET / HTTP/1.1\r\nCookie: sessionid=stale\r\n\r\n");
        let mut server = stream();
        let mut response = Response::new(&mut server);

        // a session created earlier in this request cycle
        let created = store.get_session(&request, &mut response, true);
        let resolved = store.get_session(&request, &mut response, false);
        assert_eq!(resolved.id(), created.id());
    }

    #[tokio::test]
    async fn unknown_id_without_create_yields_null() {
        let store = store();
        let request = parse_request(b"GET / HTTP/1.1\r\nCookie: sessionid=unknown\r\n\r\n");
        let mut server = stream();
        let mut response = Response::new(&mut server);
        let session = store.get_session(&request, &mut response, false);
        assert!(session.is_null());
        assert!(response.cookie(b"sessionid").is_none());
    }

    #[tokio::test]
    async fn sweep_expires_idle_sessions_and_notifies() {
        let store = store();
        let request = parse_request(b"GET / HTTP/1.1\r\n\r\n");
        let mut server = stream();
        let mut response = Response::new(&mut server);
        let session = store.get_session(&request, &mut response, true);
        let mut deleted = store.deleted();

        let expiration = SessionSettings::default().expiration_time;
        sweep_at(&store.inner, now_millis() + expiration + 1);

        assert_eq!(deleted.try_recv().unwrap(), session.id());
        assert!(store.lookup(session.id()).is_null());
        // the evicted session handle remains usable
        session.set(&b"k"[..], 1i64);
        assert!(session.contains(b"k"));
    }

    #[tokio::test]
    async fn remove_session_notifies() {
        let store = store();
        let request = parse_request(b"GET / HTTP/1.1\r\n\r\n");
        let mut server = stream();
        let mut response = Response::new(&mut server);
        let session = store.get_session(&request, &mut response, true);
        let mut deleted = store.deleted();

        store.remove_session(&session);
        assert_eq!(deleted.try_recv().unwrap(), session.id());
        assert!(store.lookup(session.id()).is_null());
    }
}
