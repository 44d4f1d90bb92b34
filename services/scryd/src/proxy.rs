use crate::auth::TokenAuthority;
use crate::config::{Config, Credentials};
use crate::errdefs::ServiceError;
use crate::session::Session;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use flint::logging::{info, Logger};
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type SessionMap = HashMap<String, Arc<Session>>;

/// Owned hold on the session map, handed into a join so the callee can
/// release it exactly once, at the point where concurrent joins become
/// safe. Dropping it unreleased is the error-path backstop.
pub struct MapLock {
    guard: Option<OwnedMutexGuard<SessionMap>>,
}

impl MapLock {
    fn new(guard: OwnedMutexGuard<SessionMap>) -> MapLock {
        MapLock { guard: Some(guard) }
    }

    /// Releases the map to other connections.
    pub fn release(&mut self) {
        self.guard.take();
    }
}

/// The session multiplexer: routes every accepted viewer socket to the
/// shared backend session matching its credential fingerprint, creating the
/// session when the viewer is first in.
pub struct Proxy {
    sessions: Arc<Mutex<SessionMap>>,
    auth: TokenAuthority,
    config: Config,
    log: Logger,
}

impl Proxy {
    pub fn new(config: Config, log: Logger) -> Result<Arc<Proxy>, ServiceError> {
        let auth = TokenAuthority::new(&config.auth.jwt_secret, &config.auth.jwt_alg)?;
        Ok(Arc::new(Proxy {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            auth,
            config,
            log,
        }))
    }

    #[inline]
    pub fn auth(&self) -> &TokenAuthority {
        &self.auth
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Number of live shared sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Looks up the live session for a credential fingerprint.
    pub async fn find_session(&self, fingerprint: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(fingerprint).cloned()
    }

    /// Routes one viewer socket into its shared session and blocks until
    /// the viewer leaves. The map mutex is held only until the join has
    /// initialised far enough to share, never across the viewer's I/O.
    pub async fn route(&self, ws: WebSocket, creds: Credentials) -> Result<(), ServiceError> {
        let fingerprint = creds.fingerprint();
        let guard = self.sessions.clone().lock_owned().await;

        let result = if let Some(session) = guard.get(&fingerprint).cloned() {
            session.join(ws, &creds, false, MapLock::new(guard)).await
        } else {
            let session =
                match Session::new(&creds.protocol, &self.config.mode, &self.log).await {
                    Ok(session) => session,
                    Err(e) => {
                        drop(guard);
                        let mut ws = ws;
                        let _ = ws
                            .send(Message::Close(Some(CloseFrame {
                                code: 1011,
                                reason: e.to_string().into(),
                            })))
                            .await;
                        return Err(e);
                    }
                };
            info!(self.log, "new session was created"; "id" => %session.id(),
                "fingerprint" => %fingerprint);

            let mut guard = guard;
            guard.insert(fingerprint.clone(), session.clone());
            session.join(ws, &creds, true, MapLock::new(guard)).await
        };

        // Drop the map entry once the last viewer is gone. (Removing on the
        // owner's exit alone would strand co-viewers on an unreachable
        // session.)
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&fingerprint) {
            if session.user_count() == 0 {
                session.close();
                sessions.remove(&fingerprint);
                info!(self.log, "session removed"; "fingerprint" => %fingerprint);
            }
        }

        result
    }
}
