//! A bounded pool of sessions to one slot.
//!
//! Sessions are opened lazily, up to the configured maximum, and handed out one operation at a time. A session that
//! failed with a session class error is marked broken and closed when returned instead of going back into the pool.
//!
//! The closed flag is shared with the connection manager so that once [`SessionPool::close_all`] has run no new
//! session can be opened, and every session still checked out at that moment is closed when it is returned.
use std::{
    ops::Deref,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, warn};
use r2d2::PooledConnection;

use crate::{
    error::Error,
    token::{SlotId, Token, TokenError, TokenSession},
};

/// How long a waiting acquire sleeps between checks of the closed flag.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

//------------ SessionManager ----------------------------------------------------------------------------------------

pub(crate) struct PooledSession {
    session: Box<dyn TokenSession>,
    broken: bool,
}

pub(crate) struct SessionManager {
    token: Arc<dyn Token>,
    slot: SlotId,
    closed: Arc<AtomicBool>,
}

impl r2d2::ManageConnection for SessionManager {
    type Connection = PooledSession;
    type Error = TokenError;

    fn connect(&self) -> Result<PooledSession, TokenError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TokenError::Fatal("session pool is closed".to_string()));
        }
        let session = self.token.open_session(self.slot)?;
        debug!("Opened session to slot {} of {}", self.slot, self.token.info());
        Ok(PooledSession { session, broken: false })
    }

    fn is_valid(&self, _conn: &mut PooledSession) -> Result<(), TokenError> {
        Ok(())
    }

    fn has_broken(&self, conn: &mut PooledSession) -> bool {
        conn.broken || self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct SessionErrorHandler;

impl r2d2::HandleError<TokenError> for SessionErrorHandler {
    fn handle_error(&self, err: TokenError) {
        warn!("Unable to open session: {}", err);
    }
}

//------------ SessionGuard ------------------------------------------------------------------------------------------

/// Exclusive use of one session. The session goes back to the pool, or is closed, when the guard is dropped.
pub(crate) struct SessionGuard {
    conn: PooledConnection<SessionManager>,
}

impl SessionGuard {
    /// Close the session on release rather than returning it to the pool.
    pub fn invalidate(&mut self) {
        self.conn.broken = true;
    }
}

impl Deref for SessionGuard {
    type Target = dyn TokenSession;

    fn deref(&self) -> &Self::Target {
        self.conn.session.as_ref()
    }
}

//------------ SessionPool -------------------------------------------------------------------------------------------

pub(crate) struct SessionPool {
    closed: Arc<AtomicBool>,
    pool: RwLock<Option<r2d2::Pool<SessionManager>>>,
    acquire_timeout: Duration,
}

impl SessionPool {
    pub fn new(token: Arc<dyn Token>, slot: SlotId, max_sessions: u32, acquire_timeout: Duration) -> Result<Self, Error> {
        if max_sessions == 0 {
            return Err(Error::invalid_argument("the session pool needs room for at least one session"));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let manager = SessionManager {
            token,
            slot,
            closed: closed.clone(),
        };

        // No reaper and no eager opening: sessions live until they break or the pool closes.
        let pool = r2d2::Pool::builder()
            .max_size(max_sessions)
            .min_idle(Some(0))
            .max_lifetime(None)
            .idle_timeout(None)
            .test_on_check_out(false)
            .connection_timeout(acquire_timeout)
            .error_handler(Box::new(SessionErrorHandler))
            .build_unchecked(manager);

        Ok(SessionPool {
            closed,
            pool: RwLock::new(Some(pool)),
            acquire_timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take a session, waiting at most the acquire timeout for one to become available. A wait is cut short with
    /// [`Error::Closed`] when the pool is closed meanwhile.
    pub fn acquire(&self) -> Result<SessionGuard, Error> {
        let pool = {
            let pool = self.pool.read().unwrap_or_else(PoisonError::into_inner);
            match pool.as_ref() {
                Some(pool) if !self.is_closed() => pool.clone(),
                _ => return Err(Error::Closed),
            }
        };

        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now()).min(CLOSE_POLL_INTERVAL);
            match pool.get_timeout(wait) {
                Ok(conn) => {
                    // closed while we waited, the session is closed when the guard drops
                    if self.is_closed() {
                        return Err(Error::Closed);
                    }
                    return Ok(SessionGuard { conn });
                }
                Err(_) if self.is_closed() => return Err(Error::Closed),
                Err(err) if Instant::now() >= deadline => {
                    return Err(Error::Timeout(format!(
                        "no session available within {}s: {}",
                        self.acquire_timeout.as_secs_f32(),
                        err
                    )));
                }
                Err(_) => {}
            }
        }
    }

    /// Close every idle session and refuse new sessions from now on. Sessions in use are closed when returned.
    pub fn close_all(&self) {
        let pool = {
            let mut pool = self.pool.write().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            pool.take()
        };

        if let Some(pool) = pool {
            let state = pool.state();
            let mut closed = 0;
            while let Some(conn) = pool.try_get() {
                drop(conn);
                closed += 1;
            }
            debug!(
                "Closed {} idle sessions, {} sessions in use will be closed on release",
                closed,
                state.connections - state.idle_connections
            );
        }
    }
}
