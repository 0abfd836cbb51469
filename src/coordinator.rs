//! Session coordinator: the lifecycle state machine over store, pairing and
//! transport.
//!
//! A coordinator owns at most one live [`TransportSession`]. `connect()` takes
//! the store lock, pairs if the record carries no credential, logs in, and
//! hands the authenticated link to a supervisor. Link events from the
//! supervisor drive the Connected/Reconnecting/Disconnected transitions.
//! Every transition is published as an [`Event::Connection`].

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::binary::Node;
use crate::config::SessionConfig;
use crate::dispatcher::{EventDispatcher, HandlerError, HandlerId};
use crate::error::{Error, Result};
use crate::pairing::{registration_request, HandshakeEngine};
use crate::socket::{Connector, WebSocketConnector};
use crate::store::{CredentialStore, DeviceIdentity, FileCredentialStore, SessionCredential, SessionRecord, StoreLock};
use crate::transport::{
    authenticate, iq, login_request, Connection, LinkContext, LinkEvent, RequestHandle, RequestTracker, Routing,
    TransportSession,
};
use crate::types::{ConnectionEvent, ConnectionState, Event, EventCategory, JID};

/// Mutable state guarded by the coordinator mutex.
struct Shared {
    state: ConnectionState,
    last_error: Option<Error>,
    record: Option<SessionRecord>,
    lock: Option<StoreLock>,
    session: Option<TransportSession>,
    monitor: Option<JoinHandle<()>>,
    /// Bumped whenever an attempt or live session is torn down, so stale
    /// tasks can tell they no longer own the state.
    generation: u64,
    cancel_attempt: Option<oneshot::Sender<()>>,
    /// A revocation that could not be written yet; applied on the next load.
    revocation_pending: bool,
}

impl Shared {
    fn transition(&mut self, next: ConnectionState, error: Option<Error>) -> Option<Event> {
        if let Some(err) = &error {
            self.last_error = Some(err.clone());
        }
        if self.state == next {
            return None;
        }
        let previous = self.state;
        self.state = next;
        match &error {
            Some(err) => info!("session state {} -> {} ({})", previous, next, err),
            None => info!("session state {} -> {}", previous, next),
        }
        Some(Event::Connection(ConnectionEvent {
            previous,
            current: next,
            error,
        }))
    }
}

struct Inner {
    config: Arc<SessionConfig>,
    store: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<EventDispatcher>,
    shared: Mutex<Shared>,
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Dispatch outside the mutex; handlers may call back into the coordinator.
    fn emit(&self, event: Option<Event>) {
        if let Some(event) = event {
            self.dispatcher.dispatch(&event);
        }
    }

    fn routing(&self) -> Routing {
        Routing {
            tracker: Arc::new(RequestTracker::new()),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Drop the credential after revocation. The identity stays.
    ///
    /// Returns the store error if the revocation could not be persisted;
    /// the next `connect()` retries the write before using the record.
    fn forget_credential(&self, shared: &mut Shared) -> Option<Error> {
        let record = shared.record.as_mut()?;
        record.credential = None;
        match self.store.save(record) {
            Ok(()) => {
                shared.revocation_pending = false;
                None
            }
            Err(e) => {
                error!("failed to persist credential revocation: {}", e);
                shared.revocation_pending = true;
                Some(e.into())
            }
        }
    }

    fn record_login(&self, shared: &mut Shared) {
        if let Some(record) = shared.record.as_mut() {
            if let Some(credential) = record.credential.as_mut() {
                credential.last_login_at = Some(Utc::now());
            }
            if let Err(e) = self.store.save(record) {
                warn!("failed to persist login time: {}", e);
            }
        }
    }
}

/// Returns the coordinator to Disconnected if a connect attempt ends without
/// reaching Connected, including when the `connect()` future is dropped.
struct AttemptGuard {
    inner: Arc<Inner>,
    generation: u64,
    armed: bool,
}

impl AttemptGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn abandon(&mut self, error: Error) {
        if !self.armed {
            return;
        }
        self.armed = false;
        let event = {
            let mut shared = self.inner.shared();
            if shared.generation != self.generation {
                return;
            }
            shared.generation += 1;
            shared.cancel_attempt = None;
            shared.lock = None;
            let unsaved = match error {
                Error::CredentialRevoked(_) => self.inner.forget_credential(&mut shared),
                _ => None,
            };
            let event = shared.transition(ConnectionState::Disconnected, Some(error));
            if let Some(e) = unsaved {
                shared.last_error = Some(e);
            }
            event
        };
        self.inner.emit(event);
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("connect attempt dropped before completion");
            self.abandon(Error::Cancelled);
        }
    }
}

/// One WhatsApp Web companion session.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Coordinator over the on-disk store and the WebSocket transport.
    pub fn new(config: SessionConfig) -> Self {
        let store = FileCredentialStore::new(config.session_directory.clone(), config.session_id.clone());
        Self::with_parts(config, Arc::new(store), Arc::new(WebSocketConnector::default()))
    }

    /// Coordinator over caller-supplied store and connector.
    pub fn with_parts(config: SessionConfig, store: Arc<dyn CredentialStore>, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                store,
                connector,
                dispatcher: Arc::new(EventDispatcher::new()),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    last_error: None,
                    record: None,
                    lock: None,
                    session: None,
                    monitor: None,
                    generation: 0,
                    cancel_attempt: None,
                    revocation_pending: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Bring the session up: pair if needed, log in, and return the state reached.
    ///
    /// While an attempt is underway or the session is up this returns the
    /// current state without starting anything. Fails with `TransportClosed`
    /// after [`disconnect`](Self::disconnect) until [`reset`](Self::reset).
    pub async fn connect(&self) -> Result<ConnectionState> {
        self.inner.config.validate()?;

        let (record, generation, cancelled, event) = {
            let mut shared = self.inner.shared();
            match shared.state {
                state if state.is_active() => return Ok(state),
                ConnectionState::Closed => {
                    return Err(Error::TransportClosed("session was closed; reset() it first".into()))
                }
                _ => {}
            }

            let lock = self.inner.store.lock()?;
            let record = match self.inner.store.load()? {
                Some(mut record) if shared.revocation_pending && record.credential.is_some() => {
                    warn!("applying credential revocation left over from the last session");
                    record.credential = None;
                    self.inner.store.save(&record)?;
                    shared.revocation_pending = false;
                    record
                }
                Some(record) => record,
                None => {
                    info!("no stored session {:?}, generating device identity", self.inner.config.session_id);
                    let record = SessionRecord::new(self.inner.config.session_id.clone());
                    self.inner.store.save(&record)?;
                    record
                }
            };

            let (cancel, cancelled) = oneshot::channel();
            shared.generation += 1;
            shared.lock = Some(lock);
            shared.record = Some(record.clone());
            shared.cancel_attempt = Some(cancel);
            let next = if record.is_paired() {
                ConnectionState::Authenticating
            } else {
                ConnectionState::Pairing
            };
            (record, shared.generation, cancelled, shared.transition(next, None))
        };
        self.inner.emit(event);

        let mut guard = AttemptGuard {
            inner: self.inner.clone(),
            generation,
            armed: true,
        };
        let outcome = tokio::select! {
            _ = cancelled => Err(Error::Cancelled),
            outcome = self.run_attempt(record, generation) => outcome,
        };
        match outcome {
            Ok(state) => {
                guard.disarm();
                Ok(state)
            }
            Err(err) => {
                warn!("connect failed: {}", err);
                guard.abandon(err.clone());
                Err(err)
            }
        }
    }

    async fn run_attempt(&self, mut record: SessionRecord, generation: u64) -> Result<ConnectionState> {
        let inner = &self.inner;
        let mut credential = match record.credential.clone() {
            Some(credential) => credential,
            None => {
                let credential = self.pair(&record.identity).await?;
                record.credential = Some(credential.clone());
                // Persisted before anything reports success.
                inner.store.save(&record)?;
                let event = {
                    let mut shared = inner.shared();
                    if shared.generation != generation {
                        return Err(Error::Cancelled);
                    }
                    shared.record = Some(record.clone());
                    shared.transition(ConnectionState::Authenticating, None)
                };
                inner.emit(event);
                credential
            }
        };

        let routing = inner.routing();
        let request = login_request(&inner.config, &record.identity, &credential)?;
        let mut conn = Connection::open(inner.connector.as_ref(), request, &routing).await?;
        authenticate(&mut conn, inner.config.connect_timeout()).await?;

        credential.last_login_at = Some(Utc::now());
        record.credential = Some(credential.clone());
        inner.store.save(&record)?;

        let (link_events, link_rx) = mpsc::unbounded_channel();
        let session = TransportSession::spawn(
            conn,
            LinkContext {
                connector: inner.connector.clone(),
                config: inner.config.clone(),
                routing,
                identity: record.identity.clone(),
                credential,
            },
            link_events,
        );
        let event = {
            let mut shared = inner.shared();
            if shared.generation != generation {
                return Err(Error::Cancelled);
            }
            shared.session = Some(session);
            shared.monitor = Some(tokio::spawn(monitor(Arc::downgrade(inner), generation, link_rx)));
            shared.record = Some(record);
            shared.cancel_attempt = None;
            shared.transition(ConnectionState::Connected, None)
        };
        inner.emit(event);
        Ok(ConnectionState::Connected)
    }

    async fn pair(&self, identity: &DeviceIdentity) -> Result<SessionCredential> {
        let inner = &self.inner;
        let engine = HandshakeEngine::new(&inner.config, identity, &inner.dispatcher)?;
        let routing = inner.routing();
        let request = registration_request(&inner.config, identity);
        let mut conn = Connection::open(inner.connector.as_ref(), request, &routing).await?;
        let result = engine.run(&mut conn, &routing.tracker).await;
        // The server restarts the stream after pairing; login uses a new link.
        conn.close().await;
        result
    }

    /// Close the session. Terminal until [`reset`](Self::reset).
    ///
    /// Cancels an attempt in progress. Does nothing when already Disconnected
    /// or Closed.
    pub async fn disconnect(&self) {
        drop(self.close(false).await);
    }

    /// Move to Closed and stop the live session. The store lock is handed
    /// back to the caller, who decides when to release it.
    async fn close(&self, from_idle: bool) -> Option<StoreLock> {
        let (session, monitor, lock, event) = {
            let mut shared = self.inner.shared();
            let idle = matches!(shared.state, ConnectionState::Disconnected | ConnectionState::Closed);
            if idle && !from_idle {
                return None;
            }
            shared.generation += 1;
            shared.cancel_attempt = None;
            let event = shared.transition(ConnectionState::Closed, None);
            (shared.session.take(), shared.monitor.take(), shared.lock.take(), event)
        };
        self.inner.emit(event);

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        if let Some(session) = session {
            session.shutdown().await;
        }
        lock
    }

    /// Unlink this companion from the account and wipe the stored session.
    pub async fn logout(&self) -> Result<()> {
        let pending = {
            let shared = self.inner.shared();
            let jid = shared
                .record
                .as_ref()
                .and_then(|r| r.credential.as_ref())
                .map(|c| c.jid.clone());
            match (&shared.session, jid) {
                (Some(session), Some(jid)) if shared.state == ConnectionState::Connected => {
                    Some(session.issue(remove_companion_device(&jid), true)?)
                }
                _ => None,
            }
        };
        match pending {
            Some(request) => match request.wait().await {
                Ok(_) => info!("server removed this companion device"),
                Err(e) => warn!("logout was not confirmed by the server: {}", e),
            },
            None => info!("logging out without a live link"),
        }

        // Link down before the wipe.
        let held = self.close(true).await;
        let wiped = match held {
            Some(lock) => Ok(lock),
            None => self.inner.store.lock(),
        }
        .and_then(|lock| {
            self.inner.store.clear()?;
            Ok(lock)
        })
        .map_err(Error::from);
        match wiped {
            Ok(lock) => {
                self.inner.shared().record = None;
                drop(lock);
                Ok(())
            }
            Err(err) => {
                error!("logout could not wipe the stored session: {}", err);
                let event = self
                    .inner
                    .shared()
                    .transition(ConnectionState::Disconnected, Some(err.clone()));
                self.inner.emit(event);
                Err(err)
            }
        }
    }

    /// Leave Closed so `connect()` may be called again.
    pub fn reset(&self) -> ConnectionState {
        let event = {
            let mut shared = self.inner.shared();
            if shared.state != ConnectionState::Closed {
                return shared.state;
            }
            shared.last_error = None;
            shared.transition(ConnectionState::Disconnected, None)
        };
        self.inner.emit(event);
        ConnectionState::Disconnected
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.shared().state
    }

    /// The error behind the last failed transition.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.shared().last_error.clone()
    }

    /// Credential of the paired account, if any.
    pub fn credential(&self) -> Option<SessionCredential> {
        self.inner.shared().record.as_ref().and_then(|r| r.credential.clone())
    }

    /// Queue an outbound stanza on the live session.
    ///
    /// Accepted while Connected, and while Reconnecting (written once the
    /// link is back).
    pub fn issue_request(&self, node: Node, expects_reply: bool) -> Result<RequestHandle> {
        let shared = self.inner.shared();
        match (&shared.session, shared.state) {
            (Some(session), ConnectionState::Connected | ConnectionState::Reconnecting) => {
                session.issue(node, expects_reply)
            }
            (_, state) => Err(Error::TransportClosed(format!("session is {}", state))),
        }
    }

    /// Register a handler for one event category.
    pub fn on<F>(&self, category: EventCategory, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(category, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.off(id)
    }
}

fn remove_companion_device(jid: &JID) -> Node {
    let id = format!("logout.{}", Utc::now().timestamp_millis());
    iq(&id, "set", "md").children(vec![Node::new("remove-companion-device")
        .attr("jid", jid.clone())
        .attr("reason", "user_initiated")])
}

/// Follow the supervisor of one live session and mirror it into the state.
async fn monitor(inner: Weak<Inner>, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(link_event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let event = {
            let mut shared = inner.shared();
            if shared.generation != generation {
                return;
            }
            match link_event {
                LinkEvent::Lost(err) => shared.transition(ConnectionState::Reconnecting, Some(err)),
                LinkEvent::Retrying { .. } => None,
                LinkEvent::Authenticated => {
                    inner.record_login(&mut shared);
                    shared.transition(ConnectionState::Connected, None)
                }
                LinkEvent::Failed(err) => {
                    let unsaved = match err {
                        Error::CredentialRevoked(_) => {
                            warn!("credential revoked, stored session must pair again");
                            inner.forget_credential(&mut shared)
                        }
                        _ => None,
                    };
                    shared.generation += 1;
                    shared.session = None;
                    shared.monitor = None;
                    shared.lock = None;
                    let event = shared.transition(ConnectionState::Disconnected, Some(err));
                    if let Some(e) = unsaved {
                        shared.last_error = Some(e);
                    }
                    event
                }
                LinkEvent::Closed => return,
            }
        };
        inner.emit(event);
    }
}
