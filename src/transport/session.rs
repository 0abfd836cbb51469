//! Supervisor of an authenticated session.
//!
//! Owns the live [`Connection`]: writes queued requests in issuance order,
//! answers server pings, sends keepalives and watches for inbound silence.
//! When the link drops it reconnects with backoff, reusing the stored
//! credential, and reports every step as a [`LinkEvent`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

use crate::binary::Node;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::proto::make_login_payload;
use crate::socket::{ConnectRequest, Connector};
use crate::store::{DeviceIdentity, SessionCredential};
use crate::transport::backoff::Backoff;
use crate::transport::connection::{authenticate, stream_end_error, Connection, Routing};
use crate::transport::keepalive::{is_server_ping, ping, pong, Keepalive};
use crate::transport::request::{RequestHandle, RequestTracker};

/// What the supervisor reports to its owner.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link dropped; the error says why.
    Lost(Error),
    /// About to sleep before reconnect attempt `attempt`.
    Retrying { attempt: u32, delay: Duration },
    /// A new link logged in successfully.
    Authenticated,
    /// Gave up; no further links will be opened.
    Failed(Error),
    /// Shut down on request.
    Closed,
}

/// Login request for an already paired device.
pub fn login_request(
    config: &SessionConfig,
    identity: &DeviceIdentity,
    credential: &SessionCredential,
) -> Result<ConnectRequest> {
    let user: u64 = credential
        .jid
        .user
        .parse()
        .map_err(|_| Error::Corruption(format!("stored jid {} has a non-numeric user", credential.jid)))?;
    Ok(ConnectRequest {
        endpoint: config.endpoint.clone(),
        origin: config.origin.clone(),
        noise_key: identity.noise_key.clone(),
        payload: make_login_payload(user, u32::from(credential.jid.device), config.push_name.as_deref()),
        timeout: config.connect_timeout(),
    })
}

/// Everything needed to re-open the link.
pub struct LinkContext {
    pub connector: Arc<dyn Connector>,
    pub config: Arc<SessionConfig>,
    pub routing: Routing,
    pub identity: DeviceIdentity,
    pub credential: SessionCredential,
}

struct Outbound {
    id: String,
    node: Node,
}

enum LinkEnd {
    Shutdown,
    Lost(Error),
}

enum Reconnect {
    Linked(Connection),
    Shutdown,
    Failed(Error),
}

/// Handle to a running supervisor task.
pub struct TransportSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    tracker: Arc<RequestTracker>,
    request_timeout: Duration,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Take over an authenticated connection.
    pub fn spawn(conn: Connection, ctx: LinkContext, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (shutdown, stop) = oneshot::channel();
        let tracker = ctx.routing.tracker.clone();
        let request_timeout = ctx.config.request_timeout();
        let task = tokio::spawn(supervise(conn, ctx, queue, stop, events));
        Self {
            outbound,
            tracker,
            request_timeout,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Queue a stanza for writing.
    ///
    /// Requests that expect a reply get an `id` attribute if they have none.
    pub fn issue(&self, mut node: Node, expects_reply: bool) -> Result<RequestHandle> {
        let id = match node.get_attr_str("id") {
            Some(id) => id.to_string(),
            None => {
                let id = self.tracker.next_id();
                if expects_reply {
                    node.set_attr("id", id.as_str());
                }
                id
            }
        };
        let rx = self.tracker.register(&id, expects_reply)?;
        if self.outbound.send(Outbound { id: id.clone(), node }).is_err() {
            self.tracker.cancel(&id);
            return Err(Error::TransportClosed("session supervisor stopped".into()));
        }
        Ok(RequestHandle::new(id, rx, self.tracker.clone(), self.request_timeout))
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Close the link and wait for the supervisor to finish.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.shutdown.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn supervise(
    conn: Connection,
    ctx: LinkContext,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    mut stop: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let tracker = ctx.routing.tracker.clone();
    let mut current = Some(conn);
    loop {
        let mut conn = match current.take() {
            Some(conn) => conn,
            None => match reconnect(&ctx, &mut stop, &events).await {
                Reconnect::Linked(conn) => {
                    let _ = events.send(LinkEvent::Authenticated);
                    conn
                }
                Reconnect::Shutdown => {
                    tracker.fail_all(&Error::TransportClosed("session closed".into()));
                    let _ = events.send(LinkEvent::Closed);
                    return;
                }
                Reconnect::Failed(err) => {
                    tracker.fail_all(&err);
                    let _ = events.send(LinkEvent::Failed(err));
                    return;
                }
            },
        };

        let end = run_link(&mut conn, &ctx, &mut queue, &mut stop).await;
        conn.close().await;
        match end {
            LinkEnd::Shutdown => {
                info!("session link closed");
                tracker.fail_all(&Error::TransportClosed("session closed".into()));
                let _ = events.send(LinkEvent::Closed);
                return;
            }
            LinkEnd::Lost(cause) => {
                warn!("link lost: {}", cause);
                tracker.fail_in_flight(&Error::TransportClosed(cause.to_string()));
                let _ = events.send(LinkEvent::Lost(cause.clone()));
                if cause.is_fatal_for_link() {
                    tracker.fail_all(&cause);
                    let _ = events.send(LinkEvent::Failed(cause));
                    return;
                }
            }
        }
    }
}

async fn run_link(
    conn: &mut Connection,
    ctx: &LinkContext,
    queue: &mut mpsc::UnboundedReceiver<Outbound>,
    stop: &mut oneshot::Receiver<()>,
) -> LinkEnd {
    let tracker = &ctx.routing.tracker;
    let keepalive = Keepalive::new(ctx.config.keepalive_interval(), ctx.config.keepalive_timeout());
    let mut ticker = interval_at(Instant::now() + keepalive.interval(), keepalive.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut *stop => return LinkEnd::Shutdown,
            Some(out) = queue.recv() => {
                if let Err(e) = write_request(conn, tracker, out).await {
                    return LinkEnd::Lost(e);
                }
            }
            inbound = conn.next_control() => {
                let handled = match inbound {
                    Ok(node) => handle_stanza(conn, node).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = handled {
                    return LinkEnd::Lost(e);
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let last = conn.last_inbound();
                if keepalive.is_silent(last, now) {
                    return LinkEnd::Lost(Error::TransportClosed(format!(
                        "no inbound traffic for {:?}",
                        now.saturating_duration_since(last)
                    )));
                }
                let id = tracker.next_id();
                // Only the arrival of the reply matters, not its content.
                drop(tracker.register(&id, true));
                tracker.start_write(&id);
                if let Err(e) = conn.send(&ping(&id)).await {
                    return LinkEnd::Lost(e);
                }
            }
        }
    }
}

async fn write_request(conn: &mut Connection, tracker: &RequestTracker, out: Outbound) -> Result<()> {
    if !tracker.start_write(&out.id) {
        debug!("request {} cancelled before it was written", out.id);
        return Ok(());
    }
    conn.send(&out.node).await?;
    tracker.finish_write(&out.id);
    Ok(())
}

async fn handle_stanza(conn: &mut Connection, node: Node) -> Result<()> {
    if let Some(err) = stream_end_error(&node) {
        return Err(err);
    }
    if is_server_ping(&node) {
        return conn.send(&pong(&node)).await;
    }
    debug!("unhandled stanza {}", node.describe());
    Ok(())
}

async fn reconnect(
    ctx: &LinkContext,
    stop: &mut oneshot::Receiver<()>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> Reconnect {
    let mut backoff = Backoff::from_config(&ctx.config);
    let mut last_error = None;
    while let Some(delay) = backoff.next_delay() {
        let attempt = backoff.attempt();
        warn!("reconnect attempt {}/{} in {:?}", attempt, backoff.ceiling(), delay);
        let _ = events.send(LinkEvent::Retrying { attempt, delay });

        tokio::select! {
            _ = &mut *stop => return Reconnect::Shutdown,
            _ = sleep(delay) => {}
        }
        let outcome = tokio::select! {
            _ = &mut *stop => return Reconnect::Shutdown,
            outcome = relink(ctx) => outcome,
        };
        match outcome {
            Ok(conn) => {
                info!("reconnected on attempt {}", attempt);
                return Reconnect::Linked(conn);
            }
            Err(e) if e.is_fatal_for_link() => return Reconnect::Failed(e),
            Err(e) => {
                warn!("reconnect attempt {} failed: {}", attempt, e);
                last_error = Some(e);
            }
        }
    }
    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    Reconnect::Failed(Error::TransportClosed(format!(
        "gave up after {} reconnect attempts: {}",
        backoff.ceiling(),
        reason
    )))
}

async fn relink(ctx: &LinkContext) -> Result<Connection> {
    let request = login_request(&ctx.config, &ctx.identity, &ctx.credential)?;
    let mut conn = Connection::open(ctx.connector.as_ref(), request, &ctx.routing).await?;
    authenticate(&mut conn, ctx.config.connect_timeout()).await?;
    Ok(conn)
}
