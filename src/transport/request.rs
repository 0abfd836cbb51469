//! Request/response correlation for outbound stanzas.
//!
//! Every issued request gets an id and a one-shot slot in the pending table.
//! The supervisor marks a request in flight when it writes it; the read loop
//! resolves it when the `<iq>` reply with the same id arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::binary::Node;
use crate::error::{Error, Result};
use crate::types::servers;

type Reply = Result<Option<Node>>;

struct Pending {
    slot: oneshot::Sender<Reply>,
    expects_reply: bool,
    in_flight: bool,
}

/// Pending table keyed by request id.
pub struct RequestTracker {
    pending: Mutex<HashMap<String, Pending>>,
    counter: AtomicU64,
    prefix: u16,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            prefix: rand::random(),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        // The table holds no invariants a panicking holder could break.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate a new unique request ID.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{:X}.{}", self.prefix, n)
    }

    /// Register a request and get the receiver its outcome is delivered on.
    ///
    /// An id that is still pending is refused; its waiter keeps the slot.
    pub(crate) fn register(&self, id: &str, expects_reply: bool) -> Result<oneshot::Receiver<Reply>> {
        let mut table = self.table();
        if table.contains_key(id) {
            return Err(Error::Protocol(format!("request id {} is already pending", id)));
        }
        let (slot, rx) = oneshot::channel();
        table.insert(
            id.to_string(),
            Pending {
                slot,
                expects_reply,
                in_flight: false,
            },
        );
        Ok(rx)
    }

    /// Mark a request as being written. `false` if it was cancelled meanwhile.
    pub(crate) fn start_write(&self, id: &str) -> bool {
        match self.table().get_mut(id) {
            Some(pending) => {
                pending.in_flight = true;
                true
            }
            None => false,
        }
    }

    /// The frame was written; requests without a reply are done.
    pub(crate) fn finish_write(&self, id: &str) {
        let mut table = self.table();
        if table.get(id).map_or(false, |p| !p.expects_reply) {
            if let Some(pending) = table.remove(id) {
                let _ = pending.slot.send(Ok(None));
            }
        }
    }

    /// Resolve a pending request with its reply. `false` if no such request is pending.
    pub fn complete(&self, id: &str, reply: Node) -> bool {
        let pending = {
            let mut table = self.table();
            match table.get(id) {
                Some(p) if p.expects_reply => table.remove(id),
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                // The handle may have been dropped without waiting.
                let _ = pending.slot.send(Ok(Some(reply)));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request. Its waiter sees `Cancelled`.
    pub fn cancel(&self, id: &str) -> bool {
        self.table().remove(id).is_some()
    }

    /// Fail requests that already went out on a link that is now gone.
    pub(crate) fn fail_in_flight(&self, err: &Error) {
        let failed: Vec<Pending> = {
            let mut table = self.table();
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, p)| p.in_flight)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        if !failed.is_empty() {
            debug!("failing {} in-flight requests: {}", failed.len(), err);
        }
        for pending in failed {
            let _ = pending.slot.send(Err(err.clone()));
        }
    }

    /// Fail everything, queued or in flight.
    pub(crate) fn fail_all(&self, err: &Error) {
        let drained: Vec<Pending> = self.table().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.slot.send(Err(err.clone()));
        }
    }

    /// Get count of pending requests.
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller's side of an issued request.
#[derive(Debug)]
pub struct RequestHandle {
    id: String,
    rx: oneshot::Receiver<Reply>,
    tracker: Arc<RequestTracker>,
    timeout: Duration,
}

impl RequestHandle {
    pub(crate) fn new(
        id: String,
        rx: oneshot::Receiver<Reply>,
        tracker: Arc<RequestTracker>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            rx,
            tracker,
            timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A cancel switch usable while another task awaits [`RequestHandle::wait`].
    pub fn canceller(&self) -> RequestCanceller {
        RequestCanceller {
            id: self.id.clone(),
            tracker: self.tracker.clone(),
        }
    }

    pub fn cancel(&self) {
        self.tracker.cancel(&self.id);
    }

    /// Wait for the outcome.
    ///
    /// Requests that expect a reply resolve to `Some(reply)`; an `<iq type="error">`
    /// reply becomes [`Error::ServerError`]. Fire-and-forget requests resolve to
    /// `None` once written.
    pub async fn wait(self) -> Result<Option<Node>> {
        match timeout(self.timeout, self.rx).await {
            Ok(Ok(Ok(Some(reply)))) if is_iq_error(&reply) => Err(server_error(&reply)),
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.tracker.cancel(&self.id);
                Err(Error::RequestTimeout(self.id))
            }
        }
    }
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Cancels one request from anywhere.
#[derive(Debug, Clone)]
pub struct RequestCanceller {
    id: String,
    tracker: Arc<RequestTracker>,
}

impl RequestCanceller {
    pub fn cancel(&self) -> bool {
        self.tracker.cancel(&self.id)
    }
}

/// Build an `<iq>` addressed to the server.
pub fn iq(id: &str, kind: &str, xmlns: &str) -> Node {
    Node::new("iq")
        .attr("id", id)
        .attr("type", kind)
        .attr("xmlns", xmlns)
        .attr("to", servers::DEFAULT_USER)
}

/// Build an IQ result response.
pub fn iq_result(id: &str, to: Option<&str>) -> Node {
    let mut node = Node::new("iq").attr("id", id).attr("type", "result");
    if let Some(to) = to {
        node.set_attr("to", to);
    }
    node
}

/// Check if a node is a reply to one of our requests.
pub fn is_iq_reply(node: &Node) -> bool {
    node.tag == "iq" && matches!(node.get_attr_str("type"), Some("result") | Some("error"))
}

/// Check if a node is an IQ error.
pub fn is_iq_error(node: &Node) -> bool {
    node.tag == "iq" && node.get_attr_str("type") == Some("error")
}

/// Error carried by an `<iq type="error">` reply.
pub fn server_error(node: &Node) -> Error {
    let error = node.get_child_by_tag("error");
    let code = error
        .and_then(|e| e.get_attr_int("code"))
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(0);
    let text = error
        .and_then(|e| e.get_attr_str("text"))
        .unwrap_or("unknown error")
        .to_string();
    Error::ServerError { code, text }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(tracker: &Arc<RequestTracker>, expects_reply: bool) -> RequestHandle {
        let id = tracker.next_id();
        let rx = tracker.register(&id, expects_reply).unwrap();
        RequestHandle::new(id, rx, tracker.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_replies_resolve_out_of_order() {
        let tracker = Arc::new(RequestTracker::new());
        let first = handle(&tracker, true);
        let second = handle(&tracker, true);
        for h in [&first, &second] {
            assert!(tracker.start_write(h.id()));
            tracker.finish_write(h.id());
        }
        assert_eq!(tracker.pending_count(), 2);

        assert!(tracker.complete(second.id(), iq_result(second.id(), None).attr("n", "2")));
        assert!(tracker.complete(first.id(), iq_result(first.id(), None).attr("n", "1")));

        let reply = second.wait().await.unwrap().unwrap();
        assert_eq!(reply.get_attr_str("n"), Some("2"));
        let reply = first.wait().await.unwrap().unwrap();
        assert_eq!(reply.get_attr_str("n"), Some("1"));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter_and_discards_late_reply() {
        let tracker = Arc::new(RequestTracker::new());
        let request = handle(&tracker, true);
        let id = request.id().to_string();
        let canceller = request.canceller();

        let waiter = tokio::spawn(request.wait());
        assert!(canceller.cancel());
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));

        assert!(!tracker.complete(&id, iq_result(&id, None)));
        assert!(!tracker.start_write(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let tracker = Arc::new(RequestTracker::new());
        let request = handle(&tracker, true);
        let id = request.id().to_string();

        match request.wait().await {
            Err(Error::RequestTimeout(timed_out)) => assert_eq!(timed_out, id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_link_loss_fails_only_in_flight() {
        let tracker = Arc::new(RequestTracker::new());
        let sent = handle(&tracker, true);
        let queued = handle(&tracker, true);
        tracker.start_write(sent.id());

        tracker.fail_in_flight(&Error::TransportClosed("eof".into()));
        assert!(matches!(sent.wait().await, Err(Error::TransportClosed(_))));
        assert_eq!(tracker.pending_count(), 1);

        tracker.fail_all(&Error::TransportClosed("closed".into()));
        assert!(matches!(queued.wait().await, Err(Error::TransportClosed(_))));
    }

    #[tokio::test]
    async fn test_duplicate_id_refused() {
        let tracker = Arc::new(RequestTracker::new());
        let first = handle(&tracker, true);
        let id = first.id().to_string();
        assert!(matches!(tracker.register(&id, true), Err(Error::Protocol(_))));
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.complete(&id, iq_result(&id, None)));
        assert!(first.wait().await.unwrap().is_some());
        assert!(tracker.register(&id, true).is_ok());
    }

    #[tokio::test]
    async fn test_fire_and_forget_resolves_on_write() {
        let tracker = Arc::new(RequestTracker::new());
        let request = handle(&tracker, false);
        tracker.start_write(request.id());
        tracker.finish_write(request.id());
        assert_eq!(request.wait().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_error_reply_becomes_server_error() {
        let tracker = Arc::new(RequestTracker::new());
        let request = handle(&tracker, true);
        let id = request.id().to_string();
        tracker.start_write(&id);

        let reply = Node::new("iq")
            .attr("id", id.as_str())
            .attr("type", "error")
            .children(vec![Node::new("error").attr("code", "404").attr("text", "item-not-found")]);
        assert!(tracker.complete(&id, reply));
        match request.wait().await {
            Err(Error::ServerError { code, text }) => {
                assert_eq!(code, 404);
                assert_eq!(text, "item-not-found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_iq_builders() {
        let node = iq("1.1", "get", "w:p");
        assert_eq!(node.get_attr_str("to"), Some("s.whatsapp.net"));
        assert!(is_iq_reply(&iq_result("1.1", None)));
        assert!(!is_iq_reply(&node));
    }
}
