//! Transport abstraction for IU replication.
//!
//! The transport delivers broadcast events to scope subscribers and carries
//! blocking request/response calls to named RPC servers. Delivery is
//! best-effort: a subscriber that joins late never sees earlier events.

use std::sync::Arc;
use std::time::Duration;

use iubus_core::{IuEvent, RpcRequest};

use crate::error::Result;
use crate::scope::Scope;

/// Callback receiving decoded events for one subscription.
pub type EventSink = Arc<dyn Fn(IuEvent) + Send + Sync>;

/// Callback answering RPC requests. Returns `0` to reject, otherwise the
/// resulting revision.
pub type RpcHandler = Arc<dyn Fn(RpcRequest) -> u64 + Send + Sync>;

/// Handle to a live subscription or server. Dropping it unregisters.
pub struct Registration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A registration with nothing to undo.
    pub fn noop() -> Self {
        Self { cancel: None }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Publish/subscribe plus RPC.
///
/// Implementations must be thread-safe (Send + Sync). Sinks and handlers
/// are invoked on transport-owned threads and may themselves block on
/// [`RemoteServer::call`].
pub trait Transport: Send + Sync {
    /// Broadcast an event to every current subscriber of `scope`.
    fn publish(&self, scope: &Scope, event: &IuEvent) -> Result<()>;

    /// Receive events published on `scope` until the registration is dropped.
    fn subscribe(&self, scope: &Scope, sink: EventSink) -> Result<Registration>;

    /// Answer RPC requests addressed to `scope`.
    fn serve(&self, scope: &Scope, handler: RpcHandler) -> Result<Registration>;

    /// Obtain a client handle for the server at `scope`.
    ///
    /// The server need not exist yet; calls fail until it does.
    fn remote_server(&self, scope: &Scope) -> Result<Arc<dyn RemoteServer>>;
}

/// Client side of an RPC server.
pub trait RemoteServer: Send + Sync {
    fn scope(&self) -> &Scope;

    /// Issue a request and block until the reply arrives or `timeout` passes.
    fn call(&self, request: &RpcRequest, timeout: Duration) -> Result<u64>;
}

/// An in-process transport for tests and single-process setups.
///
/// Every subscription and every server gets its own delivery thread fed by
/// a tokio channel. RPC replies come back over a oneshot channel awaited
/// with a timeout on the network's runtime, so [`RemoteServer::call`] must
/// not be used from inside an async context.
pub mod memory {
    use super::*;
    use bytes::Bytes;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Weak;
    use tokio::sync::{mpsc, oneshot};
    use tracing::{debug, trace, warn};

    use iubus_core::{decode_event, decode_request, encode_event, encode_request, REJECTED};

    use crate::error::TransportError;

    /// A queued RPC call.
    struct PendingCall {
        frame: Bytes,
        reply: oneshot::Sender<u64>,
    }

    type Subscriber = (u64, mpsc::UnboundedSender<Bytes>);

    /// Shared state for the in-process network.
    pub struct MemoryNetwork {
        /// Drives RPC timeouts. `None` if it could not be started.
        runtime: Option<tokio::runtime::Runtime>,
        topics: RwLock<HashMap<Scope, Vec<Subscriber>>>,
        servers: RwLock<HashMap<Scope, (u64, mpsc::UnboundedSender<PendingCall>)>>,
        next_id: AtomicU64,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        ///
        /// If the timer runtime cannot be started the network still
        /// publishes and subscribes, but every RPC fails with
        /// [`TransportError::Spawn`]. Use [`MemoryNetwork::try_new`] to
        /// surface that failure up front.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a new memory network, failing if its timer runtime
        /// cannot be started.
        pub fn try_new() -> Result<Arc<Self>> {
            let runtime = build_runtime()?;
            Ok(Arc::new(Self::with_runtime(Some(runtime))))
        }

        pub(crate) fn with_runtime(runtime: Option<tokio::runtime::Runtime>) -> Self {
            Self {
                runtime,
                topics: RwLock::new(HashMap::new()),
                servers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }
        }

        /// Create a transport connected to this network.
        pub fn create_transport(self: &Arc<Self>) -> MemoryTransport {
            MemoryTransport {
                network: Arc::clone(self),
            }
        }

        /// Number of live subscriptions on `scope`.
        pub fn subscriber_count(&self, scope: &Scope) -> usize {
            self.topics.read().get(scope).map(Vec::len).unwrap_or(0)
        }

        /// Whether an RPC server is registered at `scope`.
        pub fn has_server(&self, scope: &Scope) -> bool {
            self.servers.read().contains_key(scope)
        }

        fn next_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        }

        fn publish(&self, scope: &Scope, event: &IuEvent) -> Result<()> {
            let frame = encode_event(event)?;
            let topics = self.topics.read();
            let Some(subscribers) = topics.get(scope) else {
                trace!(%scope, kind = event.kind(), "publish with no subscribers");
                return Ok(());
            };
            for (_, sender) in subscribers {
                // A subscriber whose thread already stopped is skipped.
                let _ = sender.send(frame.clone());
            }
            Ok(())
        }

        fn subscribe(self: &Arc<Self>, scope: &Scope, sink: EventSink) -> Result<Registration> {
            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            let id = self.next_id();
            let thread_scope = scope.clone();

            std::thread::Builder::new()
                .name(format!("iubus-sub-{}", id))
                .spawn(move || {
                    while let Some(frame) = rx.blocking_recv() {
                        match decode_event(&frame) {
                            Ok(event) => sink(event),
                            Err(e) => warn!(scope = %thread_scope, error = %e, "dropping undecodable event"),
                        }
                    }
                    trace!(scope = %thread_scope, "subscription closed");
                })
                .map_err(|e| TransportError::Spawn(e.to_string()))?;

            self.topics
                .write()
                .entry(scope.clone())
                .or_default()
                .push((id, tx));
            debug!(%scope, id, "subscribed");

            let network = Arc::downgrade(self);
            let scope = scope.clone();
            Ok(Registration::new(move || {
                if let Some(network) = network.upgrade() {
                    let mut topics = network.topics.write();
                    if let Some(subscribers) = topics.get_mut(&scope) {
                        subscribers.retain(|(sub_id, _)| *sub_id != id);
                        if subscribers.is_empty() {
                            topics.remove(&scope);
                        }
                    }
                }
            }))
        }

        fn serve(self: &Arc<Self>, scope: &Scope, handler: RpcHandler) -> Result<Registration> {
            let (tx, mut rx) = mpsc::unbounded_channel::<PendingCall>();
            let id = self.next_id();
            let thread_scope = scope.clone();

            std::thread::Builder::new()
                .name(format!("iubus-rpc-{}", id))
                .spawn(move || {
                    while let Some(call) = rx.blocking_recv() {
                        let result = match decode_request(&call.frame) {
                            Ok(request) => handler(request),
                            Err(e) => {
                                warn!(scope = %thread_scope, error = %e, "rejecting undecodable request");
                                REJECTED
                            }
                        };
                        // The caller may have timed out already.
                        let _ = call.reply.send(result);
                    }
                    trace!(scope = %thread_scope, "server closed");
                })
                .map_err(|e| TransportError::Spawn(e.to_string()))?;

            if let Some((old_id, _)) = self.servers.write().insert(scope.clone(), (id, tx)) {
                warn!(%scope, old_id, "replacing existing server");
            }
            debug!(%scope, id, "serving");

            let network = Arc::downgrade(self);
            let scope = scope.clone();
            Ok(Registration::new(move || {
                if let Some(network) = network.upgrade() {
                    let mut servers = network.servers.write();
                    if servers.get(&scope).map(|(sid, _)| *sid == id).unwrap_or(false) {
                        servers.remove(&scope);
                    }
                }
            }))
        }

        fn call(&self, scope: &Scope, request: &RpcRequest, timeout: Duration) -> Result<u64> {
            let runtime = self
                .runtime
                .as_ref()
                .ok_or_else(|| TransportError::Spawn("timer runtime unavailable".to_string()))?;
            let frame = encode_request(request)?;
            let sender = self
                .servers
                .read()
                .get(scope)
                .map(|(_, tx)| tx.clone())
                .ok_or_else(|| TransportError::NoServer(scope.to_string()))?;

            let (reply_tx, reply_rx) = oneshot::channel();
            sender
                .send(PendingCall {
                    frame,
                    reply: reply_tx,
                })
                .map_err(|_| TransportError::Disconnected(scope.to_string()))?;

            match runtime
                .block_on(async move { tokio::time::timeout(timeout, reply_rx).await })
            {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => Err(TransportError::Disconnected(scope.to_string())),
                Err(_) => Err(TransportError::Timeout {
                    scope: scope.to_string(),
                    timeout_ms: timeout.as_millis(),
                }),
            }
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            let runtime = build_runtime()
                .map_err(|e| warn!(error = %e, "memory network has no timer runtime, RPCs will fail"))
                .ok();
            Self::with_runtime(runtime)
        }
    }

    fn build_runtime() -> Result<tokio::runtime::Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("iubus-timer")
            .enable_time()
            .build()
            .map_err(|e| TransportError::Spawn(format!("timer runtime: {}", e)))
    }

    /// In-memory transport implementation.
    #[derive(Clone)]
    pub struct MemoryTransport {
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        pub fn network(&self) -> &Arc<MemoryNetwork> {
            &self.network
        }
    }

    impl Transport for MemoryTransport {
        fn publish(&self, scope: &Scope, event: &IuEvent) -> Result<()> {
            self.network.publish(scope, event)
        }

        fn subscribe(&self, scope: &Scope, sink: EventSink) -> Result<Registration> {
            self.network.subscribe(scope, sink)
        }

        fn serve(&self, scope: &Scope, handler: RpcHandler) -> Result<Registration> {
            self.network.serve(scope, handler)
        }

        fn remote_server(&self, scope: &Scope) -> Result<Arc<dyn RemoteServer>> {
            Ok(Arc::new(MemoryRemoteServer {
                scope: scope.clone(),
                network: Arc::downgrade(&self.network),
            }))
        }
    }

    /// Client handle for a server on a [`MemoryNetwork`].
    pub struct MemoryRemoteServer {
        scope: Scope,
        network: Weak<MemoryNetwork>,
    }

    impl RemoteServer for MemoryRemoteServer {
        fn scope(&self) -> &Scope {
            &self.scope
        }

        fn call(&self, request: &RpcRequest, timeout: Duration) -> Result<u64> {
            let network = self
                .network
                .upgrade()
                .ok_or_else(|| TransportError::Disconnected("network shut down".into()))?;
            network.call(&self.scope, request, timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::error::TransportError;
    use iubus_core::{Commission, ResendRequest, Retraction};
    use std::sync::mpsc;

    fn retraction(uid: &str) -> IuEvent {
        IuEvent::Retraction(Retraction {
            uid: uid.into(),
            revision: 2,
        })
    }

    #[test]
    fn test_memory_transport_publish_subscribe() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport();
        let scope = Scope::category("default", "cat1");

        let (tx, rx) = mpsc::channel();
        let _sub = transport
            .subscribe(
                &scope,
                Arc::new(move |event: IuEvent| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();

        transport.publish(&scope, &retraction("a")).unwrap();
        transport.publish(&scope, &retraction("b")).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.uid(), "a");
        assert_eq!(second.uid(), "b");
    }

    #[test]
    fn test_memory_transport_scopes_are_isolated() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport();

        let (tx, rx) = mpsc::channel();
        let _sub = transport
            .subscribe(
                &Scope::category("default", "cat1"),
                Arc::new(move |event: IuEvent| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();

        transport
            .publish(&Scope::category("default", "cat2"), &retraction("x"))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_dropping_registration_unsubscribes() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport();
        let scope = Scope::new("channel/default/category/x");

        let sub = transport.subscribe(&scope, Arc::new(|_: IuEvent| {})).unwrap();
        assert_eq!(network.subscriber_count(&scope), 1);
        drop(sub);
        assert_eq!(network.subscriber_count(&scope), 0);
    }

    #[test]
    fn test_memory_transport_rpc() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport();
        let scope = Scope::new("component/owner-00000001/OB");

        let _server = transport
            .serve(
                &scope,
                Arc::new(|request: RpcRequest| match request {
                    RpcRequest::Commit(c) => c.revision + 1,
                    _ => 0,
                }),
            )
            .unwrap();

        let remote = transport.remote_server(&scope).unwrap();
        let result = remote
            .call(
                &RpcRequest::Commit(Commission {
                    uid: "u".into(),
                    revision: 4,
                    writer_name: "w".into(),
                }),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(result, 5);

        let rejected = remote
            .call(
                &RpcRequest::ResendRequest(ResendRequest {
                    uid: "u".into(),
                    reply_scope: "r".into(),
                }),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(rejected, 0);
    }

    #[test]
    fn test_try_new_network_serves_rpcs() {
        let network = MemoryNetwork::try_new().unwrap();
        let transport = network.create_transport();
        let scope = Scope::new("component/owner-00000002/OB");
        let _server = transport.serve(&scope, Arc::new(|_: RpcRequest| 7)).unwrap();

        let result = transport
            .remote_server(&scope)
            .unwrap()
            .call(
                &RpcRequest::Commit(Commission {
                    uid: "u".into(),
                    revision: 1,
                    writer_name: "w".into(),
                }),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn test_network_without_runtime_fails_rpcs_but_delivers_events() {
        let network = Arc::new(MemoryNetwork::with_runtime(None));
        let transport = network.create_transport();
        let scope = Scope::new("component/owner-00000003/OB");
        let _server = transport.serve(&scope, Arc::new(|_: RpcRequest| 7)).unwrap();

        let err = transport
            .remote_server(&scope)
            .unwrap()
            .call(
                &RpcRequest::Commit(Commission {
                    uid: "u".into(),
                    revision: 1,
                    writer_name: "w".into(),
                }),
                Duration::from_secs(2),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));

        let category = Scope::category("default", "cat1");
        let (tx, rx) = mpsc::channel();
        let _sub = transport
            .subscribe(
                &category,
                Arc::new(move |event: IuEvent| {
                    let _ = tx.send(event);
                }),
            )
            .unwrap();
        transport.publish(&category, &retraction("a")).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().uid(), "a");
    }

    #[test]
    fn test_rpc_without_server_fails() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport();
        let remote = transport
            .remote_server(&Scope::new("component/nobody-00000000/OB"))
            .unwrap();
        let err = remote
            .call(
                &RpcRequest::Commit(Commission {
                    uid: "u".into(),
                    revision: 1,
                    writer_name: "w".into(),
                }),
                Duration::from_millis(100),
            )
            .unwrap_err();
        assert!(matches!(err, crate::TransportError::NoServer(_)));
    }

    #[test]
    fn test_rpc_timeout() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport();
        let scope = Scope::new("component/slow-00000000/OB");

        let _server = transport
            .serve(
                &scope,
                Arc::new(|_: RpcRequest| {
                    std::thread::sleep(Duration::from_millis(300));
                    1
                }),
            )
            .unwrap();

        let remote = transport.remote_server(&scope).unwrap();
        let err = remote
            .call(
                &RpcRequest::Commit(Commission {
                    uid: "u".into(),
                    revision: 1,
                    writer_name: "w".into(),
                }),
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert!(matches!(err, crate::TransportError::Timeout { .. }));
    }
}
