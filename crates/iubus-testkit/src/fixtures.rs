//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: an in-process bus, a transport
//! that records RPC traffic, and handlers that record what they see.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iubus::{BufferConfig, InputBuffer, Iu, IuEventType, OutputBuffer};
use iubus_core::{IuEvent, RpcRequest};
use iubus_transport::{
    EventSink, MemoryNetwork, MemoryTransport, Registration, RemoteServer, RpcHandler, Scope,
    Transport,
};

/// Default patience for [`wait_until`] in tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Install a test-friendly tracing subscriber once per process.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// An in-process network plus helpers to create buffers on it.
pub struct TestBus {
    pub network: Arc<MemoryNetwork>,
}

impl TestBus {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            network: MemoryNetwork::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.network.create_transport())
    }

    /// A transport that also records every RPC it sends.
    pub fn recording_transport(&self) -> RecordingTransport {
        RecordingTransport::new(self.network.create_transport())
    }

    pub fn output(&self, basename: &str) -> OutputBuffer {
        OutputBuffer::new(BufferConfig::new(basename), self.transport())
            .unwrap_or_else(|e| panic!("failed to create output buffer: {}", e))
    }

    pub fn input(&self, basename: &str, categories: &[&str]) -> InputBuffer {
        let config = BufferConfig::builder(basename)
            .category_interests(categories.iter().copied())
            .build();
        self.input_with(config, self.transport())
    }

    pub fn input_with(&self, config: BufferConfig, transport: Arc<dyn Transport>) -> InputBuffer {
        InputBuffer::new(config, transport)
            .unwrap_or_else(|e| panic!("failed to create input buffer: {}", e))
    }
}

impl Default for TestBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One RPC observed by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub scope: String,
    pub request: RpcRequest,
}

/// Wraps a [`MemoryTransport`] and records outgoing RPCs.
#[derive(Clone)]
pub struct RecordingTransport {
    inner: MemoryTransport,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RecordingTransport {
    pub fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls of `method` sent anywhere.
    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.request.method() == method)
            .count()
    }

    /// Number of calls of `method` sent to `scope`.
    pub fn count_to(&self, scope: &str, method: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.scope == scope && c.request.method() == method)
            .count()
    }
}

impl Transport for RecordingTransport {
    fn publish(&self, scope: &Scope, event: &IuEvent) -> iubus_transport::Result<()> {
        self.inner.publish(scope, event)
    }

    fn subscribe(&self, scope: &Scope, sink: EventSink) -> iubus_transport::Result<Registration> {
        self.inner.subscribe(scope, sink)
    }

    fn serve(&self, scope: &Scope, handler: RpcHandler) -> iubus_transport::Result<Registration> {
        self.inner.serve(scope, handler)
    }

    fn remote_server(&self, scope: &Scope) -> iubus_transport::Result<Arc<dyn RemoteServer>> {
        Ok(Arc::new(RecordingRemoteServer {
            inner: self.inner.remote_server(scope)?,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct RecordingRemoteServer {
    inner: Arc<dyn RemoteServer>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RemoteServer for RecordingRemoteServer {
    fn scope(&self) -> &Scope {
        self.inner.scope()
    }

    fn call(&self, request: &RpcRequest, timeout: Duration) -> iubus_transport::Result<u64> {
        self.calls.lock().push(RecordedCall {
            scope: self.inner.scope().to_string(),
            request: request.clone(),
        });
        self.inner.call(request, timeout)
    }
}

/// What a [`RecordingHandler`] saw for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub uid: String,
    pub event: IuEventType,
    pub local: bool,
    pub revision: u64,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Records every event it is invoked for, with the IU state at that time.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler function suitable for `register_handler`.
    pub fn handler(&self) -> impl Fn(&Iu, IuEventType, bool) -> anyhow::Result<()> + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |iu: &Iu, event: IuEventType, local: bool| {
            events.lock().push(ObservedEvent {
                uid: iu.uid().to_string(),
                event,
                local,
                revision: iu.revision(),
                payload: iu.payload().to_map().into_iter().collect(),
            });
            Ok(())
        }
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: IuEventType) -> usize {
        self.events.lock().iter().filter(|e| e.event == event).count()
    }

    /// Wait until at least `n` events of type `event` were seen.
    pub fn wait_for(&self, event: IuEventType, n: usize) -> bool {
        wait_until(WAIT, || self.count(event) >= n)
    }

    /// The last recorded event of type `event`.
    pub fn last(&self, event: IuEventType) -> Option<ObservedEvent> {
        self.events.lock().iter().rev().find(|e| e.event == event).cloned()
    }
}
