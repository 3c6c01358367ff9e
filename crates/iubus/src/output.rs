//! The OutputBuffer: authoritative home of locally created IUs.
//!
//! An OutputBuffer publishes every state change of its IUs on their
//! category scopes and serves the remote write methods (`updatePayload`,
//! `updateLinks`, `commit`, `resendRequest`) on its component scope.
//!
//! Remote writes pass an optimistic gate: a non-zero revision hint must
//! match the current revision, and terminal IUs accept nothing. Accepted
//! writes bump the revision, are broadcast, and fire this buffer's handlers
//! with `local = true`.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use iubus_core::{
    Commission, EventMask, IuEvent, IuEventType, ResendRequest, Retraction, RpcRequest,
    FORCE_REVISION, REJECTED,
};
use iubus_transport::{BufferRole, Registration, RpcHandler, Scope, Transport};

use crate::buffer::BufferCore;
use crate::config::BufferConfig;
use crate::error::{IuError, Result};
use crate::iu::{Iu, IuKind, Mutation};

/// What a remote caller asks the gate to do.
enum RemoteWrite {
    Mutation(Mutation),
    Commit,
}

pub(crate) struct OutputShared {
    core: BufferCore,
    /// Owned, non-ephemeral IUs by uid.
    ius: RwLock<HashMap<String, Iu>>,
    server: Mutex<Option<Registration>>,
}

impl OutputShared {
    pub(crate) fn channel(&self) -> &str {
        self.core.channel()
    }

    pub(crate) fn config(&self) -> &BufferConfig {
        self.core.config()
    }

    pub(crate) fn unique_name(&self) -> &str {
        self.core.unique_name()
    }

    /// Broadcast on a category scope. Failures are logged, never raised.
    pub(crate) fn publish(&self, category: &str, event: &IuEvent) {
        self.publish_on(&self.core.category_scope(category), event);
    }

    fn publish_on(&self, scope: &Scope, event: &IuEvent) {
        tracing::debug!(%scope, uid = event.uid(), kind = event.kind(), "publish");
        if let Err(e) = self.core.transport().publish(scope, event) {
            tracing::warn!(%scope, uid = event.uid(), error = %e, "publish failed");
        }
    }

    fn handle_request(&self, request: RpcRequest) -> u64 {
        tracing::debug!(
            buffer = self.unique_name(),
            method = request.method(),
            uid = request.uid(),
            "remote request"
        );
        match request {
            RpcRequest::UpdatePayload(update) => {
                let write = RemoteWrite::Mutation(Mutation::Payload(update.delta()));
                self.gate(&update.uid, update.revision, &update.writer_name, write)
            }
            RpcRequest::UpdateLinks(update) => {
                let write = RemoteWrite::Mutation(Mutation::Links(update.delta()));
                self.gate(&update.uid, update.revision, &update.writer_name, write)
            }
            RpcRequest::Commit(commission) => self.gate(
                &commission.uid,
                commission.revision,
                &commission.writer_name,
                RemoteWrite::Commit,
            ),
            RpcRequest::ResendRequest(request) => self.resend(request),
        }
    }

    fn gate(&self, uid: &str, revision_hint: u64, writer_name: &str, write: RemoteWrite) -> u64 {
        let Some(iu) = self.ius.read().get(uid).cloned() else {
            tracing::warn!(uid, writer = writer_name, "spurious write to nonexistent IU");
            return REJECTED;
        };

        let guard = iu.lock_state();
        let (revision, event, event_type) = {
            let mut state = guard.borrow_mut();
            if revision_hint != FORCE_REVISION && revision_hint != state.revision {
                tracing::warn!(
                    uid,
                    writer = writer_name,
                    hint = revision_hint,
                    current = state.revision,
                    "rejecting stale remote write"
                );
                return REJECTED;
            }
            if state.committed || state.retracted {
                tracing::warn!(uid, writer = writer_name, "rejecting write to terminal IU");
                return REJECTED;
            }

            state.revision += 1;
            let revision = state.revision;
            match write {
                RemoteWrite::Mutation(mutation) => {
                    mutation.apply(&mut state);
                    let event = mutation.event(uid, revision, writer_name, iu.payload_type());
                    (revision, event, mutation.event_type())
                }
                RemoteWrite::Commit => {
                    state.committed = true;
                    let event = IuEvent::Commission(Commission {
                        uid: uid.to_string(),
                        revision,
                        writer_name: writer_name.to_string(),
                    });
                    (revision, event, IuEventType::Committed)
                }
            }
        };

        self.publish(iu.category(), &event);
        self.core.dispatch(&iu, event_type, true);
        drop(guard);
        revision
    }

    fn resend(&self, request: ResendRequest) -> u64 {
        if request.reply_scope.is_empty() {
            tracing::warn!(uid = %request.uid, "resend request without reply scope");
            return REJECTED;
        }
        let Some(iu) = self.ius.read().get(&request.uid).cloned() else {
            tracing::warn!(uid = %request.uid, "resend request for unknown IU");
            return REJECTED;
        };

        let guard = iu.lock_state();
        let data = iu.data();
        self.publish_on(
            &self.core.category_scope(&request.reply_scope),
            &IuEvent::Iu(data),
        );
        let revision = guard.borrow().revision;
        drop(guard);
        revision
    }

    /// Mark `iu` retracted and broadcast it, once.
    fn retract(&self, iu: &Iu) {
        let guard = iu.lock_state();
        let event = {
            let mut state = guard.borrow_mut();
            if state.retracted {
                return;
            }
            state.retracted = true;
            IuEvent::Retraction(Retraction {
                uid: iu.uid().to_string(),
                revision: state.revision,
            })
        };
        self.publish(iu.category(), &event);
    }
}

/// Publishes and owns IUs.
pub struct OutputBuffer {
    shared: Arc<OutputShared>,
}

impl OutputBuffer {
    /// Create a buffer and start serving remote writes.
    pub fn new(config: BufferConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let shared = Arc::new(OutputShared {
            core: BufferCore::new(config, transport, BufferRole::Output),
            ius: RwLock::new(HashMap::new()),
            server: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let handler: RpcHandler = Arc::new(move |request: RpcRequest| -> u64 {
            match weak.upgrade() {
                Some(shared) => shared.handle_request(request),
                None => REJECTED,
            }
        });
        let scope = Scope::new(shared.unique_name());
        let registration = shared.core.transport().serve(&scope, handler)?;
        *shared.server.lock() = Some(registration);

        tracing::debug!(buffer = shared.unique_name(), "output buffer ready");
        Ok(Self { shared })
    }

    /// `component/<basename>-<id>/OB`; also the owner name of every IU
    /// published here.
    pub fn unique_name(&self) -> &str {
        self.shared.unique_name()
    }

    pub fn channel(&self) -> &str {
        self.shared.channel()
    }

    pub fn config(&self) -> &BufferConfig {
        self.shared.config()
    }

    /// Publish `iu`, making this buffer its owner.
    ///
    /// Messages are broadcast but not retained.
    pub fn add(&self, iu: &Iu) -> Result<()> {
        match iu.kind() {
            IuKind::Owned => {}
            IuKind::Mirror => return Err(IuError::AlreadyPublished(iu.uid().to_string())),
            IuKind::Fake => {
                return Err(IuError::NotImplemented(
                    "fake IUs cannot be published".to_string(),
                ))
            }
        }
        if self.shared.ius.read().contains_key(iu.uid()) || iu.is_published() {
            return Err(IuError::AlreadyPublished(iu.uid().to_string()));
        }

        let guard = iu.lock_state();
        iu.attach_to_output(self.unique_name(), Arc::downgrade(&self.shared))?;
        if !iu.is_ephemeral() {
            self.shared
                .ius
                .write()
                .insert(iu.uid().to_string(), iu.clone());
        }
        self.shared.publish(iu.category(), &IuEvent::Iu(iu.data()));
        drop(guard);

        tracing::debug!(buffer = self.unique_name(), uid = iu.uid(), category = iu.category(), "added IU");
        Ok(())
    }

    /// Retract and forget an IU. Unknown uids are logged and yield `None`.
    pub fn remove(&self, uid: &str) -> Option<Iu> {
        let removed = self.shared.ius.write().remove(uid);
        match removed {
            Some(iu) => {
                self.shared.retract(&iu);
                Some(iu)
            }
            None => {
                tracing::warn!(buffer = self.unique_name(), uid, "remove of unknown IU");
                None
            }
        }
    }

    pub fn remove_iu(&self, iu: &Iu) -> Option<Iu> {
        self.remove(iu.uid())
    }

    pub fn get(&self, uid: &str) -> Option<Iu> {
        self.shared.ius.read().get(uid).cloned()
    }

    pub fn get_ius(&self) -> Vec<Iu> {
        self.shared.ius.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.ius.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.ius.read().is_empty()
    }

    /// Register a handler for remote writes to owned IUs. An empty
    /// `categories` slice means every category.
    pub fn register_handler<F>(&self, handler: F, mask: impl Into<EventMask>, categories: &[&str])
    where
        F: Fn(&Iu, IuEventType, bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let categories: BTreeSet<String> = categories.iter().map(|c| c.to_string()).collect();
        self.shared
            .core
            .register_handler(Arc::new(handler), mask.into(), categories);
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        drop(self.shared.server.lock().take());
        let ius: Vec<Iu> = self.shared.ius.write().drain().map(|(_, iu)| iu).collect();
        tracing::debug!(buffer = self.unique_name(), count = ius.len(), "retracting on teardown");
        for iu in &ius {
            self.shared.retract(iu);
        }
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("unique_name", &self.unique_name())
            .field("channel", &self.channel())
            .field("ius", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use iubus_core::{LinkDelta, LinkMap, PayloadDelta, PayloadUpdate, PayloadType};
    use iubus_transport::{EventSink, MemoryNetwork};
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (Arc<MemoryNetwork>, OutputBuffer) {
        let network = MemoryNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.create_transport());
        let ob = OutputBuffer::new(BufferConfig::new("ob"), transport).unwrap();
        (network, ob)
    }

    fn listen(network: &Arc<MemoryNetwork>, category: &str) -> (Registration, mpsc::Receiver<IuEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink: EventSink = Arc::new(move |event: IuEvent| {
            let _ = tx.lock().send(event);
        });
        let registration = network
            .create_transport()
            .subscribe(&Scope::category("default", category), sink)
            .unwrap();
        (registration, rx)
    }

    fn call(network: &Arc<MemoryNetwork>, ob: &OutputBuffer, request: RpcRequest) -> u64 {
        network
            .create_transport()
            .remote_server(&Scope::new(ob.unique_name()))
            .unwrap()
            .call(&request, WAIT)
            .unwrap()
    }

    fn set_request(uid: &str, hint: u64, key: &str, value: serde_json::Value) -> RpcRequest {
        RpcRequest::UpdatePayload(PayloadUpdate::from_delta(
            uid,
            hint,
            "component/remote-1/IB",
            PayloadType::Json,
            PayloadDelta::set(key, value),
        ))
    }

    #[test]
    fn test_add_publishes_full_iu() {
        let (network, ob) = setup();
        let (_sub, rx) = listen(&network, "cat1");

        let iu = Iu::builder("cat1").item("word", "OK").build();
        ob.add(&iu).unwrap();

        assert_eq!(iu.owner_name().as_deref(), Some(ob.unique_name()));
        assert_eq!(iu.channel().unwrap(), "default");
        match rx.recv_timeout(WAIT).unwrap() {
            IuEvent::Iu(data) => {
                assert_eq!(data.uid, iu.uid());
                assert_eq!(data.owner_name, ob.unique_name());
                assert_eq!(data.payload["word"], json!("OK"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_add_twice_fails() {
        let (_network, ob) = setup();
        let iu = Iu::new("cat1");
        ob.add(&iu).unwrap();
        assert!(matches!(ob.add(&iu), Err(IuError::AlreadyPublished(_))));

        let (_other_network, other) = setup();
        assert!(matches!(other.add(&iu), Err(IuError::AlreadyPublished(_))));
    }

    #[test]
    fn test_add_rejects_fake_and_mirror() {
        let (_network, ob) = setup();
        assert!(matches!(ob.add(&Iu::fake("cat1")), Err(IuError::NotImplemented(_))));

        let mirror = Iu::mirror(Iu::new("cat1").data(), Weak::new());
        assert!(matches!(ob.add(&mirror), Err(IuError::AlreadyPublished(_))));
    }

    #[test]
    fn test_message_is_broadcast_but_not_stored() {
        let (network, ob) = setup();
        let (_sub, rx) = listen(&network, "note");
        let message = Iu::message("note");
        ob.add(&message).unwrap();
        assert!(ob.get(message.uid()).is_none());
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), IuEvent::Iu(_)));
    }

    #[test]
    fn test_local_writes_are_broadcast() {
        let (network, ob) = setup();
        let iu = Iu::new("cat1");
        ob.add(&iu).unwrap();
        let (_sub, rx) = listen(&network, "cat1");

        iu.payload().set("a", 1).unwrap();
        iu.add_link("grin", "x").unwrap();
        iu.commit().unwrap();

        match rx.recv_timeout(WAIT).unwrap() {
            IuEvent::PayloadUpdate(u) => {
                assert_eq!(u.revision, 2);
                assert_eq!(u.writer_name, ob.unique_name());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), IuEvent::LinkUpdate(u) if u.revision == 3));
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), IuEvent::Commission(c) if c.revision == 4));
    }

    #[test]
    fn test_gate_accepts_and_fires_local_handler() {
        let (network, ob) = setup();
        let iu = Iu::new("cat1");
        ob.add(&iu).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        ob.register_handler(
            move |iu: &Iu, event: IuEventType, local: bool| {
                let _ = tx.lock().send((iu.revision(), event, local));
                Ok(())
            },
            EventMask::ALL,
            &[],
        );

        assert_eq!(call(&network, &ob, set_request(iu.uid(), 1, "reply", json!("R1"))), 2);
        assert_eq!(iu.payload().get_str("reply"), "R1");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (2, IuEventType::Updated, true));
    }

    #[test]
    fn test_gate_rejects_stale_hint() {
        let (network, ob) = setup();
        let iu = Iu::new("cat1");
        ob.add(&iu).unwrap();
        iu.payload().set("a", 1).unwrap();

        assert_eq!(call(&network, &ob, set_request(iu.uid(), 1, "a", json!(2))), REJECTED);
        assert_eq!(iu.revision(), 2);
        assert_eq!(iu.payload().get("a"), json!(1));

        // Hint 0 skips the check.
        assert_eq!(call(&network, &ob, set_request(iu.uid(), FORCE_REVISION, "a", json!(3))), 3);
    }

    #[test]
    fn test_gate_rejects_terminal_and_unknown() {
        let (network, ob) = setup();
        let iu = Iu::new("cat1");
        ob.add(&iu).unwrap();

        let commit = RpcRequest::Commit(Commission {
            uid: iu.uid().to_string(),
            revision: 1,
            writer_name: "component/remote-1/IB".to_string(),
        });
        assert_eq!(call(&network, &ob, commit.clone()), 2);
        assert!(iu.committed());
        assert_eq!(call(&network, &ob, commit), REJECTED);

        let links = RpcRequest::UpdateLinks(iubus_core::LinkUpdate::from_delta(
            iu.uid(),
            FORCE_REVISION,
            "w",
            LinkDelta::replace(LinkMap::from_pairs([("grin", vec!["x"])])),
        ));
        assert_eq!(call(&network, &ob, links), REJECTED);
        assert_eq!(call(&network, &ob, set_request("missing", 0, "a", json!(1))), REJECTED);
        assert_eq!(iu.revision(), 2);
    }

    #[test]
    fn test_resend_republishes_on_reply_scope() {
        let (network, ob) = setup();
        let iu = Iu::builder("cat1").item("k", "v").build();
        ob.add(&iu).unwrap();
        let (_sub, rx) = listen(&network, "abcd1234");

        let request = |uid: &str, reply: &str| {
            RpcRequest::ResendRequest(ResendRequest {
                uid: uid.to_string(),
                reply_scope: reply.to_string(),
            })
        };
        assert_eq!(call(&network, &ob, request(iu.uid(), "abcd1234")), 1);
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), IuEvent::Iu(d) if d.uid == iu.uid()));

        assert_eq!(call(&network, &ob, request(iu.uid(), "")), REJECTED);
        assert_eq!(call(&network, &ob, request("missing", "abcd1234")), REJECTED);
    }

    #[test]
    fn test_remove_retracts_once() {
        let (network, ob) = setup();
        let iu = Iu::new("cat1");
        ob.add(&iu).unwrap();
        let (_sub, rx) = listen(&network, "cat1");

        assert!(ob.remove(iu.uid()).is_some());
        assert!(iu.retracted());
        assert!(ob.remove(iu.uid()).is_none());
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), IuEvent::Retraction(_)));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(matches!(iu.payload().set("a", 1), Err(IuError::Retracted(_))));
    }

    #[test]
    fn test_drop_retracts_live_ius() {
        let (network, ob) = setup();
        let first = Iu::new("cat1");
        let second = Iu::new("cat1");
        ob.add(&first).unwrap();
        ob.add(&second).unwrap();
        ob.remove(second.uid());
        let (_sub, rx) = listen(&network, "cat1");
        let scope = Scope::new(ob.unique_name());

        drop(ob);

        assert!(first.retracted());
        assert!(!network.has_server(&scope));
        match rx.recv_timeout(WAIT).unwrap() {
            IuEvent::Retraction(r) => assert_eq!(r.uid, first.uid()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
