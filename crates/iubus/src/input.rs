//! The InputBuffer: local mirrors of remotely owned IUs.
//!
//! An InputBuffer subscribes to its categories of interest and keeps one
//! mirror per IU it has seen. Writes to a mirror are forwarded to the
//! owning OutputBuffer as blocking RPCs.
//!
//! ## Gap recovery
//!
//! With resend enabled, an update or commission for an unknown uid makes
//! the buffer ask the update's writer to republish the full IU on a
//! private reply scope (`channel/<channel>/category/<instance-id>`). The
//! republished IU is then handled like any first sighting.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use iubus_core::{
    AccessMode, EventMask, IuData, IuEvent, IuEventType, ResendRequest, RpcRequest, REJECTED,
};
use iubus_transport::{BufferRole, EventSink, Registration, RemoteServer, Scope, Transport};

use crate::buffer::BufferCore;
use crate::config::BufferConfig;
use crate::error::{IuError, Result};
use crate::iu::{Iu, IuState};

pub(crate) struct InputShared {
    core: BufferCore,
    self_ref: Weak<InputShared>,
    ius: RwLock<HashMap<String, Iu>>,
    /// One subscription per category of interest.
    subscriptions: Mutex<BTreeMap<String, Registration>>,
    reply_subscription: Mutex<Option<Registration>>,
    /// Handles to owners contacted so far, by owner name.
    remote_servers: Mutex<HashMap<String, Arc<dyn RemoteServer>>>,
    resend: AtomicBool,
}

impl InputShared {
    pub(crate) fn channel(&self) -> &str {
        self.core.channel()
    }

    pub(crate) fn config(&self) -> &BufferConfig {
        self.core.config()
    }

    pub(crate) fn unique_name(&self) -> &str {
        self.core.unique_name()
    }

    /// Blocking RPC to the OutputBuffer named `owner`.
    pub(crate) fn call_owner(&self, owner: &str, request: &RpcRequest) -> Result<u64> {
        let server = self.remote_server(owner)?;
        let result = server.call(request, self.config().rpc_timeout)?;
        if result == REJECTED {
            tracing::warn!(owner, method = request.method(), uid = request.uid(), "remote write rejected");
        }
        Ok(result)
    }

    fn remote_server(&self, owner: &str) -> Result<Arc<dyn RemoteServer>> {
        let mut servers = self.remote_servers.lock();
        if let Some(server) = servers.get(owner) {
            return Ok(Arc::clone(server));
        }
        let server = self.core.transport().remote_server(&Scope::new(owner))?;
        servers.insert(owner.to_string(), Arc::clone(&server));
        Ok(server)
    }

    fn sink(&self) -> EventSink {
        let weak = self.self_ref.clone();
        Arc::new(move |event: IuEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(event);
            }
        })
    }

    fn subscribe_category(&self, category: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(category) {
            return Ok(());
        }
        let scope = self.core.category_scope(category);
        let registration = self.core.transport().subscribe(&scope, self.sink())?;
        subscriptions.insert(category.to_string(), registration);
        tracing::debug!(buffer = self.unique_name(), %scope, "listening");
        Ok(())
    }

    fn request_resend(&self, uid: &str, writer_name: &str) -> Result<()> {
        let request = RpcRequest::ResendRequest(ResendRequest {
            uid: uid.to_string(),
            reply_scope: self.core.instance_id().to_string(),
        });
        let result = self
            .call_owner(writer_name, &request)
            .map_err(|e| IuError::ResendRequestFailed {
                uid: uid.to_string(),
                reason: e.to_string(),
            })?;
        if result == REJECTED {
            return Err(IuError::ResendRequestFailed {
                uid: uid.to_string(),
                reason: format!("rejected by {}", writer_name),
            });
        }
        tracing::debug!(uid, writer = writer_name, revision = result, "resend requested");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound events
    // ─────────────────────────────────────────────────────────────────────

    fn handle_event(&self, event: IuEvent) {
        tracing::trace!(buffer = self.unique_name(), uid = event.uid(), kind = event.kind(), "event");
        match event {
            IuEvent::Iu(data) => self.handle_iu(data),
            IuEvent::PayloadUpdate(update) => {
                let Some(iu) = self.known(&update.uid, &update.writer_name) else {
                    return;
                };
                let delta = update.delta();
                self.update_mirror(&iu, IuEventType::Updated, |state| {
                    state.revision = update.revision;
                    state.payload.apply(&delta);
                    true
                });
            }
            IuEvent::LinkUpdate(update) => {
                let Some(iu) = self.known(&update.uid, &update.writer_name) else {
                    return;
                };
                let delta = update.delta();
                self.update_mirror(&iu, IuEventType::LinksUpdated, |state| {
                    state.revision = update.revision;
                    delta.apply_to(&mut state.links);
                    true
                });
            }
            IuEvent::Commission(commission) => {
                let Some(iu) = self.known(&commission.uid, &commission.writer_name) else {
                    return;
                };
                self.update_mirror(&iu, IuEventType::Committed, |state| {
                    if state.committed {
                        return false;
                    }
                    state.committed = true;
                    state.revision = commission.revision;
                    true
                });
            }
            IuEvent::Retraction(retraction) => {
                let iu = self.ius.read().get(&retraction.uid).cloned();
                let Some(iu) = iu else {
                    tracing::info!(uid = %retraction.uid, "retraction for unknown IU");
                    return;
                };
                self.update_mirror(&iu, IuEventType::Retracted, |state| {
                    if state.retracted {
                        return false;
                    }
                    state.revision = retraction.revision;
                    state.retracted = true;
                    true
                });
                self.ius.write().remove(&retraction.uid);
            }
        }
    }

    fn handle_iu(&self, data: IuData) {
        if data.access_mode == AccessMode::Message {
            let message = Iu::mirror(data, self.self_ref.clone());
            self.core.dispatch(&message, IuEventType::Message, false);
            return;
        }

        let mut ius = self.ius.write();
        let existing = ius.get(&data.uid).cloned();
        if let Some(existing) = existing {
            drop(ius);
            tracing::debug!(uid = %data.uid, revision = data.revision, "refreshing mirror");
            existing.refresh_from(data);
            return;
        }
        let iu = Iu::mirror(data, self.self_ref.clone());
        ius.insert(iu.uid().to_string(), iu.clone());
        drop(ius);

        self.core.dispatch(&iu, IuEventType::Added, false);
    }

    /// The mirror an update refers to, or `None` if the update is our own
    /// echo or the uid is unknown.
    fn known(&self, uid: &str, writer_name: &str) -> Option<Iu> {
        if writer_name == self.unique_name() {
            return None;
        }
        let iu = self.ius.read().get(uid).cloned();
        if iu.is_none() {
            self.on_unknown(uid, writer_name);
        }
        iu
    }

    fn on_unknown(&self, uid: &str, writer_name: &str) {
        if self.resend.load(Ordering::Relaxed) && !writer_name.is_empty() {
            if let Err(e) = self.request_resend(uid, writer_name) {
                tracing::warn!(uid, writer = writer_name, error = %e, "implicit resend failed");
            }
        } else {
            tracing::info!(uid, writer = writer_name, "update for unknown IU dropped");
        }
    }

    /// Apply `f` under the IU lock and fire `event` if it reports a change.
    fn update_mirror(&self, iu: &Iu, event: IuEventType, f: impl FnOnce(&mut IuState) -> bool) {
        let guard = iu.lock_state();
        let changed = f(&mut guard.borrow_mut());
        if changed {
            self.core.dispatch(iu, event, false);
        }
        drop(guard);
    }
}

/// Mirrors IUs of interest and mediates writes to them.
pub struct InputBuffer {
    shared: Arc<InputShared>,
}

impl InputBuffer {
    /// Create a buffer and subscribe to every configured category.
    pub fn new(config: BufferConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let resend = config.resend;
        let interests = config.category_interests.clone();
        let shared = Arc::new_cyclic(|self_ref| InputShared {
            core: BufferCore::new(config, transport, BufferRole::Input),
            self_ref: self_ref.clone(),
            ius: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(BTreeMap::new()),
            reply_subscription: Mutex::new(None),
            remote_servers: Mutex::new(HashMap::new()),
            resend: AtomicBool::new(resend),
        });

        let reply_scope = shared.core.category_scope(shared.core.instance_id());
        let registration = shared
            .core
            .transport()
            .subscribe(&reply_scope, shared.sink())?;
        *shared.reply_subscription.lock() = Some(registration);

        for category in &interests {
            shared.subscribe_category(category)?;
        }

        tracing::debug!(buffer = shared.unique_name(), "input buffer ready");
        Ok(Self { shared })
    }

    /// `component/<basename>-<id>/IB`; the writer name of every remote
    /// write issued from here.
    pub fn unique_name(&self) -> &str {
        self.shared.unique_name()
    }

    pub fn channel(&self) -> &str {
        self.shared.channel()
    }

    pub fn config(&self) -> &BufferConfig {
        self.shared.config()
    }

    pub fn add_category_interest(&self, category: &str) -> Result<()> {
        self.shared.subscribe_category(category)
    }

    /// Stop listening to `category`. Returns whether it was subscribed.
    pub fn remove_category_interest(&self, category: &str) -> bool {
        let removed = self.shared.subscriptions.lock().remove(category);
        removed.is_some()
    }

    pub fn category_interests(&self) -> Vec<String> {
        self.shared.subscriptions.lock().keys().cloned().collect()
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

    pub fn set_resend(&self, enabled: bool) {
        self.shared.resend.store(enabled, Ordering::Relaxed);
    }

    pub fn resend(&self) -> bool {
        self.shared.resend.load(Ordering::Relaxed)
    }

    /// Ask `writer_name` to republish `uid` on this buffer's reply scope.
    pub fn request_resend(&self, uid: &str, writer_name: &str) -> Result<()> {
        self.shared.request_resend(uid, writer_name)
    }

    /// Register a handler. Explicit categories are also subscribed to; an
    /// empty slice matches every category already of interest.
    pub fn register_handler<F>(
        &self,
        handler: F,
        mask: impl Into<EventMask>,
        categories: &[&str],
    ) -> Result<()>
    where
        F: Fn(&Iu, IuEventType, bool) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let categories: BTreeSet<String> = categories.iter().map(|c| c.to_string()).collect();
        for category in &categories {
            self.shared.subscribe_category(category)?;
        }
        self.shared
            .core
            .register_handler(Arc::new(handler), mask.into(), categories);
        Ok(())
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        self.shared.subscriptions.lock().clear();
        drop(self.shared.reply_subscription.lock().take());
        self.shared.remote_servers.lock().clear();
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("unique_name", &self.unique_name())
            .field("channel", &self.channel())
            .field("interests", &self.category_interests())
            .field("ius", &self.len())
            .finish()
    }
}
