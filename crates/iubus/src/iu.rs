//! The Incremental Unit.
//!
//! One [`Iu`] type covers every variant of the replicated entity:
//!
//! - **Owned**: created locally, published through an OutputBuffer which
//!   becomes its authoritative home. Writes apply in-process and are
//!   broadcast as deltas.
//! - **Mirror**: a local replica of an IU owned elsewhere. Writes are
//!   forwarded to the owner as blocking RPCs and only applied locally once
//!   the owner accepts them.
//! - **Fake**: a buffer-less stand-in for tests; writes stay local.
//!
//! Messages (access mode `MESSAGE`) are ephemeral: once published, edits to
//! them have no remote effect.
//!
//! Every IU has a reentrant state lock guarding revision, flags, links and
//! payload. A thread holding it may call back into the same IU, e.g. from a
//! handler fired during a remote write.

use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use iubus_core::{
    generate_uid, AccessMode, Commission, DocumentStore, IuData, IuEvent, IuEventType, LinkDelta,
    LinkMap, LinkUpdate, PayloadDelta, PayloadType, PayloadUpdate, RpcRequest, REJECTED,
};

use crate::config::DEFAULT_BATCH_TIMEOUT;
use crate::error::{IuError, Result};
use crate::input::InputShared;
use crate::output::OutputShared;
use crate::payload::{BatchState, Payload};

/// Which side of replication an IU lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IuKind {
    Owned,
    Mirror,
    Fake,
}

/// Non-owning link from an IU to the buffer it lives in.
pub(crate) enum ResidentBuffer {
    Output(Weak<OutputShared>),
    Input(Weak<InputShared>),
}

/// Mutable part of an IU, guarded by the state lock.
#[derive(Debug, Clone)]
pub(crate) struct IuState {
    pub(crate) revision: u64,
    pub(crate) owner_name: Option<String>,
    pub(crate) committed: bool,
    pub(crate) retracted: bool,
    pub(crate) links: LinkMap,
    pub(crate) payload: DocumentStore,
}

impl IuState {
    fn initial(payload: DocumentStore, links: LinkMap) -> Self {
        Self {
            revision: 1,
            owner_name: None,
            committed: false,
            retracted: false,
            links,
            payload,
        }
    }
}

pub(crate) struct IuShared {
    uid: OnceLock<String>,
    category: String,
    payload_type: PayloadType,
    access_mode: AccessMode,
    read_only: bool,
    kind: IuKind,
    state: ReentrantMutex<RefCell<IuState>>,
    pub(crate) batch: Mutex<Option<BatchState>>,
    pub(crate) batch_released: Condvar,
    buffer: OnceLock<ResidentBuffer>,
}

/// A change to links or payload, travelling through the mutation path.
#[derive(Debug, Clone)]
pub(crate) enum Mutation {
    Payload(PayloadDelta),
    Links(LinkDelta),
}

impl Mutation {
    pub(crate) fn apply(&self, state: &mut IuState) {
        match self {
            Mutation::Payload(delta) => state.payload.apply(delta),
            Mutation::Links(delta) => delta.apply_to(&mut state.links),
        }
    }

    pub(crate) fn event_type(&self) -> IuEventType {
        match self {
            Mutation::Payload(_) => IuEventType::Updated,
            Mutation::Links(_) => IuEventType::LinksUpdated,
        }
    }

    pub(crate) fn event(
        &self,
        uid: &str,
        revision: u64,
        writer_name: &str,
        payload_type: PayloadType,
    ) -> IuEvent {
        match self {
            Mutation::Payload(delta) => IuEvent::PayloadUpdate(PayloadUpdate::from_delta(
                uid,
                revision,
                writer_name,
                payload_type,
                delta.clone(),
            )),
            Mutation::Links(delta) => {
                IuEvent::LinkUpdate(LinkUpdate::from_delta(uid, revision, writer_name, delta.clone()))
            }
        }
    }

    fn request(
        &self,
        uid: &str,
        revision_hint: u64,
        writer_name: &str,
        payload_type: PayloadType,
    ) -> RpcRequest {
        match self {
            Mutation::Payload(delta) => RpcRequest::UpdatePayload(PayloadUpdate::from_delta(
                uid,
                revision_hint,
                writer_name,
                payload_type,
                delta.clone(),
            )),
            Mutation::Links(delta) => RpcRequest::UpdateLinks(LinkUpdate::from_delta(
                uid,
                revision_hint,
                writer_name,
                delta.clone(),
            )),
        }
    }
}

/// A replicated Incremental Unit.
///
/// `Iu` is a cheap handle: clones refer to the same unit.
#[derive(Clone)]
pub struct Iu {
    shared: Arc<IuShared>,
}

/// Builder for owned IUs.
#[derive(Debug, Clone)]
pub struct IuBuilder {
    category: String,
    payload_type: PayloadType,
    access_mode: AccessMode,
    read_only: bool,
    payload: BTreeMap<String, Value>,
    links: LinkMap,
}

impl IuBuilder {
    pub fn payload_type(mut self, payload_type: PayloadType) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Make this a fire-and-forget message. Messages are read-only for
    /// receivers unless overridden afterwards.
    pub fn message(mut self) -> Self {
        self.access_mode = AccessMode::Message;
        self.read_only = true;
        self
    }

    /// Initial payload entry. Does not count as a mutation.
    pub fn item(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Initial link. Does not count as a mutation.
    pub fn link(mut self, link_type: impl Into<String>, target: impl Into<String>) -> Self {
        self.links.insert(link_type, target);
        self
    }

    pub fn build(self) -> Iu {
        Iu::from_parts(
            IuKind::Owned,
            Some(generate_uid()),
            self.category,
            self.payload_type,
            self.access_mode,
            self.read_only,
            IuState::initial(DocumentStore::from_items(self.payload), self.links),
        )
    }
}

impl Iu {
    /// A fresh owned IU with revision 1, uncommitted and unpublished.
    pub fn new(category: impl Into<String>) -> Self {
        Self::builder(category).build()
    }

    pub fn builder(category: impl Into<String>) -> IuBuilder {
        IuBuilder {
            category: category.into(),
            payload_type: PayloadType::default(),
            access_mode: AccessMode::Push,
            read_only: false,
            payload: BTreeMap::new(),
            links: LinkMap::new(),
        }
    }

    /// A fresh owned message.
    pub fn message(category: impl Into<String>) -> Self {
        Self::builder(category).message().build()
    }

    /// A buffer-less IU for tests. It has no uid until [`Iu::set_uid`].
    pub fn fake(category: impl Into<String>) -> Self {
        Self::from_parts(
            IuKind::Fake,
            None,
            category.into(),
            PayloadType::default(),
            AccessMode::Push,
            false,
            IuState::initial(DocumentStore::new(), LinkMap::new()),
        )
    }

    fn from_parts(
        kind: IuKind,
        uid: Option<String>,
        category: String,
        payload_type: PayloadType,
        access_mode: AccessMode,
        read_only: bool,
        state: IuState,
    ) -> Self {
        let uid_cell = OnceLock::new();
        if let Some(uid) = uid {
            let _ = uid_cell.set(uid);
        }
        Self {
            shared: Arc::new(IuShared {
                uid: uid_cell,
                category,
                payload_type,
                access_mode,
                read_only,
                kind,
                state: ReentrantMutex::new(RefCell::new(state)),
                batch: Mutex::new(None),
                batch_released: Condvar::new(),
                buffer: OnceLock::new(),
            }),
        }
    }

    /// Build the local replica of a remotely owned IU.
    pub(crate) fn mirror(data: IuData, buffer: Weak<InputShared>) -> Self {
        let iu = Self::from_parts(
            IuKind::Mirror,
            Some(data.uid),
            data.category,
            data.payload_type,
            data.access_mode,
            data.read_only,
            IuState {
                revision: data.revision,
                owner_name: Some(data.owner_name),
                committed: data.committed,
                retracted: false,
                links: data.links,
                payload: DocumentStore::from_items(data.payload),
            },
        );
        let _ = iu.shared.buffer.set(ResidentBuffer::Input(buffer));
        iu
    }

    /// Overwrite a mirror with a freshly received full state.
    pub(crate) fn refresh_from(&self, data: IuData) {
        let guard = self.lock_state();
        let mut state = guard.borrow_mut();
        state.revision = data.revision;
        state.owner_name = Some(data.owner_name);
        state.committed = data.committed;
        state.links = data.links;
        state.payload = DocumentStore::from_items(data.payload);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    /// The IU's uid, or `""` for a fake IU that has not been given one.
    pub fn uid(&self) -> &str {
        self.shared.uid.get().map(String::as_str).unwrap_or("")
    }

    /// Assign the uid of a fake IU.
    pub fn set_uid(&self, uid: impl Into<String>) -> Result<()> {
        self.shared
            .uid
            .set(uid.into())
            .map_err(|_| IuError::AlreadyHasUid(self.uid().to_string()))
    }

    pub fn category(&self) -> &str {
        &self.shared.category
    }

    pub fn payload_type(&self) -> PayloadType {
        self.shared.payload_type
    }

    pub fn access_mode(&self) -> AccessMode {
        self.shared.access_mode
    }

    pub fn kind(&self) -> IuKind {
        self.shared.kind
    }

    pub fn read_only(&self) -> bool {
        self.shared.read_only
    }

    /// Messages are ephemeral: published once, never updated remotely.
    pub fn is_ephemeral(&self) -> bool {
        self.shared.access_mode == AccessMode::Message
    }

    pub fn revision(&self) -> u64 {
        self.with_state(|s| s.revision)
    }

    pub fn owner_name(&self) -> Option<String> {
        self.with_state(|s| s.owner_name.clone())
    }

    pub fn is_published(&self) -> bool {
        self.with_state(|s| s.owner_name.is_some())
    }

    pub fn committed(&self) -> bool {
        self.with_state(|s| s.committed)
    }

    pub fn retracted(&self) -> bool {
        self.with_state(|s| s.retracted)
    }

    /// Channel of the buffer this IU lives in.
    pub fn channel(&self) -> Result<String> {
        let channel = match self.shared.buffer.get() {
            Some(ResidentBuffer::Output(weak)) => weak.upgrade().map(|b| b.channel().to_string()),
            Some(ResidentBuffer::Input(weak)) => weak.upgrade().map(|b| b.channel().to_string()),
            None => None,
        };
        channel.ok_or_else(|| IuError::Unpublished(self.uid().to_string()))
    }

    /// Access the payload.
    pub fn payload(&self) -> Payload<'_> {
        Payload::new(self)
    }

    /// Targets of one link type (empty if the type is absent).
    pub fn links(&self, link_type: &str) -> BTreeSet<String> {
        self.with_state(|s| s.links.get(link_type).cloned().unwrap_or_default())
    }

    pub fn all_links(&self) -> LinkMap {
        self.with_state(|s| s.links.clone())
    }

    /// Full state snapshot, as sent on publication.
    pub fn data(&self) -> IuData {
        self.with_state(|s| IuData {
            uid: self.uid().to_string(),
            revision: s.revision,
            category: self.shared.category.clone(),
            payload_type: self.shared.payload_type,
            owner_name: s.owner_name.clone().unwrap_or_default(),
            committed: s.committed,
            access_mode: self.shared.access_mode,
            read_only: self.shared.read_only,
            payload: s.payload.to_items(),
            links: s.links.clone(),
        })
    }

    pub(crate) fn shared(&self) -> &IuShared {
        &self.shared
    }

    pub(crate) fn lock_state(&self) -> ReentrantMutexGuard<'_, RefCell<IuState>> {
        self.shared.state.lock()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&IuState) -> R) -> R {
        let guard = self.lock_state();
        let state = guard.borrow();
        f(&state)
    }

    pub(crate) fn batch_timeout(&self) -> Duration {
        let configured = match self.shared.buffer.get() {
            Some(ResidentBuffer::Output(weak)) => weak.upgrade().map(|b| b.config().batch_timeout),
            Some(ResidentBuffer::Input(weak)) => weak.upgrade().map(|b| b.config().batch_timeout),
            None => None,
        };
        configured.unwrap_or(DEFAULT_BATCH_TIMEOUT)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Links
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_link(&self, link_type: &str, target: impl Into<String>) -> Result<()> {
        self.add_links(link_type, [target.into()])
    }

    pub fn add_links(
        &self,
        link_type: &str,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        let add = LinkMap::from_pairs([(link_type, targets)]);
        self.modify_links(add, LinkMap::new())
    }

    pub fn remove_link(&self, link_type: &str, target: impl Into<String>) -> Result<()> {
        self.remove_links(link_type, [target.into()])
    }

    pub fn remove_links(
        &self,
        link_type: &str,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<()> {
        let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        let remove = LinkMap::from_pairs([(link_type, targets)]);
        self.modify_links(LinkMap::new(), remove)
    }

    /// Remove then add, as one revision.
    pub fn modify_links(&self, add: LinkMap, remove: LinkMap) -> Result<()> {
        self.mutate(Mutation::Links(LinkDelta::modify(add, remove)))
    }

    /// Replace every link.
    pub fn set_links(&self, links: LinkMap) -> Result<()> {
        self.mutate(Mutation::Links(LinkDelta::replace(links)))
    }

    pub(crate) fn modify_payload(&self, delta: PayloadDelta) -> Result<()> {
        self.mutate(Mutation::Payload(delta))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutation path
    // ─────────────────────────────────────────────────────────────────────

    fn mutate(&self, mutation: Mutation) -> Result<()> {
        match self.shared.kind {
            IuKind::Owned => self.mutate_owned(mutation),
            IuKind::Mirror => self.mutate_mirror(mutation),
            IuKind::Fake => {
                let guard = self.lock_state();
                mutation.apply(&mut guard.borrow_mut());
                Ok(())
            }
        }
    }

    fn mutate_owned(&self, mutation: Mutation) -> Result<()> {
        let guard = self.lock_state();
        let event = {
            let mut state = guard.borrow_mut();
            if state.committed {
                return Err(IuError::Committed(self.uid().to_string()));
            }
            if state.retracted {
                return Err(IuError::Retracted(self.uid().to_string()));
            }
            if self.is_ephemeral() {
                if state.owner_name.is_some() {
                    tracing::info!(uid = self.uid(), "editing a sent message has no remote effect");
                }
                mutation.apply(&mut state);
                return Ok(());
            }
            state.revision += 1;
            mutation.apply(&mut state);
            state.owner_name.as_deref().map(|owner| {
                mutation.event(self.uid(), state.revision, owner, self.shared.payload_type)
            })
        };
        if let Some(event) = event {
            self.broadcast(&event);
        }
        drop(guard);
        Ok(())
    }

    fn mutate_mirror(&self, mutation: Mutation) -> Result<()> {
        let guard = self.lock_state();
        let (revision, owner) = {
            let state = guard.borrow();
            if state.committed {
                return Err(IuError::Committed(self.uid().to_string()));
            }
            if self.shared.read_only {
                return Err(IuError::ReadOnly(self.uid().to_string()));
            }
            (state.revision, state.owner_name.clone().unwrap_or_default())
        };
        if self.is_ephemeral() {
            tracing::info!(uid = self.uid(), "editing a received message only has local effect");
            mutation.apply(&mut guard.borrow_mut());
            return Ok(());
        }

        let input = self.input_buffer()?;
        let request = mutation.request(
            self.uid(),
            revision,
            input.unique_name(),
            self.shared.payload_type,
        );
        let result = input.call_owner(&owner, &request)?;
        if result == REJECTED {
            return Err(IuError::UpdateFailed(self.uid().to_string()));
        }

        let mut state = guard.borrow_mut();
        state.revision = result;
        mutation.apply(&mut state);
        Ok(())
    }

    /// Commit the IU: no link or payload change is accepted afterwards.
    pub fn commit(&self) -> Result<()> {
        match self.shared.kind {
            IuKind::Owned => self.commit_owned(),
            IuKind::Mirror => self.commit_mirror(),
            IuKind::Fake => {
                self.lock_state().borrow_mut().committed = true;
                Ok(())
            }
        }
    }

    fn commit_owned(&self) -> Result<()> {
        let guard = self.lock_state();
        let event = {
            let mut state = guard.borrow_mut();
            if state.committed {
                return Err(IuError::Committed(self.uid().to_string()));
            }
            if state.retracted {
                return Err(IuError::Retracted(self.uid().to_string()));
            }
            if self.is_ephemeral() {
                tracing::info!(uid = self.uid(), "committing a message has no effect");
                return Ok(());
            }
            state.revision += 1;
            state.committed = true;
            state.owner_name.as_ref().map(|owner| {
                IuEvent::Commission(Commission {
                    uid: self.uid().to_string(),
                    revision: state.revision,
                    writer_name: owner.clone(),
                })
            })
        };
        if let Some(event) = event {
            self.broadcast(&event);
        }
        drop(guard);
        Ok(())
    }

    fn commit_mirror(&self) -> Result<()> {
        let guard = self.lock_state();
        let (revision, owner) = {
            let state = guard.borrow();
            if state.committed {
                return Ok(());
            }
            if self.shared.read_only {
                return Err(IuError::ReadOnly(self.uid().to_string()));
            }
            (state.revision, state.owner_name.clone().unwrap_or_default())
        };
        if self.is_ephemeral() {
            tracing::info!(uid = self.uid(), "committing a received message has no effect");
            return Ok(());
        }

        let input = self.input_buffer()?;
        let request = RpcRequest::Commit(Commission {
            uid: self.uid().to_string(),
            revision,
            writer_name: input.unique_name().to_string(),
        });
        let result = input.call_owner(&owner, &request)?;
        if result == REJECTED {
            return Err(IuError::UpdateFailed(self.uid().to_string()));
        }

        let mut state = guard.borrow_mut();
        state.revision = result;
        state.committed = true;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Buffer residency
    // ─────────────────────────────────────────────────────────────────────

    /// Claim this IU for an OutputBuffer.
    pub(crate) fn attach_to_output(&self, owner_name: &str, buffer: Weak<OutputShared>) -> Result<()> {
        let guard = self.lock_state();
        let mut state = guard.borrow_mut();
        if state.owner_name.is_some() {
            return Err(IuError::AlreadyHasOwner(self.uid().to_string()));
        }
        self.shared
            .buffer
            .set(ResidentBuffer::Output(buffer))
            .map_err(|_| IuError::AlreadyInABuffer(self.uid().to_string()))?;
        state.owner_name = Some(owner_name.to_string());
        Ok(())
    }

    fn broadcast(&self, event: &IuEvent) {
        if let Some(ResidentBuffer::Output(weak)) = self.shared.buffer.get() {
            if let Some(output) = weak.upgrade() {
                output.publish(&self.shared.category, event);
            }
        }
    }

    fn input_buffer(&self) -> Result<Arc<InputShared>> {
        let input = match self.shared.buffer.get() {
            Some(ResidentBuffer::Input(weak)) => weak.upgrade(),
            _ => None,
        };
        input.ok_or_else(|| IuError::Unpublished(self.uid().to_string()))
    }
}

impl PartialEq for Iu {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Iu {}

impl fmt::Debug for Iu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_state(|s| {
            f.debug_struct("Iu")
                .field("uid", &self.uid())
                .field("kind", &self.shared.kind)
                .field("category", &self.shared.category)
                .field("revision", &s.revision)
                .field("committed", &s.committed)
                .field("retracted", &s.retracted)
                .finish()
        })
    }
}

impl fmt::Display for Iu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        write!(
            f,
            "IU {{ uid: {}, category: {}, revision: {}, committed: {}, owner: {}, payload: {{",
            data.uid,
            data.category,
            data.revision,
            data.committed,
            if data.owner_name.is_empty() { "-" } else { &data.owner_name }
        )?;
        for (i, (key, value)) in data.payload.iter().enumerate() {
            let sep = if i == 0 { "" } else { ", " };
            write!(f, "{}{:?}: {}", sep, key, value)?;
        }
        write!(f, "}}, links: {{")?;
        for (i, (link_type, targets)) in data.links.iter().enumerate() {
            let sep = if i == 0 { "" } else { ", " };
            let targets: Vec<&str> = targets.iter().map(String::as_str).collect();
            write!(f, "{}{}: [{}]", sep, link_type, targets.join(", "))?;
        }
        write!(f, "}} }}")
    }
}
