//! Protocol message types.
//!
//! Events are broadcast on category scopes (and on a buffer's private
//! resend scope). Requests are RPC calls addressed to an OutputBuffer;
//! every request is answered with a revision, `0` meaning rejected.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::links::LinkMap;
use crate::types::{AccessMode, PayloadType};

/// RPC method names served by an OutputBuffer.
pub mod methods {
    pub const UPDATE_PAYLOAD: &str = "updatePayload";
    pub const UPDATE_LINKS: &str = "updateLinks";
    pub const COMMIT: &str = "commit";
    pub const RESEND_REQUEST: &str = "resendRequest";
}

/// Revision hint that bypasses the optimistic check.
pub const FORCE_REVISION: u64 = 0;

/// RPC result signalling a rejected request.
pub const REJECTED: u64 = 0;

/// Full state of an IU, sent on first publication and on resend.
#[derive(Debug, Clone, PartialEq)]
pub struct IuData {
    pub uid: String,
    pub revision: u64,
    pub category: String,
    pub payload_type: PayloadType,
    pub owner_name: String,
    pub committed: bool,
    pub access_mode: AccessMode,
    pub read_only: bool,
    pub payload: BTreeMap<String, Value>,
    pub links: LinkMap,
}

/// A payload change, local form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadDelta {
    /// `false` replaces the whole payload with `new_items`.
    pub is_delta: bool,
    pub new_items: BTreeMap<String, Value>,
    pub keys_to_remove: Vec<String>,
}

impl PayloadDelta {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        let mut new_items = BTreeMap::new();
        new_items.insert(key.into(), value);
        Self {
            is_delta: true,
            new_items,
            keys_to_remove: Vec::new(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            is_delta: true,
            new_items: BTreeMap::new(),
            keys_to_remove: vec![key.into()],
        }
    }

    pub fn replace(items: BTreeMap<String, Value>) -> Self {
        Self {
            is_delta: false,
            new_items: items,
            keys_to_remove: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.is_delta && self.new_items.is_empty() && self.keys_to_remove.is_empty()
    }
}

/// A link change, local form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkDelta {
    /// `false` replaces the whole link map with `new_links`.
    pub is_delta: bool,
    pub new_links: LinkMap,
    pub links_to_remove: LinkMap,
}

impl LinkDelta {
    pub fn modify(add: LinkMap, remove: LinkMap) -> Self {
        Self {
            is_delta: true,
            new_links: add,
            links_to_remove: remove,
        }
    }

    pub fn replace(links: LinkMap) -> Self {
        Self {
            is_delta: false,
            new_links: links,
            links_to_remove: LinkMap::new(),
        }
    }

    pub fn apply_to(&self, links: &mut LinkMap) {
        if self.is_delta {
            links.add_and_remove(&self.new_links, &self.links_to_remove);
        } else {
            links.replace(self.new_links.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadUpdate {
    pub uid: String,
    pub revision: u64,
    pub writer_name: String,
    pub payload_type: PayloadType,
    pub is_delta: bool,
    pub new_items: BTreeMap<String, Value>,
    pub keys_to_remove: Vec<String>,
}

impl PayloadUpdate {
    pub fn from_delta(
        uid: impl Into<String>,
        revision: u64,
        writer_name: impl Into<String>,
        payload_type: PayloadType,
        delta: PayloadDelta,
    ) -> Self {
        Self {
            uid: uid.into(),
            revision,
            writer_name: writer_name.into(),
            payload_type,
            is_delta: delta.is_delta,
            new_items: delta.new_items,
            keys_to_remove: delta.keys_to_remove,
        }
    }

    pub fn delta(&self) -> PayloadDelta {
        PayloadDelta {
            is_delta: self.is_delta,
            new_items: self.new_items.clone(),
            keys_to_remove: self.keys_to_remove.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkUpdate {
    pub uid: String,
    pub revision: u64,
    pub writer_name: String,
    pub is_delta: bool,
    pub new_links: LinkMap,
    pub links_to_remove: LinkMap,
}

impl LinkUpdate {
    pub fn from_delta(
        uid: impl Into<String>,
        revision: u64,
        writer_name: impl Into<String>,
        delta: LinkDelta,
    ) -> Self {
        Self {
            uid: uid.into(),
            revision,
            writer_name: writer_name.into(),
            is_delta: delta.is_delta,
            new_links: delta.new_links,
            links_to_remove: delta.links_to_remove,
        }
    }

    pub fn delta(&self) -> LinkDelta {
        LinkDelta {
            is_delta: self.is_delta,
            new_links: self.new_links.clone(),
            links_to_remove: self.links_to_remove.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commission {
    pub uid: String,
    pub revision: u64,
    pub writer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retraction {
    pub uid: String,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendRequest {
    pub uid: String,
    /// Scope the owner should republish the full IU on.
    pub reply_scope: String,
}

/// Anything broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum IuEvent {
    Iu(IuData),
    PayloadUpdate(PayloadUpdate),
    LinkUpdate(LinkUpdate),
    Commission(Commission),
    Retraction(Retraction),
}

impl IuEvent {
    pub fn uid(&self) -> &str {
        match self {
            IuEvent::Iu(iu) => &iu.uid,
            IuEvent::PayloadUpdate(u) => &u.uid,
            IuEvent::LinkUpdate(u) => &u.uid,
            IuEvent::Commission(c) => &c.uid,
            IuEvent::Retraction(r) => &r.uid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IuEvent::Iu(_) => "iu",
            IuEvent::PayloadUpdate(_) => "payload_update",
            IuEvent::LinkUpdate(_) => "link_update",
            IuEvent::Commission(_) => "commission",
            IuEvent::Retraction(_) => "retraction",
        }
    }
}

/// Anything sent to an OutputBuffer's RPC server.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    UpdatePayload(PayloadUpdate),
    UpdateLinks(LinkUpdate),
    Commit(Commission),
    ResendRequest(ResendRequest),
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::UpdatePayload(_) => methods::UPDATE_PAYLOAD,
            RpcRequest::UpdateLinks(_) => methods::UPDATE_LINKS,
            RpcRequest::Commit(_) => methods::COMMIT,
            RpcRequest::ResendRequest(_) => methods::RESEND_REQUEST,
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            RpcRequest::UpdatePayload(u) => &u.uid,
            RpcRequest::UpdateLinks(u) => &u.uid,
            RpcRequest::Commit(c) => &c.uid,
            RpcRequest::ResendRequest(r) => &r.uid,
        }
    }
}
