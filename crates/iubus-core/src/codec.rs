//! CBOR wire codec for events and RPC requests.
//!
//! A frame is a CBOR map `{kind, body}`. Payload values travel as text plus
//! a type tag (`"json"` or `"str"`), so a receiver can decode a value
//! without knowing the sender's payload mode.

use bytes::Bytes;
use ciborium::value::Value as CborValue;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::links::LinkMap;
use crate::messages::{
    methods, Commission, IuData, IuEvent, LinkUpdate, PayloadUpdate, ResendRequest, Retraction,
    RpcRequest,
};
use crate::types::{AccessMode, PayloadType};
use crate::value::Coerce;

mod tags {
    pub const JSON: &str = "json";
    pub const STR: &str = "str";
}

#[derive(Serialize, Deserialize)]
struct Frame {
    kind: String,
    body: CborValue,
}

#[derive(Serialize, Deserialize)]
struct WireValue {
    value: String,
    type_tag: String,
}

#[derive(Serialize, Deserialize)]
struct WireItem {
    key: String,
    value: String,
    type_tag: String,
}

#[derive(Serialize, Deserialize)]
struct WireIu {
    uid: String,
    revision: u64,
    category: String,
    payload_type: String,
    owner_name: String,
    committed: bool,
    access_mode: String,
    read_only: bool,
    payload: Vec<WireItem>,
    links: Vec<(String, Vec<String>)>,
}

#[derive(Serialize, Deserialize)]
struct WirePayloadUpdate {
    uid: String,
    revision: u64,
    writer_name: String,
    payload_type: String,
    is_delta: bool,
    new_items: BTreeMap<String, WireValue>,
    keys_to_remove: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct WireLinkUpdate {
    uid: String,
    revision: u64,
    writer_name: String,
    is_delta: bool,
    new_links: Vec<(String, Vec<String>)>,
    links_to_remove: Vec<(String, Vec<String>)>,
}

#[derive(Serialize, Deserialize)]
struct WireCommission {
    uid: String,
    revision: u64,
    writer_name: String,
}

#[derive(Serialize, Deserialize)]
struct WireRetraction {
    uid: String,
    revision: u64,
}

#[derive(Serialize, Deserialize)]
struct WireResendRequest {
    uid: String,
    reply_scope: String,
}

// ─────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────

/// Encode a broadcast event.
pub fn encode_event(event: &IuEvent) -> Result<Bytes> {
    match event {
        IuEvent::Iu(iu) => frame(event.kind(), &wire_iu(iu)),
        IuEvent::PayloadUpdate(u) => frame(event.kind(), &wire_payload_update(u)),
        IuEvent::LinkUpdate(u) => frame(event.kind(), &wire_link_update(u)),
        IuEvent::Commission(c) => frame(
            event.kind(),
            &WireCommission {
                uid: c.uid.clone(),
                revision: c.revision,
                writer_name: c.writer_name.clone(),
            },
        ),
        IuEvent::Retraction(r) => frame(
            event.kind(),
            &WireRetraction {
                uid: r.uid.clone(),
                revision: r.revision,
            },
        ),
    }
}

/// Decode a broadcast event.
pub fn decode_event(bytes: &[u8]) -> Result<IuEvent> {
    let frame = read_frame(bytes)?;
    match frame.kind.as_str() {
        "iu" => Ok(IuEvent::Iu(iu_from_wire(body(frame.body)?)?)),
        "payload_update" => Ok(IuEvent::PayloadUpdate(payload_update_from_wire(body(
            frame.body,
        )?)?)),
        "link_update" => Ok(IuEvent::LinkUpdate(link_update_from_wire(body(frame.body)?))),
        "commission" => {
            let c: WireCommission = body(frame.body)?;
            Ok(IuEvent::Commission(Commission {
                uid: c.uid,
                revision: c.revision,
                writer_name: c.writer_name,
            }))
        }
        "retraction" => {
            let r: WireRetraction = body(frame.body)?;
            Ok(IuEvent::Retraction(Retraction {
                uid: r.uid,
                revision: r.revision,
            }))
        }
        other => Err(CoreError::NotImplemented(format!("event kind {:?}", other))),
    }
}

/// Encode an RPC request. The frame kind is the method name.
pub fn encode_request(request: &RpcRequest) -> Result<Bytes> {
    match request {
        RpcRequest::UpdatePayload(u) => frame(request.method(), &wire_payload_update(u)),
        RpcRequest::UpdateLinks(u) => frame(request.method(), &wire_link_update(u)),
        RpcRequest::Commit(c) => frame(
            request.method(),
            &WireCommission {
                uid: c.uid.clone(),
                revision: c.revision,
                writer_name: c.writer_name.clone(),
            },
        ),
        RpcRequest::ResendRequest(r) => frame(
            request.method(),
            &WireResendRequest {
                uid: r.uid.clone(),
                reply_scope: r.reply_scope.clone(),
            },
        ),
    }
}

/// Decode an RPC request.
pub fn decode_request(bytes: &[u8]) -> Result<RpcRequest> {
    let frame = read_frame(bytes)?;
    match frame.kind.as_str() {
        methods::UPDATE_PAYLOAD => Ok(RpcRequest::UpdatePayload(payload_update_from_wire(
            body(frame.body)?,
        )?)),
        methods::UPDATE_LINKS => Ok(RpcRequest::UpdateLinks(link_update_from_wire(body(
            frame.body,
        )?))),
        methods::COMMIT => {
            let c: WireCommission = body(frame.body)?;
            Ok(RpcRequest::Commit(Commission {
                uid: c.uid,
                revision: c.revision,
                writer_name: c.writer_name,
            }))
        }
        methods::RESEND_REQUEST => {
            let r: WireResendRequest = body(frame.body)?;
            Ok(RpcRequest::ResendRequest(ResendRequest {
                uid: r.uid,
                reply_scope: r.reply_scope,
            }))
        }
        other => Err(CoreError::NotImplemented(format!("rpc method {:?}", other))),
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Framing
// ─────────────────────────────────────────────────────────────────────────

fn frame<T: Serialize>(kind: &str, body: &T) -> Result<Bytes> {
    let body = CborValue::serialized(body).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    let frame = Frame {
        kind: kind.to_string(),
        body,
    };
    let mut buf = Vec::new();
    ciborium::into_writer(&frame, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn read_frame(bytes: &[u8]) -> Result<Frame> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}

fn body<T: DeserializeOwned>(body: CborValue) -> Result<T> {
    body.deserialized()
        .map_err(|e| CoreError::DecodingError(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────
// Field conversions
// ─────────────────────────────────────────────────────────────────────────

fn encode_value(value: &Value, payload_type: PayloadType) -> WireValue {
    match payload_type {
        PayloadType::Json => WireValue {
            value: value.to_string(),
            type_tag: tags::JSON.to_string(),
        },
        PayloadType::Str => WireValue {
            value: value.to_string_lossy(),
            type_tag: tags::STR.to_string(),
        },
    }
}

fn decode_value(value: String, type_tag: &str) -> Result<Value> {
    match type_tag {
        tags::JSON => {
            serde_json::from_str(&value).map_err(|e| CoreError::DecodingError(e.to_string()))
        }
        tags::STR => Ok(Value::String(value)),
        other => Err(CoreError::NotImplemented(format!("payload type tag {:?}", other))),
    }
}

fn parse_payload_type(s: &str) -> Result<PayloadType> {
    match s {
        "JSON" => Ok(PayloadType::Json),
        "STR" | "MAP" => Ok(PayloadType::Str),
        other => Err(CoreError::NotImplemented(format!("payload type {:?}", other))),
    }
}

fn parse_access_mode(s: &str) -> Result<AccessMode> {
    match s {
        "PUSH" => Ok(AccessMode::Push),
        "REMOTE" => Ok(AccessMode::Remote),
        "MESSAGE" => Ok(AccessMode::Message),
        other => Err(CoreError::NotImplemented(format!("access mode {:?}", other))),
    }
}

fn wire_links(links: &LinkMap) -> Vec<(String, Vec<String>)> {
    links
        .iter()
        .map(|(t, targets)| (t.clone(), targets.iter().cloned().collect()))
        .collect()
}

fn wire_iu(iu: &IuData) -> WireIu {
    WireIu {
        uid: iu.uid.clone(),
        revision: iu.revision,
        category: iu.category.clone(),
        payload_type: iu.payload_type.as_str().to_string(),
        owner_name: iu.owner_name.clone(),
        committed: iu.committed,
        access_mode: iu.access_mode.as_str().to_string(),
        read_only: iu.read_only,
        payload: iu
            .payload
            .iter()
            .map(|(key, value)| {
                let v = encode_value(value, iu.payload_type);
                WireItem {
                    key: key.clone(),
                    value: v.value,
                    type_tag: v.type_tag,
                }
            })
            .collect(),
        links: wire_links(&iu.links),
    }
}

fn iu_from_wire(w: WireIu) -> Result<IuData> {
    let mut payload = BTreeMap::new();
    for item in w.payload {
        payload.insert(item.key, decode_value(item.value, &item.type_tag)?);
    }
    Ok(IuData {
        uid: w.uid,
        revision: w.revision,
        category: w.category,
        payload_type: parse_payload_type(&w.payload_type)?,
        owner_name: w.owner_name,
        committed: w.committed,
        access_mode: parse_access_mode(&w.access_mode)?,
        read_only: w.read_only,
        payload,
        links: LinkMap::from_pairs(w.links),
    })
}

fn wire_payload_update(u: &PayloadUpdate) -> WirePayloadUpdate {
    WirePayloadUpdate {
        uid: u.uid.clone(),
        revision: u.revision,
        writer_name: u.writer_name.clone(),
        payload_type: u.payload_type.as_str().to_string(),
        is_delta: u.is_delta,
        new_items: u
            .new_items
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v, u.payload_type)))
            .collect(),
        keys_to_remove: u.keys_to_remove.clone(),
    }
}

fn payload_update_from_wire(w: WirePayloadUpdate) -> Result<PayloadUpdate> {
    let mut new_items = BTreeMap::new();
    for (key, v) in w.new_items {
        new_items.insert(key, decode_value(v.value, &v.type_tag)?);
    }
    Ok(PayloadUpdate {
        uid: w.uid,
        revision: w.revision,
        writer_name: w.writer_name,
        payload_type: parse_payload_type(&w.payload_type)?,
        is_delta: w.is_delta,
        new_items,
        keys_to_remove: w.keys_to_remove,
    })
}

fn wire_link_update(u: &LinkUpdate) -> WireLinkUpdate {
    WireLinkUpdate {
        uid: u.uid.clone(),
        revision: u.revision,
        writer_name: u.writer_name.clone(),
        is_delta: u.is_delta,
        new_links: wire_links(&u.new_links),
        links_to_remove: wire_links(&u.links_to_remove),
    }
}

fn link_update_from_wire(w: WireLinkUpdate) -> LinkUpdate {
    LinkUpdate {
        uid: w.uid,
        revision: w.revision,
        writer_name: w.writer_name,
        is_delta: w.is_delta,
        new_links: LinkMap::from_pairs(w.new_links),
        links_to_remove: LinkMap::from_pairs(w.links_to_remove),
    }
}
