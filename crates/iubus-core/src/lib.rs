//! # iubus Core
//!
//! Pure data layer of the Incremental Unit bus: no threads, no I/O.
//!
//! ## Overview
//!
//! An Incremental Unit (IU) carries a typed [`LinkMap`] and a JSON payload
//! held in a copy-on-write [`DocumentStore`]. Changes to either travel as
//! deltas ([`PayloadDelta`], [`LinkDelta`]) wrapped in the wire messages of
//! the [`messages`] module, which [`codec`] turns into CBOR frames.
//!
//! ## Key Types
//!
//! - [`LinkMap`]: link type → set of target uids, with empty sets pruned
//! - [`DocumentStore`]: top-level key → shared JSON document
//! - [`Coerce`]: lossy conversion of payload values to host types
//! - [`IuEvent`] / [`RpcRequest`]: what buffers broadcast and what they serve
//!
//! ## Usage
//!
//! ```rust
//! use iubus_core::{DocumentStore, PayloadDelta, Coerce};
//! use serde_json::json;
//!
//! let mut store = DocumentStore::new();
//! store.apply(&PayloadDelta::set("score", json!("1.5")));
//! let score = store.get("score").unwrap();
//! assert_eq!(score.to_f64().unwrap(), 1.5);
//! ```

pub mod codec;
pub mod document;
pub mod error;
pub mod links;
pub mod messages;
pub mod types;
pub mod value;

pub use codec::{decode_event, decode_request, encode_event, encode_request};
pub use document::{DocumentStore, PayloadSnapshot};
pub use error::{CoreError, Result};
pub use links::LinkMap;
pub use messages::{
    methods, Commission, IuData, IuEvent, LinkDelta, LinkUpdate, PayloadDelta, PayloadUpdate,
    ResendRequest, Retraction, RpcRequest, FORCE_REVISION, REJECTED,
};
pub use types::{
    generate_instance_id, generate_uid, AccessMode, EventMask, IuEventType, PayloadType,
    DEFAULT_CHANNEL,
};
pub use value::{materialize, resolve, Coerce, PathSegment};
