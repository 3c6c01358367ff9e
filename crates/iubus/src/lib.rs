//! # iubus
//!
//! Replicated Incremental Units: owned IUs, remote mirrors, optimistic
//! remote edits and gap recovery.
//!
//! ## Overview
//!
//! Components exchange Incremental Units (IUs) through buffers:
//!
//! - **OutputBuffer**: authoritative home of the IUs a component creates.
//!   Broadcasts every change and serves remote write requests.
//! - **InputBuffer**: keeps mirrors of IUs in its categories of interest and
//!   forwards writes on them to their owner as blocking RPCs.
//! - **Payload**: a JSON document store per IU with copy-on-write
//!   snapshots, nested cursors and an atomic batch scope.
//! - **ComponentNotifier**: announces a component and the categories it
//!   uses to its peers over message IUs.
//!
//! ## Key Concepts
//!
//! - **Revision**: bumped once per accepted change. A remote write carries
//!   the revision it was based on and is rejected if the owner moved on.
//! - **Commit**: terminal; no change is accepted afterwards.
//! - **Retraction**: the owner withdrew the IU.
//! - **Message**: a fire-and-forget IU that is delivered but never stored.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iubus::{BufferConfig, EventMask, InputBuffer, Iu, OutputBuffer};
//! use iubus::transport::MemoryNetwork;
//!
//! fn example() -> iubus::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let ob = OutputBuffer::new(BufferConfig::new("producer"), Arc::new(network.create_transport()))?;
//!     let ib = InputBuffer::new(
//!         BufferConfig::builder("consumer").category_interest("asr").build(),
//!         Arc::new(network.create_transport()),
//!     )?;
//!     ib.register_handler(
//!         |iu, event, _local| {
//!             println!("{} {}", event, iu);
//!             Ok(())
//!         },
//!         EventMask::ALL,
//!         &[],
//!     )?;
//!
//!     let iu = Iu::builder("asr").item("word", "hello").build();
//!     ob.add(&iu)?;
//!     iu.payload().set("word", "hello world")?;
//!     iu.commit()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `iubus::core` - data types, link maps, document store, wire codec
//! - `iubus::transport` - transport seam and the in-process network

mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod input;
pub mod iu;
pub mod notifier;
pub mod output;
pub mod payload;

pub use iubus_core as core;
pub use iubus_transport as transport;

pub use config::{BufferConfig, BufferConfigBuilder, DEFAULT_BATCH_TIMEOUT, DEFAULT_RPC_TIMEOUT};
pub use error::{IuError, Result};
pub use handler::HandlerFn;
pub use input::InputBuffer;
pub use iu::{Iu, IuBuilder, IuKind};
pub use notifier::{ComponentNotice, ComponentNotifier, NotificationState};
pub use output::OutputBuffer;
pub use payload::{BatchGuard, Payload, PayloadCursor};

pub use iubus_core::{
    AccessMode, EventMask, IuEventType, LinkMap, PathSegment, PayloadSnapshot, PayloadType,
};
