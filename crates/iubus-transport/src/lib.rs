//! # iubus Transport
//!
//! The publish/subscribe and RPC seam consumed by iubus buffers.
//!
//! ## Overview
//!
//! Buffers talk to each other only through [`Transport`]:
//!
//! - category scopes (`channel/<channel>/category/<category>`) carry
//!   broadcast [`IuEvent`](iubus_core::IuEvent)s
//! - component scopes (`component/<basename>-<id>/<OB|IB>`) name buffers
//!   and address the RPC server of each OutputBuffer
//!
//! [`memory::MemoryNetwork`] wires any number of transports together inside
//! one process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iubus_transport::{MemoryNetwork, Scope, Transport};
//!
//! let network = MemoryNetwork::new();
//! let transport = network.create_transport();
//! let scope = Scope::category("default", "asr");
//! let _subscription = transport
//!     .subscribe(&scope, Arc::new(|event: iubus_core::IuEvent| println!("{:?}", event)))
//!     .unwrap();
//! ```

pub mod error;
pub mod scope;
pub mod transport;

pub use error::{Result, TransportError};
pub use scope::{BufferRole, Scope};
pub use transport::{
    memory::MemoryNetwork, memory::MemoryTransport, EventSink, Registration, RemoteServer,
    RpcHandler, Transport,
};
