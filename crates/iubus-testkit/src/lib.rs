//! # iubus Testkit
//!
//! Testing utilities for iubus.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: an in-process bus with buffer helpers, a transport that
//!   records RPC traffic, and a handler that records observed events
//! - **Generators**: Proptest strategies for payloads, link maps and deltas
//!
//! ## Test Fixtures
//!
//! ```rust
//! use iubus::{EventMask, Iu, IuEventType};
//! use iubus_testkit::fixtures::{RecordingHandler, TestBus};
//!
//! let bus = TestBus::new();
//! let ob = bus.output("producer");
//! let ib = bus.input("consumer", &["asr"]);
//! let recorder = RecordingHandler::new();
//! ib.register_handler(recorder.handler(), EventMask::ALL, &[]).unwrap();
//!
//! let iu = Iu::builder("asr").item("word", "OK").build();
//! ob.add(&iu).unwrap();
//! assert!(recorder.wait_for(IuEventType::Added, 1));
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use iubus_core::DocumentStore;
//! use iubus_testkit::generators::{expected_payload, payload_delta, payload_items};
//!
//! proptest! {
//!     #[test]
//!     fn delta_applies(initial in payload_items(6), delta in payload_delta()) {
//!         let mut store = DocumentStore::from_items(initial.clone());
//!         store.apply(&delta);
//!         prop_assert_eq!(store.to_items(), expected_payload(&initial, &delta));
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    init_test_logging, wait_until, ObservedEvent, RecordedCall, RecordingHandler,
    RecordingTransport, TestBus, WAIT,
};
pub use generators::{expected_payload, json_value, link_map, payload_delta, payload_items};
