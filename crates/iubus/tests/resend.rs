//! Gap recovery: mirrors for IUs whose first publication was missed.

use std::sync::Arc;
use std::time::Duration;

use iubus::core::{Commission, IuEvent, LinkDelta, LinkMap, LinkUpdate, Retraction};
use iubus::transport::Scope;
use iubus::{BufferConfig, Iu, IuError, IuEventType};
use iubus_testkit::{wait_until, RecordingHandler, TestBus, WAIT};

fn late_input(bus: &TestBus, resend: bool) -> (iubus::InputBuffer, iubus_testkit::RecordingTransport) {
    let transport = bus.recording_transport();
    let config = BufferConfig::builder("late")
        .category_interest("cat1")
        .resend(resend)
        .build();
    let ib = bus.input_with(config, Arc::new(transport.clone()));
    (ib, transport)
}

#[test]
fn test_unknown_update_triggers_single_resend() {
    let bus = TestBus::new();
    let ob = bus.output("owner");
    let iu = Iu::builder("cat1").item("word", "OK").build();
    ob.add(&iu).unwrap();

    // Created after the IU was published, so its ADDED was missed.
    let (ib, transport) = late_input(&bus, true);
    let recorder = RecordingHandler::new();
    ib.register_handler(recorder.handler(), IuEventType::Added, &[])
        .unwrap();
    assert!(ib.get(iu.uid()).is_none());

    iu.payload().set("word", "changed").unwrap();

    assert!(recorder.wait_for(IuEventType::Added, 1));
    let mirror = ib.get(iu.uid()).unwrap();
    assert_eq!(mirror.payload().to_map(), iu.payload().to_map());
    assert_eq!(mirror.revision(), iu.revision());

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(transport.count("resendRequest"), 1);
    assert_eq!(transport.count_to(ob.unique_name(), "resendRequest"), 1);
}

#[test]
fn test_recovered_mirror_follows_later_updates() {
    let bus = TestBus::new();
    let ob = bus.output("owner");
    let iu = Iu::new("cat1");
    ob.add(&iu).unwrap();

    let (ib, transport) = late_input(&bus, true);
    iu.commit().unwrap();

    assert!(wait_until(WAIT, || ib.get(iu.uid()).is_some()));
    let mirror = ib.get(iu.uid()).unwrap();
    assert!(mirror.committed());
    assert_eq!(mirror.revision(), 2);
    assert_eq!(transport.count("resendRequest"), 1);

    ob.remove(iu.uid());
    assert!(wait_until(WAIT, || mirror.retracted()));
    assert_eq!(transport.count("resendRequest"), 1);
}

#[test]
fn test_resend_disabled_drops_unknown_updates() {
    let bus = TestBus::new();
    let ob = bus.output("owner");
    let iu = Iu::new("cat1");
    ob.add(&iu).unwrap();

    let (ib, transport) = late_input(&bus, false);
    assert!(!ib.resend());
    iu.payload().set("a", 1).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    assert!(ib.get(iu.uid()).is_none());
    assert_eq!(transport.count("resendRequest"), 0);

    // Switching it on takes effect for the next update.
    ib.set_resend(true);
    iu.payload().set("a", 2).unwrap();
    assert!(wait_until(WAIT, || ib.get(iu.uid()).is_some()));
    assert_eq!(ib.get(iu.uid()).unwrap().payload().get_str("a"), "2");
}

#[test]
fn test_failed_implicit_resend_is_not_fatal() {
    let bus = TestBus::new();
    let ob = bus.output("owner");
    let (ib, transport) = late_input(&bus, true);

    // An update from a writer that serves nothing: the resend fails quietly.
    bus.transport()
        .publish(
            &Scope::category("default", "cat1"),
            &IuEvent::LinkUpdate(LinkUpdate::from_delta(
                "00000000-0000-4000-8000-000000000000",
                7,
                "component/ghost-00000000/IB",
                LinkDelta::replace(LinkMap::new()),
            )),
        )
        .unwrap();
    assert!(wait_until(WAIT, || transport.count("resendRequest") == 1));

    // Updates without a writer never trigger a resend.
    bus.transport()
        .publish(
            &Scope::category("default", "cat1"),
            &IuEvent::Commission(Commission {
                uid: "00000000-0000-4000-8000-000000000001".to_string(),
                revision: 3,
                writer_name: String::new(),
            }),
        )
        .unwrap();

    // The buffer keeps working.
    let iu = Iu::new("cat1");
    ob.add(&iu).unwrap();
    assert!(wait_until(WAIT, || ib.get(iu.uid()).is_some()));
    assert_eq!(transport.count("resendRequest"), 1);
}

#[test]
fn test_retraction_of_unknown_iu_never_requests_resend() {
    let bus = TestBus::new();
    let ob = bus.output("owner");
    let (ib, transport) = late_input(&bus, true);

    bus.transport()
        .publish(
            &Scope::category("default", "cat1"),
            &IuEvent::Retraction(Retraction {
                uid: "00000000-0000-4000-8000-000000000002".to_string(),
                revision: 4,
            }),
        )
        .unwrap();

    // Delivery on one category is ordered: once this IU arrives the
    // retraction has been handled.
    let iu = Iu::new("cat1");
    ob.add(&iu).unwrap();
    assert!(wait_until(WAIT, || ib.get(iu.uid()).is_some()));

    assert_eq!(transport.count("resendRequest"), 0);
    assert!(ib.get("00000000-0000-4000-8000-000000000002").is_none());
}

#[test]
fn test_explicit_resend_errors() {
    let bus = TestBus::new();
    let ob = bus.output("owner");
    let (ib, _transport) = late_input(&bus, false);

    let err = ib.request_resend("no-such-uid", ob.unique_name()).unwrap_err();
    assert!(matches!(err, IuError::ResendRequestFailed { ref uid, .. } if uid == "no-such-uid"));

    let iu = Iu::new("cat1");
    ob.add(&iu).unwrap();
    let owner = ob.unique_name().to_string();
    drop(ob);
    let err = ib.request_resend(iu.uid(), &owner).unwrap_err();
    assert!(matches!(err, IuError::ResendRequestFailed { .. }));
}
