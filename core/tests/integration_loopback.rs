// Integration test: two PeerLink instances over the in-memory radio
//
// Device A runs the initiator, device B the responder. Every radio
// callback is delivered through LoopbackAir::pump, so each test runs the
// full scan -> connect -> PSM read -> channel open sequence.

use peerlink_core::transport::ble::{Advertisement, LoopbackAir, RadioState};
use peerlink_core::{
    FrameCodec, InitiatorPhase, LinkConfig, LinkError, LinkEvent, PeerLink, Psm, RecordingObserver,
    ResponderPhase, Role, MAX_CHUNK,
};
use std::sync::Arc;

struct Pair {
    air: LoopbackAir,
    a: PeerLink,
    b: PeerLink,
    a_events: Arc<RecordingObserver>,
    b_events: Arc<RecordingObserver>,
}

impl Pair {
    fn new(air: LoopbackAir) -> Self {
        Self::with_config(air, LinkConfig::default())
    }

    fn with_config(air: LoopbackAir, config: LinkConfig) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init()
            .ok();

        let a_events = RecordingObserver::new();
        let b_events = RecordingObserver::new();
        let a = PeerLink::new(
            Box::new(air.central()),
            Box::new(air.peripheral()),
            config.clone(),
        )
        .expect("device A")
        .with_observer(a_events.clone());
        let b = PeerLink::new(
            Box::new(air.central()),
            Box::new(air.peripheral()),
            config.clone(),
        )
        .expect("device B")
        .with_observer(b_events.clone());

        Self {
            air,
            a,
            b,
            a_events,
            b_events,
        }
    }

    fn pump(&mut self) {
        self.air.pump(&mut self.a, &mut self.b);
    }

    fn connect(&mut self) {
        self.b.start_responder().expect("start responder");
        self.a.start_initiator().expect("start initiator");
        self.pump();
        assert_eq!(self.a.initiator_phase(), InitiatorPhase::SessionActive);
        assert_eq!(self.b.responder_phase(), ResponderPhase::SessionActive);
    }
}

fn count(events: &[LinkEvent], wanted: &LinkEvent) -> usize {
    events.iter().filter(|e| *e == wanted).count()
}

#[test]
fn test_handshake_uses_published_psm() {
    let psm = Psm::new(5).expect("psm");
    let mut pair = Pair::new(LoopbackAir::new().with_psm(psm));
    pair.connect();

    assert_eq!(pair.a.initiator().psm(), Some(psm));
    assert_eq!(pair.b.responder().psm(), Some(psm));
    assert_eq!(
        pair.a_events.events(),
        vec![LinkEvent::Opened { role: Role::Initiator }]
    );
    assert_eq!(
        pair.b_events.events(),
        vec![LinkEvent::Opened { role: Role::Responder }]
    );

    assert_eq!(pair.a.send("hello").expect("send"), 1);
    pair.pump();
    assert_eq!(pair.b_events.messages(Role::Responder), vec!["hello"]);
}

#[test]
fn test_rotated_psm_fails_channel_open() {
    let mut pair = Pair::new(LoopbackAir::new().with_psm(Psm::new(5).expect("psm")));
    pair.b.start_responder().expect("start responder");
    pair.a.start_initiator().expect("start initiator");

    // Stop right after the responder answered the read with PSM 5
    let answered = pair.air.pump_until(&mut pair.a, &mut pair.b, |_, b| {
        b.responder_phase() == ResponderPhase::AwaitingChannel
    });
    assert!(answered);

    pair.air.republish(Psm::new(9).expect("psm"));
    pair.pump();

    assert_eq!(pair.a.initiator_phase(), InitiatorPhase::Idle);
    assert_eq!(pair.b.responder_phase(), ResponderPhase::CapabilityPublished);
    assert_eq!(pair.b.responder().psm().map(|p| p.value()), Some(9));

    let errors: Vec<String> = pair
        .a_events
        .events()
        .into_iter()
        .filter_map(|e| match e {
            LinkEvent::Error { role: Role::Initiator, message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("PSM 5"), "unexpected error: {}", errors[0]);
    assert!(matches!(pair.a.send("x"), Err(LinkError::NoActiveSession)));
}

#[test]
fn test_partial_reads_split_sentinel() {
    // 7-byte reads put "hello" and "EO" in one read and "F" in the next
    let mut pair = Pair::new(LoopbackAir::new().with_read_limit(7));
    pair.connect();

    pair.a.send("hello").expect("send");
    pair.pump();

    assert_eq!(pair.b_events.messages(Role::Responder), vec!["hello"]);
}

#[test]
fn test_multi_chunk_messages_both_directions() {
    let mut pair = Pair::new(LoopbackAir::new().with_read_limit(100));
    pair.connect();

    let long: String = "ünïcødé text ".repeat(300) + "end";
    assert!(long.len() > 2 * MAX_CHUNK);

    let chunks = pair.a.send(&long).expect("send");
    assert_eq!(chunks, FrameCodec::chunk_count(long.len()));
    assert_eq!(chunks, 5);
    pair.b.send("short reply").expect("reply");
    pair.pump();

    assert_eq!(pair.b_events.messages(Role::Responder), vec![long]);
    assert_eq!(pair.a_events.messages(Role::Initiator), vec!["short reply"]);
}

#[test]
fn test_oversized_message_is_dropped_whole() {
    let config = LinkConfig::default().with_max_message_bytes(MAX_CHUNK);
    let mut pair = Pair::with_config(LoopbackAir::new().with_read_limit(300), config);
    pair.connect();

    pair.a.send(&("a".repeat(2500) + "TAIL")).expect("send");
    pair.a.send("after").expect("send");
    pair.pump();

    assert_eq!(pair.b_events.messages(Role::Responder), vec!["after"]);
    assert_eq!(pair.b.responder_phase(), ResponderPhase::SessionActive);
}

#[test]
fn test_back_to_back_messages_in_order() {
    let mut pair = Pair::new(LoopbackAir::new());
    pair.connect();

    for i in 0..5 {
        pair.a.send(&format!("message {}", i)).expect("send");
    }
    pair.pump();

    let expected: Vec<String> = (0..5).map(|i| format!("message {}", i)).collect();
    assert_eq!(pair.b_events.messages(Role::Responder), expected);
}

#[test]
fn test_duplicate_and_foreign_advertisements() {
    let air = LoopbackAir::new()
        .with_duplicate_adverts(true)
        .with_bystander(Advertisement::new("headphones", vec![]));
    let mut pair = Pair::new(air);
    pair.connect();

    let opened = LinkEvent::Opened { role: Role::Initiator };
    assert_eq!(count(&pair.a_events.events(), &opened), 1);
    assert_eq!(pair.air.open_channels(), 1);
}

#[test]
fn test_responder_stop_returns_initiator_to_idle() {
    let mut pair = Pair::new(LoopbackAir::new());
    pair.connect();

    pair.b.stop_responder();
    pair.pump();

    assert_eq!(pair.b.responder_phase(), ResponderPhase::Idle);
    assert_eq!(pair.a.initiator_phase(), InitiatorPhase::Idle);
    assert!(!pair.air.is_advertising());
    assert_eq!(pair.air.registered_services(), 0);
    assert_eq!(pair.air.published_psm(), None);
    assert_eq!(
        pair.a_events.events().last(),
        Some(&LinkEvent::Closed { role: Role::Initiator })
    );
    assert!(matches!(pair.a.send("anyone?"), Err(LinkError::NoActiveSession)));
    assert!(matches!(pair.b.send("anyone?"), Err(LinkError::NoActiveSession)));
}

#[test]
fn test_reconnect_after_link_loss_starts_clean() {
    let mut pair = Pair::new(LoopbackAir::new().with_read_limit(256));
    pair.connect();

    // Lose the link while the responder holds part of a message
    pair.a.send(&"x".repeat(3 * MAX_CHUNK)).expect("send");
    let partial = pair.air.pump_until(&mut pair.a, &mut pair.b, |_, b| {
        b.responder()
            .session()
            .map_or(false, |s| s.pending_len() > 0)
    });
    assert!(partial);
    pair.air.drop_connection();
    pair.pump();

    assert_eq!(pair.a.initiator_phase(), InitiatorPhase::Idle);
    assert_eq!(pair.b.responder_phase(), ResponderPhase::AwaitingChannel);
    assert!(pair.b_events.messages(Role::Responder).is_empty());

    // The responder keeps advertising; a fresh initiator run reconnects
    pair.a.start_initiator().expect("restart");
    pair.pump();
    assert_eq!(pair.a.initiator_phase(), InitiatorPhase::SessionActive);
    assert_eq!(pair.b.responder_phase(), ResponderPhase::SessionActive);

    pair.a.send("fresh").expect("send");
    pair.pump();
    assert_eq!(pair.b_events.messages(Role::Responder), vec!["fresh"]);
}

#[test]
fn test_power_cycle_reconnects() {
    let mut pair = Pair::new(LoopbackAir::new());
    pair.connect();

    pair.air.set_radio_state(RadioState::PoweredOff);
    pair.pump();
    assert_eq!(pair.a.initiator_phase(), InitiatorPhase::WaitingForRadio);
    assert_eq!(pair.b.responder_phase(), ResponderPhase::WaitingForRadio);

    pair.air.set_radio_state(RadioState::PoweredOn);
    pair.pump();
    assert_eq!(pair.a.initiator_phase(), InitiatorPhase::SessionActive);
    assert_eq!(pair.b.responder_phase(), ResponderPhase::SessionActive);

    let closed = LinkEvent::Closed { role: Role::Initiator };
    let opened = LinkEvent::Opened { role: Role::Initiator };
    let events = pair.a_events.events();
    assert_eq!(count(&events, &opened), 2);
    assert_eq!(count(&events, &closed), 1);
}
