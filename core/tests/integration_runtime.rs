// Integration test: two link runtimes exchanging messages
//
// Each device runs on its own tokio task behind a LinkHandle. Radio
// callbacks from the loopback air are forwarded through the handles, and
// observer events come back on unbounded channels the way a host bridge
// would consume them.

use peerlink_core::transport::ble::LoopbackAir;
use peerlink_core::{
    spawn_link, InitiatorPhase, LinkConfig, LinkError, LinkEvent, LinkHandle, PeerLink,
    ResponderPhase, Role,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Device {
    handle: LinkHandle,
    task: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

fn device(air: &LoopbackAir) -> Device {
    let (event_tx, events) = mpsc::unbounded_channel();
    let link = PeerLink::new(
        Box::new(air.central()),
        Box::new(air.peripheral()),
        LinkConfig::default(),
    )
    .expect("link")
    .with_observer(Arc::new(event_tx));
    let (handle, task) = spawn_link(link);
    Device {
        handle,
        task,
        events,
    }
}

/// Forward radio callbacks until both queues stay empty
async fn settle(air: &LoopbackAir, initiator: &LinkHandle, responder: &LinkHandle) {
    loop {
        let mut moved = false;
        while let Some(event) = air.next_central_event() {
            initiator.deliver_central(event).await.expect("deliver");
            moved = true;
        }
        while let Some(event) = air.next_peripheral_event() {
            responder.deliver_peripheral(event).await.expect("deliver");
            moved = true;
        }
        initiator.flush().await.expect("flush");
        responder.flush().await.expect("flush");
        if !moved {
            break;
        }
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_runtime_exchange() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();

    let air = LoopbackAir::new().with_read_limit(300);
    let mut a = device(&air);
    let mut b = device(&air);

    b.handle.start_responder().await.expect("responder");
    a.handle.start_initiator().await.expect("initiator");
    settle(&air, &a.handle, &b.handle).await;

    assert_eq!(
        a.handle.phases().await.expect("phases").0,
        InitiatorPhase::SessionActive
    );
    assert_eq!(
        b.handle.phases().await.expect("phases").1,
        ResponderPhase::SessionActive
    );
    assert_eq!(a.handle.active_role().await.expect("role"), Some(Role::Initiator));
    assert_eq!(
        drain(&mut b.events),
        vec![LinkEvent::Opened { role: Role::Responder }]
    );

    let long = "line one\nline two ".repeat(200);
    a.handle.send("hello").await.expect("send");
    a.handle.send(long.clone()).await.expect("send");
    b.handle.send("world").await.expect("send");
    settle(&air, &a.handle, &b.handle).await;

    assert_eq!(
        drain(&mut b.events),
        vec![
            LinkEvent::Message {
                role: Role::Responder,
                data: "hello".to_string()
            },
            LinkEvent::Message {
                role: Role::Responder,
                data: long.trim_end().to_string()
            },
        ]
    );
    assert_eq!(
        drain(&mut a.events),
        vec![
            LinkEvent::Opened { role: Role::Initiator },
            LinkEvent::Message {
                role: Role::Initiator,
                data: "world".to_string()
            },
        ]
    );

    a.handle.stop_initiator().await.expect("stop");
    settle(&air, &a.handle, &b.handle).await;
    assert_eq!(
        drain(&mut b.events),
        vec![LinkEvent::Closed { role: Role::Responder }]
    );
    assert!(matches!(
        a.handle.send("gone").await,
        Err(LinkError::NoActiveSession)
    ));
}

#[tokio::test]
async fn test_runtime_shutdown_closes_session() {
    let air = LoopbackAir::new();
    let mut a = device(&air);
    let b = device(&air);

    b.handle.start_responder().await.expect("responder");
    a.handle.start_initiator().await.expect("initiator");
    settle(&air, &a.handle, &b.handle).await;

    a.handle.shutdown().await.expect("shutdown");
    timeout(Duration::from_secs(5), a.task)
        .await
        .expect("task finished in time")
        .expect("task");

    let events = drain(&mut a.events);
    assert_eq!(events.last(), Some(&LinkEvent::Closed { role: Role::Initiator }));
    assert!(matches!(
        a.handle.send("after shutdown").await,
        Err(LinkError::RuntimeStopped)
    ));

    // The responder hears the channel end
    while let Some(event) = air.next_peripheral_event() {
        b.handle.deliver_peripheral(event).await.expect("deliver");
    }
    b.handle.flush().await.expect("flush");
    assert_eq!(
        b.handle.phases().await.expect("phases").1,
        ResponderPhase::AwaitingChannel
    );
}

#[test]
fn test_event_json_names() {
    let opened = serde_json::to_value(LinkEvent::Opened {
        role: Role::Initiator,
    })
    .expect("serialize");
    assert_eq!(opened["event"], "connected");
    assert_eq!(opened["role"], "initiator");

    let message = serde_json::to_value(LinkEvent::Message {
        role: Role::Responder,
        data: "hi".to_string(),
    })
    .expect("serialize");
    assert_eq!(message["event"], "onmessage");
    assert_eq!(message["data"], "hi");

    let closed = serde_json::to_value(LinkEvent::Closed {
        role: Role::Responder,
    })
    .expect("serialize");
    assert_eq!(closed["event"], "closed");
}
