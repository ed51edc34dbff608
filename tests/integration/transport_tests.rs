//! Broker outages as seen from the service: offline queueing, reconnect
//! backoff, breaker gating and heartbeat behaviour.

use aquanode::app::events::EventCode;
use aquanode::app::ports::{InboundMessage, Qos};
use aquanode::config::SystemConfig;
use aquanode::transport::BreakerState;

use crate::mock_hw::{MockStore, Rig};

fn rig_with_relay() -> Rig {
    let mut rig = Rig::new();
    rig.configure(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.broker_mut().clear();
    rig
}

/// Drop the session and let the service notice.
fn go_offline(rig: &mut Rig, refuse_reconnect: bool) {
    rig.broker_mut().online = false;
    rig.broker_mut().reject_connects = refuse_reconnect;
    rig.tick();
}

fn handle(rig: &mut Rig, leaf: &str, payload: &str) {
    let topic = rig.topic(leaf);
    let msg = InboundMessage::new(&topic, payload.as_bytes()).unwrap();
    rig.app
        .handle_message(&msg, &mut rig.pins, &mut rig.store, &mut rig.sink, rig.now);
}

#[test]
fn lost_session_is_recorded_once() {
    let mut rig = rig_with_relay();
    go_offline(&mut rig, true);
    rig.tick();
    rig.tick();

    assert_eq!(rig.sink.count(EventCode::ConnectionLost), 1);
    assert!(!rig.app.link().is_connected());
}

#[test]
fn offline_publishes_are_flushed_in_order_on_reconnect() {
    let mut rig = rig_with_relay();
    go_offline(&mut rig, false);

    handle(&mut rig, "actuator/4/command", "on");
    assert!(rig.pins.level(4), "local control keeps working offline");
    assert_eq!(rig.app.link().stats().queued, 2);
    assert!(rig.broker().published.is_empty());

    rig.tick();

    assert!(rig.app.link().is_connected());
    assert_eq!(rig.app.link().stats().queued, 0);
    let topics: Vec<&str> = rig.broker().published.iter().map(|p| p.topic.as_str()).collect();
    assert!(topics[0].ends_with("actuator/4/response"), "{topics:?}");
    assert!(topics[1].ends_with("actuator/4/status"), "{topics:?}");
    // Then the reconnect announcement.
    assert!(topics[2].ends_with("emergency/state"), "{topics:?}");
    assert!(rig
        .sink
        .events
        .iter()
        .any(|(_, code, msg)| *code == EventCode::Connected && msg.contains("2 queued delivered")));
}

#[test]
fn subscriptions_are_restored_after_reconnect() {
    let mut rig = rig_with_relay();
    rig.broker_mut().subscriptions.clear();
    go_offline(&mut rig, false);
    rig.tick();

    assert_eq!(rig.broker().subscriptions.len(), 4);
}

#[test]
fn heartbeat_is_best_effort_and_never_queued() {
    let mut rig = rig_with_relay();
    go_offline(&mut rig, true);

    for _ in 0..3 {
        rig.advance(60_000);
    }
    assert_eq!(rig.app.link().stats().queued, 0);

    rig.broker_mut().reject_connects = false;
    rig.advance(60_000);
    assert!(rig.app.link().is_connected());
    assert!(rig.broker().on("heartbeat").is_empty(), "interval restarts on connect");

    rig.advance(60_000);
    let beats: Vec<_> = rig
        .broker()
        .published
        .iter()
        .filter(|p| p.topic.ends_with("/heartbeat"))
        .collect();
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].qos, Qos::AtMostOnce);
}

#[test]
fn reconnect_waits_for_backoff() {
    let mut rig = rig_with_relay();
    go_offline(&mut rig, true);

    rig.tick();
    assert_eq!(rig.broker().connects, 2, "first retry runs right away");
    assert!(rig.sink.has(EventCode::ReconnectFailed));

    rig.advance(500);
    assert_eq!(rig.broker().connects, 2, "1 s backoff not elapsed");

    rig.advance(500);
    assert_eq!(rig.broker().connects, 3);
    assert_eq!(rig.app.link().stats().reconnect_attempts, 2);
}

#[test]
fn repeated_failures_open_breaker_then_report_exhaustion() {
    let mut rig = rig_with_relay();
    go_offline(&mut rig, true);

    for _ in 0..5 {
        rig.advance(60_000);
    }
    assert_eq!(rig.app.link().stats().breaker, BreakerState::Open);
    assert!(!rig.sink.has(EventCode::RetriesExhausted));

    for _ in 0..5 {
        rig.advance(60_000);
    }
    assert_eq!(rig.sink.count(EventCode::RetriesExhausted), 1);
    assert_eq!(rig.app.link().stats().reconnect_attempts, 10);

    // Retries continue at the capped delay and are reported once.
    rig.advance(60_000);
    assert_eq!(rig.sink.count(EventCode::RetriesExhausted), 1);

    rig.broker_mut().reject_connects = false;
    rig.advance(60_000);
    assert!(rig.app.link().is_connected());
    let stats = rig.app.link().stats();
    assert_eq!(stats.breaker, BreakerState::Closed);
    assert_eq!(stats.reconnect_attempts, 0);
}

#[test]
fn queue_overflow_drops_oldest_and_is_recorded() {
    let mut rig = rig_with_relay();
    go_offline(&mut rig, true);

    let now = rig.now;
    for n in 0..40u8 {
        rig.app
            .link_mut()
            .publish("aquanode/test/seq", &[n], Qos::AtLeastOnce, 0, now)
            .unwrap();
    }
    rig.tick();

    let stats = rig.app.link().stats();
    assert_eq!(stats.queued, 32);
    assert_eq!(stats.dropped, 8);
    assert!(rig
        .sink
        .events
        .iter()
        .any(|(_, code, msg)| *code == EventCode::MessageDropped && msg.starts_with("8 ")));

    rig.broker_mut().reject_connects = false;
    rig.advance(30_000);
    assert!(rig.app.link().is_connected());
    let seq: Vec<u8> = rig
        .broker()
        .published
        .iter()
        .filter(|p| p.topic == "aquanode/test/seq")
        .map(|p| p.payload[0])
        .collect();
    assert_eq!(seq, (8..40).collect::<Vec<u8>>());
}

#[test]
fn missing_broker_host_never_dials() {
    let mut rig = Rig::with(SystemConfig::default(), MockStore::new());
    rig.advance(60_000);

    assert_eq!(rig.broker().connects, 0);
    assert!(!rig.app.link().is_connected());
    assert!(rig
        .sink
        .events
        .iter()
        .any(|(_, code, msg)| *code == EventCode::ReconnectFailed && msg.contains("initial connect")));
}
