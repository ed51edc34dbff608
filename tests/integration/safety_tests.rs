//! Emergency stop, verified clear and sequenced resume, end to end.

use aquanode::adapters::mqtt::{SimMqttLink, INBOUND_DEPTH};
use aquanode::app::events::{EventCode, Severity};
use aquanode::app::ports::InboundMessage;
use aquanode::app::service::AppService;
use aquanode::safety::EmergencyState;

use crate::mock_hw::{set_clock, test_clock, MockPins, MockStore, PinWrite, RecordingSink, Rig, DEVICE};

const STOP: &str = r#"{"action":"stop","reason":"leak detected"}"#;
const CLEAR: &str = r#"{"action":"clear"}"#;

fn rig_with(json: &str) -> Rig {
    let mut rig = Rig::new();
    let resp = rig.configure(json);
    assert_eq!(resp["success"], true, "{resp}");
    rig.broker_mut().clear();
    rig
}

fn states(rig: &Rig) -> Vec<String> {
    rig.broker()
        .on("emergency/state")
        .into_iter()
        .map(|s| s["state"].as_str().unwrap_or_default().to_string())
        .collect()
}

// ── Stop ─────────────────────────────────────────────────────

#[test]
fn stop_de_energises_everything_and_blocks_commands() {
    let mut rig = rig_with(
        r#"[{"gpio":4,"type":"relay"},{"gpio":5,"type":"pump"},{"gpio":9,"type":"pwm"}]"#,
    );
    rig.deliver("actuator/4/command", "on");
    rig.deliver("actuator/5/command", "on");
    rig.deliver("actuator/9/command", r#"{"command":"SET","value":0.8}"#);
    assert!(rig.pins.level(4) && rig.pins.level(5) && rig.pins.duty(9) > 0);

    rig.deliver("emergency", STOP);

    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);
    assert!(!rig.pins.level(4));
    assert!(!rig.pins.level(5));
    assert_eq!(rig.pins.duty(9), 0);
    for gpio in [4, 5, 9] {
        assert!(rig.app.registry().get(gpio).unwrap().is_emergency_stopped());
        let alert = rig.broker().last_on(&format!("actuator/{gpio}/alert")).unwrap();
        assert_eq!(alert["alert_type"], "emergency_stop");
        assert_eq!(alert["message"], "leak detected");
    }
    let state = rig.broker().last_on("emergency/state").unwrap();
    assert_eq!(state["state"], "ACTIVE");
    assert_eq!(state["reason"], "leak detected");
    assert!(rig.sink.events.iter().any(|(sev, code, _)| {
        *sev == Severity::Critical && *code == EventCode::EmergencyTriggered
    }));

    rig.deliver("actuator/4/command", "on");
    assert!(!rig.pins.level(4));
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], "emergency stop active");
    assert_eq!(resp["emergency_state"], "ACTIVE");
}

#[test]
fn stop_queued_behind_commands_is_handled_first() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    let writes_before = rig.pins.writes.len();

    for _ in 0..7 {
        rig.send("actuator/4/command", "on");
    }
    rig.send("emergency", STOP);
    rig.tick();

    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);
    assert!(
        rig.pins.writes[writes_before..]
            .iter()
            .all(|w| *w != PinWrite::Digital(4, true)),
        "no ON may reach the pin once a stop is pending"
    );
    let responses = rig.broker().on("actuator/4/response");
    assert_eq!(responses.len(), 7);
    assert!(responses.iter().all(|r| r["message"] == "emergency stop active"));
}

fn sim(app: &mut AppService<SimMqttLink>) -> &mut SimMqttLink {
    app.link_mut().port_mut()
}

#[test]
fn stop_behind_a_full_command_burst_is_not_dropped() {
    set_clock(0);
    let mut app = AppService::new(SimMqttLink::new(), Rig::config(), DEVICE, test_clock);
    let mut pins = MockPins::new();
    let mut store = MockStore::new();
    let mut sink = RecordingSink::new();
    let now = 1_000;
    app.start(&mut pins, &store, &mut sink, now);
    let base = app.topics().base().to_string();
    let command = format!("{base}/actuator/4/command");

    sim(&mut app).inject(&format!("{base}/config"), br#"[{"gpio":4,"type":"relay"}]"#);
    app.tick(&mut pins, &mut store, &mut sink, now);
    sim(&mut app).inject(&command, b"on");
    app.tick(&mut pins, &mut store, &mut sink, now);
    assert!(pins.level(4));

    for _ in 0..INBOUND_DEPTH {
        assert!(sim(&mut app).inject(&command, b"on"));
    }
    assert!(!sim(&mut app).inject(&command, b"on"), "command lane is full");
    assert!(sim(&mut app).inject(&format!("{base}/emergency"), STOP.as_bytes()));
    app.tick(&mut pins, &mut store, &mut sink, now);

    assert_eq!(app.emergency_state(), EmergencyState::Active);
    assert!(!pins.level(4));
    assert_eq!(pins.writes.last(), Some(&PinWrite::Digital(4, false)));
}

#[test]
fn malformed_emergency_message_is_reported_without_state_change() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", r#"{"action":"panic"}"#);

    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);
    let state = rig.broker().last_on("emergency/state").unwrap();
    assert_eq!(state["state"], "NORMAL");
    assert_eq!(state["error"], "invalid command");
}

// ── Clear ────────────────────────────────────────────────────

#[test]
fn clear_before_minimum_stop_duration_is_rejected() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);
    rig.advance(1_000);

    rig.deliver("emergency", CLEAR);

    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);
    let state = rig.broker().last_on("emergency/state").unwrap();
    assert_eq!(state["state"], "ACTIVE");
    assert_eq!(state["error"], "stop too recent (4000 ms remaining)");
    assert_eq!(rig.app.safety().clear_failures(), 1);
    assert!(rig.sink.has(EventCode::EmergencyClearRejected));
}

#[test]
fn repeated_failed_clears_lock_out_until_timeout() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);

    for _ in 0..3 {
        rig.deliver("emergency", CLEAR);
    }
    assert_eq!(rig.app.safety().clear_failures(), 3);

    rig.advance(10_000);
    rig.deliver("emergency", CLEAR);
    let state = rig.broker().last_on("emergency/state").unwrap();
    assert_eq!(state["state"], "ACTIVE");
    assert_eq!(state["error"], "clear locked out for 50000 ms");
    assert_eq!(rig.app.safety().clear_failures(), 3, "lockout refusals are not counted");

    rig.advance(50_000);
    rig.deliver("emergency", CLEAR);
    assert_ne!(rig.app.emergency_state(), EmergencyState::Active);
    assert_eq!(rig.app.safety().clear_failures(), 0);
}

#[test]
fn clear_requires_broker_connectivity() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);
    rig.advance(10_000);

    rig.broker_mut().online = false;
    rig.broker_mut().reject_connects = true;
    rig.tick();

    // Nothing arrives over a dead session; hand the message over directly.
    let topic = rig.topic("emergency");
    let msg = InboundMessage::new(&topic, CLEAR.as_bytes()).unwrap();
    rig.app
        .handle_message(&msg, &mut rig.pins, &mut rig.store, &mut rig.sink, rig.now);

    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);
    assert!(rig.sink.events.iter().any(|(_, code, msg)| {
        *code == EventCode::EmergencyClearRejected && msg.contains("transport disconnected")
    }));
    assert!(!rig.pins.level(4));
}

#[test]
fn clear_outside_active_is_rejected() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", CLEAR);

    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);
    let state = rig.broker().last_on("emergency/state").unwrap();
    assert_eq!(state["error"], "not allowed in state NORMAL");
}

// ── Resume ───────────────────────────────────────────────────

#[test]
fn resume_runs_critical_first_with_spacing() {
    let mut rig = rig_with(
        r#"[{"gpio":4,"type":"relay"},
            {"gpio":5,"type":"pump","critical":true},
            {"gpio":6,"type":"relay"}]"#,
    );
    rig.deliver("emergency", STOP);
    rig.advance(5_000);

    rig.deliver("emergency", CLEAR);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Resuming);
    let resumed = |rig: &Rig| -> Vec<u8> {
        [4u8, 5, 6]
            .into_iter()
            .filter(|g| !rig.app.registry().get(*g).unwrap().is_emergency_stopped())
            .collect()
    };
    assert_eq!(resumed(&rig), vec![5], "critical actuator first, same tick");

    rig.advance(1_999);
    assert_eq!(resumed(&rig), vec![5], "inter-actuator delay holds");

    rig.advance(1);
    assert_eq!(resumed(&rig), vec![4, 5]);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Resuming);

    rig.advance(2_000);
    assert_eq!(resumed(&rig), vec![4, 5, 6]);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);

    let order: Vec<&str> = rig
        .sink
        .events
        .iter()
        .filter(|(_, code, _)| *code == EventCode::ActuatorResumed)
        .map(|(_, _, msg)| msg.as_str())
        .collect();
    assert_eq!(order, vec!["GPIO 5", "GPIO 4", "GPIO 6"]);
    assert!(rig.sink.has(EventCode::ResumeComplete));
    assert_eq!(states(&rig).last().map(String::as_str), Some("NORMAL"));

    // Re-enabled, not re-energised.
    assert!(!rig.pins.level(4) && !rig.pins.level(5) && !rig.pins.level(6));
    rig.deliver("actuator/4/command", "on");
    assert!(rig.pins.level(4));
}

#[test]
fn stop_during_resume_abandons_the_plan() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"},{"gpio":6,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);
    rig.advance(5_000);
    rig.deliver("emergency", CLEAR);
    assert!(!rig.app.registry().get(4).unwrap().is_emergency_stopped());

    rig.deliver("emergency", STOP);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);
    assert_eq!(rig.app.safety().pending_resume(), 0);

    rig.advance(4_000);
    assert!(rig.app.registry().get(4).unwrap().is_emergency_stopped());
    assert!(rig.app.registry().get(6).unwrap().is_emergency_stopped());
}

#[test]
fn resume_from_active_performs_verified_clear() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);

    rig.deliver("emergency", r#"{"action":"resume"}"#);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);

    rig.advance(5_000);
    rig.deliver("emergency", r#"{"action":"resume"}"#);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);
    assert!(!rig.app.registry().get(4).unwrap().is_emergency_stopped());
}

#[test]
fn state_transitions_are_published_in_order() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);
    rig.advance(5_000);
    rig.deliver("emergency", CLEAR);

    assert_eq!(states(&rig), vec!["ACTIVE", "RESUMING", "NORMAL"]);
}

// ── Per-actuator latch ───────────────────────────────────────

#[test]
fn single_actuator_stop_and_clear() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"},{"gpio":6,"type":"relay"}]"#);
    rig.deliver("actuator/4/command", "on");
    rig.deliver("actuator/6/command", "on");

    rig.deliver("actuator/4/emergency", r#"{"action":"stop"}"#);
    assert!(!rig.pins.level(4));
    assert!(rig.pins.level(6), "others keep running");
    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["command"], "STOP");
    assert_eq!(resp["message"], "stopped");

    rig.deliver("actuator/4/command", "on");
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["message"], "actuator emergency stopped");

    rig.deliver("actuator/4/emergency", CLEAR);
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["command"], "CLEAR");
    assert_eq!(resp["success"], true);
    rig.deliver("actuator/4/command", "on");
    assert!(rig.pins.level(4));

    rig.deliver("actuator/4/emergency", r#"{"action":"resume"}"#);
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["command"], "RESUME");
    assert_eq!(resp["message"], "invalid command");
}

#[test]
fn single_actuator_clear_refused_during_system_stop() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);

    rig.deliver("actuator/4/emergency", CLEAR);
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], "not allowed in state ACTIVE");
    assert!(rig.app.registry().get(4).unwrap().is_emergency_stopped());
}

// ── Local triggers ───────────────────────────────────────────

#[test]
fn hardware_fault_signal_enters_active() {
    let mut rig = rig_with(r#"[{"gpio":5,"type":"pump"}]"#);
    rig.deliver("actuator/5/command", "on");

    rig.app
        .signal_hardware_fault("overcurrent", &mut rig.pins, &mut rig.sink, rig.now);

    assert_eq!(rig.app.emergency_state(), EmergencyState::Active);
    assert!(!rig.pins.level(5));
    assert_eq!(rig.app.safety().reason(), "overcurrent");
    assert!(rig.sink.events.iter().any(|(sev, code, _)| {
        *sev == Severity::Critical && *code == EventCode::HardwareFault
    }));
}

#[test]
fn actuator_configured_during_emergency_starts_latched() {
    let mut rig = rig_with(r#"[{"gpio":4,"type":"relay"}]"#);
    rig.deliver("emergency", STOP);

    let resp = rig.configure(r#"[{"gpio":7,"type":"relay","default_state":1}]"#);
    assert_eq!(resp["success"], true);
    let driver = rig.app.registry().get(7).unwrap();
    assert!(driver.is_emergency_stopped());
    assert!(!driver.is_energized());
    assert!(!rig.pins.level(7), "boot default is ignored while stopped");

    rig.advance(5_000);
    rig.deliver("emergency", CLEAR);
    rig.advance(2_000);
    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);
    assert!(!rig.app.registry().get(7).unwrap().is_emergency_stopped());
}
