//! Integration tests for the AppService → registry → pins pipeline.
//!
//! These run on the host (x86_64) and verify the full dispatch chain from
//! an inbound broker message down to a GPIO write and back out as
//! response / status / config-response messages.

use aquanode::app::events::{EventCode, Severity};
use aquanode::app::ports::{ConfigPort, PinOwner, PinPort, Qos, StoreError, MAX_ACTUATORS};
use aquanode::app::service::AppService;
use aquanode::config::SystemConfig;
use aquanode::drivers::actuator::ActuatorConfig;
use aquanode::safety::EmergencyState;

use crate::mock_hw::{
    test_clock, MockBroker, MockPins, MockStore, PinWrite, RecordingSink, Rig, DEVICE,
};

const RELAY_4: &str = r#"[{"gpio":4,"type":"relay","name":"lights","zone":"bed-1"}]"#;

fn rig_with_relay() -> Rig {
    let mut rig = Rig::new();
    let resp = rig.configure(RELAY_4);
    assert_eq!(resp["success"], true, "{resp}");
    rig.broker_mut().clear();
    rig
}

// ── Startup ──────────────────────────────────────────────────

#[test]
fn start_subscribes_connects_and_announces_state() {
    let rig = Rig::new();

    let subs = &rig.broker().subscriptions;
    assert_eq!(subs.len(), 4, "{subs:?}");
    assert!(subs.iter().any(|s| s.ends_with("/actuator/+/command")));
    assert!(subs.iter().any(|s| s.ends_with("/emergency")));
    assert!(subs.iter().any(|s| s.ends_with("/config")));

    let state = rig.broker().last_on("emergency/state").unwrap();
    assert_eq!(state["state"], "NORMAL");

    assert!(rig.sink.has(EventCode::Started));
    assert!(rig.sink.has(EventCode::Connected));
    assert!(rig.app.topics().base().ends_with(DEVICE));
}

#[test]
fn stored_actuators_are_restored_de_energised() {
    let mut seed = Rig::new();
    seed.configure(r#"[{"gpio":4,"type":"relay","default_state":1}]"#);
    let stored = seed.store.actuators.clone().unwrap();

    let rig = Rig::with(Rig::config(), MockStore { actuators: Some(stored), ..MockStore::default() });
    assert_eq!(rig.app.registry().len(), 1);
    assert_eq!(rig.pins.owner_of(4), Some(PinOwner::Actuator { slot: 4 }));
    // Boot default applies: relay comes up on.
    assert!(rig.pins.level(4));
}

/// Store whose every record fails to decode.
struct CorruptStore;

impl ConfigPort for CorruptStore {
    fn load(&self) -> Result<SystemConfig, StoreError> {
        Err(StoreError::Corrupted)
    }

    fn save(&mut self, _: &SystemConfig) -> Result<(), StoreError> {
        Ok(())
    }

    fn load_actuators(&self) -> Result<heapless::Vec<ActuatorConfig, MAX_ACTUATORS>, StoreError> {
        Err(StoreError::Corrupted)
    }

    fn save_actuators(&mut self, _: &[ActuatorConfig]) -> Result<(), StoreError> {
        Ok(())
    }
}

#[test]
fn corrupt_store_is_reported_not_fatal() {
    let mut pins = MockPins::new();
    let mut sink = RecordingSink::new();
    let mut app = AppService::new(MockBroker::new(), Rig::config(), "AQ-BROKEN", test_clock);

    app.start(&mut pins, &CorruptStore, &mut sink, 0);

    assert!(sink.events.iter().any(|(sev, code, _)| {
        *sev == Severity::Error && *code == EventCode::StorageFailed
    }));
    assert!(app.registry().is_empty());
    assert!(app.link().is_connected(), "boot continues without stored actuators");
}

// ── Configuration ────────────────────────────────────────────

#[test]
fn configure_creates_driver_persists_and_reports_status() {
    let mut rig = Rig::new();
    let resp = rig.configure(RELAY_4);

    assert_eq!(resp["success"], true);
    assert_eq!(resp["applied"], 1);
    assert_eq!(resp["persisted"], true);
    assert_eq!(rig.store.actuators.as_ref().unwrap().len(), 1);

    let status = rig.broker().last_on("actuator/4/status").unwrap();
    assert_eq!(status["type"], "relay");
    assert_eq!(status["name"], "lights");
    assert_eq!(status["state"], false);
}

#[test]
fn gpio_conflict_rejects_item_without_building_driver() {
    let mut rig = Rig::new();
    rig.pins.claim_for_sensor(5);

    let resp = rig.configure(
        r#"[{"gpio":5,"type":"relay"},{"gpio":6,"type":"relay"}]"#,
    );

    assert_eq!(resp["success"], false);
    assert_eq!(resp["applied"], 1);
    let errors = resp["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "GPIO_CONFLICT");
    assert_eq!(errors[0]["index"], 0);
    assert_eq!(errors[0]["gpio"], 5);

    assert!(rig.app.registry().get(5).is_none());
    assert!(rig.app.registry().get(6).is_some());
    assert_eq!(rig.pins.owner_of(5), Some(PinOwner::Sensor), "claim must not be taken over");
    assert!(rig.pins.writes.iter().all(|w| !matches!(w, PinWrite::Digital(5, _))));
}

#[test]
fn valve_aux_pin_conflict_leaves_primary_unclaimed() {
    let mut rig = Rig::new();
    rig.pins.claim_for_sensor(8);

    let resp = rig.configure(r#"[{"gpio":7,"aux_gpio":8,"type":"valve"}]"#);

    assert_eq!(resp["errors"][0]["code"], "GPIO_CONFLICT");
    assert_eq!(rig.pins.owner_of(7), None);
    assert!(rig.app.registry().is_empty());
}

#[test]
fn storage_failure_keeps_applied_config_and_reports_it() {
    let mut rig = Rig::new();
    rig.store.fail_writes = true;

    let resp = rig.configure(RELAY_4);

    assert_eq!(resp["applied"], 1);
    assert_eq!(resp["persisted"], false);
    assert_eq!(resp["success"], false);
    assert_eq!(resp["errors"][0]["code"], "STORAGE_WRITE_FAILED");
    assert!(rig.app.registry().get(4).is_some(), "runtime state stays applied");
    assert!(rig.sink.has(EventCode::StorageFailed));
}

#[test]
fn malformed_config_payload_is_rejected_whole() {
    let mut rig = Rig::new();
    let resp = rig.configure("{not json");
    assert_eq!(resp["success"], false);
    assert_eq!(resp["applied"], 0);
    assert_eq!(resp["errors"][0]["code"], "PARSE_ERROR");
    assert_eq!(rig.store.saves, 0);
}

#[test]
fn inactive_item_removes_actuator_and_releases_pins() {
    let mut rig = rig_with_relay();
    let resp = rig.configure(r#"[{"gpio":4,"type":"relay","active":false}]"#);

    assert_eq!(resp["success"], true);
    assert!(rig.app.registry().get(4).is_none());
    assert_eq!(rig.pins.owner_of(4), None);
    assert!(rig.store.actuators.as_ref().unwrap().is_empty());
}

#[test]
fn reconfigure_replaces_driver_in_place() {
    let mut rig = rig_with_relay();
    rig.deliver("actuator/4/command", r#"{"command":"ON"}"#);
    assert!(rig.pins.level(4));

    let resp = rig.configure(r#"[{"gpio":4,"type":"relay","inverted":true,"name":"lights-v2"}]"#);
    assert_eq!(resp["success"], true);

    let cfg = rig.app.registry().get(4).unwrap().config();
    assert_eq!(cfg.name.as_str(), "lights-v2");
    // Inverted and off: the pin idles high.
    assert!(rig.pins.level(4));
    assert!(!rig.app.registry().get(4).unwrap().is_energized());
    assert_eq!(rig.app.registry().len(), 1);
}

// ── Commands ─────────────────────────────────────────────────

#[test]
fn on_off_commands_drive_pin_and_respond() {
    let mut rig = rig_with_relay();

    rig.deliver("actuator/4/command", r#"{"command":"ON"}"#);
    assert!(rig.pins.level(4));
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["success"], true);
    assert_eq!(resp["command"], "ON");
    assert_eq!(resp["emergency_state"], "NORMAL");
    assert_eq!(rig.broker().last_on("actuator/4/status").unwrap()["state"], true);

    rig.deliver("actuator/4/command", "off");
    assert!(!rig.pins.level(4));

    let qos: Vec<Qos> = rig
        .broker()
        .published
        .iter()
        .filter(|p| p.topic.ends_with("/response"))
        .map(|p| p.qos)
        .collect();
    assert!(qos.iter().all(|q| *q == Qos::AtLeastOnce));
}

#[test]
fn pwm_set_scales_duty() {
    let mut rig = Rig::new();
    rig.configure(r#"[{"gpio":9,"type":"pwm"}]"#);
    rig.deliver("actuator/9/command", r#"{"command":"SET","value":0.5}"#);
    let duty = rig.pins.duty(9);
    assert!((126..=129).contains(&duty), "duty {duty}");

    rig.deliver("actuator/9/command", r#"{"command":"SET","value":1.5}"#);
    let resp = rig.broker().last_on("actuator/9/response").unwrap();
    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], "value out of range");
}

#[test]
fn unknown_actuator_and_bad_payload_get_failure_responses() {
    let mut rig = rig_with_relay();

    rig.deliver("actuator/12/command", r#"{"command":"ON"}"#);
    let resp = rig.broker().last_on("actuator/12/response").unwrap();
    assert_eq!(resp["success"], false);
    assert_eq!(resp["message"], "unknown actuator");

    rig.deliver("actuator/4/command", "explode");
    let resp = rig.broker().last_on("actuator/4/response").unwrap();
    assert_eq!(resp["command"], "INVALID");
    assert_eq!(resp["message"], "invalid command");
    assert!(rig.sink.has(EventCode::CommandRejected));
}

#[test]
fn command_burst_is_rate_limited() {
    let mut rig = rig_with_relay();

    for _ in 0..16 {
        rig.deliver("actuator/4/command", r#"{"command":"TOGGLE"}"#);
    }

    let responses = rig.broker().on("actuator/4/response");
    assert_eq!(responses.len(), 16);
    assert_eq!(responses[0]["success"], true, "fresh bucket accepts");
    assert!(
        responses.iter().any(|r| r["message"] == "rate limited"),
        "bucket must run dry within the burst"
    );
}

#[test]
fn runtime_cap_cuts_pump_and_cooldown_refuses() {
    let mut rig = Rig::new();
    rig.configure(
        r#"[{"gpio":5,"type":"pump","protection":{"max_runtime_ms":1000,"cooldown_ms":5000}}]"#,
    );
    rig.deliver("actuator/5/command", "on");
    assert!(rig.pins.level(5));

    rig.advance(1_000);
    assert!(!rig.pins.level(5), "pump must stop itself at the cap");
    assert!(rig.sink.has(EventCode::RuntimeCutoff));
    assert_eq!(rig.broker().last_on("actuator/5/alert").unwrap()["alert_type"], "runtime_limit");

    rig.deliver("actuator/5/command", "on");
    assert!(!rig.pins.level(5));
    let resp = rig.broker().last_on("actuator/5/response").unwrap();
    assert_eq!(resp["success"], false);
    assert_eq!(rig.broker().last_on("actuator/5/alert").unwrap()["alert_type"], "runtime_cooldown");
    assert!(rig.sink.has(EventCode::ProtectionRefused));

    rig.advance(5_000);
    rig.deliver("actuator/5/command", "on");
    assert!(rig.pins.level(5), "cooldown over");
}

#[test]
fn resending_config_keeps_runtime_cooldown() {
    let mut rig = Rig::new();
    let pump = r#"[{"gpio":5,"type":"pump","protection":{"max_runtime_ms":1000,"cooldown_ms":60000}}]"#;
    rig.configure(pump);
    rig.deliver("actuator/5/command", "on");
    rig.advance(1_000);
    assert!(!rig.pins.level(5), "cut off at the cap");

    let resp = rig.configure(pump);
    assert_eq!(resp["success"], true);
    rig.deliver("actuator/5/command", "on");

    assert!(!rig.pins.level(5), "cooldown survives reconfiguration");
    assert_eq!(rig.broker().last_on("actuator/5/alert").unwrap()["alert_type"], "runtime_cooldown");
    assert!(rig.app.registry().get(5).unwrap().status(rig.now).cooling_down);

    rig.advance(60_000);
    rig.deliver("actuator/5/command", "on");
    assert!(rig.pins.level(5));
}

#[test]
fn resending_config_keeps_activation_window() {
    let mut rig = Rig::new();
    let pump = r#"[{"gpio":5,"type":"pump","protection":{"max_activations_per_window":2,"window_ms":60000}}]"#;
    rig.configure(pump);

    let mut energised = 0;
    for _ in 0..3 {
        for _ in 0..2 {
            rig.deliver("actuator/5/command", "on");
            if rig.pins.level(5) {
                energised += 1;
            }
            rig.deliver("actuator/5/command", "off");
            rig.advance(1_000);
        }
        rig.configure(pump);
    }

    assert_eq!(energised, 2, "window budget spans reconfigurations");
    assert_eq!(rig.app.registry().get(5).unwrap().status(rig.now).activations_in_window, 2);
    assert_eq!(rig.broker().last_on("actuator/5/alert").unwrap()["alert_type"], "duty_cycle_limit");
}

#[test]
fn write_failure_latches_actuator() {
    let mut rig = rig_with_relay();
    rig.pins.failing.insert(4);

    rig.deliver("actuator/4/command", "on");

    assert!(rig.sink.has(EventCode::HardwareFault));
    assert!(rig.app.registry().get(4).unwrap().is_emergency_stopped());
    assert_eq!(rig.broker().last_on("actuator/4/alert").unwrap()["alert_type"], "emergency_stop");
    // The system as a whole keeps running.
    assert_eq!(rig.app.emergency_state(), EmergencyState::Normal);
}

#[test]
fn periodic_status_and_heartbeat() {
    let mut rig = rig_with_relay();

    rig.advance(60_000);
    let hb = rig.broker().last_on("heartbeat").unwrap();
    assert_eq!(hb["emergency_state"], "NORMAL");
    assert_eq!(hb["actuators"], 1);
    assert_eq!(hb["breaker"], "closed");
    let hb_qos = rig.broker().published.iter().find(|p| p.topic.ends_with("heartbeat")).unwrap().qos;
    assert_eq!(hb_qos, Qos::AtMostOnce);

    rig.broker_mut().clear();
    rig.advance(300_000);
    assert_eq!(rig.broker().on("actuator/4/status").len(), 1);
}
