//! End-to-end controller scenarios: a beacon arrives, commands go out,
//! reports come back, pulses expire, devices fall silent.

use lantuya::controller::{Action, Controller, ExchangeKind, ExchangeOutcome, ExchangeSpec};
use lantuya::crypto::{discovery_key, local_key, TuyaCipher};
use lantuya::discovery;
use lantuya::events::EventKind;
use lantuya::messages::{extract_dps_bool, parse_beacon};
use lantuya::protocol::{pack_frame, unpack_frame, CommandType, Version};
use serde_json::json;
use std::net::Ipv4Addr;

const KEY: &str = "0123456789abcdef";
const SOURCE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

/// Frame a beacon payload the way a v3.3 device broadcasts it: 55AA
/// envelope, zero status code, body encrypted with the discovery key.
fn encrypted_beacon(payload: &[u8]) -> Vec<u8> {
    use byteorder::{BigEndian, WriteBytesExt};
    use crc::{Crc, CRC_32_ISO_HDLC};

    let body = TuyaCipher::new(&discovery_key()).unwrap().encrypt(payload);
    let mut frame = Vec::new();
    frame.write_u32::<BigEndian>(0x0000_55AA).unwrap();
    frame.write_u32::<BigEndian>(0).unwrap();
    frame.write_u32::<BigEndian>(19).unwrap();
    frame.write_u32::<BigEndian>((4 + body.len() + 8) as u32).unwrap();
    frame.write_u32::<BigEndian>(0).unwrap();
    frame.extend_from_slice(&body);
    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&frame);
    frame.write_u32::<BigEndian>(crc).unwrap();
    frame.write_u32::<BigEndian>(0x0000_AA55).unwrap();
    frame
}

fn configured_controller() -> Controller {
    let mut controller = Controller::new();
    let config = serde_json::from_value(json!({
        "devices": [
            {"name": "lamp", "id": "abc123", "model": "keyXYZ", "key": KEY}
        ],
        "models": [
            {"id": "keyXYZ", "name": "generic bulb", "control": 20}
        ]
    }))
    .unwrap();
    controller.apply_config(&config);
    controller.take_changed();
    controller
}

fn detect(controller: &mut Controller, now: i64) {
    let beacon = parse_beacon(
        br#"{"gwId":"abc123","productKey":"keyXYZ","version":"3.3","encrypt":true}"#,
    )
    .unwrap();
    controller.beacon(&beacon, SOURCE, now);
}

fn opens(actions: &[Action]) -> Vec<&ExchangeSpec> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Open(spec) => Some(spec),
            _ => None,
        })
        .collect()
}

fn report(controller: &mut Controller, spec: &ExchangeSpec, value: bool, now: i64) {
    controller.outcome(
        &ExchangeOutcome {
            device: spec.device,
            generation: spec.generation,
            observed: Some(value),
        },
        now,
    );
}

#[test]
fn discover_unknown_device() {
    // A v3.3 beacon on :6667 from an unknown gwId inserts a placeholder.
    let payload = br#"{"ip":"192.168.1.42","gwId":"abc123","productKey":"keyXYZ","version":"3.3"}"#;
    let datagram = encrypted_beacon(payload);
    let beacon = discovery::decode_beacon(discovery::ENCRYPTED_PORT, &datagram).unwrap();

    let mut controller = Controller::new();
    controller.beacon(&beacon, SOURCE, 1000);

    assert_eq!(controller.device_count(), 1);
    assert_eq!(controller.device_name(0), Some("new_0"));
    let entry = controller.devices().get(0).unwrap();
    assert_eq!(entry.model, "keyXYZ");
    assert_eq!(entry.host.as_deref(), Some("192.168.1.42"));
    assert!(controller.take_changed(), "table must be flagged for saving");
}

#[test]
fn command_steady() {
    let mut controller = configured_controller();
    detect(&mut controller, 1000);

    let mut actions = Vec::new();
    assert!(controller.set(0, true, 0, Some("ui"), 1000, &mut actions));

    let open = opens(&actions)[0];
    assert_eq!(open.kind, ExchangeKind::Control(true));
    assert_eq!(open.addr, SOURCE);
    assert_eq!(open.port, 6668);

    // The frame that would go over the wire decodes back to dps.20 == true.
    let frame = lantuya::messages::control_frame(&open.secret, 0, open.control, true, 1000).unwrap();
    let msg = unpack_frame(&frame, Some(&local_key(KEY)), Some(Version::V3_3)).unwrap();
    assert_eq!(msg.cmd, CommandType::Control as u32);
    assert!(extract_dps_bool(&msg.payload, 20).unwrap());
    let value: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(value["devId"], "abc123");
    assert_eq!(value["uid"], "abc123");

    assert_eq!(controller.devices().get(0).unwrap().pending, 1010);
}

#[test]
fn confirmation() {
    let mut controller = configured_controller();
    detect(&mut controller, 1000);

    let mut actions = Vec::new();
    controller.set(0, true, 0, Some("ui"), 1000, &mut actions);
    let open = opens(&actions)[0].clone();

    // The device pushes {"dps":{"20":true}} on the same socket.
    report(&mut controller, &open, true, 1002);

    assert!(controller.get(0));
    assert_eq!(controller.devices().get(0).unwrap().pending, 0);
    assert_eq!(controller.events().count(EventKind::Confirmed), 1);
}

#[test]
fn pulse_reverts_to_off() {
    let mut controller = configured_controller();
    detect(&mut controller, 100);

    let mut actions = Vec::new();
    controller.set(0, true, 3, Some("ui"), 100, &mut actions);
    let open = opens(&actions)[0].clone();
    report(&mut controller, &open, true, 101);
    assert!(controller.get(0));
    assert_eq!(controller.deadline(0), 103);

    // Past the deadline the controller synthesizes the off command.
    let actions = controller.tick(105);
    let entry = controller.devices().get(0).unwrap();
    assert!(!entry.commanded);
    assert_eq!(entry.deadline, 0);
    assert_eq!(entry.pending, 110, "pulse expiry arms the shorter window");
    let off = opens(&actions)
        .into_iter()
        .find(|s| s.kind == ExchangeKind::Control(false))
        .expect("an off command goes out")
        .clone();

    // The device reports off shortly after.
    report(&mut controller, &off, false, 106);
    let entry = controller.devices().get(0).unwrap();
    assert!(!entry.commanded);
    assert!(!entry.status);
    assert_eq!(entry.deadline, 0);
    assert_eq!(entry.pending, 0);
}

#[test]
fn silence_marks_device_failed() {
    let mut controller = configured_controller();
    detect(&mut controller, 1000);
    let mut actions = Vec::new();
    controller.set(0, true, 0, None, 1000, &mut actions);
    assert!(controller.devices().get(0).unwrap().exchange.is_some());

    // No beacon for more than 100 seconds.
    let actions = controller.tick(1101);
    assert_eq!(controller.failure(0), Some("silent"));
    assert!(!controller.get(0));
    let entry = controller.devices().get(0).unwrap();
    assert_eq!(entry.pending, 0);
    assert!(
        actions
            .iter()
            .any(|a| matches!(a, Action::Close { device: 0 })),
        "the in-flight socket is closed"
    );
    // The record itself is retained.
    assert_eq!(controller.device_count(), 1);
}

#[test]
fn external_override_adopts_observed_state() {
    let mut controller = configured_controller();
    detect(&mut controller, 1000);

    // Establish a confirmed on state.
    let mut actions = Vec::new();
    controller.set(0, true, 0, None, 1000, &mut actions);
    let open = opens(&actions)[0].clone();
    report(&mut controller, &open, true, 1001);
    assert!(controller.get(0));
    assert_eq!(controller.devices().get(0).unwrap().pending, 0);

    // Someone flips the device off behind our back; the next sense sees it.
    let actions = controller.tick(1035);
    let sense = opens(&actions)[0].clone();
    assert_eq!(sense.kind, ExchangeKind::Sense);
    report(&mut controller, &sense, false, 1036);

    assert!(!controller.get(0));
    assert!(!controller.commanded(0));
    assert_eq!(controller.events().count(EventKind::Changed), 1);
    assert_eq!(controller.devices().get(0).unwrap().pending, 0);
}

#[test]
fn codec_roundtrip_across_sizes_and_keys() {
    for (i, key) in [b"0123456789abcdef", b"fedcba9876543210"].into_iter().enumerate() {
        for len in [1usize, 64, 256, 900] {
            let payload: Vec<u8> = (0..len).map(|j| ((i + j) % 251) as u8).collect();
            for code in [CommandType::Control, CommandType::Query, CommandType::Status] {
                let frame = pack_frame(key, Version::V3_3, code, 42, &payload).unwrap();
                let msg = unpack_frame(&frame, Some(key), Some(Version::V3_3)).unwrap();
                assert_eq!(msg.cmd, code as u32);
                assert_eq!(msg.seqno, 42);
                assert_eq!(msg.payload, payload);
            }
        }
    }
}

#[test]
fn command_window_asymmetry() {
    // Set arms ten seconds, pulse expiry arms five.
    let mut controller = configured_controller();
    detect(&mut controller, 100);

    let mut actions = Vec::new();
    controller.set(0, true, 20, None, 100, &mut actions);
    assert_eq!(controller.devices().get(0).unwrap().pending, 110);

    let open = opens(&actions)[0].clone();
    report(&mut controller, &open, true, 101);

    let _ = controller.tick(120);
    let entry = controller.devices().get(0).unwrap();
    assert_eq!(entry.pending, 125, "pulse expiry arms now + 5");
}
