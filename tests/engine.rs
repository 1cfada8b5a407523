//! End-to-end scenarios driving the whole engine: graph + host + automation
//! + metering together, the way a front end would.

use std::path::PathBuf;

use mixcore::automation::AutomationPoint;
use mixcore::bus::{BusKind, SendSpec};
use mixcore::constants::{PLUGIN_BUNDLE_EXTENSION, PLUGIN_MANIFEST_NAME};
use mixcore::messages::EngineCommand;
use mixcore::midi::{MidiEvent, MidiMessage};
use mixcore::parameter::{ParamKey, TrackControl};
use mixcore::Session;

fn write_bundle(dir: &PathBuf, name: &str, kind: &str, settings: serde_json::Value) -> PathBuf {
    let bundle = dir.join(format!("{name}.{PLUGIN_BUNDLE_EXTENSION}"));
    std::fs::create_dir_all(&bundle).unwrap();
    let manifest = serde_json::json!({
        "name": name, "kind": kind, "version": "1.0", "settings": settings,
    });
    std::fs::write(bundle.join(PLUGIN_MANIFEST_NAME), manifest.to_string()).unwrap();
    bundle
}

fn temp_dir(tag: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = std::env::temp_dir().join(format!("mixcore-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn group_send_scenario_compensates_bypassing_paths() {
    let dir = temp_dir("pdc");
    let bundle = write_bundle(&dir, "lookahead", "delay", serde_json::json!({ "samples": 64 }));

    // Master plus one group sending 100% to master; the group chain reports
    // 64 samples of latency.
    let mut session = Session::new("PDC", 44100.0, 256);
    let group = session
        .graph
        .create_bus(BusKind::Group, "Group", &session.params)
        .unwrap();
    session.graph.set_output(group, None).unwrap();
    session
        .graph
        .connect(group, session.graph.master(), SendSpec::post_fader(session.graph.master(), 1.0), &session.params)
        .unwrap();
    session.load_plugin(group, &bundle).unwrap();

    let direct = session.add_track("Direct").unwrap();
    session.graph.refresh_latency(&session.host);

    assert_eq!(
        session.graph.compensation_delay(direct, session.graph.master()),
        64,
        "path bypassing the group must be padded by the group's latency"
    );
    assert_eq!(
        session.graph.compensation_delay(group, session.graph.master()),
        0
    );
}

#[test]
fn midi_drives_instrument_through_graph_and_meters() {
    let dir = temp_dir("synth");
    let bundle = write_bundle(&dir, "tone", "sine", serde_json::Value::Null);

    let mut session = Session::new("Live", 48000.0, 256);
    let track = session.add_track("Lead").unwrap();
    session.load_plugin(track, &bundle).unwrap();
    session.transport.play();

    session.queue_midi(MidiEvent {
        frame: 0,
        track,
        message: MidiMessage::NoteOn { channel: 0, pitch: 60, velocity: 100 },
    });

    let mut out_l = vec![0.0f32; 256];
    let mut out_r = vec![0.0f32; 256];
    // Enough blocks for the loudness meter to complete its first 400 ms
    // measurement window.
    for _ in 0..100 {
        session.process_block(&mut out_l, &mut out_r, 256);
    }

    assert!(out_l.iter().any(|s| s.abs() > 0.001), "note should reach the master output");
    let master_reading = session.graph.latest_reading(session.graph.master()).unwrap();
    assert!(master_reading.peak_l > 0.001);
    let loudness = master_reading.loudness.expect("master carries a loudness analyzer");
    assert!(loudness.momentary_lufs.is_finite());
}

#[test]
fn automation_ramp_shapes_the_track_volume() {
    let mut session = Session::new("Ramp", 1000.0, 100);
    let track = session.add_track("Pad").unwrap();
    let key = ParamKey::TrackControl { bus: track, control: TrackControl::Volume };
    session.params.get(&key).unwrap().set_smoothing_ms(0.0);

    let lane = session.automation.create_lane(key.clone());
    lane.insert(0.0, AutomationPoint::linear(0.0));
    lane.insert(2.0, AutomationPoint::linear(1.0));

    session.transport.play();
    let mut out_l = vec![0.0f32; 100];
    let mut out_r = vec![0.0f32; 100];
    // 1 kHz sample rate, 100-frame blocks: the eleventh block starts at
    // exactly t = 1.0 s.
    for _ in 0..11 {
        session.process_block(&mut out_l, &mut out_r, 100);
    }
    // The volume parameter now carries the lane's midpoint value.
    let volume = session.graph.bus(track).unwrap().strip.volume;
    assert!((volume - 0.5).abs() < 0.06, "expected ~0.5 at 1 s, got {volume}");
}

#[test]
fn commands_route_midi_and_structure_changes_through_the_block_loop() {
    let mut session = Session::new("Cmd", 44100.0, 128);
    let event = session.apply_command(EngineCommand::CreateBus {
        kind: BusKind::Track,
        name: "Keys".into(),
    });
    let id = match event {
        Some(mixcore::messages::EngineEvent::BusAdded(id)) => id,
        other => panic!("unexpected event {other:?}"),
    };

    // A connect that would close a cycle is rejected and reported.
    let bad = session.apply_command(EngineCommand::Connect {
        from: session.graph.master(),
        to: id,
        send: SendSpec::post_fader(id, 1.0),
    });
    assert!(matches!(bad, Some(mixcore::messages::EngineEvent::Error(_))));
}

#[test]
fn unload_is_idempotent_and_clears_latency() {
    let dir = temp_dir("unload");
    let bundle = write_bundle(&dir, "lag", "delay", serde_json::json!({ "samples": 32 }));

    let mut session = Session::new("Unload", 44100.0, 256);
    let track = session.add_track("Gtr").unwrap();
    let plugin = session.load_plugin(track, &bundle).unwrap();
    session.graph.refresh_latency(&session.host);
    assert_eq!(session.host.chain_latency(&[plugin]), 32);

    session.unload_plugin(track, plugin);
    assert!(session.graph.bus(track).unwrap().effects.is_empty());
    assert_eq!(session.host.chain_latency(&[plugin]), 0);
    // Second unload of the same id is a no-op.
    session.unload_plugin(track, plugin);
}
