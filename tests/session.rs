//! Session integration tests: recording through the full MIDI path,
//! project round trips and node removal.

use loopgraph::control::{ControlAction, ControlSource, ControlTarget};
use loopgraph::dsp::{MidiMessage, TimestampedMidiMessage};
use loopgraph::engine::{AudioProcessor, MidiSource, NodeId};
use loopgraph::modules::{LoopState, LoopTrigger};
use loopgraph::persistence::ProjectError;
use loopgraph::{EngineConfig, Session};

const FRAMES: usize = 256;

struct Rig {
    session: Session,
    processor: AudioProcessor,
    looper: NodeId,
}

fn rig() -> Rig {
    let mut session = Session::new(EngineConfig::default());
    let midi_in = session.create_node("io.midi_in").unwrap();
    let looper = session.create_node("loop.midi").unwrap();
    let midi_out = session.create_node("io.midi_out").unwrap();
    session.graph_mut().connect_midi(midi_in, looper).unwrap();
    session.graph_mut().connect_midi(looper, midi_out).unwrap();
    let processor = session.take_audio_processor().unwrap();
    Rig {
        session,
        processor,
        looper,
    }
}

impl Rig {
    fn block(&mut self) {
        let mut output = vec![0.0; FRAMES * 2];
        self.processor.process(&mut output, 2);
        self.session.update();
    }

    fn play_note(&self, note: u8) {
        let message = TimestampedMidiMessage::new(
            MidiMessage::NoteOn {
                channel: 0,
                note,
                velocity: 100,
            },
            0,
        );
        self.session
            .dispatcher()
            .dispatch(&MidiSource::new(0, "Keys"), &message);
    }

    /// Records a few notes over four blocks and closes the loop.
    fn record(&mut self) {
        self.block();
        self.session
            .trigger_loop(self.looper, LoopTrigger::Record)
            .unwrap();
        for note in [60, 64, 67, 72] {
            self.play_note(note);
            self.block();
        }
        self.session
            .trigger_loop(self.looper, LoopTrigger::Stop)
            .unwrap();
        self.block();
    }
}

#[test]
fn recording_through_dispatcher() {
    let mut rig = rig();
    rig.record();

    let shared = rig.session.loops().get(rig.looper).unwrap();
    assert_eq!(shared.state(), LoopState::Playing);
    assert_eq!(shared.length(), 4 * FRAMES as u64);
}

#[test]
fn project_round_trip() {
    let mut rig = rig();
    rig.record();
    rig.session.set_master(Some(rig.looper)).unwrap();
    rig.session.surface().add_action(ControlAction::new(
        ControlSource::MidiCc {
            channel: Some(1),
            controller: 20,
        },
        ControlTarget {
            node: rig.looper,
            parameter: 12,
        },
    ));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("set.json");
    rig.session.save_project(&path, "Set").unwrap();

    let mut restored = Session::new(EngineConfig::default());
    restored.load_project(&path).unwrap();

    assert_eq!(restored.graph().node_count(), 3);
    assert_eq!(restored.graph().connection_count(), 2);
    assert_eq!(restored.loops().master_id(), Some(rig.looper));
    assert_eq!(restored.surface().actions(), rig.session.surface().actions());

    let original = rig.session.loops().get(rig.looper).unwrap();
    let loaded = restored.loops().get(rig.looper).unwrap();
    assert_eq!(loaded.length(), original.length());
    assert_eq!(loaded.state(), LoopState::Playing);
    assert_eq!(
        restored.to_project("Set").graph,
        rig.session.to_project("Set").graph
    );
}

#[test]
fn load_rejects_unknown_processor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(
        &path,
        r#"{"name":"Bad","version":1,"graph":{"nodes":[{"id":1,"type_id":"osc.sine"}],"connections":[]}}"#,
    )
    .unwrap();

    let mut rig = rig();
    let before = rig.session.graph().node_count();
    assert!(matches!(
        rig.session.load_project(&path),
        Err(ProjectError::Graph(_))
    ));
    assert_eq!(rig.session.graph().node_count(), before);
    assert_eq!(rig.session.loops().len(), 1);
}

#[test]
fn remove_node_cleans_up() {
    let mut rig = rig();
    rig.session.set_master(Some(rig.looper)).unwrap();
    rig.session.surface().add_action(ControlAction::new(
        ControlSource::MidiCc {
            channel: None,
            controller: 1,
        },
        ControlTarget {
            node: rig.looper,
            parameter: 0,
        },
    ));

    rig.session.remove_node(rig.looper).unwrap();

    assert!(!rig.session.graph().contains(rig.looper));
    assert!(!rig.session.graph().render_order().contains(&rig.looper));
    assert_eq!(rig.session.graph().connection_count(), 0);
    assert!(rig.session.loops().master_id().is_none());
    assert!(rig.session.surface().actions().is_empty());
    rig.block();
}

#[test]
fn parameter_change_drives_bound_parameter() {
    let mut rig = rig();
    let gain = rig.session.create_node("util.gain").unwrap();
    rig.session.surface().add_action(ControlAction::new(
        ControlSource::PluginParameter {
            node: gain,
            index: 0,
        },
        ControlTarget {
            node: rig.looper,
            parameter: 12,
        },
    ));

    rig.session.set_parameter(gain, 0, 1.0).unwrap();
    rig.block();
    rig.block();

    let quantize = rig
        .session
        .graph()
        .with_processor(rig.looper, |p| p.get_parameter(12))
        .unwrap();
    assert_eq!(quantize, 1.0);
}
