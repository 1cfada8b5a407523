use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::bus::BusId;

/// A timestamped MIDI event delivered by the note editor / step sequencer.
/// `frame` is the offset in samples from the start of the current block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame: u32,
    pub track: BusId,
    pub message: MidiMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    PitchBend { channel: u8, value: i16 },
    Aftertouch { channel: u8, pressure: u8 },
}

impl MidiMessage {
    /// Normalized control value in [0, 1] for messages that carry one.
    pub fn control_value(&self) -> Option<f32> {
        match self {
            MidiMessage::ControlChange { value, .. } => Some(*value as f32 / 127.0),
            MidiMessage::PitchBend { value, .. } => {
                Some((*value as f32 / 8192.0 + 1.0) / 2.0)
            }
            MidiMessage::Aftertouch { pressure, .. } => Some(*pressure as f32 / 127.0),
            _ => None,
        }
    }
}

/// Per-block event list. Inline capacity covers typical block densities
/// without allocating on the audio thread.
pub type MidiBlock = SmallVec<[MidiEvent; 32]>;

/// A MIDI event scheduled on the session timeline, as delivered by the note
/// editor / step sequencer for offline rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMidi {
    pub seconds: f64,
    pub track: BusId,
    pub message: MidiMessage,
}

impl ScheduledMidi {
    /// Place this event inside a block starting at `block_start` seconds.
    pub fn at_block(&self, block_start: f64, sample_rate: f64) -> MidiEvent {
        let frame = ((self.seconds - block_start).max(0.0) * sample_rate) as u32;
        MidiEvent { frame, track: self.track, message: self.message }
    }
}

/// Splits a block's events by destination track without allocating per call.
pub fn events_for_track<'a>(
    events: &'a [MidiEvent],
    track: BusId,
) -> impl Iterator<Item = &'a MidiEvent> {
    events.iter().filter(move |e| e.track == track)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_values_normalized() {
        let cc = MidiMessage::ControlChange { channel: 0, controller: 7, value: 127 };
        assert_eq!(cc.control_value(), Some(1.0));

        let bend = MidiMessage::PitchBend { channel: 0, value: 0 };
        assert!((bend.control_value().unwrap() - 0.5).abs() < 1e-4);

        let on = MidiMessage::NoteOn { channel: 0, pitch: 60, velocity: 100 };
        assert_eq!(on.control_value(), None);
    }
}
