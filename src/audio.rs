//! Live audio driver: owns the output stream and runs the session's block
//! loop inside the device callback.
//!
//! The callback drains the control command queue once per block (the block
//! boundary every staged change lands on), processes the graph and
//! interleaves into the device buffer. Loss of the device itself is the one
//! fatal condition and is surfaced distinctly from recoverable errors.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::constants::MAX_BLOCK_SIZE;
use crate::error::{EngineError, Result};
use crate::messages::{EngineCommand, EngineEvent};
use crate::metering::MeterBank;
use crate::midi::MidiEvent;
use crate::parameter::ParameterSet;
use crate::session::Session;
use crate::transport::Transport;
use std::sync::Arc;

/// Capacity of the realtime MIDI ring between the sequencer thread and the
/// audio callback.
const MIDI_RING_CAPACITY: usize = 1024;

pub struct LiveEngine {
    stream: cpal::Stream,
    transport: Arc<Transport>,
    params: Arc<ParameterSet>,
    meters: MeterBank,
    midi_producer: Option<rtrb::Producer<MidiEvent>>,
}

impl LiveEngine {
    /// Move the session onto the default output device and start streaming.
    pub fn start(
        mut session: Session,
        commands: Receiver<EngineCommand>,
        events: Sender<EngineEvent>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceLost("no output device available".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::DeviceLost(e.to_string()))?;

        let device_rate = config.sample_rate().0 as f64;
        if (device_rate - session.sample_rate()).abs() > f64::EPSILON {
            log::warn!(
                "Device runs at {device_rate} Hz but the session was built for {} Hz",
                session.sample_rate()
            );
        }
        let channels = config.channels() as usize;
        log::info!(
            "Starting live engine on '{}' at {device_rate} Hz, {channels} channels",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        let transport = session.transport.clone();
        let params = session.params.clone();
        let meters = session.graph.meters();

        let mut block_l = vec![0.0f32; MAX_BLOCK_SIZE];
        let mut block_r = vec![0.0f32; MAX_BLOCK_SIZE];

        // MIDI comes in through a wait-free SPSC ring so the sequencer side
        // never contends with the callback.
        let (midi_producer, mut midi_consumer) =
            rtrb::RingBuffer::<MidiEvent>::new(MIDI_RING_CAPACITY);

        let callback_events = events.clone();
        let audio_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            while let Ok(cmd) = commands.try_recv() {
                if let Some(event) = session.apply_command(cmd) {
                    let _ = callback_events.try_send(event);
                }
            }
            while let Ok(event) = midi_consumer.pop() {
                session.queue_midi(event);
            }

            let total_frames = data.len() / channels;
            let mut done = 0;
            while done < total_frames {
                let frames = (total_frames - done).min(MAX_BLOCK_SIZE);
                session.process_block(&mut block_l[..frames], &mut block_r[..frames], frames);

                for i in 0..frames {
                    let frame = &mut data[(done + i) * channels..(done + i + 1) * channels];
                    match channels {
                        1 => frame[0] = (block_l[i] + block_r[i]) * 0.5,
                        _ => {
                            frame[0] = block_l[i];
                            frame[1] = block_r[i];
                            for extra in frame.iter_mut().skip(2) {
                                *extra = 0.0;
                            }
                        }
                    }
                }
                done += frames;
            }

            for (plugin, overruns) in session.host.take_overrun_warnings() {
                let _ = callback_events.try_send(EngineEvent::PerformanceWarning {
                    plugin,
                    overruns,
                });
            }
        };

        let error_events = events;
        let stream = device
            .build_output_stream(
                &config.config(),
                audio_callback,
                move |err| {
                    log::error!("Output stream error: {err}");
                    let _ = error_events.try_send(EngineEvent::DeviceLost(err.to_string()));
                },
                None,
            )
            .map_err(|e| EngineError::DeviceLost(e.to_string()))?;
        stream
            .play()
            .map_err(|e| EngineError::DeviceLost(e.to_string()))?;

        Ok(Self { stream, transport, params, meters, midi_producer: Some(midi_producer) })
    }

    /// Producer half of the MIDI input boundary; hand this to the note
    /// editor / step sequencer. Can only be taken once.
    pub fn take_midi_input(&mut self) -> Option<rtrb::Producer<MidiEvent>> {
        self.midi_producer.take()
    }

    /// Shared transport for position display and play/stop state.
    pub fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    /// Parameter registry for direct lock-free control writes.
    pub fn params(&self) -> Arc<ParameterSet> {
        self.params.clone()
    }

    /// Latest per-bus meter snapshots.
    pub fn meters(&self) -> MeterBank {
        self.meters.clone()
    }

    pub fn pause_stream(&self) -> Result<()> {
        self.stream
            .pause()
            .map_err(|e| EngineError::DeviceLost(e.to_string()))
    }

    pub fn resume_stream(&self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| EngineError::DeviceLost(e.to_string()))
    }
}
