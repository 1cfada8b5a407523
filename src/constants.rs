// Audio Engine Constants
pub const MAX_BLOCK_SIZE: usize = 8192;
pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;
pub const DEFAULT_BPM: f32 = 120.0;
pub const DEFAULT_MASTER_VOLUME: f32 = 0.8;
pub const DEFAULT_TRACK_VOLUME: f32 = 0.7;

// Parameter smoothing
pub const DEFAULT_SMOOTHING_MS: f32 = 10.0;

// Automation
pub const DEFAULT_GRID_SNAP: f64 = 0.25;
pub const UNDO_STACK_LIMIT: usize = 100;

// Bus graph
pub const SILENCE_THRESHOLD: f32 = 0.001; // -60dB
pub const DEFAULT_IDLE_BLOCK_COUNT: u32 = 16;

// Metering
pub const METER_RELEASE_PER_SEC: f32 = 11.8; // dB/s fallback release
pub const PEAK_HOLD_SECONDS: f32 = 2.0;
pub const DEFAULT_RMS_WINDOW_MS: f32 = 300.0;

// Loudness measurement
pub const MOMENTARY_WINDOW_MS: f64 = 400.0;
pub const SHORT_TERM_WINDOW_MS: f64 = 3000.0;
pub const GATING_BLOCK_OVERLAP: f64 = 0.75;
pub const ABSOLUTE_GATE_LUFS: f64 = -70.0;
pub const RELATIVE_GATE_LU: f64 = -10.0;
pub const TRUE_PEAK_OVERSAMPLE: usize = 4;

// Render
pub const RENDER_CHUNK_FRAMES: usize = 4096;
pub const DEFAULT_TRUE_PEAK_CEILING_DB: f64 = -1.0;
pub const LIMITER_RELEASE_MS: f32 = 50.0;

// Channel Configuration
pub const COMMAND_QUEUE_SIZE: usize = 256;

// File Extensions
pub const SESSION_EXTENSION: &str = "mixcore";
pub const PLUGIN_BUNDLE_EXTENSION: &str = "mixplug";
pub const PLUGIN_MANIFEST_NAME: &str = "manifest.json";
