//! mixcore: the real-time signal-processing core of a digital audio
//! workstation. Routes audio from tracks through a bus graph with plugin
//! delay compensation, hosts processing/instrument plugins behind one
//! capability interface, automates their parameters, measures loudness to
//! EBU R128 / ITU-R BS.1770-4, and renders the result to disk.

pub mod audio;
pub mod audio_utils;
pub mod automation;
pub mod automation_engine;
pub mod bus;
pub mod bus_graph;
pub mod config;
pub mod constants;
pub mod error;
pub mod file_writer;
pub mod loudness;
pub mod messages;
pub mod metering;
pub mod midi;
pub mod native_dsp;
pub mod parameter;
pub mod pdc;
pub mod plugin_api;
pub mod plugin_host;
pub mod render;
pub mod session;
pub mod time_utils;
pub mod transport;

pub use bus::{Bus, BusId, BusKind, SendSpec};
pub use error::{EngineError, PluginLoadError, Result};
pub use session::Session;
