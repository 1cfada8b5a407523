//! File-writer boundary consumed by the render engine: `open` a path for a
//! format, stream interleaved blocks, `finalize`. The engine ships a WAV
//! implementation; other containers register their own factory.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Wav,
    Aiff,
    Flac,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Wav => "wav",
            OutputFormat::Aiff => "aiff",
            OutputFormat::Flac => "flac",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    Int16,
    Int24,
    Int32,
    Float32,
}

impl BitDepth {
    pub fn bits(&self) -> u16 {
        match self {
            BitDepth::Int16 => 16,
            BitDepth::Int24 => 24,
            BitDepth::Int32 | BitDepth::Float32 => 32,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bits() as usize / 8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: BitDepth,
}

pub trait FileWriter: Send {
    /// Append one interleaved block of finished samples.
    fn write_block(&mut self, interleaved: &[f32]) -> Result<()>;

    /// Flush headers and close. Consumes the writer; a file that was never
    /// finalized is not guaranteed to be readable.
    fn finalize(self: Box<Self>) -> Result<()>;
}

pub trait WriterFactory: Send + Sync {
    fn open(&self, path: &Path, spec: WriterSpec) -> Result<Box<dyn FileWriter>>;
}

/// Format-keyed registry of writer factories. WAV is built in; collaborators
/// register AIFF/FLAC implementations at startup.
pub struct WriterRegistry {
    factories: HashMap<OutputFormat, Box<dyn WriterFactory>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register(OutputFormat::Wav, Box::new(WavWriterFactory));
        registry
    }

    pub fn register(&mut self, format: OutputFormat, factory: Box<dyn WriterFactory>) {
        self.factories.insert(format, factory);
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        self.factories.contains_key(&format)
    }

    pub fn open(&self, format: OutputFormat, path: &Path, spec: WriterSpec) -> Result<Box<dyn FileWriter>> {
        match self.factories.get(&format) {
            Some(factory) => factory.open(path, spec),
            None => Err(EngineError::Render(format!(
                "no writer registered for {} output",
                format.extension()
            ))),
        }
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct WavWriterFactory;

impl WriterFactory for WavWriterFactory {
    fn open(&self, path: &Path, spec: WriterSpec) -> Result<Box<dyn FileWriter>> {
        let wav_spec = WavSpec {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bit_depth.bits(),
            sample_format: match spec.bit_depth {
                BitDepth::Float32 => SampleFormat::Float,
                _ => SampleFormat::Int,
            },
        };
        let writer = WavWriter::create(path, wav_spec)
            .map_err(|e| EngineError::Render(format!("failed to create {}: {e}", path.display())))?;
        Ok(Box::new(WavFileWriter {
            writer,
            bit_depth: spec.bit_depth,
            dither: StdRng::from_os_rng(),
        }))
    }
}

struct WavFileWriter {
    writer: WavWriter<BufWriter<File>>,
    bit_depth: BitDepth,
    dither: StdRng,
}

impl WavFileWriter {
    /// TPDF dither of one LSB, applied when truncating to integer widths.
    #[inline]
    fn dither_sample(&mut self, sample: f32, scale: f32) -> f32 {
        let noise: f32 = self.dither.random::<f32>() - self.dither.random::<f32>();
        sample * scale + noise
    }
}

impl FileWriter for WavFileWriter {
    fn write_block(&mut self, interleaved: &[f32]) -> Result<()> {
        for &sample in interleaved {
            let clamped = sample.clamp(-1.0, 1.0);
            match self.bit_depth {
                BitDepth::Int16 => {
                    let v = self.dither_sample(clamped, i16::MAX as f32);
                    self.writer
                        .write_sample(v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
                        .map_err(|e| EngineError::Render(e.to_string()))?;
                }
                BitDepth::Int24 => {
                    let v = self.dither_sample(clamped, 8_388_607.0);
                    self.writer
                        .write_sample(v.round().clamp(-8_388_608.0, 8_388_607.0) as i32)
                        .map_err(|e| EngineError::Render(e.to_string()))?;
                }
                BitDepth::Int32 => {
                    let v = (clamped as f64 * i32::MAX as f64).round();
                    self.writer
                        .write_sample(v.clamp(i32::MIN as f64, i32::MAX as f64) as i32)
                        .map_err(|e| EngineError::Render(e.to_string()))?;
                }
                BitDepth::Float32 => {
                    self.writer
                        .write_sample(clamped)
                        .map_err(|e| EngineError::Render(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        self.writer.finalize().map_err(|e| EngineError::Render(e.to_string()))
    }
}

/// Expand a render filename template: `{project}`, `{date}` and `{bus}` are
/// substituted, and the format extension is appended when missing.
pub fn expand_filename_template(
    template: &str,
    project: &str,
    bus: &str,
    format: OutputFormat,
) -> String {
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let mut name = template
        .replace("{project}", project)
        .replace("{date}", &date)
        .replace("{bus}", bus);
    let ext = format!(".{}", format.extension());
    if !name.ends_with(&ext) {
        name.push_str(&ext);
    }
    name
}
