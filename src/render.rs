//! Offline render engine: a queue of jobs pulled through the session's
//! processing graph by a worker pool, with optional loudness normalization
//! and a true-peak limiter before the file writer.
//!
//! Each job rebuilds its own session from the serialized document, so a
//! running render shares no mutable state with live playback or with other
//! jobs. Output goes to a temporary path that is renamed on success and
//! deleted on cancellation or failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::atomic::AtomicCell;
use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audio_utils::db_to_linear_f64;
use crate::bus::BusId;
use crate::constants::{
    DEFAULT_TRUE_PEAK_CEILING_DB, LIMITER_RELEASE_MS, RENDER_CHUNK_FRAMES, TRUE_PEAK_OVERSAMPLE,
};
use crate::error::{EngineError, Result};
use crate::file_writer::{
    expand_filename_template, BitDepth, OutputFormat, WriterRegistry, WriterSpec,
};
use crate::loudness::measure_buffer;
use crate::midi::ScheduledMidi;
use crate::session::{Session, SessionDoc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoudnessSpec {
    /// Explicit integrated-loudness target in LUFS.
    Lufs(f64),
    /// Named streaming/broadcast preset, e.g. "spotify" or "broadcast".
    Platform(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTarget {
    pub lufs: f64,
    pub true_peak_ceiling_db: f64,
}

static PLATFORM_TARGETS: Lazy<HashMap<&'static str, LoudnessTarget>> = Lazy::new(|| {
    HashMap::from([
        ("spotify", LoudnessTarget { lufs: -14.0, true_peak_ceiling_db: -1.0 }),
        ("youtube", LoudnessTarget { lufs: -14.0, true_peak_ceiling_db: -1.0 }),
        ("tidal", LoudnessTarget { lufs: -14.0, true_peak_ceiling_db: -1.0 }),
        ("apple_music", LoudnessTarget { lufs: -16.0, true_peak_ceiling_db: -1.0 }),
        ("amazon_music", LoudnessTarget { lufs: -14.0, true_peak_ceiling_db: -2.0 }),
        ("broadcast", LoudnessTarget { lufs: -23.0, true_peak_ceiling_db: -1.0 }),
        ("netflix", LoudnessTarget { lufs: -27.0, true_peak_ceiling_db: -2.0 }),
    ])
});

impl LoudnessSpec {
    pub fn resolve(&self) -> Result<LoudnessTarget> {
        match self {
            LoudnessSpec::Lufs(lufs) => Ok(LoudnessTarget {
                lufs: *lufs,
                true_peak_ceiling_db: DEFAULT_TRUE_PEAK_CEILING_DB,
            }),
            LoudnessSpec::Platform(name) => PLATFORM_TARGETS
                .get(name.to_lowercase().as_str())
                .copied()
                .ok_or_else(|| {
                    EngineError::Config(format!("unknown loudness preset '{name}'"))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Draft,
    #[default]
    Standard,
    High,
    Mastering,
}

impl QualityPreset {
    fn chunk_frames(&self) -> usize {
        match self {
            QualityPreset::Draft => RENDER_CHUNK_FRAMES * 2,
            QualityPreset::Standard | QualityPreset::High => RENDER_CHUNK_FRAMES,
            QualityPreset::Mastering => RENDER_CHUNK_FRAMES / 2,
        }
    }

    /// Oversampling factor for the limiter's peak estimate.
    fn limiter_oversample(&self) -> usize {
        match self {
            QualityPreset::Draft => 1,
            _ => TRUE_PEAK_OVERSAMPLE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// Buses to capture: the master and/or named stems.
    pub targets: Vec<BusId>,
    pub format: OutputFormat,
    pub bit_depth: BitDepth,
    /// Downmix to a single channel instead of stereo.
    pub mono: bool,
    pub loudness: Option<LoudnessSpec>,
    pub quality: QualityPreset,
    /// Supports `{project}`, `{date}` and `{bus}` substitution.
    pub filename_template: String,
    pub out_dir: PathBuf,
    /// Timeline MIDI feeding instrument tracks, pre-collected from the note
    /// editor collaborator.
    pub midi: Vec<ScheduledMidi>,
}

/// Progress/cancellation handle shared with the job's submitter.
pub struct RenderJob {
    id: u64,
    status: AtomicCell<JobStatus>,
    progress: AtomicCell<f32>,
    cancel: AtomicBool,
    error: Mutex<Option<String>>,
    outputs: Mutex<Vec<PathBuf>>,
}

impl RenderJob {
    fn new(id: u64) -> Self {
        Self {
            id,
            status: AtomicCell::new(JobStatus::Queued),
            progress: AtomicCell::new(0.0),
            cancel: AtomicBool::new(false),
            error: Mutex::new(None),
            outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status.load()
    }

    /// Fraction of the requested range already processed.
    pub fn progress(&self) -> f32 {
        self.progress.load()
    }

    /// Cooperative cancellation, honored between chunks.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Finished output files (empty until completion).
    pub fn outputs(&self) -> Vec<PathBuf> {
        self.outputs.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status(),
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

struct WorkItem {
    job: Arc<RenderJob>,
    doc: SessionDoc,
    request: RenderRequest,
}

pub struct RenderEngine {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<u64, Arc<RenderJob>>>,
    queue_tx: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
}

impl RenderEngine {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<WorkItem>();
        let workers = (0..max_concurrent_jobs.max(1))
            .map(|i| {
                let rx: Receiver<WorkItem> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("mixcore-render-{i}"))
                    .spawn(move || {
                        while let Ok(item) = rx.recv() {
                            run_item(item);
                        }
                    })
                    .expect("spawn render worker")
            })
            .collect();
        Self {
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
            queue_tx: Some(tx),
            workers,
        }
    }

    /// Queue a render of the given session's current state. The returned
    /// handle reports progress and accepts cancellation.
    pub fn submit(&self, session: &Session, request: RenderRequest) -> Result<Arc<RenderJob>> {
        if request.end_seconds <= request.start_seconds {
            return Err(EngineError::Config("render range is empty".into()));
        }
        if request.targets.is_empty() {
            return Err(EngineError::Config("render has no target buses".into()));
        }
        for target in &request.targets {
            if session.graph.bus(*target).is_none() {
                return Err(EngineError::Config(format!("render target {target} does not exist")));
            }
        }
        if !WriterRegistry::new().supports(request.format) {
            return Err(EngineError::Render(format!(
                "no writer registered for {} output",
                request.format.extension()
            )));
        }
        if let Some(spec) = &request.loudness {
            spec.resolve()?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(RenderJob::new(id));
        self.jobs.lock().insert(id, job.clone());
        let item = WorkItem { job: job.clone(), doc: session.to_doc(), request };
        self.queue_tx
            .as_ref()
            .expect("engine not shut down")
            .send(item)
            .map_err(|_| EngineError::Render("render queue is closed".into()))?;
        log::info!("Queued render job {id}");
        Ok(job)
    }

    pub fn job(&self, id: u64) -> Option<Arc<RenderJob>> {
        self.jobs.lock().get(&id).cloned()
    }

    /// Drop bookkeeping for a finished job once its result was consumed.
    pub fn reap(&self, id: u64) {
        let mut jobs = self.jobs.lock();
        if jobs.get(&id).is_some_and(|j| j.is_finished()) {
            jobs.remove(&id);
        }
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        self.queue_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

enum RenderOutcome {
    Cancelled,
    Failed(String),
}

fn run_item(item: WorkItem) {
    let WorkItem { job, doc, request } = item;
    if job.is_cancelled() {
        job.status.store(JobStatus::Cancelled);
        return;
    }
    job.status.store(JobStatus::Running);
    match run_job(&job, &doc, &request) {
        Ok(outputs) => {
            *job.outputs.lock() = outputs;
            job.progress.store(1.0);
            job.status.store(JobStatus::Completed);
            log::info!("Render job {} completed", job.id);
        }
        Err(RenderOutcome::Cancelled) => {
            job.status.store(JobStatus::Cancelled);
            log::info!("Render job {} cancelled", job.id);
        }
        Err(RenderOutcome::Failed(msg)) => {
            *job.error.lock() = Some(msg.clone());
            job.status.store(JobStatus::Failed);
            log::error!("Render job {} failed: {msg}", job.id);
        }
    }
}

fn run_job(
    job: &RenderJob,
    doc: &SessionDoc,
    request: &RenderRequest,
) -> std::result::Result<Vec<PathBuf>, RenderOutcome> {
    let fail = |e: String| RenderOutcome::Failed(e);

    let chunk = request.quality.chunk_frames();
    let mut session =
        Session::from_doc(doc, chunk).map_err(|e| fail(format!("session rebuild: {e}")))?;
    let sample_rate = session.sample_rate();

    session.graph.set_captures(&request.targets);
    session.transport.set_position(request.start_seconds);
    session.transport.play();

    let total_frames =
        ((request.end_seconds - request.start_seconds) * sample_rate).round() as u64;
    let channels: u16 = if request.mono { 1 } else { 2 };

    // Final path per target, derived from the filename template. With
    // several targets the bus name is forced into the name so files stay
    // distinct.
    let template = if request.targets.len() > 1
        && !request.filename_template.contains("{bus}")
    {
        format!("{}-{{bus}}", request.filename_template)
    } else {
        request.filename_template.clone()
    };
    std::fs::create_dir_all(&request.out_dir).map_err(|e| fail(e.to_string()))?;

    struct TargetState {
        bus: BusId,
        final_path: PathBuf,
        temp_path: PathBuf,
        writer: Option<Box<dyn crate::file_writer::FileWriter>>,
        collected_l: Vec<f32>,
        collected_r: Vec<f32>,
    }

    fn cleanup(targets: &mut [TargetState]) {
        for t in targets {
            // Drop any open writer before unlinking its temp file.
            t.writer = None;
            let _ = std::fs::remove_file(&t.temp_path);
        }
    }

    let registry = WriterRegistry::new();
    let spec = WriterSpec {
        sample_rate: sample_rate as u32,
        channels,
        bit_depth: request.bit_depth,
    };

    // A loudness target needs the finished program before gain can be
    // computed, so those jobs collect in memory and write at the end;
    // everything else streams straight to the writer.
    let collecting = request.loudness.is_some();

    let mut targets: Vec<TargetState> = Vec::new();
    for bus in &request.targets {
        let bus_name = session
            .graph
            .bus(*bus)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| bus.to_string());
        let filename = expand_filename_template(&template, &doc.name, &bus_name, request.format);
        let final_path = request.out_dir.join(filename);
        let temp_path = final_path.with_extension(format!("{}.tmp", request.format.extension()));
        let writer = if collecting {
            None
        } else {
            match registry.open(request.format, &temp_path, spec) {
                Ok(w) => Some(w),
                Err(e) => {
                    cleanup(&mut targets);
                    return Err(fail(e.to_string()));
                }
            }
        };
        targets.push(TargetState {
            bus: *bus,
            final_path,
            temp_path,
            writer,
            collected_l: Vec::new(),
            collected_r: Vec::new(),
        });
    }

    // Pull the range through the graph chunk by chunk. Cancellation is only
    // honored between chunks so a block of samples is never half-written.
    let mut out_l = vec![0.0f32; chunk];
    let mut out_r = vec![0.0f32; chunk];
    let mut interleaved: Vec<f32> = Vec::with_capacity(chunk * channels as usize);
    let mut rendered: u64 = 0;
    let mut next_midi = 0;
    while rendered < total_frames {
        if job.is_cancelled() {
            cleanup(&mut targets);
            return Err(RenderOutcome::Cancelled);
        }
        let frames = ((total_frames - rendered) as usize).min(chunk);
        let block_start = session.transport.position();
        let block_end = block_start + frames as f64 / sample_rate;
        while next_midi < request.midi.len() && request.midi[next_midi].seconds < block_end {
            session.queue_midi(request.midi[next_midi].at_block(block_start, sample_rate));
            next_midi += 1;
        }

        session.process_block(&mut out_l[..frames], &mut out_r[..frames], frames);

        for ti in 0..targets.len() {
            let (cap_l, cap_r) = session
                .graph
                .captured(targets[ti].bus)
                .expect("capture armed for every target");
            let t = &mut targets[ti];
            let write_error = if let Some(writer) = &mut t.writer {
                interleave(&cap_l[..frames], &cap_r[..frames], request.mono, &mut interleaved);
                writer.write_block(&interleaved).err()
            } else {
                t.collected_l.extend_from_slice(&cap_l[..frames]);
                t.collected_r.extend_from_slice(&cap_r[..frames]);
                None
            };
            if let Some(e) = write_error {
                cleanup(&mut targets);
                return Err(fail(e.to_string()));
            }
        }

        rendered += frames as u64;
        job.progress.store(rendered as f32 / total_frames as f32 * 0.9);
    }

    // Normalization pass: scale to the integrated target, then hold the
    // true-peak ceiling with the limiter, then write the processed program.
    if collecting {
        let target = request
            .loudness
            .as_ref()
            .expect("collecting implies a loudness target")
            .resolve()
            .map_err(|e| fail(e.to_string()))?;
        for i in 0..targets.len() {
            if job.is_cancelled() {
                cleanup(&mut targets);
                return Err(RenderOutcome::Cancelled);
            }
            let t = &mut targets[i];
            normalize_to_target(
                &mut t.collected_l,
                &mut t.collected_r,
                sample_rate,
                target,
                request.quality.limiter_oversample(),
            );
            let write_result = (|| -> Result<()> {
                let mut writer = registry.open(request.format, &t.temp_path, spec)?;
                for start in (0..t.collected_l.len()).step_by(chunk) {
                    let end = (start + chunk).min(t.collected_l.len());
                    interleave(
                        &t.collected_l[start..end],
                        &t.collected_r[start..end],
                        request.mono,
                        &mut interleaved,
                    );
                    writer.write_block(&interleaved)?;
                }
                writer.finalize()
            })();
            if let Err(e) = write_result {
                cleanup(&mut targets);
                return Err(fail(e.to_string()));
            }
        }
    } else {
        for i in 0..targets.len() {
            let writer = targets[i].writer.take().expect("streaming target has a writer");
            if let Err(e) = writer.finalize() {
                cleanup(&mut targets);
                return Err(fail(e.to_string()));
            }
        }
    }

    // Everything on disk is complete: move temp files into place.
    let mut finished = Vec::new();
    for i in 0..targets.len() {
        if let Err(e) = std::fs::rename(&targets[i].temp_path, &targets[i].final_path) {
            cleanup(&mut targets);
            return Err(fail(e.to_string()));
        }
        finished.push(targets[i].final_path.clone());
    }

    Ok(finished)
}

fn interleave(left: &[f32], right: &[f32], mono: bool, out: &mut Vec<f32>) {
    out.clear();
    for i in 0..left.len().min(right.len()) {
        if mono {
            out.push((left[i] + right[i]) * 0.5);
        } else {
            out.push(left[i]);
            out.push(right[i]);
        }
    }
}

/// Gain the buffer to the requested integrated loudness, bounded by the
/// true-peak ceiling, then limit residual overshoots.
fn normalize_to_target(
    left: &mut [f32],
    right: &mut [f32],
    sample_rate: f64,
    target: LoudnessTarget,
    oversample: usize,
) {
    let measured = measure_buffer(left, right, sample_rate);
    if !measured.integrated_lufs.is_finite() {
        return;
    }
    let gain = db_to_linear_f64(target.lufs - measured.integrated_lufs) as f32;
    for s in left.iter_mut() {
        *s *= gain;
    }
    for s in right.iter_mut() {
        *s *= gain;
    }

    let mut limiter = PeakLimiter::new(
        db_to_linear_f64(target.true_peak_ceiling_db),
        sample_rate,
        oversample,
    );
    limiter.process(left, right);
}

/// Instant-attack, exponential-release peak limiter with an oversampled
/// side-chain estimate for inter-sample peaks.
struct PeakLimiter {
    ceiling: f64,
    gain: f64,
    release: f64,
    oversample: usize,
    prev_l: f64,
    prev_r: f64,
}

impl PeakLimiter {
    fn new(ceiling: f64, sample_rate: f64, oversample: usize) -> Self {
        let release_secs = LIMITER_RELEASE_MS as f64 / 1000.0;
        Self {
            ceiling,
            gain: 1.0,
            release: (-1.0 / (release_secs * sample_rate)).exp(),
            oversample: oversample.max(1),
            prev_l: 0.0,
            prev_r: 0.0,
        }
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for i in 0..left.len().min(right.len()) {
            let l = left[i] as f64;
            let r = right[i] as f64;

            let mut level = l.abs().max(r.abs());
            for phase in 1..self.oversample {
                let t = phase as f64 / self.oversample as f64;
                let il = self.prev_l + (l - self.prev_l) * t;
                let ir = self.prev_r + (r - self.prev_r) * t;
                level = level.max(il.abs()).max(ir.abs());
            }
            self.prev_l = l;
            self.prev_r = r;

            let needed = if level * self.gain > self.ceiling && level > 0.0 {
                self.ceiling / level
            } else {
                1.0
            };
            if needed < self.gain {
                self.gain = needed; // instant attack
            } else {
                self.gain = 1.0 + (self.gain - 1.0) * self.release;
            }
            left[i] = (l * self.gain) as f32;
            right[i] = (r * self.gain) as f32;
        }
    }
}
