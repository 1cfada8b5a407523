//! Plugin hosting: bundle discovery, instance lifecycle and the realtime
//! chain-processing entry point used by the bus graph.
//!
//! Instantiation and activation happen on a control thread; the audio path
//! only ever touches already-activated instances through `process_chain`,
//! which neither allocates nor blocks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use glob::glob;

use crate::constants::{MAX_BLOCK_SIZE, PLUGIN_BUNDLE_EXTENSION, PLUGIN_MANIFEST_NAME};
use crate::error::PluginLoadError;
use crate::midi::MidiEvent;
use crate::native_dsp::NativeFormat;
use crate::parameter::{ParamKey, ParamRange, Parameter, ParameterSet};
use crate::plugin_api::{
    PluginCategory, PluginFormat, PluginId, PluginInfo, PluginManifest, PluginProcessor,
};

/// Scans well-known directories for plugin bundles and validates each one
/// structurally before exposing it.
pub struct PluginScanner {
    bundles: HashMap<PathBuf, PluginInfo>,
}

impl PluginScanner {
    pub fn new() -> Self {
        Self { bundles: HashMap::new() }
    }

    pub fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from(shellexpand::tilde("~/.mixcore/plugins").into_owned()),
            PathBuf::from("/usr/lib/mixcore/plugins"),
            PathBuf::from("/usr/local/lib/mixcore/plugins"),
        ];
        if let Some(data) = dirs::data_local_dir() {
            paths.push(data.join("mixcore").join("plugins"));
        }
        paths
    }

    pub fn scan_default_paths(&mut self, formats: &[Box<dyn PluginFormat>]) -> Result<()> {
        for path in Self::default_search_paths() {
            self.scan_directory(&path, formats)?;
        }
        Ok(())
    }

    pub fn scan_directory(&mut self, dir: &Path, formats: &[Box<dyn PluginFormat>]) -> Result<()> {
        let pattern = format!("{}/*.{}", dir.display(), PLUGIN_BUNDLE_EXTENSION);
        for entry in glob(&pattern)?.flatten() {
            match Self::read_bundle(&entry) {
                Ok(manifest) => {
                    if !formats.iter().any(|f| f.can_load(&manifest)) {
                        log::warn!(
                            "Skipping {}: no format handles kind '{}'",
                            entry.display(),
                            manifest.kind
                        );
                        continue;
                    }
                    self.bundles.insert(
                        entry.clone(),
                        PluginInfo { path: entry, manifest, category: PluginCategory::Unknown },
                    );
                }
                Err(e) => log::warn!("Skipping malformed bundle {}: {e}", entry.display()),
            }
        }
        Ok(())
    }

    fn read_bundle(path: &Path) -> Result<PluginManifest> {
        let manifest_path = path.join(PLUGIN_MANIFEST_NAME);
        let text = std::fs::read_to_string(&manifest_path)?;
        let manifest: PluginManifest = serde_json::from_str(&text)?;
        manifest.validate().map_err(anyhow::Error::msg)?;
        Ok(manifest)
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.bundles.values().cloned().collect()
    }
}

impl Default for PluginScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// A loaded processing unit plus the host-side bookkeeping around it.
pub struct PluginInstance {
    pub id: PluginId,
    pub name: String,
    pub path: PathBuf,
    pub bypass: bool,
    processor: Box<dyn PluginProcessor>,
    /// Parameter cells latched into the processor at each block boundary.
    params: Vec<(String, Arc<Parameter>)>,
    active: bool,
    latency: usize,
    overruns: u32,
    overrun_reported: bool,
}

impl PluginInstance {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn latency_samples(&self) -> usize {
        if self.active && !self.bypass { self.latency } else { 0 }
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }
}

pub struct PluginHost {
    formats: Vec<Box<dyn PluginFormat>>,
    instances: HashMap<PluginId, PluginInstance>,
    next_id: u64,
    sample_rate: f64,
    max_block_size: usize,
    // Ping-pong scratch buffers for chain processing.
    scratch_a: (Vec<f32>, Vec<f32>),
    scratch_b: (Vec<f32>, Vec<f32>),
}

impl PluginHost {
    pub fn new(sample_rate: f64, max_block_size: usize) -> Self {
        let max_block = max_block_size.min(MAX_BLOCK_SIZE);
        Self {
            formats: vec![Box::new(NativeFormat) as Box<dyn PluginFormat>],
            instances: HashMap::new(),
            next_id: 1,
            sample_rate,
            max_block_size: max_block,
            scratch_a: (vec![0.0; max_block], vec![0.0; max_block]),
            scratch_b: (vec![0.0; max_block], vec![0.0; max_block]),
        }
    }

    /// Register an additional plugin format (external adapters).
    pub fn register_format(&mut self, format: Box<dyn PluginFormat>) {
        self.formats.push(format);
    }

    pub fn formats(&self) -> &[Box<dyn PluginFormat>] {
        &self.formats
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Load a bundle from disk. The new instance is inactive until
    /// `activate` is called; its parameters are registered into `params`.
    pub fn load(
        &mut self,
        path: &Path,
        params: &ParameterSet,
    ) -> std::result::Result<PluginId, PluginLoadError> {
        if !path.exists() {
            return Err(PluginLoadError::NotFound(path.to_path_buf()));
        }
        let manifest = PluginScanner::read_bundle(path)
            .map_err(|e| PluginLoadError::IncompatibleFormat(e.to_string()))?;

        let format = self
            .formats
            .iter()
            .find(|f| f.can_load(&manifest))
            .ok_or_else(|| {
                PluginLoadError::IncompatibleFormat(format!(
                    "no registered format handles kind '{}'",
                    manifest.kind
                ))
            })?;

        let processor = format.instantiate(&manifest)?;
        let id = PluginId(self.next_id);
        self.next_id += 1;

        let mut cells = Vec::new();
        for info in processor.params() {
            let key = ParamKey::Plugin { plugin: id, param: info.id.clone() };
            let mut p = Parameter::new(
                key,
                info.name.clone(),
                ParamRange::new(info.min, info.max, info.default),
            );
            if let Some(unit) = &info.unit {
                p = p.with_unit(unit.clone());
            }
            cells.push((info.id.clone(), params.register(p)));
        }

        log::info!("Loaded plugin '{}' ({}) as {id}", manifest.name, manifest.kind);
        self.instances.insert(
            id,
            PluginInstance {
                id,
                name: manifest.name,
                path: path.to_path_buf(),
                bypass: false,
                processor,
                params: cells,
                active: false,
                latency: 0,
                overruns: 0,
                overrun_reported: false,
            },
        );
        Ok(id)
    }

    pub fn activate(
        &mut self,
        id: PluginId,
        sample_rate: f64,
        block_size: usize,
    ) -> std::result::Result<(), PluginLoadError> {
        let inst = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| PluginLoadError::ActivationFailed(format!("{id} not loaded")))?;
        inst.processor
            .activate(sample_rate, block_size)
            .map_err(|e| PluginLoadError::ActivationFailed(e.to_string()))?;
        inst.latency = inst.processor.latency_samples();
        inst.active = true;
        Ok(())
    }

    /// Clamped, non-blocking parameter write from any thread; the new value
    /// reaches the processor at the next block boundary.
    pub fn set_parameter(&self, id: PluginId, param: &str, value: f32) {
        if let Some(inst) = self.instances.get(&id) {
            if let Some((_, cell)) = inst.params.iter().find(|(pid, _)| pid == param) {
                cell.set(value);
            }
        }
    }

    pub fn latency_samples(&self, id: PluginId) -> usize {
        self.instances.get(&id).map_or(0, |i| i.latency_samples())
    }

    pub fn chain_latency(&self, chain: &[PluginId]) -> usize {
        chain.iter().map(|id| self.latency_samples(*id)).sum()
    }

    pub fn set_bypass(&mut self, id: PluginId, bypass: bool) {
        if let Some(inst) = self.instances.get_mut(&id) {
            inst.bypass = bypass;
        }
    }

    pub fn instance(&self, id: PluginId) -> Option<&PluginInstance> {
        self.instances.get(&id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &PluginInstance> {
        self.instances.values()
    }

    pub fn instrument_for(&self, chain: &[PluginId]) -> Option<PluginId> {
        chain.iter().copied().find(|id| {
            self.instances
                .get(id)
                .is_some_and(|i| i.processor.category() == PluginCategory::Instrument)
        })
    }

    /// Flush internal processor state after a transport reposition.
    pub fn reset_all(&mut self) {
        for inst in self.instances.values_mut() {
            inst.processor.reset();
        }
    }

    /// Unload and release an instance. Unloading an id that is already gone
    /// is a no-op, not an error.
    pub fn unload(&mut self, id: PluginId, params: &ParameterSet) {
        if let Some(mut inst) = self.instances.remove(&id) {
            inst.processor.reset();
            params.unregister_plugin(id);
            log::info!("Unloaded plugin '{}' ({id})", inst.name);
        }
    }

    /// Process an effects chain in place over `buf_l`/`buf_r`.
    ///
    /// Realtime contract: parameter cells are latched here (block boundary),
    /// a unit that overruns the block's time budget contributes silence for
    /// the block and is flagged, and nothing in this path allocates.
    pub fn process_chain(
        &mut self,
        chain: &[PluginId],
        buf_l: &mut [f32],
        buf_r: &mut [f32],
        midi: &[MidiEvent],
        frames: usize,
    ) {
        debug_assert!(frames <= self.max_block_size);
        let budget = Duration::from_secs_f64(frames as f64 / self.sample_rate);

        self.scratch_a.0[..frames].copy_from_slice(&buf_l[..frames]);
        self.scratch_a.1[..frames].copy_from_slice(&buf_r[..frames]);

        for plugin_id in chain {
            let Some(inst) = self.instances.get_mut(plugin_id) else {
                continue;
            };
            if !inst.active || inst.bypass {
                continue;
            }

            // Latch pending control-domain writes into the processor.
            for (pid, cell) in &inst.params {
                inst.processor.set_param(pid, cell.latch_block());
            }

            self.scratch_b.0[..frames].fill(0.0);
            self.scratch_b.1[..frames].fill(0.0);

            let started = Instant::now();
            inst.processor.process(
                &self.scratch_a.0[..frames],
                &self.scratch_a.1[..frames],
                &mut self.scratch_b.0[..frames],
                &mut self.scratch_b.1[..frames],
                midi,
                frames,
            );

            if started.elapsed() > budget {
                // Overrunning unit contributes silence for this block; the
                // chain keeps running and the audio thread never stalls.
                inst.overruns += 1;
                inst.overrun_reported = false;
                self.scratch_b.0[..frames].fill(0.0);
                self.scratch_b.1[..frames].fill(0.0);
            }

            std::mem::swap(&mut self.scratch_a, &mut self.scratch_b);
        }

        buf_l[..frames].copy_from_slice(&self.scratch_a.0[..frames]);
        buf_r[..frames].copy_from_slice(&self.scratch_a.1[..frames]);
    }

    /// Drain performance warnings accumulated on the audio path. Called from
    /// the control domain, which owns the logging.
    pub fn take_overrun_warnings(&mut self) -> Vec<(PluginId, u32)> {
        let mut out = Vec::new();
        for inst in self.instances.values_mut() {
            if inst.overruns > 0 && !inst.overrun_reported {
                inst.overrun_reported = true;
                out.push((inst.id, inst.overruns));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path, name: &str, kind: &str, settings: serde_json::Value) -> PathBuf {
        let bundle = dir.join(format!("{name}.{PLUGIN_BUNDLE_EXTENSION}"));
        std::fs::create_dir_all(&bundle).unwrap();
        let manifest = serde_json::json!({
            "name": name,
            "kind": kind,
            "version": "1.0",
            "settings": settings,
        });
        std::fs::write(bundle.join(PLUGIN_MANIFEST_NAME), manifest.to_string()).unwrap();
        bundle
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mixcore-host-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn load_missing_path_is_not_found() {
        let mut host = PluginHost::new(44100.0, 512);
        let params = ParameterSet::new();
        let err = host.load(Path::new("/nonexistent/x.mixplug"), &params).unwrap_err();
        assert!(matches!(err, PluginLoadError::NotFound(_)));
    }

    #[test]
    fn load_malformed_manifest_is_incompatible() {
        let dir = temp_dir("badmanifest");
        let bundle = dir.join(format!("broken.{PLUGIN_BUNDLE_EXTENSION}"));
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join(PLUGIN_MANIFEST_NAME), "not json").unwrap();

        let mut host = PluginHost::new(44100.0, 512);
        let params = ParameterSet::new();
        let err = host.load(&bundle, &params).unwrap_err();
        assert!(matches!(err, PluginLoadError::IncompatibleFormat(_)));
    }

    #[test]
    fn load_activate_process_set_param_unload() {
        let dir = temp_dir("lifecycle");
        let bundle = write_bundle(&dir, "utility-gain", "gain", serde_json::Value::Null);

        let mut host = PluginHost::new(44100.0, 256);
        let params = ParameterSet::new();
        let id = host.load(&bundle, &params).unwrap();
        host.activate(id, 44100.0, 256).unwrap();
        assert_eq!(params.len(), 1);

        // -6 dB via the non-blocking parameter path.
        host.set_parameter(id, "gain_db", -6.0);

        let mut l = vec![1.0f32; 256];
        let mut r = vec![1.0f32; 256];
        host.process_chain(&[id], &mut l, &mut r, &[], 256);
        let expected = db_to_linear_ref(-6.0);
        assert!((l[255] - expected).abs() < 0.01, "got {}", l[255]);

        host.unload(id, &params);
        assert_eq!(params.len(), 0);
        // Double-unload is a no-op.
        host.unload(id, &params);
    }

    #[test]
    fn chain_latency_sums_reported_latencies() {
        let dir = temp_dir("latency");
        let delay = write_bundle(&dir, "lookahead", "delay", serde_json::json!({ "samples": 64 }));
        let gain = write_bundle(&dir, "trim", "gain", serde_json::Value::Null);

        let mut host = PluginHost::new(48000.0, 512);
        let params = ParameterSet::new();
        let d = host.load(&delay, &params).unwrap();
        let g = host.load(&gain, &params).unwrap();
        host.activate(d, 48000.0, 512).unwrap();
        host.activate(g, 48000.0, 512).unwrap();

        assert_eq!(host.chain_latency(&[d, g]), 64);
        host.set_bypass(d, true);
        assert_eq!(host.chain_latency(&[d, g]), 0);
    }

    #[test]
    fn scanner_skips_invalid_bundles() {
        let dir = temp_dir("scan");
        write_bundle(&dir, "good", "gain", serde_json::Value::Null);
        write_bundle(&dir, "alien", "quantum_reverb", serde_json::Value::Null);
        let broken = dir.join(format!("broken.{PLUGIN_BUNDLE_EXTENSION}"));
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(PLUGIN_MANIFEST_NAME), "{}").unwrap();

        let host = PluginHost::new(44100.0, 512);
        let mut scanner = PluginScanner::new();
        scanner.scan_directory(&dir, host.formats()).unwrap();
        let found = scanner.plugins();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.kind, "gain");
    }

    fn db_to_linear_ref(db: f32) -> f32 {
        10.0f32.powf(db / 20.0)
    }
}
