//! The studio lifecycle controller.
//!
//! `Studio` owns the engine connection and every piece of engine-side
//! state derived from it. It is the only component allowed to tear that
//! state down and rebuild it: `reboot` quiesces the machine behind an
//! atomic flag, swaps the server handle wholesale, recreates the group/bus
//! topology and the shared random-source buffer, replays the synthdef
//! cache and repopulates the sample cache in the background. Every other
//! public operation checks the flag first and fails fast with
//! [`StudioError::RebootInProgress`] rather than blocking — blocking there
//! could deadlock against the reboot itself.

mod buffers;
mod recording;
mod samples;

pub use buffers::BufferCache;
pub use recording::RecordingManager;
pub use samples::SampleLibrary;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

use beltane_types::{SampleFormat, StudioConfig, StudioError};

use crate::midi_bridge::MidiBridges;
use crate::notify::Notifier;
use crate::server::osc::OscServer;
use crate::server::{AddAction, Arg, Buffer, EngineInfo, EngineStatus, Server, ALLOC_TIMEOUT};

const MIXER_SYNTHDEF: &str = "beltane_mixer";
const SCOPE_SYNTHDEF: &str = "beltane_scope";
const AMP_MONITOR_SYNTHDEF: &str = "beltane_amp_monitor";
/// Reply address of the amp monitor synth.
const AMP_EVENT_ADDR: &str = "/beltane/amp";

/// Factory producing a fresh engine connection; called at construction and
/// on every reboot so the handle is replaced, never mutated.
pub type Connector = Box<dyn Fn(&StudioConfig) -> Result<Arc<dyn Server>, StudioError> + Send + Sync>;

/// Engine-side node/bus layout, rebuilt wholesale on every reboot.
///
/// Execution order: synths feed fx feed the mixer; the monitor group
/// observes after the mixer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Topology {
    pub mixer_bus: i32,
    pub mixer_group: i32,
    pub fx_group: i32,
    pub synth_group: i32,
    pub monitor_group: i32,
    pub mixer_synth: i32,
    pub scope_synth: i32,
    pub amp_monitor: Option<i32>,
    pub rand_buffer: i32,
}

enum SupervisorMsg {
    Reboot,
    Shutdown,
}

struct Supervisor {
    tx: Sender<SupervisorMsg>,
    handle: thread::JoinHandle<()>,
}

pub struct Studio {
    config: StudioConfig,
    connect: Connector,
    notifier: Notifier,
    server: RwLock<Arc<dyn Server>>,
    /// The shared state token read by every guarded operation.
    rebooting: AtomicBool,
    /// Held for the whole reboot sequence.
    reboot_lock: Mutex<()>,
    topology: Mutex<Topology>,
    buffers: BufferCache,
    samples: Arc<SampleLibrary>,
    recording: RecordingManager,
    midi: Mutex<MidiBridges>,
    sample_format: Mutex<SampleFormat>,
    volume: Mutex<f32>,
    amp: Arc<Mutex<(f32, f32)>>,
    cent_tuning: Mutex<f64>,
    error_flag: AtomicBool,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Studio {
    /// Connect to the engine and bring up the full studio: group/bus
    /// topology, mixer and scope synths, synthdefs, the shared
    /// random-source buffer and the MIDI bridges.
    pub fn new(
        config: StudioConfig,
        connect: Connector,
        notifier: Notifier,
    ) -> Result<Arc<Self>, StudioError> {
        let sample_format = SampleFormat::from_bit_depth(config.bit_depth)
            .ok_or(StudioError::InvalidBitDepth(config.bit_depth))?;
        let server = connect(&config)?;

        let studio = Arc::new(Self {
            config,
            connect,
            notifier,
            server: RwLock::new(server),
            rebooting: AtomicBool::new(false),
            reboot_lock: Mutex::new(()),
            topology: Mutex::new(Topology::default()),
            buffers: BufferCache::new()?,
            samples: Arc::new(SampleLibrary::new()),
            recording: RecordingManager::new(),
            midi: Mutex::new(MidiBridges::new()),
            sample_format: Mutex::new(sample_format),
            volume: Mutex::new(1.0),
            amp: Arc::new(Mutex::new((0.0, 1.0))),
            cent_tuning: Mutex::new(0.0),
            error_flag: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        });

        studio.reset_server()?;
        studio.init_studio()?;
        studio
            .midi
            .lock()
            .unwrap()
            .init_or_reset(&studio.config, &studio.notifier);
        studio.spawn_supervisor();
        Ok(studio)
    }

    /// Connect to a local engine over OSC using the configured ports.
    pub fn connect(config: StudioConfig, notifier: Notifier) -> Result<Arc<Self>, StudioError> {
        let connector: Connector = Box::new(|config: &StudioConfig| {
            let server = OscServer::connect("127.0.0.1", config.ports.scsynth)
                .map_err(|e| StudioError::Server(format!("cannot reach engine: {}", e)))?;
            Ok(Arc::new(server) as Arc<dyn Server>)
        });
        Self::new(config, connector, notifier)
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let (tx, rx) = unbounded();
        let weak = Arc::downgrade(self);
        let handle = thread::spawn(move || {
            for msg in rx.iter() {
                match msg {
                    SupervisorMsg::Shutdown => break,
                    SupervisorMsg::Reboot => {
                        let Some(studio) = weak.upgrade() else { break };
                        studio.reboot();
                    }
                }
            }
        });
        *self.supervisor.lock().unwrap() = Some(Supervisor { tx, handle });
    }

    /// Ask the supervisor thread to reboot without blocking the caller.
    pub fn request_reboot(&self) {
        if let Some(supervisor) = &*self.supervisor.lock().unwrap() {
            let _ = supervisor.tx.send(SupervisorMsg::Reboot);
        }
    }

    fn server(&self) -> Arc<dyn Server> {
        Arc::clone(&self.server.read().unwrap())
    }

    /// Fail fast while a reboot is in flight. Never blocks: blocking here
    /// against the reboot lock would deadlock with per-operation locks.
    fn guard(&self, op: &str) -> Result<(), StudioError> {
        if self.rebooting.load(Ordering::Acquire) {
            log::warn!(target: "studio", "rejected {} while rebooting", op);
            self.notifier
                .info(format!("Server rebooting, cannot {} yet", op));
            return Err(StudioError::RebootInProgress);
        }
        Ok(())
    }

    fn record_error(&self, context: &str, err: &StudioError) {
        self.error_flag.store(true, Ordering::Release);
        log::error!(target: "studio", "{}: {}", context, err);
        self.notifier.error(format!("{}: {}", context, err));
    }

    /// True when any operation failed since the last check; reading clears
    /// the flag.
    pub fn error_occurred(&self) -> bool {
        self.error_flag.swap(false, Ordering::AcqRel)
    }

    // ─── buffers and samples ────────────────────────────────────────

    /// Fetch or allocate the named cache buffer. See [`BufferCache`].
    pub fn allocate_buffer(
        &self,
        name: &str,
        duration: Option<f64>,
    ) -> Result<(Buffer, bool), StudioError> {
        self.guard("allocate_buffer")?;
        let format = *self.sample_format.lock().unwrap();
        self.buffers
            .allocate(&self.server(), name, duration, format)
    }

    /// Free the named cache buffer; returns whether anything was freed.
    pub fn free_buffer(&self, name: &str) -> Result<bool, StudioError> {
        self.guard("free_buffer")?;
        self.buffers.free(&self.server(), name)
    }

    pub fn load_sample(&self, path: &Path) -> Result<(Buffer, bool), StudioError> {
        self.guard("load_sample")?;
        self.samples.load(&self.server(), path)
    }

    pub fn sample_loaded(&self, path: &Path) -> bool {
        self.samples.loaded(path)
    }

    pub fn free_sample(&self, paths: &[PathBuf]) -> Result<(), StudioError> {
        self.guard("free_sample")?;
        self.samples.free(&self.server(), paths)
    }

    pub fn free_all_samples(&self) -> Result<(), StudioError> {
        self.guard("free_all_samples")?;
        self.samples.free_all(&self.server())
    }

    pub fn load_synthdefs(&self, path: &Path) -> Result<(), StudioError> {
        self.guard("load_synthdefs")?;
        self.samples.load_synthdefs(&self.server(), path)
    }

    // ─── pass-through controls ──────────────────────────────────────

    pub fn trigger_synth(
        &self,
        position: AddAction,
        group: i32,
        name: &str,
        args: &[(String, f32)],
        now: bool,
    ) -> Result<i32, StudioError> {
        self.guard("trigger_synth")?;
        Ok(self.server().trigger_synth(position, group, name, args, now)?)
    }

    pub fn set_volume(&self, volume: f32, now: bool, silent: bool) -> Result<(), StudioError> {
        self.guard("set_volume")?;
        *self.volume.lock().unwrap() = volume;
        if !silent {
            self.notifier
                .info(format!("Setting master volume to {}", volume));
        }
        let mixer = self.topology.lock().unwrap().mixer_synth;
        Ok(self
            .server()
            .node_ctl(mixer, &[("pre_amp".to_string(), volume)], now)?)
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    pub fn mixer_control(&self, args: &[(String, f32)], now: bool) -> Result<(), StudioError> {
        self.guard("mixer_control")?;
        let mixer = self.topology.lock().unwrap().mixer_synth;
        Ok(self.server().node_ctl(mixer, args, now)?)
    }

    pub fn mixer_invert_stereo(&self, invert: bool) -> Result<(), StudioError> {
        self.guard("mixer_invert_stereo")?;
        let value = if invert { 1.0 } else { 0.0 };
        let mixer = self.topology.lock().unwrap().mixer_synth;
        Ok(self
            .server()
            .node_ctl(mixer, &[("invert_stereo".to_string(), value)], true)?)
    }

    pub fn mixer_mono_mode(&self) -> Result<(), StudioError> {
        self.guard("mixer_mono_mode")?;
        let mixer = self.topology.lock().unwrap().mixer_synth;
        Ok(self
            .server()
            .node_ctl(mixer, &[("force_mono".to_string(), 1.0)], true)?)
    }

    pub fn mixer_stereo_mode(&self) -> Result<(), StudioError> {
        self.guard("mixer_stereo_mode")?;
        let mixer = self.topology.lock().unwrap().mixer_synth;
        Ok(self
            .server()
            .node_ctl(mixer, &[("force_mono".to_string(), 0.0)], true)?)
    }

    /// Start the amp monitor synth on the monitor group, once.
    pub fn start_amp_monitor(&self) -> Result<(), StudioError> {
        self.guard("start_amp_monitor")?;
        let mut topology = self.topology.lock().unwrap();
        if topology.amp_monitor.is_none() {
            let node = self.server().trigger_synth(
                AddAction::Head,
                topology.monitor_group,
                AMP_MONITOR_SYNTHDEF,
                &[("bus".to_string(), 0.0)],
                true,
            )?;
            topology.amp_monitor = Some(node);
        }
        Ok(())
    }

    /// Latest (left, right) amplitude pair reported by the amp monitor.
    pub fn amp(&self) -> (f32, f32) {
        *self.amp.lock().unwrap()
    }

    pub fn status(&self) -> Result<EngineStatus, StudioError> {
        self.guard("status")?;
        Ok(self.server().status()?)
    }

    pub fn engine_info(&self) -> Result<EngineInfo, StudioError> {
        Ok(self.server().info()?)
    }

    /// Drop scheduled messages and silence every run synth.
    pub fn stop(&self) -> Result<(), StudioError> {
        self.guard("stop")?;
        let server = self.server();
        server.clear_schedule()?;
        let synth_group = self.topology.lock().unwrap().synth_group;
        server.group_clear(synth_group)?;
        Ok(())
    }

    pub fn new_group(
        &self,
        position: AddAction,
        target: i32,
        label: &str,
    ) -> Result<i32, StudioError> {
        self.guard("new_group")?;
        Ok(self.server().create_group(position, target, label)?)
    }

    /// A per-run group at the tail of the synth group.
    pub fn new_synth_group(&self, run_id: i64) -> Result<i32, StudioError> {
        let synth_group = self.topology.lock().unwrap().synth_group;
        self.new_group(
            AddAction::Tail,
            synth_group,
            &format!("Run-{}-Synths", run_id),
        )
    }

    /// A per-run group at the tail of the fx group.
    pub fn new_fx_group(&self, run_id: i64) -> Result<i32, StudioError> {
        let fx_group = self.topology.lock().unwrap().fx_group;
        self.new_group(AddAction::Tail, fx_group, &format!("Run-{}-FX", run_id))
    }

    pub fn new_fx_bus(&self) -> Result<i32, StudioError> {
        self.guard("new_fx_bus")?;
        Ok(self.server().allocate_audio_bus()?)
    }

    pub fn control_delta(&self) -> f64 {
        self.server().control_delta()
    }

    pub fn set_control_delta(&self, secs: f64) {
        self.server().set_control_delta(secs)
    }

    /// Set the recording/save bit depth (8, 16, 24 or 32).
    pub fn set_bit_depth(&self, depth: u32) -> Result<(), StudioError> {
        let format =
            SampleFormat::from_bit_depth(depth).ok_or(StudioError::InvalidBitDepth(depth))?;
        *self.sample_format.lock().unwrap() = format;
        Ok(())
    }

    pub fn cent_tuning(&self) -> f64 {
        *self.cent_tuning.lock().unwrap()
    }

    pub fn set_cent_tuning(&self, cents: f64) {
        *self.cent_tuning.lock().unwrap() = cents;
    }

    pub fn topology(&self) -> Topology {
        *self.topology.lock().unwrap()
    }

    // ─── recording ──────────────────────────────────────────────────

    pub fn recording_start(&self, path: &Path, bus: i32) -> Result<bool, StudioError> {
        self.guard("recording_start")?;
        let monitor_group = self.topology.lock().unwrap().monitor_group;
        let format = *self.sample_format.lock().unwrap();
        self.recording
            .start(&self.server(), monitor_group, path, bus, format)
    }

    pub fn recording_stop(&self, bus: i32) -> Result<bool, StudioError> {
        self.guard("recording_stop")?;
        self.recording.stop(&self.server(), bus, &self.notifier)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_recording()
    }

    pub fn pause(&self, silent: bool) -> Result<(), StudioError> {
        self.recording.pause(&self.server(), silent, &self.notifier)
    }

    pub fn resume(&self) -> Result<(), StudioError> {
        self.recording.resume(&self.server(), &self.notifier)
    }

    // ─── reboot ─────────────────────────────────────────────────────

    /// Tear down and rebuild every piece of engine-side state.
    ///
    /// Steps are individually caught: a failure is logged and reported but
    /// the remaining steps still run — a dead MIDI bridge must not block
    /// audio recovery. Returns false when a reboot was already in flight.
    pub fn reboot(&self) -> bool {
        if self.rebooting.load(Ordering::Acquire) {
            return false;
        }
        let _running = self.reboot_lock.lock().unwrap();
        self.rebooting.store(true, Ordering::Release);
        self.notifier.info("Rebooting audio server. Please wait...");

        self.run_step("Error resetting MIDI bridges", || {
            self.midi
                .lock()
                .unwrap()
                .init_or_reset(&self.config, &self.notifier);
            Ok(())
        });
        self.run_step("Error reconnecting to engine", || self.replace_server());
        self.run_step("Error resetting server state", || self.reset_server());
        self.run_step("Error initialising studio state", || self.init_studio());

        self.notifier.info("Audio server ready.");
        self.rebooting.store(false, Ordering::Release);
        true
    }

    fn run_step(&self, context: &str, step: impl FnOnce() -> Result<(), StudioError>) {
        if let Err(e) = step() {
            self.record_error(context, &e);
        }
    }

    /// Swap in a fresh engine handle; the old one is shut down after the
    /// swap so no caller can pick it up in between.
    fn replace_server(&self) -> Result<(), StudioError> {
        let fresh = (self.connect)(&self.config)?;
        let old = {
            let mut server = self.server.write().unwrap();
            std::mem::replace(&mut *server, fresh)
        };
        let _ = old.shutdown();
        Ok(())
    }

    /// Clear the engine and recreate the group/bus topology and the mixer
    /// and scope synths.
    fn reset_server(&self) -> Result<(), StudioError> {
        let server = self.server();
        log::debug!(target: "studio", "clearing engine state");
        server.clear_all()?;

        let mixer_bus = server.allocate_audio_bus()?;
        log::debug!(target: "studio", "creating base groups");
        let mixer_group = server.create_group(AddAction::Head, 0, "BELTANE-MIXER")?;
        let fx_group = server.create_group(AddAction::Before, mixer_group, "BELTANE-FX")?;
        let synth_group = server.create_group(AddAction::Before, fx_group, "BELTANE-SYNTHS")?;
        let monitor_group = server.create_group(AddAction::After, mixer_group, "BELTANE-MONITOR")?;

        log::debug!(target: "studio", "starting mixer");
        let mixer_synth = server.trigger_synth(
            AddAction::Head,
            mixer_group,
            MIXER_SYNTHDEF,
            &[("in_bus".to_string(), mixer_bus as f32)],
            true,
        )?;
        log::debug!(target: "studio", "starting scope");
        let scope_synth = server.trigger_synth(
            AddAction::Head,
            monitor_group,
            SCOPE_SYNTHDEF,
            &[("max_frames".to_string(), 1024.0)],
            false,
        )?;

        *self.topology.lock().unwrap() = Topology {
            mixer_bus,
            mixer_group,
            fx_group,
            synth_group,
            monitor_group,
            mixer_synth,
            scope_synth,
            amp_monitor: None,
            rand_buffer: 0,
        };
        Ok(())
    }

    /// Load synthdefs, rebuild the caches against the current handle and
    /// allocate the shared random-source buffer.
    fn init_studio(&self) -> Result<(), StudioError> {
        let server = self.server();
        self.install_amp_handler(&server);

        let (old_samples, old_synthdefs) = self.samples.take_for_repopulation();
        self.buffers.invalidate_all();
        self.recording.clear_sessions();

        server.load_synthdefs(&self.config.synthdef_dir)?;
        for path in old_synthdefs {
            self.notifier
                .info(format!("Reloading synthdefs in {}", path.display()));
            if let Err(e) = self.samples.load_synthdefs(&server, &path) {
                self.record_error("Error reloading synthdefs", &e);
            }
        }

        // Loaded directly so it is never treated as a sample.
        let rand_buf = server.alloc_buffer_read(&self.config.rand_stream_path)?;
        rand_buf.wait_ready(ALLOC_TIMEOUT)?;
        self.topology.lock().unwrap().rand_buffer = rand_buf.id();

        if !old_samples.is_empty() {
            self.spawn_sample_repopulator(server, old_samples);
        }
        Ok(())
    }

    fn install_amp_handler(&self, server: &Arc<dyn Server>) {
        let amp = Arc::clone(&self.amp);
        server.add_event_handler(
            AMP_EVENT_ADDR,
            AMP_EVENT_ADDR,
            Box::new(move |args| {
                // SendReply layout: node, reply id, left, right
                if let (Some(left), Some(right)) = (
                    args.get(2).and_then(Arg::as_f32),
                    args.get(3).and_then(Arg::as_f32),
                ) {
                    *amp.lock().unwrap() = (left, right);
                }
            }),
        );
    }

    /// Reload previously cached samples on a low-priority path: the reboot
    /// caller is not blocked, and per-sample failures surface on the
    /// notification channel instead of vanishing with the thread.
    fn spawn_sample_repopulator(&self, server: Arc<dyn Server>, paths: Vec<PathBuf>) {
        let samples = Arc::clone(&self.samples);
        let notifier = self.notifier.clone();
        thread::spawn(move || {
            for path in paths {
                notifier.info(format!("Reloading sample - {}", path.display()));
                if let Err(e) = samples.load(&server, &path) {
                    notifier.error(format!(
                        "Failed to reload sample {}: {}",
                        path.display(),
                        e
                    ));
                }
            }
        });
    }

    /// Stop the supervisor thread, the engine connection and the MIDI
    /// bridges. Never fails; connection errors are discarded.
    pub fn shutdown(&self) {
        if let Some(supervisor) = self.supervisor.lock().unwrap().take() {
            let _ = supervisor.tx.send(SupervisorMsg::Shutdown);
            let _ = supervisor.handle.join();
        }
        let _ = self.server().shutdown();
        self.midi.lock().unwrap().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{TestOp, TestServer};
    use std::time::{Duration, Instant};

    /// Keeps a handle to every TestServer the connector produced, so tests
    /// can assert against both the pre- and post-reboot engine.
    struct Harness {
        studio: Arc<Studio>,
        servers: Arc<Mutex<Vec<Arc<TestServer>>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(test_config())
        }

        fn with_config(config: StudioConfig) -> Self {
            let servers: Arc<Mutex<Vec<Arc<TestServer>>>> = Arc::new(Mutex::new(Vec::new()));
            let produced = Arc::clone(&servers);
            let connect: Connector = Box::new(move |_| {
                let server = TestServer::new();
                produced.lock().unwrap().push(Arc::clone(&server));
                Ok(server as Arc<dyn Server>)
            });
            let studio = Studio::new(config, connect, Notifier::detached()).unwrap();
            Self { studio, servers }
        }

        fn current_server(&self) -> Arc<TestServer> {
            Arc::clone(self.servers.lock().unwrap().last().unwrap())
        }
    }

    fn test_config() -> StudioConfig {
        StudioConfig {
            midi_in_bridge: "/nonexistent/midi-in".into(),
            midi_out_bridge: "/nonexistent/midi-out".into(),
            synthdef_dir: "/defs".into(),
            rand_stream_path: "/buffers/rand-stream.wav".into(),
            ..StudioConfig::default()
        }
    }

    fn write_wav(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..32i16 {
            writer.write_sample(i).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn init_builds_the_group_topology_in_order() {
        let harness = Harness::new();
        let server = harness.current_server();
        let topology = harness.studio.topology();

        let groups: Vec<TestOp> = server
            .operations()
            .into_iter()
            .filter(|op| matches!(op, TestOp::CreateGroup { .. }))
            .collect();
        assert_eq!(groups.len(), 4);
        match &groups[0] {
            TestOp::CreateGroup {
                id,
                position,
                target,
                label,
            } => {
                assert_eq!(*id, topology.mixer_group);
                assert_eq!(*position, AddAction::Head);
                assert_eq!(*target, 0);
                assert_eq!(label, "BELTANE-MIXER");
            }
            _ => unreachable!(),
        }
        match &groups[1] {
            TestOp::CreateGroup {
                id,
                position,
                target,
                ..
            } => {
                assert_eq!(*id, topology.fx_group);
                assert_eq!(*position, AddAction::Before);
                assert_eq!(*target, topology.mixer_group);
            }
            _ => unreachable!(),
        }
        match &groups[2] {
            TestOp::CreateGroup {
                id,
                position,
                target,
                ..
            } => {
                assert_eq!(*id, topology.synth_group);
                assert_eq!(*position, AddAction::Before);
                assert_eq!(*target, topology.fx_group);
            }
            _ => unreachable!(),
        }
        match &groups[3] {
            TestOp::CreateGroup {
                id,
                position,
                target,
                ..
            } => {
                assert_eq!(*id, topology.monitor_group);
                assert_eq!(*position, AddAction::After);
                assert_eq!(*target, topology.mixer_group);
            }
            _ => unreachable!(),
        }

        // mixer synth reads from the mixer bus
        let mixer = server
            .find(|op| {
                matches!(op, TestOp::TriggerSynth { name, .. } if name == MIXER_SYNTHDEF)
            })
            .unwrap();
        match mixer {
            TestOp::TriggerSynth { group, args, .. } => {
                assert_eq!(group, topology.mixer_group);
                assert!(args.contains(&("in_bus".to_string(), topology.mixer_bus as f32)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn guarded_operations_fail_fast_while_rebooting() {
        let harness = Harness::new();
        let studio = &harness.studio;
        studio.rebooting.store(true, Ordering::Release);

        assert!(studio
            .allocate_buffer("click", None)
            .unwrap_err()
            .is_reboot_in_progress());
        assert!(studio
            .set_volume(0.5, true, true)
            .unwrap_err()
            .is_reboot_in_progress());
        assert!(studio
            .recording_start(Path::new("/tmp/x.wav"), 0)
            .unwrap_err()
            .is_reboot_in_progress());
        assert!(studio.status().unwrap_err().is_reboot_in_progress());
        assert!(studio.stop().unwrap_err().is_reboot_in_progress());

        studio.rebooting.store(false, Ordering::Release);
        assert!(studio.allocate_buffer("click", None).is_ok());
    }

    #[test]
    fn buffer_cache_scenario() {
        let harness = Harness::new();
        let studio = &harness.studio;

        let (a, hit) = studio.allocate_buffer("click", Some(2.0)).unwrap();
        assert!(!hit);
        let (a2, hit) = studio.allocate_buffer("click", Some(2.0)).unwrap();
        assert!(hit);
        assert_eq!(a.id(), a2.id());

        let (b, hit) = studio.allocate_buffer("click", Some(4.0)).unwrap();
        assert!(!hit);
        assert_ne!(b.id(), a.id());
        assert!(harness.current_server().buffers_freed().contains(&a.id()));

        assert!(studio.free_buffer("click").unwrap());
        assert!(!studio.free_buffer("click").unwrap());
    }

    #[test]
    fn reboot_swaps_the_server_handle() {
        let harness = Harness::new();
        assert_eq!(harness.servers.lock().unwrap().len(), 1);
        assert!(harness.studio.reboot());
        assert_eq!(harness.servers.lock().unwrap().len(), 2);
        // the old handle was shut down
        let old = Arc::clone(&harness.servers.lock().unwrap()[0]);
        assert_eq!(old.count(|op| matches!(op, TestOp::Shutdown)), 1);
        // and the machine is usable again
        assert!(harness.studio.allocate_buffer("click", None).is_ok());
    }

    #[test]
    fn reboot_replays_synthdefs_and_repopulates_samples() {
        let harness = Harness::new();
        let studio = &harness.studio;
        let dir = tempfile::tempdir().unwrap();
        let sample = write_wav(dir.path(), "kick.wav");

        studio.load_sample(&sample).unwrap();
        studio.load_synthdefs(Path::new("/custom-defs")).unwrap();
        assert!(studio.sample_loaded(&sample));

        assert!(studio.reboot());
        let server = harness.current_server();

        // synthdefs replayed synchronously on the new handle
        assert!(server
            .find(|op| matches!(op, TestOp::LoadSynthdefs(p) if p == "/custom-defs"))
            .is_some());

        // samples come back within a bounded delay (background thread)
        let deadline = Instant::now() + Duration::from_secs(2);
        while !studio.sample_loaded(&sample) {
            assert!(Instant::now() < deadline, "sample was not repopulated");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            server.count(|op| matches!(op, TestOp::AllocBufferRead { .. })),
            2 // rand-stream + the repopulated sample
        );
    }

    #[test]
    fn reboot_reallocates_the_rand_stream_buffer() {
        let harness = Harness::new();
        let before = harness.studio.topology().rand_buffer;
        assert!(harness.studio.reboot());
        let server = harness.current_server();
        assert!(server
            .find(|op| matches!(op, TestOp::AllocBufferRead { path, .. }
                if path.ends_with("rand-stream.wav")))
            .is_some());
        // fresh handle, fresh id space — but the buffer exists again
        let after = harness.studio.topology().rand_buffer;
        assert_eq!(before, after); // both ids are the first read-alloc of their handle
    }

    #[test]
    fn set_volume_drives_the_mixer_synth() {
        let harness = Harness::new();
        harness.studio.set_volume(0.7, true, true).unwrap();
        let mixer = harness.studio.topology().mixer_synth;
        let server = harness.current_server();
        assert!(server
            .find(|op| matches!(op, TestOp::NodeCtl { node, args }
                if *node == mixer && args.contains(&("pre_amp".to_string(), 0.7))))
            .is_some());
        assert_eq!(harness.studio.volume(), 0.7);
    }

    #[test]
    fn stop_clears_schedule_and_synth_group() {
        let harness = Harness::new();
        harness.studio.stop().unwrap();
        let server = harness.current_server();
        let synth_group = harness.studio.topology().synth_group;
        assert_eq!(server.count(|op| matches!(op, TestOp::ClearSchedule)), 1);
        assert!(server
            .find(|op| matches!(op, TestOp::GroupClear(g) if *g == synth_group))
            .is_some());
    }

    #[test]
    fn recording_round_trip_through_the_controller() {
        let harness = Harness::new();
        let studio = &harness.studio;
        let path = Path::new("/tmp/take.wav");

        assert!(studio.recording_start(path, 0).unwrap());
        assert!(!studio.recording_start(path, 0).unwrap());
        assert!(studio.is_recording());
        assert!(studio.recording_stop(0).unwrap());
        assert!(!studio.recording_stop(0).unwrap());
        assert!(!studio.is_recording());
    }

    #[test]
    fn amp_handler_tracks_engine_replies() {
        let harness = Harness::new();
        let server = harness.current_server();
        server.emit(
            AMP_EVENT_ADDR,
            &[
                Arg::Int(5),
                Arg::Int(0),
                Arg::Float(0.25),
                Arg::Float(0.75),
            ],
        );
        assert_eq!(harness.studio.amp(), (0.25, 0.75));
    }

    #[test]
    fn start_amp_monitor_is_idempotent() {
        let harness = Harness::new();
        harness.studio.start_amp_monitor().unwrap();
        harness.studio.start_amp_monitor().unwrap();
        let server = harness.current_server();
        assert_eq!(
            server.count(|op| {
                matches!(op, TestOp::TriggerSynth { name, .. } if name == AMP_MONITOR_SYNTHDEF)
            }),
            1
        );
    }

    #[test]
    fn error_flag_is_cleared_by_reading() {
        let harness = Harness::new();
        let studio = &harness.studio;
        assert!(!studio.error_occurred());
        studio.record_error(
            "Error in test",
            &StudioError::Server("synthetic".to_string()),
        );
        assert!(studio.error_occurred());
        assert!(!studio.error_occurred());
    }

    #[test]
    fn invalid_bit_depth_is_rejected() {
        let harness = Harness::new();
        assert!(matches!(
            harness.studio.set_bit_depth(12),
            Err(StudioError::InvalidBitDepth(12))
        ));
        harness.studio.set_bit_depth(24).unwrap();
    }

    #[test]
    fn shutdown_never_fails_and_is_idempotent() {
        let harness = Harness::new();
        harness.studio.shutdown();
        harness.studio.shutdown();
        let server = harness.current_server();
        assert!(server.count(|op| matches!(op, TestOp::Shutdown)) >= 1);
    }

    #[test]
    fn request_reboot_runs_on_the_supervisor_thread() {
        let harness = Harness::new();
        harness.studio.request_reboot();
        let deadline = Instant::now() + Duration::from_secs(2);
        while harness.servers.lock().unwrap().len() < 2 {
            assert!(Instant::now() < deadline, "supervisor never rebooted");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
