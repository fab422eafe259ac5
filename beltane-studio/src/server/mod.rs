//! Engine capability trait: a semantic-level abstraction over the
//! synthesis server.
//!
//! `Server` captures what the studio *means* to do (allocate a buffer,
//! create a group, trigger a synth) independently of how it's done (OSC
//! messages to scsynth). This enables unit testing of lifecycle logic
//! without a running audio server.

pub mod osc;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use beltane_types::{SampleFormat, StudioError};

/// Result type for engine operations.
pub type ServerResult<T = ()> = Result<T, ServerError>;

/// Error from an engine operation.
#[derive(Debug, Clone)]
pub struct ServerError(pub String);

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError(e.to_string())
    }
}

impl From<String> for ServerError {
    fn from(s: String) -> Self {
        ServerError(s)
    }
}

impl From<ServerError> for StudioError {
    fn from(e: ServerError) -> Self {
        StudioError::Server(e.0)
    }
}

/// Where a new node lands relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddAction {
    Head,
    Tail,
    Before,
    After,
}

impl AddAction {
    pub(crate) fn to_i32(self) -> i32 {
        match self {
            Self::Head => 0,
            Self::Tail => 1,
            Self::Before => 2,
            Self::After => 3,
        }
    }
}

/// A loosely-typed argument from an engine reply, so studio code doesn't
/// depend on `rosc`.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Float(f32),
    Str(String),
}

impl Arg {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Int(v) => Some(*v as f32),
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i32),
            Self::Str(_) => None,
        }
    }
}

/// Engine self-description captured after connect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineInfo {
    pub sample_rate: f64,
}

/// Snapshot of the engine's status counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngineStatus {
    pub num_ugens: i32,
    pub num_synths: i32,
    pub num_groups: i32,
    pub num_synthdefs: i32,
    pub avg_cpu: f32,
    pub peak_cpu: f32,
    pub nominal_sample_rate: f64,
    pub actual_sample_rate: f64,
}

/// Default ceiling for engine allocation acknowledgments.
pub const ALLOC_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Buffer ─────────────────────────────────────────────────────────

enum GateState {
    Pending,
    Ready,
    Failed(String),
}

/// Pending→ready cell completed by the engine's asynchronous allocation
/// acknowledgment.
pub struct AllocGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl AllocGate {
    pub fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::Pending),
            cv: Condvar::new(),
        })
    }

    /// A gate that is already acknowledged (for fakes and tests).
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::Ready),
            cv: Condvar::new(),
        })
    }

    pub fn complete(&self) {
        *self.state.lock().unwrap() = GateState::Ready;
        self.cv.notify_all();
    }

    pub fn fail(&self, reason: impl Into<String>) {
        *self.state.lock().unwrap() = GateState::Failed(reason.into());
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<(), StudioError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                GateState::Ready => return Ok(()),
                GateState::Failed(reason) => return Err(StudioError::Server(reason.clone())),
                GateState::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StudioError::AllocationTimeout(timeout));
                    }
                    let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                }
            }
        }
    }
}

/// An engine-resident block of audio sample storage.
///
/// The id is assigned locally but only exists on the engine once the
/// allocation acknowledgment arrives; [`Buffer::wait_ready`] must succeed
/// before the id is trusted.
#[derive(Clone)]
pub struct Buffer {
    id: i32,
    frames: i64,
    channels: i32,
    duration: Option<f64>,
    path: Option<PathBuf>,
    gate: Arc<AllocGate>,
}

impl Buffer {
    pub fn new(id: i32, frames: i64, channels: i32, gate: Arc<AllocGate>) -> Self {
        Self {
            id,
            frames,
            channels,
            duration: None,
            path: None,
            gate,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn frames(&self) -> i64 {
        self.frames
    }

    pub fn channels(&self) -> i32 {
        self.channels
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    /// Block until the engine acknowledges the allocation.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), StudioError> {
        self.gate.wait(timeout)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("frames", &self.frames)
            .field("channels", &self.channels)
            .field("duration", &self.duration)
            .field("path", &self.path)
            .finish()
    }
}

// ─── Server trait ───────────────────────────────────────────────────

/// Semantic-level engine capability.
///
/// Implementations translate these into server-specific commands (OSC for
/// scsynth) or record them for testing.
pub trait Server: Send + Sync {
    /// Engine self-description (sample rate). May block on a round-trip
    /// the first time it is called.
    fn info(&self) -> ServerResult<EngineInfo>;

    /// Current engine status counters.
    fn status(&self) -> ServerResult<EngineStatus>;

    /// Allocate an empty buffer. The returned buffer is pending until the
    /// engine acknowledges.
    fn alloc_buffer(&self, frames: i64, channels: i32) -> ServerResult<Buffer>;

    /// Allocate a buffer and read a sound file into it.
    fn alloc_buffer_read(&self, path: &Path) -> ServerResult<Buffer>;

    fn free_buffer(&self, buffer: &Buffer) -> ServerResult;

    /// Persist a buffer's contents to a sound file.
    fn write_buffer(
        &self,
        buffer: &Buffer,
        path: &Path,
        header: &str,
        format: SampleFormat,
    ) -> ServerResult;

    /// Open a buffer streaming to a sound file on disk (left open for
    /// continuous writing).
    fn open_buffer_stream(
        &self,
        path: &Path,
        block_size: i64,
        channels: i32,
        header: &str,
        format: SampleFormat,
    ) -> ServerResult<Buffer>;

    /// Close and free a streaming buffer.
    fn close_buffer_stream(&self, buffer: &Buffer) -> ServerResult;

    /// Create a group node; returns its id.
    fn create_group(&self, position: AddAction, target: i32, label: &str) -> ServerResult<i32>;

    /// Free every node inside a group.
    fn group_clear(&self, group: i32) -> ServerResult;

    /// Create a synth node; returns its id.
    fn trigger_synth(
        &self,
        position: AddAction,
        group: i32,
        name: &str,
        args: &[(String, f32)],
        now: bool,
    ) -> ServerResult<i32>;

    /// Set named parameters on a node.
    fn node_ctl(&self, node: i32, args: &[(String, f32)], now: bool) -> ServerResult;

    fn node_pause(&self, node: i32, now: bool) -> ServerResult;

    fn node_run(&self, node: i32, now: bool) -> ServerResult;

    fn free_node(&self, node: i32) -> ServerResult;

    /// Invoke `callback` once when the engine reports the node destroyed.
    fn on_node_destroyed(&self, node: i32, callback: Box<dyn FnOnce() + Send>);

    /// Register a handler for engine replies on `addr`. Re-registering
    /// with the same `key` replaces the previous handler.
    fn add_event_handler(&self, addr: &str, key: &str, handler: Box<dyn Fn(&[Arg]) + Send + Sync>);

    /// Free every node and clear the engine's schedule.
    fn clear_all(&self) -> ServerResult;

    fn clear_schedule(&self) -> ServerResult;

    /// Reserve a stereo audio bus; returns its index.
    fn allocate_audio_bus(&self) -> ServerResult<i32>;

    /// Load every compiled synthdef under `path`.
    fn load_synthdefs(&self, path: &Path) -> ServerResult;

    /// Scheduling latency applied to non-immediate sends.
    fn control_delta(&self) -> f64 {
        0.0
    }

    fn set_control_delta(&self, _secs: f64) {}

    /// Close the connection. Implementations tolerate an already-dead
    /// engine.
    fn shutdown(&self) -> ServerResult;
}

// ─── Test Server ────────────────────────────────────────────────────

/// An operation recorded by [`TestServer`] for assertion in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOp {
    AllocBuffer {
        id: i32,
        frames: i64,
        channels: i32,
    },
    AllocBufferRead {
        id: i32,
        path: String,
    },
    FreeBuffer(i32),
    WriteBuffer {
        id: i32,
        path: String,
        format: SampleFormat,
    },
    OpenBufferStream {
        id: i32,
        path: String,
        block_size: i64,
        channels: i32,
        format: SampleFormat,
    },
    CloseBufferStream(i32),
    CreateGroup {
        id: i32,
        position: AddAction,
        target: i32,
        label: String,
    },
    GroupClear(i32),
    TriggerSynth {
        node: i32,
        position: AddAction,
        group: i32,
        name: String,
        args: Vec<(String, f32)>,
    },
    NodeCtl {
        node: i32,
        args: Vec<(String, f32)>,
    },
    NodePause(i32),
    NodeRun(i32),
    FreeNode(i32),
    ClearAll,
    ClearSchedule,
    AllocateAudioBus(i32),
    LoadSynthdefs(String),
    Shutdown,
}

type DestroyedCallbacks = Mutex<HashMap<i32, Vec<Box<dyn FnOnce() + Send>>>>;
type EventHandlers = Mutex<HashMap<String, Vec<(String, Box<dyn Fn(&[Arg]) + Send + Sync>)>>>;

/// A test engine that records all operations for assertions. Buffers are
/// acknowledged immediately; freeing a node fires its destroyed callbacks
/// synchronously.
pub struct TestServer {
    ops: Mutex<Vec<TestOp>>,
    next_node: AtomicI32,
    next_buffer: AtomicI32,
    next_bus: AtomicI32,
    sample_rate: f64,
    destroyed: DestroyedCallbacks,
    handlers: EventHandlers,
}

impl TestServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            next_node: AtomicI32::new(16),
            next_buffer: AtomicI32::new(0),
            next_bus: AtomicI32::new(16),
            sample_rate: 44100.0,
            destroyed: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Return all recorded operations.
    pub fn operations(&self) -> Vec<TestOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Clear recorded operations.
    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Count operations matching a predicate.
    pub fn count<F: Fn(&TestOp) -> bool>(&self, f: F) -> usize {
        self.ops.lock().unwrap().iter().filter(|op| f(op)).count()
    }

    /// Find the first operation matching a predicate.
    pub fn find<F: Fn(&TestOp) -> bool>(&self, f: F) -> Option<TestOp> {
        self.ops.lock().unwrap().iter().find(|op| f(op)).cloned()
    }

    /// Ids of every freed buffer, in order.
    pub fn buffers_freed(&self) -> Vec<i32> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                TestOp::FreeBuffer(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Fire registered event handlers as if the engine sent a reply.
    pub fn emit(&self, addr: &str, args: &[Arg]) {
        if let Some(handlers) = self.handlers.lock().unwrap().get(addr) {
            for (_, handler) in handlers {
                handler(args);
            }
        }
    }

    fn record(&self, op: TestOp) {
        self.ops.lock().unwrap().push(op);
    }
}

impl Server for TestServer {
    fn info(&self) -> ServerResult<EngineInfo> {
        Ok(EngineInfo {
            sample_rate: self.sample_rate,
        })
    }

    fn status(&self) -> ServerResult<EngineStatus> {
        Ok(EngineStatus {
            nominal_sample_rate: self.sample_rate,
            actual_sample_rate: self.sample_rate,
            ..EngineStatus::default()
        })
    }

    fn alloc_buffer(&self, frames: i64, channels: i32) -> ServerResult<Buffer> {
        let id = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        self.record(TestOp::AllocBuffer {
            id,
            frames,
            channels,
        });
        Ok(Buffer::new(id, frames, channels, AllocGate::ready()))
    }

    fn alloc_buffer_read(&self, path: &Path) -> ServerResult<Buffer> {
        let id = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        self.record(TestOp::AllocBufferRead {
            id,
            path: path.to_string_lossy().to_string(),
        });
        Ok(Buffer::new(id, 0, 2, AllocGate::ready()))
    }

    fn free_buffer(&self, buffer: &Buffer) -> ServerResult {
        self.record(TestOp::FreeBuffer(buffer.id()));
        Ok(())
    }

    fn write_buffer(
        &self,
        buffer: &Buffer,
        path: &Path,
        _header: &str,
        format: SampleFormat,
    ) -> ServerResult {
        self.record(TestOp::WriteBuffer {
            id: buffer.id(),
            path: path.to_string_lossy().to_string(),
            format,
        });
        Ok(())
    }

    fn open_buffer_stream(
        &self,
        path: &Path,
        block_size: i64,
        channels: i32,
        _header: &str,
        format: SampleFormat,
    ) -> ServerResult<Buffer> {
        let id = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        self.record(TestOp::OpenBufferStream {
            id,
            path: path.to_string_lossy().to_string(),
            block_size,
            channels,
            format,
        });
        Ok(Buffer::new(id, block_size, channels, AllocGate::ready()))
    }

    fn close_buffer_stream(&self, buffer: &Buffer) -> ServerResult {
        self.record(TestOp::CloseBufferStream(buffer.id()));
        Ok(())
    }

    fn create_group(&self, position: AddAction, target: i32, label: &str) -> ServerResult<i32> {
        let id = self.next_node.fetch_add(1, Ordering::SeqCst);
        self.record(TestOp::CreateGroup {
            id,
            position,
            target,
            label: label.to_string(),
        });
        Ok(id)
    }

    fn group_clear(&self, group: i32) -> ServerResult {
        self.record(TestOp::GroupClear(group));
        Ok(())
    }

    fn trigger_synth(
        &self,
        position: AddAction,
        group: i32,
        name: &str,
        args: &[(String, f32)],
        _now: bool,
    ) -> ServerResult<i32> {
        let node = self.next_node.fetch_add(1, Ordering::SeqCst);
        self.record(TestOp::TriggerSynth {
            node,
            position,
            group,
            name: name.to_string(),
            args: args.to_vec(),
        });
        Ok(node)
    }

    fn node_ctl(&self, node: i32, args: &[(String, f32)], _now: bool) -> ServerResult {
        self.record(TestOp::NodeCtl {
            node,
            args: args.to_vec(),
        });
        Ok(())
    }

    fn node_pause(&self, node: i32, _now: bool) -> ServerResult {
        self.record(TestOp::NodePause(node));
        Ok(())
    }

    fn node_run(&self, node: i32, _now: bool) -> ServerResult {
        self.record(TestOp::NodeRun(node));
        Ok(())
    }

    fn free_node(&self, node: i32) -> ServerResult {
        self.record(TestOp::FreeNode(node));
        let callbacks = self.destroyed.lock().unwrap().remove(&node);
        for callback in callbacks.into_iter().flatten() {
            callback();
        }
        Ok(())
    }

    fn on_node_destroyed(&self, node: i32, callback: Box<dyn FnOnce() + Send>) {
        self.destroyed
            .lock()
            .unwrap()
            .entry(node)
            .or_default()
            .push(callback);
    }

    fn add_event_handler(&self, addr: &str, key: &str, handler: Box<dyn Fn(&[Arg]) + Send + Sync>) {
        let mut handlers = self.handlers.lock().unwrap();
        let slot = handlers.entry(addr.to_string()).or_default();
        slot.retain(|(k, _)| k != key);
        slot.push((key.to_string(), handler));
    }

    fn clear_all(&self) -> ServerResult {
        self.record(TestOp::ClearAll);
        Ok(())
    }

    fn clear_schedule(&self) -> ServerResult {
        self.record(TestOp::ClearSchedule);
        Ok(())
    }

    fn allocate_audio_bus(&self) -> ServerResult<i32> {
        let bus = self.next_bus.fetch_add(2, Ordering::SeqCst);
        self.record(TestOp::AllocateAudioBus(bus));
        Ok(bus)
    }

    fn load_synthdefs(&self, path: &Path) -> ServerResult {
        self.record(TestOp::LoadSynthdefs(path.to_string_lossy().to_string()));
        Ok(())
    }

    fn shutdown(&self) -> ServerResult {
        self.record(TestOp::Shutdown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_wait_times_out_while_pending() {
        let gate = AllocGate::pending();
        let buffer = Buffer::new(1, 0, 2, gate);
        let err = buffer.wait_ready(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, StudioError::AllocationTimeout(_)));
    }

    #[test]
    fn gate_completes_from_another_thread() {
        let gate = AllocGate::pending();
        let buffer = Buffer::new(1, 0, 2, Arc::clone(&gate));
        let completer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            gate.complete();
        });
        buffer.wait_ready(Duration::from_secs(2)).unwrap();
        completer.join().unwrap();
    }

    #[test]
    fn gate_failure_surfaces_the_reason() {
        let gate = AllocGate::pending();
        gate.fail("allocation refused");
        let buffer = Buffer::new(1, 0, 2, gate);
        let err = buffer.wait_ready(Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("allocation refused"));
    }

    #[test]
    fn free_node_fires_destroyed_callbacks() {
        let server = TestServer::new();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        server.on_node_destroyed(
            99,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        server.free_node(99).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn event_handlers_replace_by_key() {
        let server = TestServer::new();
        let hits = Arc::new(std::sync::atomic::AtomicI32::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            server.add_event_handler(
                "/amp",
                "amp-watch",
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        server.emit("/amp", &[Arg::Float(0.5)]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
