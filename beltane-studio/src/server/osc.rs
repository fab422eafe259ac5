//! OSC implementation of [`Server`] for scsynth.
//!
//! One UDP socket: sends go straight out, replies arrive on a background
//! receive thread which completes allocation gates (`/done`, `/fail`),
//! fires node-destroyed callbacks (`/n_end`), parses `/status.reply` and
//! hands everything else to registered event handlers.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};

use beltane_types::SampleFormat;

use super::{
    AddAction, AllocGate, Arg, Buffer, EngineInfo, EngineStatus, Server, ServerError, ServerResult,
};

/// Node and group ids handed out by this client start here; 0 is the root
/// group.
const FIRST_NODE_ID: i32 = 16;
/// Audio buses below this index map to hardware channels.
const FIRST_AUDIO_BUS: i32 = 16;
/// How long a `/status` round-trip may take before giving up.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// Default scheduling latency for non-immediate sends.
const DEFAULT_CONTROL_DELTA: f64 = 0.005;

type EventHandlers = HashMap<String, Vec<(String, Box<dyn Fn(&[Arg]) + Send + Sync>)>>;

/// State shared with the receive thread.
struct Shared {
    /// Buffer id → gate completed by `/done` (failed by `/fail`).
    alloc_gates: Mutex<HashMap<i32, Arc<AllocGate>>>,
    /// Node id → callbacks fired on `/n_end`.
    destroyed: Mutex<HashMap<i32, Vec<Box<dyn FnOnce() + Send>>>>,
    handlers: Mutex<EventHandlers>,
    status: Mutex<Option<EngineStatus>>,
    status_cv: Condvar,
    running: AtomicBool,
}

pub struct OscServer {
    socket: UdpSocket,
    server_addr: String,
    shared: Arc<Shared>,
    next_node: AtomicI32,
    next_buffer: AtomicI32,
    next_bus: AtomicI32,
    /// f64 bits, packed for lock-free access.
    control_delta: AtomicU64,
    info: Mutex<Option<EngineInfo>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl OscServer {
    /// Bind a local socket, start the receive thread and register for
    /// engine notifications (`/notify 1`).
    pub fn connect(host: &str, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        let shared = Arc::new(Shared {
            alloc_gates: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            status: Mutex::new(None),
            status_cv: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8192];
            while thread_shared.running.load(Ordering::Acquire) {
                match recv_socket.recv(&mut buf) {
                    Ok(n) => {
                        if let Ok((_, packet)) = rosc::decoder::decode_udp(&buf[..n]) {
                            handle_packet(&packet, &thread_shared);
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(_) => break,
                }
            }
        });

        let server = Self {
            socket,
            server_addr: format!("{}:{}", host, port),
            shared,
            next_node: AtomicI32::new(FIRST_NODE_ID),
            next_buffer: AtomicI32::new(0),
            next_bus: AtomicI32::new(FIRST_AUDIO_BUS),
            control_delta: AtomicU64::new(DEFAULT_CONTROL_DELTA.to_bits()),
            info: Mutex::new(None),
            recv_thread: Mutex::new(Some(handle)),
        };
        server.send("/notify", vec![OscType::Int(1)])?;
        Ok(server)
    }

    fn send(&self, addr: &str, args: Vec<OscType>) -> std::io::Result<()> {
        let msg = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        let buf = rosc::encoder::encode(&msg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.socket.send_to(&buf, &self.server_addr)?;
        Ok(())
    }

    /// Immediate sends go out as plain messages; scheduled sends are
    /// wrapped in a bundle timestamped `control_delta` from now.
    fn send_timed(&self, addr: &str, args: Vec<OscType>, now: bool) -> ServerResult {
        if now {
            return self.send(addr, args).map_err(ServerError::from);
        }
        let msg = OscMessage {
            addr: addr.to_string(),
            args,
        };
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: osc_time_from_now(self.control_delta()),
            content: vec![OscPacket::Message(msg)],
        });
        let buf = rosc::encoder::encode(&bundle)
            .map_err(|e| ServerError(format!("OSC encode error: {}", e)))?;
        self.socket
            .send_to(&buf, &self.server_addr)
            .map_err(ServerError::from)?;
        Ok(())
    }

    fn next_node_id(&self) -> i32 {
        self.next_node.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a pending gate for `bufnum` before the request goes out,
    /// so the acknowledgment cannot race the registration.
    fn register_gate(&self, bufnum: i32) -> Arc<AllocGate> {
        let gate = AllocGate::pending();
        self.shared
            .alloc_gates
            .lock()
            .unwrap()
            .insert(bufnum, Arc::clone(&gate));
        gate
    }

    fn path_str(path: &Path) -> ServerResult<&str> {
        path.to_str()
            .ok_or_else(|| ServerError(format!("path is not valid UTF-8: {:?}", path)))
    }
}

impl Server for OscServer {
    fn info(&self) -> ServerResult<EngineInfo> {
        let mut cached = self.info.lock().unwrap();
        if let Some(info) = *cached {
            return Ok(info);
        }
        let status = self.status()?;
        let sample_rate = if status.actual_sample_rate > 0.0 {
            status.actual_sample_rate
        } else {
            status.nominal_sample_rate
        };
        let info = EngineInfo { sample_rate };
        *cached = Some(info);
        Ok(info)
    }

    fn status(&self) -> ServerResult<EngineStatus> {
        *self.shared.status.lock().unwrap() = None;
        self.send("/status", vec![])?;

        let deadline = Instant::now() + STATUS_TIMEOUT;
        let mut status = self.shared.status.lock().unwrap();
        loop {
            if let Some(reply) = *status {
                return Ok(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ServerError("engine did not answer /status".to_string()));
            }
            let (next, _) = self
                .shared
                .status_cv
                .wait_timeout(status, deadline - now)
                .unwrap();
            status = next;
        }
    }

    fn alloc_buffer(&self, frames: i64, channels: i32) -> ServerResult<Buffer> {
        let bufnum = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        let gate = self.register_gate(bufnum);
        self.send(
            "/b_alloc",
            vec![
                OscType::Int(bufnum),
                OscType::Int(frames as i32),
                OscType::Int(channels),
            ],
        )?;
        Ok(Buffer::new(bufnum, frames, channels, gate))
    }

    fn alloc_buffer_read(&self, path: &Path) -> ServerResult<Buffer> {
        let bufnum = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        let path = Self::path_str(path)?;
        let gate = self.register_gate(bufnum);
        self.send(
            "/b_allocRead",
            vec![
                OscType::Int(bufnum),
                OscType::String(path.to_string()),
                OscType::Int(0),
                OscType::Int(0), // 0 = read the entire file
            ],
        )?;
        Ok(Buffer::new(bufnum, 0, 2, gate))
    }

    fn free_buffer(&self, buffer: &Buffer) -> ServerResult {
        self.shared.alloc_gates.lock().unwrap().remove(&buffer.id());
        self.send("/b_free", vec![OscType::Int(buffer.id())])?;
        Ok(())
    }

    fn write_buffer(
        &self,
        buffer: &Buffer,
        path: &Path,
        header: &str,
        format: SampleFormat,
    ) -> ServerResult {
        let path = Self::path_str(path)?;
        self.send(
            "/b_write",
            vec![
                OscType::Int(buffer.id()),
                OscType::String(path.to_string()),
                OscType::String(header.to_string()),
                OscType::String(format.as_str().to_string()),
                OscType::Int(-1), // all frames
                OscType::Int(0),
                OscType::Int(0),
            ],
        )?;
        Ok(())
    }

    fn open_buffer_stream(
        &self,
        path: &Path,
        block_size: i64,
        channels: i32,
        header: &str,
        format: SampleFormat,
    ) -> ServerResult<Buffer> {
        let bufnum = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        let path = Self::path_str(path)?;
        let gate = self.register_gate(bufnum);
        self.send(
            "/b_alloc",
            vec![
                OscType::Int(bufnum),
                OscType::Int(block_size as i32),
                OscType::Int(channels),
            ],
        )?;
        self.send(
            "/b_write",
            vec![
                OscType::Int(bufnum),
                OscType::String(path.to_string()),
                OscType::String(header.to_string()),
                OscType::String(format.as_str().to_string()),
                OscType::Int(0),
                OscType::Int(0),
                OscType::Int(1), // leaveOpen
            ],
        )?;
        Ok(Buffer::new(bufnum, block_size, channels, gate))
    }

    fn close_buffer_stream(&self, buffer: &Buffer) -> ServerResult {
        self.send("/b_close", vec![OscType::Int(buffer.id())])?;
        self.send("/b_free", vec![OscType::Int(buffer.id())])?;
        Ok(())
    }

    fn create_group(&self, position: AddAction, target: i32, label: &str) -> ServerResult<i32> {
        let id = self.next_node_id();
        log::debug!(target: "studio::osc", "group {} ({}) {:?} {}", id, label, position, target);
        self.send(
            "/g_new",
            vec![
                OscType::Int(id),
                OscType::Int(position.to_i32()),
                OscType::Int(target),
            ],
        )?;
        Ok(id)
    }

    fn group_clear(&self, group: i32) -> ServerResult {
        self.send("/g_freeAll", vec![OscType::Int(group)])?;
        Ok(())
    }

    fn trigger_synth(
        &self,
        position: AddAction,
        group: i32,
        name: &str,
        args: &[(String, f32)],
        now: bool,
    ) -> ServerResult<i32> {
        let node = self.next_node_id();
        let mut osc_args = vec![
            OscType::String(name.to_string()),
            OscType::Int(node),
            OscType::Int(position.to_i32()),
            OscType::Int(group),
        ];
        for (param, value) in args {
            osc_args.push(OscType::String(param.clone()));
            osc_args.push(OscType::Float(*value));
        }
        self.send_timed("/s_new", osc_args, now)?;
        Ok(node)
    }

    fn node_ctl(&self, node: i32, args: &[(String, f32)], now: bool) -> ServerResult {
        let mut osc_args = vec![OscType::Int(node)];
        for (param, value) in args {
            osc_args.push(OscType::String(param.clone()));
            osc_args.push(OscType::Float(*value));
        }
        self.send_timed("/n_set", osc_args, now)
    }

    fn node_pause(&self, node: i32, now: bool) -> ServerResult {
        self.send_timed("/n_run", vec![OscType::Int(node), OscType::Int(0)], now)
    }

    fn node_run(&self, node: i32, now: bool) -> ServerResult {
        self.send_timed("/n_run", vec![OscType::Int(node), OscType::Int(1)], now)
    }

    fn free_node(&self, node: i32) -> ServerResult {
        self.send("/n_free", vec![OscType::Int(node)])?;
        Ok(())
    }

    fn on_node_destroyed(&self, node: i32, callback: Box<dyn FnOnce() + Send>) {
        self.shared
            .destroyed
            .lock()
            .unwrap()
            .entry(node)
            .or_default()
            .push(callback);
    }

    fn add_event_handler(&self, addr: &str, key: &str, handler: Box<dyn Fn(&[Arg]) + Send + Sync>) {
        let mut handlers = self.shared.handlers.lock().unwrap();
        let slot = handlers.entry(addr.to_string()).or_default();
        slot.retain(|(k, _)| k != key);
        slot.push((key.to_string(), handler));
    }

    fn clear_all(&self) -> ServerResult {
        self.clear_schedule()?;
        self.send("/g_freeAll", vec![OscType::Int(0)])?;
        Ok(())
    }

    fn clear_schedule(&self) -> ServerResult {
        self.send("/clearSched", vec![])?;
        Ok(())
    }

    fn allocate_audio_bus(&self) -> ServerResult<i32> {
        // stereo pair
        Ok(self.next_bus.fetch_add(2, Ordering::SeqCst))
    }

    fn load_synthdefs(&self, path: &Path) -> ServerResult {
        let abs = path
            .canonicalize()
            .map_err(|e| ServerError(format!("cannot resolve synthdef dir {:?}: {}", path, e)))?;
        let dir = Self::path_str(&abs)?;
        self.send("/d_loadDir", vec![OscType::String(dir.to_string())])?;
        Ok(())
    }

    fn control_delta(&self) -> f64 {
        f64::from_bits(self.control_delta.load(Ordering::Relaxed))
    }

    fn set_control_delta(&self, secs: f64) {
        self.control_delta.store(secs.to_bits(), Ordering::Relaxed);
    }

    fn shutdown(&self) -> ServerResult {
        let _ = self.send("/quit", vec![]);
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for OscServer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

// ─── Receive path ───────────────────────────────────────────────────

fn handle_packet(packet: &OscPacket, shared: &Shared) {
    match packet {
        OscPacket::Message(msg) => handle_message(msg, shared),
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                handle_packet(inner, shared);
            }
        }
    }
}

fn handle_message(msg: &OscMessage, shared: &Shared) {
    match msg.addr.as_str() {
        "/done" => {
            // /done <command> [bufnum]
            let is_buffer_cmd = matches!(
                str_at(&msg.args, 0),
                Some("/b_alloc") | Some("/b_allocRead") | Some("/b_write") | Some("/b_close")
            );
            if is_buffer_cmd {
                if let Some(bufnum) = int_at(&msg.args, 1) {
                    if let Some(gate) = shared.alloc_gates.lock().unwrap().remove(&bufnum) {
                        gate.complete();
                    }
                }
            }
        }
        "/fail" => {
            // /fail <command> <reason> [bufnum]
            let reason = str_at(&msg.args, 1).unwrap_or("engine command failed");
            match int_at(&msg.args, 2) {
                Some(bufnum) => {
                    if let Some(gate) = shared.alloc_gates.lock().unwrap().remove(&bufnum) {
                        gate.fail(reason);
                    }
                }
                None => {
                    log::warn!(target: "studio::osc", "engine failure: {} {}",
                        str_at(&msg.args, 0).unwrap_or("?"), reason);
                }
            }
        }
        "/n_end" => {
            if let Some(node) = int_at(&msg.args, 0) {
                let callbacks = shared.destroyed.lock().unwrap().remove(&node);
                for callback in callbacks.into_iter().flatten() {
                    callback();
                }
            }
        }
        "/status.reply" => {
            // [unused, ugens, synths, groups, synthdefs, avg_cpu, peak_cpu,
            //  nominal_sample_rate, actual_sample_rate]
            let reply = EngineStatus {
                num_ugens: int_at(&msg.args, 1).unwrap_or(0),
                num_synths: int_at(&msg.args, 2).unwrap_or(0),
                num_groups: int_at(&msg.args, 3).unwrap_or(0),
                num_synthdefs: int_at(&msg.args, 4).unwrap_or(0),
                avg_cpu: f32_at(&msg.args, 5).unwrap_or(0.0),
                peak_cpu: f32_at(&msg.args, 6).unwrap_or(0.0),
                nominal_sample_rate: f64_at(&msg.args, 7).unwrap_or(0.0),
                actual_sample_rate: f64_at(&msg.args, 8).unwrap_or(0.0),
            };
            *shared.status.lock().unwrap() = Some(reply);
            shared.status_cv.notify_all();
        }
        addr => {
            let handlers = shared.handlers.lock().unwrap();
            if let Some(registered) = handlers.get(addr) {
                let args = to_args(&msg.args);
                for (_, handler) in registered {
                    handler(&args);
                }
            }
        }
    }
}

fn int_at(args: &[OscType], index: usize) -> Option<i32> {
    match args.get(index) {
        Some(OscType::Int(v)) => Some(*v),
        Some(OscType::Long(v)) => Some(*v as i32),
        Some(OscType::Float(v)) => Some(*v as i32),
        _ => None,
    }
}

fn f32_at(args: &[OscType], index: usize) -> Option<f32> {
    match args.get(index) {
        Some(OscType::Float(v)) => Some(*v),
        Some(OscType::Double(v)) => Some(*v as f32),
        Some(OscType::Int(v)) => Some(*v as f32),
        _ => None,
    }
}

fn f64_at(args: &[OscType], index: usize) -> Option<f64> {
    match args.get(index) {
        Some(OscType::Double(v)) => Some(*v),
        Some(OscType::Float(v)) => Some(*v as f64),
        Some(OscType::Int(v)) => Some(*v as f64),
        _ => None,
    }
}

fn str_at<'a>(args: &'a [OscType], index: usize) -> Option<&'a str> {
    match args.get(index) {
        Some(OscType::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn to_args(args: &[OscType]) -> Vec<Arg> {
    args.iter()
        .filter_map(|arg| match arg {
            OscType::Int(v) => Some(Arg::Int(*v)),
            OscType::Long(v) => Some(Arg::Int(*v as i32)),
            OscType::Float(v) => Some(Arg::Float(*v)),
            OscType::Double(v) => Some(Arg::Float(*v as f32)),
            OscType::String(s) => Some(Arg::Str(s.clone())),
            _ => None,
        })
        .collect()
}

// ─── Timetags ───────────────────────────────────────────────────────

/// SC uses the NTP epoch (1900-01-01); this is the NTP↔Unix offset.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Anchor pair captured once at init: (monotonic instant, wall-clock
/// seconds). Timetags derive from the Instant elapsed since the anchor so
/// wall-clock jumps cannot skew scheduled bundles.
static CLOCK_ANCHOR: LazyLock<(Instant, f64)> = LazyLock::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    (Instant::now(), wall)
});

fn osc_time_from_now(offset_secs: f64) -> OscTime {
    let (anchor_instant, anchor_wall) = &*CLOCK_ANCHOR;
    let total_secs = anchor_wall + anchor_instant.elapsed().as_secs_f64() + offset_secs;
    let secs = total_secs as u64 + NTP_UNIX_OFFSET;
    let frac = (total_secs.fract() * (u32::MAX as f64)) as u32;
    OscTime {
        seconds: secs as u32,
        fractional: frac,
    }
}
