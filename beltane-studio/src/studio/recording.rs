//! Per-bus recording sessions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

use beltane_types::{SampleFormat, StudioError};

use crate::notify::Notifier;
use crate::server::{AddAction, Buffer, Server};

/// Frames per disk block of the output stream.
const STREAM_BLOCK_FRAMES: i64 = 65536;
const STREAM_CHANNELS: i32 = 2;
/// How long `stop` waits for the monitor synth to confirm destruction.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Synthdef that taps a bus into the output stream.
const RECORDER_SYNTHDEF: &str = "beltane_recorder";

struct Session {
    stream: Buffer,
    monitor_synth: i32,
}

#[derive(Default)]
struct State {
    sessions: HashMap<i32, Session>,
    paused: bool,
}

/// One recording session per bus, with a synchronous, bounded stop
/// protocol. The pause flag lives under the same lock because stopping a
/// recorder can implicitly resume playback.
pub struct RecordingManager {
    state: RwLock<State>,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub fn is_recording(&self) -> bool {
        !self.state.read().unwrap().sessions.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().unwrap().paused
    }

    /// Open a session on `bus` writing to `path`. Returns false when a
    /// session already exists for that bus (fast negative check, then
    /// re-checked under the write lock).
    pub fn start(
        &self,
        server: &Arc<dyn Server>,
        monitor_group: i32,
        path: &Path,
        bus: i32,
        format: SampleFormat,
    ) -> Result<bool, StudioError> {
        if self.state.read().unwrap().sessions.contains_key(&bus) {
            return Ok(false);
        }
        let mut state = self.state.write().unwrap();
        if state.sessions.contains_key(&bus) {
            return Ok(false);
        }

        let stream =
            server.open_buffer_stream(path, STREAM_BLOCK_FRAMES, STREAM_CHANNELS, "wav", format)?;
        let args = vec![
            ("out-buf".to_string(), stream.id() as f32),
            ("in_bus".to_string(), bus as f32),
        ];
        let monitor_synth =
            server.trigger_synth(AddAction::Head, monitor_group, RECORDER_SYNTHDEF, &args, true)?;
        log::info!(target: "studio::recording",
            "recording bus {} to {:?} (stream {}, synth {})", bus, path, stream.id(), monitor_synth);
        state.sessions.insert(
            bus,
            Session {
                stream,
                monitor_synth,
            },
        );
        Ok(true)
    }

    /// Stop the session on `bus`, blocking until the monitor synth
    /// confirms destruction or [`STOP_TIMEOUT`] elapses. The session is
    /// torn down either way — a timeout only means the tail of the file
    /// may be truncated, reported as a warning, not an error.
    pub fn stop(
        &self,
        server: &Arc<dyn Server>,
        bus: i32,
        notifier: &Notifier,
    ) -> Result<bool, StudioError> {
        if !self.state.read().unwrap().sessions.contains_key(&bus) {
            return Ok(false);
        }
        let mut state = self.state.write().unwrap();
        let session = match state.sessions.remove(&bus) {
            Some(session) => session,
            None => return Ok(false),
        };

        let (tx, rx) = mpsc::channel();
        server.on_node_destroyed(
            session.monitor_synth,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        server.free_node(session.monitor_synth)?;

        // Callers saving the file need it flushed before continuing.
        if rx.recv_timeout(STOP_TIMEOUT).is_err() {
            notifier.warn(format!(
                "recorder on bus {} did not confirm within {:?}; output may be truncated",
                bus, STOP_TIMEOUT
            ));
        }
        server.close_buffer_stream(&session.stream)?;

        // Stopping the recorder can implicitly resume playback.
        if state.paused {
            server.node_pause(0, true)?;
        }
        Ok(true)
    }

    /// Pause the engine's root group, unless a recording is running (the
    /// recorder needs the graph live) or we are already paused.
    pub fn pause(
        &self,
        server: &Arc<dyn Server>,
        silent: bool,
        notifier: &Notifier,
    ) -> Result<(), StudioError> {
        let mut state = self.state.write().unwrap();
        if !state.paused && state.sessions.is_empty() {
            server.node_pause(0, true)?;
            if !silent {
                notifier.info("Pausing audio studio");
            }
        }
        state.paused = true;
        Ok(())
    }

    pub fn resume(&self, server: &Arc<dyn Server>, notifier: &Notifier) -> Result<(), StudioError> {
        let mut state = self.state.write().unwrap();
        if state.paused {
            server.node_run(0, true)?;
            notifier.info("Resuming audio studio");
        }
        state.paused = false;
        Ok(())
    }

    /// Forget every session without engine-side teardown; the nodes are
    /// already gone (post-reboot).
    pub fn clear_sessions(&self) {
        self.state.write().unwrap().sessions.clear();
    }
}

impl Default for RecordingManager {
    fn default() -> Self {
        Self::new()
    }
}
