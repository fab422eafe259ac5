//! Supervision of the two external MIDI bridge processes.
//!
//! The bridges translate between MIDI hardware and the OSC control
//! channel: one carries hardware input to the cues port, the other carries
//! outbound messages back to hardware. They are auxiliary — a bridge that
//! fails to spawn degrades MIDI support but never fails the studio
//! operation that asked for it.

use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use beltane_types::StudioConfig;

use crate::notify::Notifier;
use crate::paths;

#[derive(Default)]
pub struct MidiBridges {
    midi_in: Option<Child>,
    midi_out: Option<Child>,
}

impl MidiBridges {
    pub fn new() -> Self {
        Self::default()
    }

    /// First call spawns both bridges; later calls terminate whatever is
    /// still registered and spawn fresh processes. Each spawn is guarded
    /// independently, so one broken bridge never stops the other.
    pub fn init_or_reset(&mut self, config: &StudioConfig, notifier: &Notifier) {
        if self.midi_in.is_some() || self.midi_out.is_some() {
            notifier.info("Resetting MIDI bridges");
            Self::kill_detached(self.midi_in.take());
            Self::kill_detached(self.midi_out.take());
        } else {
            notifier.info("Initialising MIDI bridges");
        }

        let cues_port = config.ports.osc_cues.to_string();
        let midi_port = config.ports.osc_midi.to_string();

        let in_args = ["-o", &cues_port, "-m", "6"];
        match Self::spawn(&config.midi_in_bridge, &in_args, &paths::midi_in_log_path()) {
            Ok(child) => {
                log::info!(target: "studio::midi", "MIDI input bridge running (pid {})", child.id());
                self.midi_in = Some(child);
            }
            Err(e) => {
                log::error!(target: "studio::midi", "failed to start MIDI input bridge {:?}: {}",
                    config.midi_in_bridge, e);
                notifier.error("Error initialising MIDI inputs");
            }
        }

        let out_args = ["-i", &midi_port, "-O", &cues_port, "-m", "6"];
        match Self::spawn(
            &config.midi_out_bridge,
            &out_args,
            &paths::midi_out_log_path(),
        ) {
            Ok(child) => {
                log::info!(target: "studio::midi", "MIDI output bridge running (pid {})", child.id());
                self.midi_out = Some(child);
            }
            Err(e) => {
                log::error!(target: "studio::midi", "failed to start MIDI output bridge {:?}: {}",
                    config.midi_out_bridge, e);
                notifier.error("Error initialising MIDI outputs");
            }
        }
    }

    /// True per bridge when a process handle is registered.
    pub fn running(&self) -> (bool, bool) {
        (self.midi_in.is_some(), self.midi_out.is_some())
    }

    /// Terminate both bridges.
    pub fn shutdown(&mut self) {
        Self::kill_detached(self.midi_in.take());
        Self::kill_detached(self.midi_out.take());
    }

    fn spawn(exe: &Path, args: &[&str], log_path: &Path) -> std::io::Result<Child> {
        if let Some(dir) = log_path.parent() {
            let _ = fs::create_dir_all(dir);
        }
        let stdout = fs::File::create(log_path).ok();
        let stderr = stdout.as_ref().and_then(|f| f.try_clone().ok());
        Command::new(exe)
            .args(args)
            .stdout(stdout.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stderr(stderr.map(Stdio::from).unwrap_or_else(Stdio::null))
            .spawn()
    }

    /// kill+wait can block, so reap off the calling thread.
    fn kill_detached(child: Option<Child>) {
        if let Some(mut child) = child {
            thread::spawn(move || {
                let _ = child.kill();
                let _ = child.wait();
            });
        }
    }
}

impl Drop for MidiBridges {
    fn drop(&mut self) {
        self.shutdown();
    }
}
