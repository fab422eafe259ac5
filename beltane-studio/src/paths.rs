use std::path::PathBuf;

/// Resolve the directory helper-process logs are written to.
///
/// Fallback chain:
/// 1. `BELTANE_LOG_DIR` env var (runtime override)
/// 2. `<config dir>/beltane/log`
/// 3. `./log` relative to CWD
pub fn log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BELTANE_LOG_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(config) = dirs::config_dir() {
        return config.join("beltane").join("log");
    }

    PathBuf::from("log")
}

/// Log file for the hardware-MIDI → OSC bridge.
pub fn midi_in_log_path() -> PathBuf {
    log_dir().join("midi-in-bridge.log")
}

/// Log file for the OSC → hardware-MIDI bridge.
pub fn midi_out_log_path() -> PathBuf {
    log_dir().join("midi-out-bridge.log")
}
