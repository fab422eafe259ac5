//! Named cache of pre-allocated engine buffers.

use std::sync::Arc;

use beltane_types::{SampleFormat, StudioError};

use crate::server::{Buffer, Server, ALLOC_TIMEOUT};
use crate::single_flight::{Claimed, SingleFlight};

/// Duration used when a caller does not ask for one.
const DEFAULT_DURATION_SECS: f64 = 8.0;
const CACHE_CHANNELS: i32 = 2;

/// Duration-aware cache of named engine buffers.
///
/// Each buffer is also persisted to a `.wav` under a private temp
/// directory, so it can be reloaded rather than resynthesized. The
/// directory lives as long as the cache.
pub struct BufferCache {
    entries: SingleFlight<String, Buffer>,
    dir: tempfile::TempDir,
}

impl BufferCache {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            entries: SingleFlight::new(),
            dir: tempfile::tempdir()?,
        })
    }

    /// Fetch or allocate the buffer cached under `name`.
    ///
    /// A cached buffer satisfies the request when no duration was asked
    /// for or the durations match. Otherwise a replacement is allocated
    /// and installed, and only then is the displaced buffer freed — no
    /// caller ever observes a freed id. Returns the buffer and whether it
    /// was a cache hit.
    pub fn allocate(
        &self,
        server: &Arc<dyn Server>,
        name: &str,
        duration: Option<f64>,
        format: SampleFormat,
    ) -> Result<(Buffer, bool), StudioError> {
        let key = name.to_string();
        let guard = match self
            .entries
            .claim(&key, |buf| duration.is_none() || buf.duration() == duration)
        {
            Claimed::Hit(buf) => return Ok((buf, true)),
            Claimed::Miss(guard) => guard,
        };

        let duration = duration.unwrap_or(DEFAULT_DURATION_SECS);
        match self.allocate_fresh(server, name, duration, format) {
            Ok(buf) => {
                if let Some(old) = guard.install(buf.clone()) {
                    log::debug!(target: "studio::buffers",
                        "buffer {:?}: replacing {} with {}", name, old.id(), buf.id());
                    let _ = server.free_buffer(&old);
                }
                Ok((buf, false))
            }
            Err(e) => {
                guard.abort();
                Err(e)
            }
        }
    }

    fn allocate_fresh(
        &self,
        server: &Arc<dyn Server>,
        name: &str,
        duration: f64,
        format: SampleFormat,
    ) -> Result<Buffer, StudioError> {
        let info = server.info()?;
        let frames = (duration * info.sample_rate) as i64;
        let buf = server.alloc_buffer(frames, CACHE_CHANNELS)?;
        buf.wait_ready(ALLOC_TIMEOUT)?;
        let path = self.dir.path().join(format!("{}.wav", name));
        server.write_buffer(&buf, &path, "wav", format)?;
        Ok(buf.with_duration(duration).with_path(path))
    }

    /// Free the buffer cached under `name`. Returns whether anything was
    /// freed.
    pub fn free(&self, server: &Arc<dyn Server>, name: &str) -> Result<bool, StudioError> {
        match self.entries.remove(&name.to_string()) {
            Some(buf) => {
                server.free_buffer(&buf)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains(&name.to_string())
    }

    /// Drop every entry without engine-side frees; the ids are assumed
    /// already invalid (post-reboot).
    pub fn invalidate_all(&self) {
        self.entries.clear();
    }
}
