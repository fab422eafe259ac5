//! Path-keyed cache of loaded samples, plus the synthdef-path cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use beltane_types::StudioError;

use crate::server::{Buffer, Server, ALLOC_TIMEOUT};
use crate::single_flight::{Claimed, SingleFlight};

/// Samples keyed by canonical path, and the set of synthdef paths to
/// replay after a reboot. Both are invalidated together — the entries
/// reference engine-side state that a reboot wipes wholesale.
pub struct SampleLibrary {
    samples: SingleFlight<PathBuf, Buffer>,
    synthdefs: Mutex<HashSet<PathBuf>>,
}

impl SampleLibrary {
    pub fn new() -> Self {
        Self {
            samples: SingleFlight::new(),
            synthdefs: Mutex::new(HashSet::new()),
        }
    }

    /// Load the sample at `path`, reusing the cached buffer when one
    /// exists. Distinct spellings of the same file dedup through
    /// canonicalization; concurrent first loads allocate exactly once.
    pub fn load(
        &self,
        server: &Arc<dyn Server>,
        path: &Path,
    ) -> Result<(Buffer, bool), StudioError> {
        let canonical = Self::canonicalize(path)?;
        let guard = match self.samples.claim(&canonical, |_| true) {
            Claimed::Hit(buf) => return Ok((buf, true)),
            Claimed::Miss(guard) => guard,
        };

        log::debug!(target: "studio::samples", "loading sample {:?}", canonical);
        let loaded = server
            .alloc_buffer_read(&canonical)
            .map_err(StudioError::from)
            .and_then(|buf| {
                buf.wait_ready(ALLOC_TIMEOUT)?;
                Ok(buf.with_path(canonical.clone()))
            });
        match loaded {
            Ok(buf) => {
                guard.install(buf.clone());
                Ok((buf, false))
            }
            Err(e) => {
                guard.abort();
                Err(e)
            }
        }
    }

    fn canonicalize(path: &Path) -> Result<PathBuf, StudioError> {
        if !path.exists() || path.is_dir() {
            return Err(StudioError::SampleNotFound(path.to_path_buf()));
        }
        path.canonicalize()
            .map_err(|_| StudioError::SampleNotFound(path.to_path_buf()))
    }

    pub fn loaded(&self, path: &Path) -> bool {
        path.canonicalize()
            .map(|canonical| self.samples.contains(&canonical))
            .unwrap_or(false)
    }

    /// Free each listed path. Missing entries are skipped; the call is
    /// idempotent.
    pub fn free(&self, server: &Arc<dyn Server>, paths: &[PathBuf]) -> Result<(), StudioError> {
        for path in paths {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if let Some(buf) = self.samples.remove(&canonical) {
                server.free_buffer(&buf)?;
            }
        }
        Ok(())
    }

    /// Free every cached sample and clear the cache.
    pub fn free_all(&self, server: &Arc<dyn Server>) -> Result<(), StudioError> {
        for (_, buf) in self.samples.drain() {
            server.free_buffer(&buf)?;
        }
        Ok(())
    }

    /// Issue a synthdef load and remember the path for post-reboot replay.
    pub fn load_synthdefs(&self, server: &Arc<dyn Server>, path: &Path) -> Result<(), StudioError> {
        server.load_synthdefs(path)?;
        self.synthdefs.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    /// Paths to replay after a reboot: `(samples, synthdefs)`. Clears both
    /// tables without engine-side frees — the old ids are already invalid.
    pub fn take_for_repopulation(&self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let sample_paths = self.samples.ready_keys();
        self.samples.clear();
        let synthdef_paths = {
            let mut set = self.synthdefs.lock().unwrap();
            set.drain().collect()
        };
        (sample_paths, synthdef_paths)
    }
}

impl Default for SampleLibrary {
    fn default() -> Self {
        Self::new()
    }
}
