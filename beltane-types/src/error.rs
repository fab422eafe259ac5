use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by studio operations.
#[derive(Debug)]
pub enum StudioError {
    /// Operation rejected because the server is mid-reboot. Recoverable:
    /// retry once the reboot completes.
    RebootInProgress,
    /// Requested sample path does not exist or is a directory.
    SampleNotFound(PathBuf),
    /// The engine never acknowledged a buffer allocation.
    AllocationTimeout(Duration),
    /// Recording bit depth outside 8/16/24/32.
    InvalidBitDepth(u32),
    /// Engine-side or transport failure.
    Server(String),
    Io(std::io::Error),
}

impl StudioError {
    /// The only variant callers are expected to branch on for retry logic.
    pub fn is_reboot_in_progress(&self) -> bool {
        matches!(self, Self::RebootInProgress)
    }
}

impl fmt::Display for StudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RebootInProgress => write!(f, "server is currently rebooting"),
            Self::SampleNotFound(path) => {
                write!(f, "no sample exists with path: {}", path.display())
            }
            Self::AllocationTimeout(waited) => write!(
                f,
                "engine did not acknowledge buffer allocation within {:?}",
                waited
            ),
            Self::InvalidBitDepth(depth) => write!(
                f,
                "unknown recording bit depth: {} (expected one of 8, 16, 24 or 32)",
                depth
            ),
            Self::Server(msg) => write!(f, "{}", msg),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StudioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StudioError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reboot_rejection_is_distinguishable() {
        assert!(StudioError::RebootInProgress.is_reboot_in_progress());
        assert!(!StudioError::Server("boom".into()).is_reboot_in_progress());
    }

    #[test]
    fn display_names_the_missing_path() {
        let e = StudioError::SampleNotFound(PathBuf::from("/tmp/missing.wav"));
        assert!(e.to_string().contains("/tmp/missing.wav"));
    }
}
