//! Lifecycle progress events for an external observer.
//!
//! Events are newline-delimited strings appended to a named pipe handed over
//! on the command line. Opens are non-blocking so a missing reader never
//! stalls the manager; without a configured path every update is a no-op.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

pub const WAITING_FOR_STANDALONE_MODULES: &str = "WAITING_FOR_STANDALONE_MODULES";
pub const ALL_MODULES_STARTED: &str = "ALL_MODULES_STARTED";
pub const MODULE_FAILED: &str = "MODULE_FAILED";
pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";

#[derive(Clone, Default)]
pub struct StatusFifo {
    path: Option<Arc<PathBuf>>,
}

impl StatusFifo {
    /// An empty path disables the sink.
    pub fn create_from_path(path: &str) -> Self {
        if path.is_empty() {
            Self::default()
        } else {
            Self {
                path: Some(Arc::new(PathBuf::from(path))),
            }
        }
    }

    pub fn update(&self, event: &str) {
        let Some(path) = &self.path else { return };
        match OpenOptions::new()
            .write(true)
            .append(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path.as_ref())
        {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{event}") {
                    warn!(path = %path.display(), error = %e, "status fifo write failed");
                }
            }
            Err(e) => {
                // typically: nobody has the read end open
                debug!(path = %path.display(), error = %e, "status fifo not writable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        std::fs::write(&path, "").unwrap();

        let fifo = StatusFifo::create_from_path(path.to_str().unwrap());
        fifo.update(ALL_MODULES_STARTED);
        fifo.update(&format!("{MODULE_FAILED} store"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "ALL_MODULES_STARTED\nMODULE_FAILED store\n");
    }

    #[test]
    fn empty_path_disables_the_sink() {
        let fifo = StatusFifo::create_from_path("");
        fifo.update(SHUTTING_DOWN);
    }
}
