use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const QUALIFIER: &str = "dev";
const ORGANIZATION: &str = "featureflow";
const APPLICATION: &str = "featureflow";

/// Process-wide knobs for the extraction runtime, loaded with `serde` +
/// `toml` and a `Default` impl that is safe to run with out of the box.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Size, in bytes, of the chunks a source node reads at a time.
    /// Small in tests so that chunk-boundary behavior is exercised; large in
    /// production to amortize syscall and allocation overhead.
    pub chunk_size: usize,
    /// Bound on the scheduler's pending-envelope stack before it is
    /// considered a runaway graph. `0` means unbounded.
    pub max_pending_envelopes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_pending_envelopes: 0,
        }
    }
}

/// Default directory for filesystem-backed `Database` implementations when
/// the caller hasn't specified one explicitly.
pub fn get_default_cache_dir() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION) {
        return dirs.cache_dir().to_path_buf();
    }

    PathBuf::from(APPLICATION)
}
