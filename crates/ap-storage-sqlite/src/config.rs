//! Repository configuration (§6 "Persistent layout").

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Optional sink receiving a formatted log/error message, forwarded
/// alongside the `tracing` events the engine emits (§6).
pub type LogSink = Arc<dyn Fn(std::fmt::Arguments) + Send + Sync>;

/// Configuration recognized at repository construction (§6).
#[derive(Clone)]
pub struct Config {
    /// Directory holding `storage.sqlite`; must exist or be creatable with
    /// mode 0700.
    pub path: PathBuf,
    pub cache_enable: bool,
    pub log_fn: Option<LogSink>,
    pub err_fn: Option<LogSink>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("cache_enable", &self.cache_enable)
            .field("log_fn", &self.log_fn.is_some())
            .field("err_fn", &self.err_fn.is_some())
            .finish()
    }
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Config {
            path: path.into(),
            cache_enable: false,
            log_fn: None,
            err_fn: None,
        }
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enable = enabled;
        self
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.path.join("storage.sqlite")
    }
}
