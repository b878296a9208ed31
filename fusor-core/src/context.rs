use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use tracing::info;

/// Compile counters owned by the context; dropping it logs the summary, so
/// the embedder decides the reporting lifetime.
pub struct CompileStats {
    started: Instant,
    pub kernels: Cell<usize>,
}

impl CompileStats {
    fn new() -> CompileStats {
        CompileStats {
            started: Instant::now(),
            kernels: Cell::new(0),
        }
    }
}

impl Drop for CompileStats {
    fn drop(&mut self) {
        if self.kernels.get() > 0 {
            info!(
                kernels = self.kernels.get(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "compile session"
            );
        }
    }
}

/// Per-job compiler state, threaded explicitly through the pipeline stages.
/// Nothing here is process-global.
pub struct CompileContext {
    /// 0 silent, 1 kernels, 2 schedules, 3+ ordered uops.
    pub debug: u8,
    /// Disable the optional lowering heuristics (grouping, upcasting).
    pub no_opt: bool,
    /// On-disk cache for rendered kernel source; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    pub stats: CompileStats,
    // kernel name -> hash of the source it was first used for
    names: RefCell<HashMap<String, u64>>,
}

impl Default for CompileContext {
    fn default() -> Self {
        CompileContext::new()
    }
}

impl CompileContext {
    pub fn new() -> CompileContext {
        CompileContext {
            debug: 0,
            no_opt: false,
            cache_dir: dirs::home_dir().map(|h| h.join(".cache/fusor/src")),
            stats: CompileStats::new(),
            names: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_debug(mut self, debug: u8) -> CompileContext {
        self.debug = debug;
        self
    }

    pub fn without_opts(mut self) -> CompileContext {
        self.no_opt = true;
        self
    }

    /// Stable kernel naming: `base` is reused for identical source, and gets
    /// a numeric suffix when a prior rendering claimed it with different
    /// source.
    pub fn kernel_name(&self, base: &str, source_hash: u64) -> String {
        let mut names = self.names.borrow_mut();
        let mut candidate = base.to_string();
        let mut n = 1usize;
        loop {
            match names.get(&candidate) {
                None => {
                    names.insert(candidate.clone(), source_hash);
                    return candidate;
                }
                Some(h) if *h == source_hash => return candidate,
                Some(_) => {
                    candidate = format!("{base}n{n}");
                    n += 1;
                }
            }
        }
    }

    /// Best-effort source cache write; failures are ignored, the cache is
    /// purely an inspection convenience.
    pub fn cache_source(&self, name: &str, source: &str) {
        if let Some(dir) = &self.cache_dir {
            if fs::create_dir_all(dir).is_ok() {
                let _ = fs::write(dir.join(format!("{name}.c")), source);
            }
        }
    }
}
