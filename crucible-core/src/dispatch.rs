//! Backend discovery and selection.
//!
//! The registry holds every known backend for the life of the process.
//! Selection hands the raw header bytes to each backend in registration
//! order; the first match wins, the fallback catches the rest.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backend::BackendModule;
use crate::dynamic::DynamicBackend;
use crate::error::{Error, Result};

/// Environment variable naming the directory scanned into the global
/// registry on first use.
pub const BACKEND_PATH_ENV: &str = "CRUCIBLE_BACKEND_PATH";

#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn BackendModule>>,
    fallback: Option<Arc<dyn BackendModule>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. At most one fallback is kept; a later fallback
    /// replaces an earlier one.
    pub fn register(&mut self, module: Arc<dyn BackendModule>) {
        let descriptor = module.descriptor();
        if descriptor.is_fallback {
            if let Some(previous) = &self.fallback {
                warn!(
                    replaced = previous.descriptor().name,
                    by = descriptor.name,
                    "replacing fallback backend"
                );
            }
            self.fallback = Some(module);
        } else {
            self.backends.push(module);
        }
    }

    /// Load every shared library in `dir` that exports the module symbol.
    /// Files that fail to load or lack the symbol are skipped.
    ///
    /// Returns the number of modules registered.
    pub fn scan_dir(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "backend directory not readable");
                return 0;
            }
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(std::env::consts::DLL_EXTENSION)
            {
                continue;
            }
            match DynamicBackend::load(&path) {
                Ok(module) => {
                    info!(
                        module = %path.display(),
                        backend = module.descriptor().name,
                        "loaded backend module"
                    );
                    self.register(Arc::new(module));
                    loaded += 1;
                }
                Err(err) => debug!(module = %path.display(), %err, "skipping module"),
            }
        }
        loaded
    }

    /// Pick the backend for a model file header.
    pub fn select(&self, header: &[u8]) -> Result<Arc<dyn BackendModule>> {
        for backend in &self.backends {
            if backend.identify(header) {
                return Ok(backend.clone());
            }
        }
        self.fallback.clone().ok_or(Error::NoBackend)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty() && self.fallback.is_none()
    }

    /// Registered backends, fallback included.
    pub fn len(&self) -> usize {
        self.backends.len() + usize::from(self.fallback.is_some())
    }
}

/// The process-wide registry.
///
/// Initialized on first use by scanning [`BACKEND_PATH_ENV`] if set. Never
/// dropped, so dynamically loaded module handles live for the rest of the
/// process.
pub fn global() -> &'static RwLock<BackendRegistry> {
    static REGISTRY: OnceLock<RwLock<BackendRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = BackendRegistry::new();
        if let Ok(dir) = std::env::var(BACKEND_PATH_ENV) {
            let loaded = registry.scan_dir(Path::new(&dir));
            info!(dir = %dir, loaded, "scanned backend directory");
        }
        RwLock::new(registry)
    })
}
