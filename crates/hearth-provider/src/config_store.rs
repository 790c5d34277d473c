use hearth_config::{ConfigStore, Settings};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// In-memory config store, mainly for tests and throwaway devices. An
/// optional defaults hook stands in for the factory configuration.
#[derive(Default)]
pub struct MemoryConfigStore {
    blobs: Mutex<HashMap<String, String>>,
    defaults: Option<Box<dyn Fn(&mut Settings) + Send + Sync>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: impl Fn(&mut Settings) + Send + Sync + 'static) -> Self {
        MemoryConfigStore {
            blobs: Mutex::new(HashMap::new()),
            defaults: Some(Box::new(defaults)),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_defaults(&self, settings: &mut Settings) {
        if let Some(defaults) = &self.defaults {
            defaults(settings);
        }
    }

    fn load_settings(&self, key: &str) -> Option<String> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn save_settings(&self, key: &str, value: &str) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }
}

/// Config store writing one JSON file per key under a directory. The blobs
/// are stored as-is; protecting them is the deployment's responsibility.
pub struct FileConfigStore {
    dir: PathBuf,
    defaults: Option<Box<dyn Fn(&mut Settings) + Send + Sync>>,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileConfigStore {
            dir: dir.into(),
            defaults: None,
        }
    }

    pub fn with_defaults(
        dir: impl Into<PathBuf>,
        defaults: impl Fn(&mut Settings) + Send + Sync + 'static,
    ) -> Self {
        FileConfigStore {
            dir: dir.into(),
            defaults: Some(Box::new(defaults)),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are internal constants, but keep them filesystem-safe anyway.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl ConfigStore for FileConfigStore {
    fn load_defaults(&self, settings: &mut Settings) {
        if let Some(defaults) = &self.defaults {
            defaults(settings);
        }
    }

    fn load_settings(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn save_settings(&self, key: &str, value: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot create config directory");
            return;
        }
        if let Err(e) = std::fs::write(self.path_for(key), value) {
            warn!(key, error = %e, "failed to write settings");
        }
    }
}
