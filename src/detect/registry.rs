use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::StubPoseDetector;

/// Detector selection as it appears in configuration.
#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// Backend name ("stub", "tract").
    pub backend: String,
    /// Model file for model-backed detectors.
    pub model_path: Option<PathBuf>,
    /// Square model input size in pixels.
    pub input_size: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            input_size: 640,
        }
    }
}

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct DetectorRegistry {
    backends: HashMap<String, Arc<Mutex<dyn DetectorBackend>>>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Build a registry holding every backend compiled into this binary that the
    /// settings can construct, with the configured backend as default.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(StubPoseDetector::new());

        #[cfg(feature = "backend-tract")]
        if let Some(model_path) = &settings.model_path {
            let backend = super::backends::TractPoseBackend::new(model_path, settings.input_size)?;
            registry.register(backend);
        }

        registry.set_default(&settings.backend).map_err(|e| {
            anyhow!(
                "{} (available: {})",
                e,
                registry.list().join(", ")
            )
        })?;
        Ok(registry)
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("detector backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PersonPose;

    struct NamedFake(&'static str);

    impl DetectorBackend for NamedFake {
        fn name(&self) -> &'static str {
            self.0
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> Result<Vec<PersonPose>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn first_registered_backend_is_default() -> Result<()> {
        let mut registry = DetectorRegistry::new();
        registry.register(NamedFake("a"));
        registry.register(NamedFake("b"));

        let default = registry.default_backend().ok_or_else(|| anyhow!("no default"))?;
        let name = default.lock().map_err(|_| anyhow!("poisoned"))?.name();
        assert_eq!(name, "a");

        registry.set_default("b")?;
        let default = registry.default_backend().ok_or_else(|| anyhow!("no default"))?;
        let name = default.lock().map_err(|_| anyhow!("poisoned"))?.name();
        assert_eq!(name, "b");
        Ok(())
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let settings = DetectorSettings {
            backend: "openpose".to_string(),
            ..DetectorSettings::default()
        };
        assert!(DetectorRegistry::from_settings(&settings).is_err());
    }

    #[test]
    fn default_settings_select_stub() -> Result<()> {
        let registry = DetectorRegistry::from_settings(&DetectorSettings::default())?;
        assert_eq!(registry.list(), vec!["stub".to_string()]);
        assert!(registry.get("stub").is_some());
        Ok(())
    }
}
