//! KL-017: Assembly orchestration.
//!
//! load configs → resolve extension order → register all → boot all →
//! finalize collections → freeze → interpret or compile (optionally cached)

use super::compiler::{self, CompileError};
use super::container::{Container, ContainerError};
use super::extension::{Extension, ExtensionCatalog, ExtensionError, Lifecycle};
use super::factory::Factories;
use super::loader::{self, AppConfig, LoadError};
use super::parameters::{ParameterError, Parameters};
use super::registry::{Registry, RegistryError};
use super::value::Value;
use crate::cache::{hasher, ArtifactCache, CacheError};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Anything that can stop an assembly run.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl KernelError {
    /// Extension that was running when the error happened.
    pub fn alias(&self) -> Option<&str> {
        match self {
            Self::Extension(e) => e.alias(),
            _ => None,
        }
    }
}

/// Result of [`Kernel::compile_cached`].
#[derive(Debug)]
pub enum Compiled {
    /// A fresh artifact already existed; no extension code ran.
    Reused(PathBuf),
    /// The registry was assembled, compiled and written.
    Written(PathBuf),
    /// Writing failed; the assembled registry is served by the interpreter.
    Interpreted(Container),
}

impl Compiled {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Reused(p) | Self::Written(p) => Some(p),
            Self::Interpreted(_) => None,
        }
    }
}

/// Collects everything an assembly run needs.
#[derive(Debug, Default)]
pub struct Kernel {
    files: Vec<PathBuf>,
    configs: Vec<AppConfig>,
    parameters: IndexMap<String, Value>,
    extensions: Vec<Box<dyn Extension>>,
    catalog: ExtensionCatalog,
    factories: Option<Factories>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a YAML application file (loaded with its includes at assembly).
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    /// Add an already-parsed configuration. Applied after files.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.configs.push(config);
        self
    }

    /// Set a parameter; overrides anything the configs declare.
    pub fn parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        let mut scratch = Parameters::new(std::mem::take(&mut self.parameters));
        scratch.set(key, value.into());
        self.parameters = scratch.tree().clone();
        self
    }

    pub fn extension(mut self, extension: Box<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn extensions(mut self, extensions: impl IntoIterator<Item = Box<dyn Extension>>) -> Self {
        self.extensions.extend(extensions);
        self
    }

    pub fn catalog(mut self, catalog: ExtensionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Callables for the interpreter. When set, compilation also checks
    /// every statement against them.
    pub fn factories(mut self, factories: Factories) -> Self {
        self.factories = Some(factories);
        self
    }

    fn load(&self) -> Result<AppConfig, KernelError> {
        let mut merged = AppConfig::default();
        for file in &self.files {
            merged.merge(loader::load_config(file)?);
        }
        for config in &self.configs {
            merged.merge(config.clone());
        }
        let mut parameters = Parameters::new(std::mem::take(&mut merged.parameters));
        parameters.merge(self.parameters.clone());
        merged.parameters = parameters.tree().clone();
        Ok(merged)
    }

    fn lifecycle(&mut self) -> Result<Lifecycle, KernelError> {
        let extensions = std::mem::take(&mut self.extensions);
        Ok(Lifecycle::resolve(extensions, &self.catalog)?)
    }

    fn build(&self, mut lifecycle: Lifecycle, config: AppConfig) -> Result<Registry, KernelError> {
        let start = Instant::now();
        let mut registry = Registry::with_parameters(Parameters::new(config.parameters));
        lifecycle.register_all(&mut registry, &config.sections)?;
        tracing::info!(services = registry.len(), "register phase complete");
        lifecycle.boot_all(&mut registry)?;
        registry.freeze()?;
        tracing::info!(
            services = registry.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "registry assembled"
        );
        Ok(registry)
    }

    /// Run the full lifecycle and return the frozen registry.
    pub fn assemble(mut self) -> Result<Registry, KernelError> {
        let config = self.load()?;
        let lifecycle = self.lifecycle()?;
        self.build(lifecycle, config)
    }

    /// Assemble, then serve the registry through the interpreter.
    pub fn container(mut self) -> Result<Container, KernelError> {
        let config = self.load()?;
        let lifecycle = self.lifecycle()?;
        let registry = self.build(lifecycle, config)?;
        Ok(Container::new(registry, self.factories.unwrap_or_default())?)
    }

    /// Assemble, then render the registry as Rust source.
    pub fn compile(mut self) -> Result<String, KernelError> {
        let config = self.load()?;
        let lifecycle = self.lifecycle()?;
        let registry = self.build(lifecycle, config)?;
        Ok(compiler::compile(&registry, self.factories.as_ref())?)
    }

    /// Reuse a fresh artifact from `cache`, or assemble, compile and store a
    /// new one. A failed write falls back to the interpreter.
    pub fn compile_cached(self, cache: &ArtifactCache) -> Result<Compiled, KernelError> {
        self.compile_into(cache, true)
    }

    /// Like [`Kernel::compile_cached`] but never reuses an existing artifact.
    pub fn recompile(self, cache: &ArtifactCache) -> Result<Compiled, KernelError> {
        self.compile_into(cache, false)
    }

    /// Digest of what shapes the registry besides file contents: every
    /// loaded file in load order (so added files and new glob matches
    /// count), inline configs and kernel parameters. `None` when an inline
    /// value holds a live service and has no serialized form.
    fn fingerprint(&self, config: &AppConfig) -> Option<String> {
        let mut parts = vec!["files".to_string()];
        parts.extend(config.sources.iter().map(|p| p.display().to_string()));
        parts.push("configs".to_string());
        for inline in &self.configs {
            parts.push(serde_yaml_ng::to_string(inline).ok()?);
        }
        parts.push("parameters".to_string());
        parts.push(serde_yaml_ng::to_string(&self.parameters).ok()?);
        let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
        Some(hasher::composite_hash(&parts))
    }

    fn compile_into(mut self, cache: &ArtifactCache, reuse: bool) -> Result<Compiled, KernelError> {
        let config = self.load()?;
        let lifecycle = self.lifecycle()?;
        let order = lifecycle.order();
        let inputs = self.fingerprint(&config);
        match (&inputs, reuse) {
            (Some(inputs), true) => match cache.lookup(&order, inputs) {
                Ok(path) => {
                    tracing::info!(path = %path.display(), "reusing compiled artifact");
                    return Ok(Compiled::Reused(path));
                }
                Err(reason) => tracing::info!(%reason, "compiled artifact is stale"),
            },
            (None, true) => tracing::info!("inline inputs hold live services, not reusing"),
            (_, false) => {}
        }

        let resources = config.sources.clone();
        let registry = self.build(lifecycle, config)?;
        let source = compiler::compile(&registry, self.factories.as_ref())?;
        let inputs = inputs.unwrap_or_else(|| hasher::hash_string(&source));
        match cache.store(&order, &inputs, &resources, &source) {
            Ok(path) => Ok(Compiled::Written(path)),
            Err(e @ CacheError::StaleArtifactWriteFailure { .. }) => {
                tracing::warn!(error = %e, "falling back to the interpreting container");
                Ok(Compiled::Interpreted(Container::new(
                    registry,
                    self.factories.unwrap_or_default(),
                )?))
            }
            Err(e) => Err(e.into()),
        }
    }
}
