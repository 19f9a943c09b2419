//! Compiled-artifact cache: generated source plus a freshness manifest.
//!
//! Layout under the cache directory:
//! - `<key>.rs`: generated container module
//! - `<key>.manifest.yaml`: resources, extension order and artifact hash
//!
//! A stale-but-complete artifact is always safe to read; writes go through
//! temp + rename.

pub mod hasher;
pub mod manifest;

use manifest::{write_atomic, Manifest};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Artifact cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write compiled artifact {}: {source}", .path.display())]
    StaleArtifactWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {message}", .path.display())]
    InvalidManifest { path: PathBuf, message: String },
}

/// Why a cached artifact cannot be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    NoManifest,
    GeneratorChanged,
    ExtensionsChanged,
    InputsChanged,
    ResourceMissing(String),
    ResourceChanged(String),
    ArtifactMissing,
    ArtifactChanged,
}

impl std::fmt::Display for Staleness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoManifest => write!(f, "no manifest"),
            Self::GeneratorChanged => write!(f, "generator version changed"),
            Self::ExtensionsChanged => write!(f, "extension list changed"),
            Self::InputsChanged => write!(f, "kernel inputs changed"),
            Self::ResourceMissing(p) => write!(f, "resource {} is missing", p),
            Self::ResourceChanged(p) => write!(f, "resource {} changed", p),
            Self::ArtifactMissing => write!(f, "artifact is missing"),
            Self::ArtifactChanged => write!(f, "artifact was modified"),
        }
    }
}

/// Directory of compiled artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.rs", key))
    }

    pub fn manifest_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.manifest.yaml", key))
    }

    /// Cache key for an ordered extension list and an inputs digest, so two
    /// applications sharing extensions never share an artifact.
    pub fn key_for(extensions: &[String], inputs: &str) -> String {
        let mut parts: Vec<&str> = extensions.iter().map(String::as_str).collect();
        parts.push(inputs);
        hasher::cache_key(&parts)
    }

    pub fn load_manifest(&self, key: &str) -> Result<Option<Manifest>, CacheError> {
        Manifest::load(&self.manifest_path(key))
    }

    /// Compare a manifest against the filesystem and the current inputs.
    pub fn check(
        &self,
        manifest: &Manifest,
        extensions: &[String],
        inputs: &str,
    ) -> Result<(), Staleness> {
        if manifest.generator != crate::core::compiler::GENERATOR {
            return Err(Staleness::GeneratorChanged);
        }
        if manifest.extensions != extensions {
            return Err(Staleness::ExtensionsChanged);
        }
        if manifest.inputs != inputs {
            return Err(Staleness::InputsChanged);
        }
        for (path, expected) in &manifest.resources {
            match hasher::hash_file(Path::new(path)) {
                Ok(actual) if &actual == expected => {}
                Ok(_) => return Err(Staleness::ResourceChanged(path.clone())),
                Err(_) => return Err(Staleness::ResourceMissing(path.clone())),
            }
        }
        match hasher::hash_file(&self.artifact_path(&manifest.key)) {
            Ok(actual) if actual == manifest.artifact_hash => Ok(()),
            Ok(_) => Err(Staleness::ArtifactChanged),
            Err(_) => Err(Staleness::ArtifactMissing),
        }
    }

    pub fn is_fresh(&self, manifest: &Manifest, extensions: &[String], inputs: &str) -> bool {
        self.check(manifest, extensions, inputs).is_ok()
    }

    /// Path of a reusable artifact, or why there is none.
    pub fn lookup(&self, extensions: &[String], inputs: &str) -> Result<PathBuf, Staleness> {
        let key = Self::key_for(extensions, inputs);
        let manifest = match self.load_manifest(&key) {
            Ok(Some(manifest)) => manifest,
            Ok(None) | Err(_) => return Err(Staleness::NoManifest),
        };
        self.check(&manifest, extensions, inputs)?;
        Ok(self.artifact_path(&key))
    }

    /// Write `source` and its manifest. `resources` are the files that
    /// contributed to the registration; relative paths are made absolute.
    pub fn store(
        &self,
        extensions: &[String],
        inputs: &str,
        resources: &[PathBuf],
        source: &str,
    ) -> Result<PathBuf, CacheError> {
        let key = Self::key_for(extensions, inputs);
        let mut manifest = Manifest::new(&key, extensions, inputs);
        for resource in resources {
            let absolute = std::path::absolute(resource).map_err(|source| CacheError::Io {
                path: resource.clone(),
                source,
            })?;
            let hash = hasher::hash_file(&absolute)?;
            manifest
                .resources
                .insert(absolute.to_string_lossy().into_owned(), hash);
        }
        manifest.artifact_hash = hasher::hash_string(source);

        let artifact = self.artifact_path(&key);
        write_atomic(&artifact, source.as_bytes())?;
        manifest.save(&self.manifest_path(&key))?;
        tracing::info!(path = %artifact.display(), "compiled artifact written");
        Ok(artifact)
    }
}
