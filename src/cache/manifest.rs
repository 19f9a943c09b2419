//! KL-014: Freshness manifest stored next to a compiled artifact.

use super::CacheError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_SCHEMA: &str = "1.0";

/// Everything that contributed to one compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema: String,
    pub generator: String,
    pub key: String,
    /// Extension aliases in resolved order.
    pub extensions: Vec<String>,
    /// Digest of the kernel inputs that are not file contents: the loaded
    /// file list, inline configs and kernel parameters.
    pub inputs: String,
    /// Absolute resource path → `blake3:` content hash.
    pub resources: IndexMap<String, String>,
    pub artifact_hash: String,
}

impl Manifest {
    pub fn new(key: &str, extensions: &[String], inputs: &str) -> Self {
        Self {
            schema: MANIFEST_SCHEMA.to_string(),
            generator: crate::core::compiler::GENERATOR.to_string(),
            key: key.to_string(),
            extensions: extensions.to_vec(),
            inputs: inputs.to_string(),
            resources: IndexMap::new(),
            artifact_hash: String::new(),
        }
    }

    /// Paths whose changes invalidate the artifact, for build scripts
    /// (`cargo:rerun-if-changed=`).
    pub fn rerun_if_changed(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Load a manifest. Returns `None` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest =
            serde_yaml_ng::from_str(&content).map_err(|e| CacheError::InvalidManifest {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Some(manifest))
    }

    /// Save atomically (write to temp, then rename).
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let yaml = serde_yaml_ng::to_string(self).map_err(|e| CacheError::InvalidManifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        write_atomic(path, yaml.as_bytes())
    }
}

/// Write `contents` to a sibling temp file, then rename over `path`, so a
/// concurrent reader sees either the old file or the complete new one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let failure = |source: std::io::Error| CacheError::StaleArtifactWriteFailure {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(failure)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, contents).map_err(failure)?;
    std::fs::rename(&tmp_path, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp_path);
        failure(source)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kl014_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.manifest.yaml");
        let mut m = Manifest::new("abc", &["services".to_string()], "blake3:22");
        m.resources.insert("/srv/app.yaml".into(), "blake3:00".into());
        m.artifact_hash = "blake3:11".into();
        m.save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), Some(m));
    }

    #[test]
    fn test_kl014_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Manifest::load(&dir.path().join("none.yaml")).unwrap(), None);
    }

    #[test]
    fn test_kl014_load_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "schema: [unclosed").unwrap();
        assert!(matches!(
            Manifest::load(&path),
            Err(CacheError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_kl014_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.rs");
        write_atomic(&path, b"fn main() {}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fn main() {}");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_kl014_rerun_if_changed_lists_resources() {
        let mut m = Manifest::new("k", &[], "");
        m.resources.insert("/a.yaml".into(), "blake3:1".into());
        m.resources.insert("/b.yaml".into(), "blake3:2".into());
        assert_eq!(
            m.rerun_if_changed().collect::<Vec<_>>(),
            vec!["/a.yaml", "/b.yaml"]
        );
    }
}
