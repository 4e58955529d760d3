//! Manifest patching.
//!
//! A patch loads the workspace manifest, merges the configured base block, the
//! caller's overlay and at most one pattern-selected block into its `spack`
//! section, then writes it back. Patching is idempotent for scalar and mapping
//! values, so stages can re-apply their overlay safely.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::config::{Settings, SpecRule};
use crate::error::PipelineError;
use crate::utils::{deep_merge, patterns};

const SPACK_KEY: &str = "spack";

/// Patches the manifest of one run workspace.
#[derive(Debug, Clone)]
pub struct ManifestPatcher {
    path: PathBuf,
    base: Value,
    rules: Vec<SpecRule>,
}

impl ManifestPatcher {
    /// Creates a patcher for the manifest inside `workspace`.
    pub fn new(settings: &Settings, workspace: &Path) -> Self {
        Self {
            path: workspace.join(&settings.spack.manifest.name),
            base: settings.spack.manifest.spack.clone(),
            rules: settings.spack.manifest.specs.clone(),
        }
    }

    /// Path of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the manifest document.
    ///
    /// # Errors
    ///
    /// Returns `ManifestPatch` if the file is missing, unreadable or not a
    /// mapping.
    pub fn load(&self) -> Result<Value, PipelineError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| PipelineError::manifest(&self.path, e.to_string()))?;
        let document: Value = serde_yaml::from_str(&text)
            .map_err(|e| PipelineError::manifest(&self.path, e.to_string()))?;
        match document {
            Value::Mapping(_) => Ok(document),
            Value::Null => Ok(Value::Mapping(Mapping::new())),
            _ => Err(PipelineError::manifest(
                &self.path,
                "manifest root is not a mapping",
            )),
        }
    }

    /// Applies `overlay` to the manifest and writes it back.
    ///
    /// Returns the patched document.
    ///
    /// # Errors
    ///
    /// Returns `ManifestPatch` if the manifest cannot be loaded or written.
    pub fn patch(&self, overlay: &Value) -> Result<Value, PipelineError> {
        let mut document = self.load()?;
        let section = spack_section(&mut document, &self.path)?;

        deep_merge(section, &self.base);
        deep_merge(section, overlay);

        let specs = manifest_specs(section);
        if let Some(rule) = patterns::first_match(&self.rules, &specs, |r| r.pattern.as_str()) {
            deep_merge(section, &rule.spack);
        }

        let text = serde_yaml::to_string(&document)
            .map_err(|e| PipelineError::manifest(&self.path, e.to_string()))?;
        std::fs::write(&self.path, text)
            .map_err(|e| PipelineError::manifest(&self.path, e.to_string()))?;

        Ok(document)
    }

    /// Reads the base OS image configured in the manifest's container section.
    pub fn container_os(&self) -> Result<Option<String>, PipelineError> {
        let document = self.load()?;
        Ok(document
            .get(SPACK_KEY)
            .and_then(|s| s.get("container"))
            .and_then(|c| c.get("images"))
            .and_then(|i| i.get("os"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// Returns the `spack` section, creating it when absent.
fn spack_section<'a>(document: &'a mut Value, path: &Path) -> Result<&'a mut Value, PipelineError> {
    let root = document
        .as_mapping_mut()
        .ok_or_else(|| PipelineError::manifest(path, "manifest root is not a mapping"))?;
    let key = Value::from(SPACK_KEY);
    if !matches!(root.get(&key), Some(Value::Mapping(_))) {
        root.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    root.get_mut(&key)
        .ok_or_else(|| PipelineError::manifest(path, "missing spack section"))
}

/// Spec strings currently listed in the manifest.
fn manifest_specs(section: &Value) -> Vec<String> {
    section
        .get("specs")
        .and_then(Value::as_sequence)
        .map(|specs| {
            specs
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = "spack:\n  specs:\n  - zlib\n  - cuda-toolkit@12\n  view: true\n";

    fn patcher(dir: &Path, overrides: &str) -> ManifestPatcher {
        let settings = Settings::from_yaml_layers(Some(overrides)).unwrap();
        ManifestPatcher::new(&settings, dir)
    }

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_missing_manifest_is_error() {
        let dir = TempDir::new().unwrap();
        let p = patcher(dir.path(), "{}");
        let err = p.patch(&Value::Null).unwrap_err();
        assert!(matches!(err, PipelineError::ManifestPatch { .. }));
    }

    #[test]
    fn test_unparseable_manifest_is_error() {
        let dir = TempDir::new().unwrap();
        let p = patcher(dir.path(), "{}");
        std::fs::write(p.path(), "spack: [unclosed").unwrap();
        assert!(matches!(
            p.patch(&Value::Null),
            Err(PipelineError::ManifestPatch { .. })
        ));
    }

    #[test]
    fn test_base_and_overlay_are_merged_keeping_specs() {
        let dir = TempDir::new().unwrap();
        let p = patcher(dir.path(), "{}");
        std::fs::write(p.path(), MANIFEST).unwrap();

        let doc = p
            .patch(&yaml("container:\n  template: envforge/singularity-build.def\n"))
            .unwrap();
        let spack = &doc["spack"];

        assert_eq!(spack["specs"][0], Value::from("zlib"));
        assert_eq!(spack["specs"][1], Value::from("cuda-toolkit@12"));
        // Base configuration wins over the existing value
        assert_eq!(spack["view"], Value::from(false));
        assert_eq!(spack["container"]["images"]["os"], Value::from("ubuntu:22.04"));
        assert_eq!(
            spack["container"]["template"],
            Value::from("envforge/singularity-build.def")
        );
    }

    #[test]
    fn test_patch_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let p = patcher(dir.path(), "{}");
        std::fs::write(p.path(), MANIFEST).unwrap();
        let overlay = yaml("container:\n  template: t.def\n  labels:\n    app: demo\n");

        p.patch(&overlay).unwrap();
        let once = std::fs::read_to_string(p.path()).unwrap();
        p.patch(&overlay).unwrap();
        let twice = std::fs::read_to_string(p.path()).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_first_matching_spec_rule_applies() {
        let dir = TempDir::new().unwrap();
        let p = patcher(
            dir.path(),
            "spack:\n  manifest:\n    specs:\n      - pattern: cuda\n        spack:\n          packages:\n            all:\n              variants: +cuda\n      - pattern: zlib\n        spack:\n          packages:\n            all:\n              variants: ~shared\n",
        );
        std::fs::write(p.path(), MANIFEST).unwrap();

        let doc = p.patch(&Value::Null).unwrap();
        assert_eq!(
            doc["spack"]["packages"]["all"]["variants"],
            Value::from("+cuda")
        );
    }

    #[test]
    fn test_rule_without_matching_spec_is_skipped() {
        let dir = TempDir::new().unwrap();
        let p = patcher(
            dir.path(),
            "spack:\n  manifest:\n    specs:\n      - pattern: openmpi\n        spack:\n          mpi: true\n",
        );
        std::fs::write(p.path(), MANIFEST).unwrap();

        let doc = p.patch(&Value::Null).unwrap();
        assert!(doc["spack"].get("mpi").is_none());
    }

    #[test]
    fn test_multiline_strings_written_as_block() {
        let dir = TempDir::new().unwrap();
        let p = patcher(dir.path(), "{}");
        std::fs::write(p.path(), MANIFEST).unwrap();

        p.patch(&yaml("container:\n  labels:\n    notes: \"first line\\nsecond line\\n\"\n"))
            .unwrap();
        let text = std::fs::read_to_string(p.path()).unwrap();
        assert!(text.contains("notes: |"));

        let reloaded = p.load().unwrap();
        assert_eq!(
            reloaded["spack"]["container"]["labels"]["notes"],
            Value::from("first line\nsecond line\n")
        );
    }

    #[test]
    fn test_container_os() {
        let dir = TempDir::new().unwrap();
        let p = patcher(dir.path(), "{}");
        std::fs::write(p.path(), MANIFEST).unwrap();
        assert_eq!(p.container_os().unwrap(), None);
        p.patch(&Value::Null).unwrap();
        assert_eq!(p.container_os().unwrap().as_deref(), Some("ubuntu:22.04"));
    }
}
