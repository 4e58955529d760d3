//! Module file rendering.
//!
//! A module file tells downstream users how to load a built environment. The
//! template is chosen by matching requested packages against configured
//! `{name, pattern}` rules (first match wins, otherwise the default template)
//! and rendered with `tera`.
//!
//! Templates see these variables:
//! - `description`: environment description
//! - `packages`: requested packages in order
//! - `build.id`, `build.image`, `build.created`, `build.updated`
//! - `cache_dir`: container cache directory

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use uuid::Uuid;

use crate::config::{Settings, TemplateRule};
use crate::error::PipelineError;
use crate::utils::patterns;

/// Build metadata rendered into a module file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    pub id: Uuid,
    /// Published image reference, `<image url>:<version>`.
    pub image: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Renders module files from configured templates.
#[derive(Debug, Clone)]
pub struct ModuleFileRenderer {
    templates_dir: PathBuf,
    default_template: String,
    rules: Vec<TemplateRule>,
    cache_dir: PathBuf,
    filename: String,
}

impl ModuleFileRenderer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            templates_dir: settings.modules.templates.path.clone(),
            default_template: settings.modules.templates.default.clone(),
            rules: settings.modules.templates.patterns.clone(),
            cache_dir: settings.container.cache.clone(),
            filename: settings.modules.name.clone(),
        }
    }

    /// Name of the template used for `packages`.
    pub fn select_template<S: AsRef<str>>(&self, packages: &[S]) -> &str {
        patterns::first_match(&self.rules, packages, |r| r.pattern.as_str())
            .map(|rule| rule.name.as_str())
            .unwrap_or(self.default_template.as_str())
    }

    /// Output path of the module file inside `workspace`.
    pub fn output_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.filename)
    }

    /// Renders the module file content.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the template file cannot be read, or a template
    /// error if it fails to render.
    pub fn render(
        &self,
        description: &str,
        packages: &[String],
        build: &BuildInfo,
    ) -> Result<String, PipelineError> {
        let template_path = self.templates_dir.join(self.select_template(packages));
        let template = std::fs::read_to_string(&template_path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("module template {}: {}", template_path.display(), e),
            )
        })?;

        let mut context = Context::new();
        context.insert("description", description);
        context.insert("packages", packages);
        context.insert("build", build);
        context.insert("cache_dir", &self.cache_dir.display().to_string());

        Ok(Tera::one_off(&template, &context, false)?)
    }

    /// Renders the module file and writes it into `workspace`.
    ///
    /// Returns the written path.
    pub fn write(
        &self,
        workspace: &Path,
        description: &str,
        packages: &[String],
        build: &BuildInfo,
    ) -> Result<PathBuf, PipelineError> {
        let content = self.render(description, packages, build)?;
        let path = self.output_path(workspace);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
