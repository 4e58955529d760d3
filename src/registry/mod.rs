//! Artifact registries.
//!
//! This module provides:
//! - [`Registry`]: a configured registry bound to one environment's image path
//! - [`TagLister`]: tag listing over the OCI distribution API
//! - [`RegistryVersionResolver`]: next-version negotiation against the default registry
//!
//! Version negotiation is read-only. Two concurrent runs for the same image
//! path can compute the same next version; the later push overwrites the
//! earlier image.

pub mod version;

pub use version::{is_version_tag, next_version, parse_tag, VersionParseError, INITIAL_VERSION};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{RegistryConfig, Settings, DEFAULT_REGISTRY};
use crate::logging::LogSink;

/// Errors from registry HTTP calls.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Invalid registry URL '{0}'")]
    InvalidUrl(String),
}

/// A configured registry bound to an environment's image path.
#[derive(Clone)]
pub struct Registry {
    /// Configuration key of this registry.
    pub key: String,
    pub url: String,
    pub username: String,
    pub password: String,
    image_path: String,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("image_path", &self.image_path)
            .finish()
    }
}

impl Registry {
    /// Binds registry `key` to the image path derived from `env_name`.
    pub fn new(key: impl Into<String>, config: &RegistryConfig, env_name: &str) -> Self {
        Self {
            key: key.into(),
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            image_path: image_path(env_name),
        }
    }

    /// Every configured registry, in configuration key order.
    pub fn all(settings: &Settings, env_name: &str) -> Vec<Self> {
        settings
            .artifacts
            .registries
            .iter()
            .map(|(key, config)| Self::new(key, config, env_name))
            .collect()
    }

    /// The registry used for version negotiation and module files.
    pub fn default_for(settings: &Settings, env_name: &str) -> Result<Self, crate::config::ConfigError> {
        settings
            .default_registry()
            .map(|config| Self::new(DEFAULT_REGISTRY, config, env_name))
    }

    /// Image path relative to the registry URL.
    pub fn image_path(&self) -> &str {
        &self.image_path
    }

    /// Full image URL without a tag.
    pub fn image_url(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.image_path)
    }

    /// Image reference for `version`.
    pub fn image_ref(&self, version: &str) -> String {
        format!("{}:{}", self.image_url(), version)
    }

    /// The distribution API endpoint listing tags of this image.
    ///
    /// `http://` registries are queried over plain HTTP; every other scheme
    /// (`oras://`, `docker://`, none) over HTTPS.
    pub fn tags_endpoint(&self) -> Result<String, RegistryError> {
        let url = self.image_url();
        let (scheme, rest) = match url.split_once("://") {
            Some(("http", rest)) => ("http", rest),
            Some((_, rest)) => ("https", rest),
            None => ("https", url.as_str()),
        };
        let (host, repository) = rest
            .split_once('/')
            .ok_or_else(|| RegistryError::InvalidUrl(url.clone()))?;
        if host.is_empty() || repository.is_empty() {
            return Err(RegistryError::InvalidUrl(url.clone()));
        }
        Ok(format!("{}://{}/v2/{}/tags/list", scheme, host, repository))
    }
}

/// Derives the image path from an environment name.
///
/// Parent components are joined with `-`, so `users/alice/env` becomes
/// `users-alice/env` and `env` stays `env`.
pub fn image_path(env_name: &str) -> String {
    let path = Path::new(env_name.trim());
    let last = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parents: Vec<String> = path
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if parents.is_empty() {
        last
    } else {
        format!("{}/{}", parents.join("-"), last)
    }
}

/// Lists the tags of an image.
#[async_trait]
pub trait TagLister: Send + Sync {
    async fn list_tags(&self, registry: &Registry) -> Result<Vec<String>, RegistryError>;
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Tag listing over the OCI distribution API.
#[derive(Debug, Clone)]
pub struct HttpTagLister {
    client: Client,
}

impl HttpTagLister {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

impl Default for HttpTagLister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TagLister for HttpTagLister {
    async fn list_tags(&self, registry: &Registry) -> Result<Vec<String>, RegistryError> {
        let url = registry.tags_endpoint()?;
        let mut request = self
            .client
            .get(&url)
            .header("User-Agent", "envforge/0.1")
            .header("Accept", "application/json");
        if !registry.username.is_empty() {
            request = request.basic_auth(&registry.username, Some(&registry.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }
}

/// Computes the next image version against a registry.
#[derive(Clone)]
pub struct RegistryVersionResolver {
    lister: Arc<dyn TagLister>,
}

impl RegistryVersionResolver {
    pub fn new(lister: Arc<dyn TagLister>) -> Self {
        Self { lister }
    }

    /// Resolver backed by [`HttpTagLister`].
    pub fn http() -> Self {
        Self::new(Arc::new(HttpTagLister::new()))
    }

    /// Returns the next version for `registry`'s image path.
    ///
    /// An unreachable registry behaves like one without tags; the failure is
    /// written to the run log.
    pub async fn next_version(&self, registry: &Registry, sink: &LogSink) -> String {
        let tags = match self.lister.list_tags(registry).await {
            Ok(tags) => tags,
            Err(e) => {
                sink.warn(&format!(
                    "tag listing for {} ({}) failed, assuming no tags: {}",
                    registry.image_url(),
                    registry.key,
                    e
                ));
                Vec::new()
            }
        };
        next_version(&tags)
    }
}
