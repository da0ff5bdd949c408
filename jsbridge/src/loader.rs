//! Script retrieval: packaged resources, HTTP downloads, and module
//! resolution
//!
//! Retrieval is a host concern and never runs on the engine thread; the
//! host handle resolves script text first and hands the engine finished
//! strings. ES module imports inside the engine resolve through
//! [`ModuleResolver`], which confines them to the configured script root.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rquickjs::loader::Resolver;
use rquickjs::Ctx;

use crate::config::BridgeConfig;
use crate::error::LoadError;

/// Source of script text for the bridge.
///
/// Both operations resolve a name or URL to complete script text; failures
/// stay typed so callers can distinguish a missing resource from a network
/// fault.
#[async_trait]
pub trait ScriptLoader: Send + Sync {
    /// Read a packaged script by name, relative to the script root
    async fn read_packaged(&self, name: &str) -> Result<String, LoadError>;

    /// Download script text from an absolute URL
    async fn download(&self, url: &str) -> Result<String, LoadError>;
}

/// Loader backed by the configured script root and an HTTP client
pub struct DefaultScriptLoader {
    script_root: Option<PathBuf>,
    client: reqwest::Client,
}

impl DefaultScriptLoader {
    pub fn new(config: &BridgeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!(%error, "failed to build configured HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self {
            script_root: config.script_root.clone(),
            client,
        }
    }
}

#[async_trait]
impl ScriptLoader for DefaultScriptLoader {
    async fn read_packaged(&self, name: &str) -> Result<String, LoadError> {
        let root = self
            .script_root
            .as_ref()
            .ok_or_else(|| LoadError::NoScriptRoot {
                name: name.to_string(),
            })?;
        let path = resolve_packaged(root, name)?;
        tracing::debug!(name, path = %path.display(), "reading packaged script");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| LoadError::Read {
                name: name.to_string(),
                source,
            })
    }

    async fn download(&self, url: &str) -> Result<String, LoadError> {
        let parsed = url::Url::parse(url).map_err(|source| LoadError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        tracing::debug!(url = %parsed, "downloading script");
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|source| LoadError::Http {
                url: url.to_string(),
                source,
            })?;
        response.text().await.map_err(|source| LoadError::Http {
            url: url.to_string(),
            source,
        })
    }
}

/// Resolve a packaged name against the root, rejecting traversal
fn resolve_packaged(root: &Path, name: &str) -> Result<PathBuf, LoadError> {
    let relative = Path::new(name);
    if relative.is_absolute()
        || relative
            .components()
            .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(LoadError::OutsideRoot {
            name: name.to_string(),
        });
    }
    Ok(root.join(relative))
}

/// Restricts ES module resolution to a single directory.
///
/// Relative specifiers resolve against the allowed directory, are
/// canonicalized, and must still sit inside it. Anything else fails to
/// resolve and the import rejects in the guest.
pub(crate) struct ModuleResolver {
    allowed_dir: PathBuf,
}

impl ModuleResolver {
    pub(crate) fn new(allowed_dir: PathBuf) -> Self {
        Self { allowed_dir }
    }
}

impl Resolver for ModuleResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let requested = Path::new(name);
        if requested.is_absolute() {
            tracing::warn!(name, "rejecting absolute module path");
            return Err(rquickjs::Error::new_resolving(base, name));
        }
        let candidate = self.allowed_dir.join(requested);
        let canonical = candidate
            .canonicalize()
            .map_err(|_| rquickjs::Error::new_resolving(base, name))?;
        let allowed = self
            .allowed_dir
            .canonicalize()
            .map_err(|_| rquickjs::Error::new_resolving(base, name))?;
        if !canonical.starts_with(&allowed) {
            tracing::warn!(name, "rejecting module path outside script root");
            return Err(rquickjs::Error::new_resolving(base, name));
        }
        Ok(canonical.to_string_lossy().into_owned())
    }
}
