//! Content resolver
//!
//! Serves decrypted assets to the UI layer through a privileged custom
//! resource scheme. Resolution is independent of any windowing shell: a
//! host registers [`SchemeConfig`] before signalling readiness and routes
//! each request through [`ContentResolver::handle`]. Requests share no
//! mutable state; decryption runs inline.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::archive;
use crate::crypto::{self, ContentKey};

/// Long-lived immutable caching for everything served off the archive
const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

const FALLBACK_MIME: &str = "application/octet-stream";

/// Privileged scheme registration, consumed by the host shell before it
/// signals readiness. CSP bypass plus standard/secure/fetch privileges
/// match what an app window needs to treat the scheme as a real origin.
#[derive(Debug, Clone)]
pub struct SchemeConfig {
    pub scheme: String,
    pub authority: String,
    pub bypass_csp: bool,
    pub standard: bool,
    pub secure: bool,
    pub supports_fetch: bool,
}

impl Default for SchemeConfig {
    fn default() -> Self {
        SchemeConfig {
            scheme: "shroud".to_string(),
            authority: "app".to_string(),
            bypass_csp: true,
            standard: true,
            secure: true,
            supports_fetch: true,
        }
    }
}

impl SchemeConfig {
    /// Origin prefix requests arrive under, e.g. `shroud://app/`
    pub fn origin(&self) -> String {
        format!("{}://{}/", self.scheme, self.authority)
    }
}

/// Where asset bytes come from. Implementations: the packed archive in
/// production, a plain directory during development, fakes in tests.
pub trait AssetSource {
    /// `Ok(None)` when no asset exists at `rel_path`; `Err` only for
    /// internal failures.
    fn read(&self, rel_path: &str) -> Result<Option<Vec<u8>>>;
}

/// Assets read out of the shipped archive
pub struct ArchiveSource {
    archive_path: PathBuf,
    asset_subtree: String,
}

impl ArchiveSource {
    pub fn new(archive_path: PathBuf, asset_subtree: impl Into<String>) -> Self {
        ArchiveSource {
            archive_path,
            asset_subtree: asset_subtree.into(),
        }
    }
}

impl AssetSource for ArchiveSource {
    fn read(&self, rel_path: &str) -> Result<Option<Vec<u8>>> {
        let entry = format!("{}/{}", self.asset_subtree, rel_path);
        archive::read_entry(&self.archive_path, &entry)
            .with_context(|| format!("Failed to read archive entry: {entry}"))
    }
}

/// Assets read from a directory tree (dev serving)
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: PathBuf) -> Self {
        DirSource { root }
    }
}

impl AssetSource for DirSource {
    fn read(&self, rel_path: &str) -> Result<Option<Vec<u8>>> {
        let path = self.root.join(rel_path);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map(Some)
            .with_context(|| format!("Failed to read asset: {}", path.display()))
    }
}

/// One resolved response
#[derive(Debug)]
pub struct ResourceResponse {
    pub status: u16,
    pub mime_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Resolver over one asset source
pub struct ContentResolver<S: AssetSource> {
    scheme: SchemeConfig,
    source: S,
    key: ContentKey,
    protected_extensions: Vec<String>,
    index_document: String,
}

impl<S: AssetSource> ContentResolver<S> {
    pub fn new(
        scheme: SchemeConfig,
        source: S,
        key: ContentKey,
        protected_extensions: Vec<String>,
    ) -> Self {
        ContentResolver {
            scheme,
            source,
            key,
            protected_extensions,
            index_document: "index.html".to_string(),
        }
    }

    pub fn scheme(&self) -> &SchemeConfig {
        &self.scheme
    }

    /// Resolve one request URL to a response. Never panics and never
    /// returns a blank failure: internal errors produce a self-contained
    /// diagnostic page.
    pub fn handle(&self, url: &str) -> ResourceResponse {
        let rel_path = self.request_path(url);

        match self.resolve(&rel_path) {
            Ok(Some(response)) => response,
            Ok(None) => {
                error!("static 404 -> {}", rel_path);
                ResourceResponse {
                    status: 404,
                    mime_type: "text/plain".to_string(),
                    headers: Vec::new(),
                    body: Vec::new(),
                }
            }
            Err(err) => {
                error!("static 500 -> {}: {:#}", rel_path, err);
                error_page(&err)
            }
        }
    }

    /// Map the request URL onto the virtual document root; empty paths fall
    /// back to the index document.
    fn request_path(&self, url: &str) -> String {
        let stripped = url.strip_prefix(&self.scheme.origin()).unwrap_or(url);
        let stripped = stripped.split(['?', '#']).next().unwrap_or(stripped);
        if stripped.is_empty() {
            self.index_document.clone()
        } else {
            stripped.to_string()
        }
    }

    fn resolve(&self, rel_path: &str) -> Result<Option<ResourceResponse>> {
        let Some(stored) = self.source.read(rel_path)? else {
            return Ok(None);
        };

        let body = if self.is_protected(rel_path) {
            debug!("Decrypting protected asset: {}", rel_path);
            crypto::decrypt(&self.key, &stored)?
        } else {
            stored
        };

        let mime_type = mime_guess::from_path(Path::new(rel_path))
            .first_raw()
            .unwrap_or(FALLBACK_MIME)
            .to_string();

        Ok(Some(ResourceResponse {
            status: 200,
            mime_type,
            headers: vec![("Cache-Control".to_string(), CACHE_CONTROL.to_string())],
            body,
        }))
    }

    fn is_protected(&self, rel_path: &str) -> bool {
        Path::new(rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.protected_extensions.iter().any(|p| p == ext))
    }
}

/// Minimal self-contained diagnostic page for internal failures
fn error_page(err: &anyhow::Error) -> ResourceResponse {
    let body = format!(
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"UTF-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\
         <title>Error</title></head>\
         <body style=\"height:100vh;margin:0;user-select:none;\">\
         <main style=\"height:100%;display:flex;align-items:center;justify-content:center;\">\
         <div style=\"display:flex;flex-direction:column;gap:12px;\">\
         <div style=\"font-size:32px;font-weight:900;\">500</div>\
         <div style=\"font-size:20px;font-weight:600;\">Internal error</div>\
         <div style=\"color:grey;overflow:hidden;\">{err}</div>\
         </div></main></body></html>"
    );

    ResourceResponse {
        status: 500,
        mime_type: "text/html".to_string(),
        headers: Vec::new(),
        body: body.into_bytes(),
    }
}
