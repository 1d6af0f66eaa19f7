//! Renderer abstraction for the browsing session.
//!
//! `Renderer` launches a browsing context against a profile directory;
//! `RenderContext` is the one live page the engine drives: navigation, DOM
//! snapshots, form input, PDF printing and in-page fetches. Chromium backs
//! the real runs; `StaticRenderer` serves an in-memory site.

pub mod chromium;
pub mod static_site;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PdfOptions;

pub use chromium::{find_chromium, ChromiumRenderer};
pub use static_site::{StaticPage, StaticRenderer, StaticSite};

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// A link as rendered on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLink {
    /// Resolved `href`; the raw attribute when the browser could not resolve it.
    pub href: String,
    /// Visible link text (Moodle instance names without hidden suffixes).
    pub text: String,
    /// Heading of the enclosing course section, if any.
    #[serde(default)]
    pub section: Option<String>,
}

/// Everything the navigators and resolvers read from a loaded page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub links: Vec<PageLink>,
    /// `src`/`data` of iframes, embeds and objects.
    #[serde(default)]
    pub embeds: Vec<String>,
    /// Target of a `<meta http-equiv="refresh">`, if present.
    #[serde(default)]
    pub meta_refresh: Option<String>,
}

/// A browser cookie as persisted in the session profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    /// Whether this cookie would be sent to `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        let domain = self.domain.trim_start_matches('.').to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    }
}

/// How to launch a browsing context.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Persistent browser profile directory.
    pub user_data_dir: PathBuf,
    pub headless: bool,
}

/// A browser engine that can launch browsing contexts.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn RenderContext>>;
}

/// A single live page.
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Navigate to a URL with a timeout.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult>;
    /// Current URL of the page.
    async fn current_url(&self) -> Result<String>;
    /// Links, embeds and metadata of the loaded page.
    async fn snapshot(&self) -> Result<PageSnapshot>;
    /// Whether `selector` matches an element on the page.
    async fn has_element(&self, selector: &str) -> Result<bool>;
    /// Type `value` into the element matching `selector`.
    async fn fill(&mut self, selector: &str, value: &str) -> Result<()>;
    /// Click the element matching `selector` and wait for the resulting navigation.
    async fn click_and_wait(&mut self, selector: &str, timeout_ms: u64) -> Result<()>;
    /// Print the loaded page to PDF.
    async fn print_pdf(&self, options: &PdfOptions) -> Result<Vec<u8>>;
    /// Fetch a URL from inside the page, carrying its cookies.
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
    async fn cookies(&self) -> Result<Vec<StoredCookie>>;
    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> Result<()>;
    /// Close the page and its browser.
    async fn close(self: Box<Self>) -> Result<()>;
}
