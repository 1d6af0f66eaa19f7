//! Platform navigators: walk a course hierarchy and produce content nodes.
//!
//! `discover` reads the listing page once and returns the filtered, de-duplicated
//! node links; `visit` loads one node page. Landing on the login page at any point
//! means the session expired and is escalated as [`AuthError::Expired`].

pub mod moodle;
pub mod roeselite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ArchiveConfig, NavigationPolicy};
use crate::error::{ArchiveError, ArchiveResult, AuthError};
use crate::renderer::{NavigationResult, RenderContext};
use crate::session::LoginDetector;
use crate::types::{ContentNode, Platform};

pub use moodle::MoodleNavigator;
pub use roeselite::RoeseliteNavigator;

/// A node found on a listing page, before its own page is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLink {
    pub id: String,
    /// Title shown on the listing, if it had one.
    pub title: Option<String>,
    pub location: String,
    /// Hierarchy path the navigation policy was evaluated against.
    pub path: String,
    pub section: Option<String>,
}

/// Finite, restartable, single-pass sequence of node links.
#[derive(Debug, Clone, Default)]
pub struct NodeCursor {
    links: Vec<NodeLink>,
    pos: usize,
}

impl NodeCursor {
    /// Build a cursor, dropping links whose identifier was already seen.
    pub fn new(links: impl IntoIterator<Item = NodeLink>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let links = links
            .into_iter()
            .filter(|l| seen.insert(l.id.clone()))
            .collect();
        Self { links, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Iterator for NodeCursor {
    type Item = NodeLink;

    fn next(&mut self) -> Option<NodeLink> {
        let link = self.links.get(self.pos).cloned()?;
        self.pos += 1;
        Some(link)
    }
}

/// Walks one platform's content hierarchy.
#[async_trait]
pub trait Navigator: Send + Sync {
    /// Load the listing at `start` and return the admitted node links.
    async fn discover(
        &self,
        ctx: &mut dyn RenderContext,
        start: &str,
        policy: &NavigationPolicy,
    ) -> ArchiveResult<NodeCursor>;

    /// Load a node page and materialize the node. The page stays loaded for
    /// the resolver.
    async fn visit(&self, ctx: &mut dyn RenderContext, link: &NodeLink)
        -> ArchiveResult<ContentNode>;
}

/// Navigator for the configured platform.
pub fn for_config(config: &ArchiveConfig) -> Box<dyn Navigator> {
    let detector = LoginDetector::new(config.platform, &config.login_path);
    match config.platform {
        Platform::Moodle => Box::new(MoodleNavigator::new(
            config.base_url.clone(),
            config.module_patterns.clone(),
            detector,
            config.navigation_timeout_ms,
        )),
        Platform::Roeselite => Box::new(RoeseliteNavigator::new(
            config.base_url.clone(),
            config.include_submissions,
            detector,
            config.navigation_timeout_ms,
        )),
    }
}

/// Navigate and classify the landing page.
pub(crate) async fn load_page(
    ctx: &mut dyn RenderContext,
    url: &str,
    timeout_ms: u64,
    detector: &LoginDetector,
) -> ArchiveResult<NavigationResult> {
    let nav = ctx.navigate(url, timeout_ms).await.map_err(|e| {
        warn!(url, "navigation failed: {e:#}");
        ArchiveError::navigation(url, format!("{e:#}"))
    })?;
    let on_login = detector
        .is_login_page(&*ctx)
        .await
        .map_err(|e| ArchiveError::navigation(url, format!("{e:#}")))?;
    if on_login {
        warn!(url, landed = %nav.final_url, "redirected to login, session expired");
        return Err(AuthError::Expired.into());
    }
    debug!(url, ms = nav.load_time_ms, "page loaded");
    Ok(nav)
}
