use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};
use url::Url;

use super::{load_page, NodeCursor, NodeLink, Navigator};
use crate::config::NavigationPolicy;
use crate::error::{ArchiveError, ArchiveResult};
use crate::naming::id_from_path;
use crate::renderer::RenderContext;
use crate::session::LoginDetector;
use crate::types::ContentNode;

const ASSIGNMENTS: &str = r"^/assignment/view/";
const ASSIGNMENTS_AND_SUBMISSIONS: &str = r"^/(assignment|submission)/view/";

/// Walks a Roeselite assignment list.
pub struct RoeseliteNavigator {
    base_url: Url,
    allow: Regex,
    detector: LoginDetector,
    timeout_ms: u64,
}

impl RoeseliteNavigator {
    pub fn new(
        base_url: Url,
        include_submissions: bool,
        detector: LoginDetector,
        timeout_ms: u64,
    ) -> Self {
        let pattern = if include_submissions {
            ASSIGNMENTS_AND_SUBMISSIONS
        } else {
            ASSIGNMENTS
        };
        Self {
            base_url,
            allow: Regex::new(pattern).expect("assignment path regex is valid"),
            detector,
            timeout_ms,
        }
    }

    /// Path plus query of `url` when it lives on the platform host.
    fn local_path(&self, url: &Url) -> Option<String> {
        if url.host_str() != self.base_url.host_str() {
            return None;
        }
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        Some(path)
    }
}

#[async_trait]
impl Navigator for RoeseliteNavigator {
    async fn discover(
        &self,
        ctx: &mut dyn RenderContext,
        start: &str,
        policy: &NavigationPolicy,
    ) -> ArchiveResult<NodeCursor> {
        load_page(ctx, start, self.timeout_ms, &self.detector).await?;
        let snapshot = ctx
            .snapshot()
            .await
            .map_err(|e| ArchiveError::navigation(start, format!("{e:#}")))?;

        let mut links = Vec::new();
        for link in &snapshot.links {
            let Ok(mut url) = self.base_url.join(&link.href) else {
                continue;
            };
            url.set_fragment(None);
            let Some(path) = self.local_path(&url) else {
                continue;
            };
            if !self.allow.is_match(&path) {
                continue;
            }
            if !policy.admits(&path) {
                debug!(%path, "filtered out");
                continue;
            }
            links.push(NodeLink {
                id: id_from_path(&path),
                title: None,
                location: url.to_string(),
                path,
                section: None,
            });
        }

        let cursor = NodeCursor::new(links);
        info!(admitted = cursor.len(), "assignment pages discovered");
        Ok(cursor)
    }

    async fn visit(
        &self,
        ctx: &mut dyn RenderContext,
        link: &NodeLink,
    ) -> ArchiveResult<ContentNode> {
        load_page(ctx, &link.location, self.timeout_ms, &self.detector).await?;
        let snapshot = ctx
            .snapshot()
            .await
            .map_err(|e| ArchiveError::navigation(&link.location, format!("{e:#}")))?;
        let title = Some(snapshot.title.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| link.title.clone())
            .unwrap_or_else(|| link.id.clone());
        Ok(ContentNode {
            id: link.id.clone(),
            title,
            location: link.location.clone(),
            path: link.path.clone(),
            section: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use crate::renderer::{LaunchOptions, Renderer, StaticPage, StaticRenderer, StaticSite};

    fn navigator(include_submissions: bool) -> RoeseliteNavigator {
        RoeseliteNavigator::new(
            Url::parse("https://se.example").unwrap(),
            include_submissions,
            LoginDetector::new(Platform::Roeselite, "/users/login"),
            1000,
        )
    }

    fn renderer() -> StaticRenderer {
        let list = StaticPage::new("Assignments")
            .link("/assignment/view/1", "Blatt 1")
            .link("/assignment/view/2#top", "Blatt 2")
            .link("/submission/view/9", "Abgabe")
            .link("https://other.example/assignment/view/3", "Elsewhere")
            .link("/assignment/view/1", "Blatt 1 again")
            .link("/users/logout", "Logout")
            .public();
        let site = StaticSite::new("https://se.example", "/users/login")
            .unwrap()
            .page("/assignments", list)
            .unwrap()
            .page("/assignment/view/1", StaticPage::new("Blatt 1: Sortieren").public())
            .unwrap()
            .page("/assignment/view/2", StaticPage::new("").public())
            .unwrap();
        StaticRenderer::new(site)
    }

    async fn discover(
        renderer: &StaticRenderer,
        nav: &RoeseliteNavigator,
        policy: &NavigationPolicy,
    ) -> (Box<dyn RenderContext>, NodeCursor) {
        let mut ctx = renderer
            .launch(&LaunchOptions {
                user_data_dir: "/tmp/unused".into(),
                headless: true,
            })
            .await
            .unwrap();
        let cursor = nav
            .discover(ctx.as_mut(), "https://se.example/assignments", policy)
            .await
            .unwrap();
        (ctx, cursor)
    }

    #[tokio::test]
    async fn test_discover_assignments() {
        let renderer = renderer();
        let (_ctx, cursor) = discover(&renderer, &navigator(false), &NavigationPolicy::default()).await;
        let ids: Vec<String> = cursor.map(|l| l.id).collect();
        assert_eq!(ids, vec!["assignment-view-1", "assignment-view-2"]);
    }

    #[tokio::test]
    async fn test_discover_with_submissions_and_policy() {
        let renderer = renderer();
        let policy = NavigationPolicy::compile(&[], &["/2$".into()]).unwrap();
        let (_ctx, cursor) = discover(&renderer, &navigator(true), &policy).await;
        let ids: Vec<String> = cursor.map(|l| l.id).collect();
        assert_eq!(ids, vec!["assignment-view-1", "submission-view-9"]);
    }

    #[tokio::test]
    async fn test_visit_uses_page_title() {
        let renderer = renderer();
        let nav = navigator(false);
        let (mut ctx, mut cursor) = discover(&renderer, &nav, &NavigationPolicy::default()).await;
        let node = nav.visit(ctx.as_mut(), &cursor.next().unwrap()).await.unwrap();
        assert_eq!(node.title, "Blatt 1: Sortieren");
        assert_eq!(node.location, "https://se.example/assignment/view/1");

        let untitled = nav.visit(ctx.as_mut(), &cursor.next().unwrap()).await.unwrap();
        assert_eq!(untitled.title, "assignment-view-2");
    }
}
