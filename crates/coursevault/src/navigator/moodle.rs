use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use super::{load_page, NodeCursor, NodeLink, Navigator};
use crate::config::NavigationPolicy;
use crate::error::{ArchiveError, ArchiveResult};
use crate::naming::id_from_path;
use crate::renderer::{PageLink, RenderContext};
use crate::session::LoginDetector;
use crate::types::ContentNode;

/// Section name for modules outside any course section.
pub const UNSORTED_SECTION: &str = "Unsorted";

/// Walks a Moodle course page: sections and the modules inside them.
pub struct MoodleNavigator {
    base_url: Url,
    module_patterns: Vec<String>,
    detector: LoginDetector,
    timeout_ms: u64,
}

impl MoodleNavigator {
    pub fn new(
        base_url: Url,
        module_patterns: Vec<String>,
        detector: LoginDetector,
        timeout_ms: u64,
    ) -> Self {
        Self {
            base_url,
            module_patterns,
            detector,
            timeout_ms,
        }
    }

    fn module_link(&self, link: &PageLink) -> Option<NodeLink> {
        if !self.module_patterns.iter().any(|p| link.href.contains(p.as_str())) {
            return None;
        }
        let url = self.base_url.join(&link.href).ok()?;
        let id = module_id(&url);
        let section = link
            .section
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNSORTED_SECTION)
            .to_string();
        let title = Some(link.text.trim().to_string()).filter(|t| !t.is_empty());
        let path = format!("{}/{}", section, title.as_deref().unwrap_or(&id));
        Some(NodeLink {
            id,
            title,
            location: url.to_string(),
            path,
            section: Some(section),
        })
    }
}

/// `/mod/<kind>/view.php?id=<n>` becomes `<kind>-<n>`.
fn module_id(url: &Url) -> String {
    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    let kind = segments
        .windows(2)
        .find(|w| w[0] == "mod")
        .map(|w| w[1]);
    let cmid = url
        .query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned());
    match (kind, cmid) {
        (Some(kind), Some(cmid)) => format!("{kind}-{cmid}"),
        _ => {
            let mut path = url.path().to_string();
            if let Some(q) = url.query() {
                path.push('?');
                path.push_str(q);
            }
            id_from_path(&path)
        }
    }
}

#[async_trait]
impl Navigator for MoodleNavigator {
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

        let mut modules = 0usize;
        let admitted: Vec<NodeLink> = snapshot
            .links
            .iter()
            .filter_map(|l| self.module_link(l))
            .inspect(|_| modules += 1)
            .filter(|l| {
                let keep = policy.admits(&l.path);
                if !keep {
                    debug!(path = %l.path, "filtered out");
                }
                keep
            })
            .collect();

        let cursor = NodeCursor::new(admitted);
        info!(
            course = %snapshot.title,
            modules,
            admitted = cursor.len(),
            "course modules discovered"
        );
        Ok(cursor)
    }

    async fn visit(
        &self,
        ctx: &mut dyn RenderContext,
        link: &NodeLink,
    ) -> ArchiveResult<ContentNode> {
        let nav = load_page(ctx, &link.location, self.timeout_ms, &self.detector).await?;
        let title = match &link.title {
            Some(t) => t.clone(),
            None => {
                let snapshot = ctx
                    .snapshot()
                    .await
                    .map_err(|e| ArchiveError::navigation(&link.location, format!("{e:#}")))?;
                Some(snapshot.title.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| link.id.clone())
            }
        };
        debug!(id = %link.id, landed = %nav.final_url, "module visited");
        Ok(ContentNode {
            id: link.id.clone(),
            title,
            location: link.location.clone(),
            path: link.path.clone(),
            section: link.section.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use crate::config::DEFAULT_MODULE_PATTERNS;
    use crate::error::AuthError;
    use crate::renderer::{LaunchOptions, Renderer, StaticPage, StaticRenderer, StaticSite};

    const COURSE: &str = "/course/view.php?id=19620";

    fn navigator() -> MoodleNavigator {
        MoodleNavigator::new(
            Url::parse("https://lms.example").unwrap(),
            DEFAULT_MODULE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            LoginDetector::new(Platform::Moodle, "/login/index.php"),
            1000,
        )
    }

    fn site() -> StaticSite {
        let course = StaticPage::new("Theoretische Informatik")
            .section_link("Woche 1", "/mod/resource/view.php?id=11", "Vorlesung 1")
            .section_link("Woche 1", "/mod/forum/view.php?id=12", "Forum")
            .section_link("Woche 2", "/mod/folder/view.php?id=21", "Übungsblätter")
            .link("/mod/resource/view.php?id=31", "Organisatorisches")
            .section_link("Woche 1", "/mod/resource/view.php?id=11", "Vorlesung 1")
            .public();
        StaticSite::new("https://lms.example", "/login/index.php")
            .unwrap()
            .page(COURSE, course)
            .unwrap()
            .page("/mod/resource/view.php?id=11", StaticPage::new("Vorlesung 1").public())
            .unwrap()
            .page("/mod/resource/view.php?id=31", StaticPage::new("Organisatorisches"))
            .unwrap()
    }

    async fn context(renderer: &StaticRenderer) -> Box<dyn RenderContext> {
        renderer
            .launch(&LaunchOptions {
                user_data_dir: "/tmp/unused".into(),
                headless: true,
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_module_id() {
        let url = Url::parse("https://lms.example/mod/resource/view.php?id=42").unwrap();
        assert_eq!(module_id(&url), "resource-42");
        let other = Url::parse("https://lms.example/pluginfile.php/1/x.pdf").unwrap();
        assert_eq!(module_id(&other), "pluginfile.php-1-x.pdf");
    }

    #[tokio::test]
    async fn test_discover_sections_and_modules() {
        let renderer = StaticRenderer::new(site());
        let mut ctx = context(&renderer).await;
        let cursor = navigator()
            .discover(
                ctx.as_mut(),
                &format!("https://lms.example{COURSE}"),
                &NavigationPolicy::default(),
            )
            .await
            .unwrap();
        let links: Vec<NodeLink> = cursor.collect();
        let ids: Vec<&str> = links.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["resource-11", "folder-21", "resource-31"]);
        assert_eq!(links[0].path, "Woche 1/Vorlesung 1");
        assert_eq!(links[2].section.as_deref(), Some(UNSORTED_SECTION));
    }

    #[tokio::test]
    async fn test_filtering_before_page_loads() {
        let renderer = StaticRenderer::new(site());
        let mut ctx = context(&renderer).await;
        let policy = NavigationPolicy::compile(&["^Woche 1/".into()], &[]).unwrap();
        let cursor = navigator()
            .discover(ctx.as_mut(), &format!("https://lms.example{COURSE}"), &policy)
            .await
            .unwrap();
        assert_eq!(renderer.navigations(), 1);
        let ids: Vec<String> = cursor.map(|l| l.id).collect();
        assert_eq!(ids, vec!["resource-11"]);
    }

    #[tokio::test]
    async fn test_visit_login_redirect_is_expired() {
        let renderer = StaticRenderer::new(site());
        let mut ctx = context(&renderer).await;
        let nav = navigator();
        let mut cursor = nav
            .discover(
                ctx.as_mut(),
                &format!("https://lms.example{COURSE}"),
                &NavigationPolicy::default(),
            )
            .await
            .unwrap();

        let first = cursor.next().unwrap();
        let node = nav.visit(ctx.as_mut(), &first).await.unwrap();
        assert_eq!(node.title, "Vorlesung 1");

        // folder-21 has no page at all.
        let second = cursor.next().unwrap();
        let err = nav.visit(ctx.as_mut(), &second).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Navigation { .. }));

        // resource-31 needs a session we do not have.
        let third = cursor.next().unwrap();
        let err = nav.visit(ctx.as_mut(), &third).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Auth(AuthError::Expired)));
    }
}
