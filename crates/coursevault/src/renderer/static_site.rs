//! In-memory renderer serving a fixed site.
//!
//! Pages are keyed by absolute URL. Non-public pages need the site's session
//! cookie, which the login page hands out when the configured credentials are
//! filled in and submitted; requests without it land on the login page. The
//! site can invalidate every session after a number of page loads to imitate
//! a server-side logout mid-run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use url::Url;

use super::{
    LaunchOptions, NavigationResult, PageLink, PageSnapshot, RenderContext, Renderer,
    StoredCookie,
};
use crate::config::PdfOptions;

/// Selectors present on every login page.
const LOGIN_ELEMENTS: &[&str] = &[
    r#"input[type="text"]"#,
    r#"input[type="password"]"#,
    r#"button[type="submit"]"#,
    r#"input[type="submit"]"#,
];

/// One page of a [`StaticSite`].
#[derive(Debug, Clone, Default)]
pub struct StaticPage {
    pub title: String,
    pub links: Vec<PageLink>,
    pub embeds: Vec<String>,
    pub meta_refresh: Option<String>,
    /// CSS selectors that match on this page.
    pub elements: Vec<String>,
    /// Serve a redirect to this location instead of the page.
    pub redirect: Option<String>,
    /// Reachable without a session.
    pub public: bool,
    /// Fails to load.
    pub broken: bool,
    /// Loads but fails to print.
    pub unprintable: bool,
}

impl StaticPage {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn link(mut self, href: &str, text: &str) -> Self {
        self.links.push(PageLink {
            href: href.to_string(),
            text: text.to_string(),
            section: None,
        });
        self
    }

    pub fn section_link(mut self, section: &str, href: &str, text: &str) -> Self {
        self.links.push(PageLink {
            href: href.to_string(),
            text: text.to_string(),
            section: Some(section.to_string()),
        });
        self
    }

    pub fn embed(mut self, src: &str) -> Self {
        self.embeds.push(src.to_string());
        self
    }

    pub fn meta_refresh(mut self, target: &str) -> Self {
        self.meta_refresh = Some(target.to_string());
        self
    }

    pub fn element(mut self, selector: &str) -> Self {
        self.elements.push(selector.to_string());
        self
    }

    pub fn redirect_to(mut self, target: &str) -> Self {
        self.redirect = Some(target.to_string());
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn unprintable(mut self) -> Self {
        self.unprintable = true;
        self
    }
}

/// A site served by [`StaticRenderer`].
#[derive(Debug)]
pub struct StaticSite {
    origin: Url,
    login_url: String,
    pages: HashMap<String, StaticPage>,
    files: HashMap<String, Vec<u8>>,
    username: String,
    password: String,
    cookie_name: String,
    generation: u32,
    expire_after: Option<u32>,
    authenticated_loads: u32,
    navigations: u32,
    renders: u32,
    launches: u32,
    closes: u32,
    last_headless: Option<bool>,
}

impl StaticSite {
    /// A site at `origin` whose login form lives at `login_path`.
    pub fn new(origin: &str, login_path: &str) -> Result<Self> {
        let origin = Url::parse(origin)?;
        let login_url = origin.join(login_path)?.to_string();
        let mut login = StaticPage::new("Log in").public();
        login.elements = LOGIN_ELEMENTS.iter().map(|s| s.to_string()).collect();

        let mut pages = HashMap::new();
        pages.insert(login_url.clone(), login);
        Ok(Self {
            origin,
            login_url,
            pages,
            files: HashMap::new(),
            username: "student".to_string(),
            password: "secret".to_string(),
            cookie_name: "SiteSession".to_string(),
            generation: 1,
            expire_after: None,
            authenticated_loads: 0,
            navigations: 0,
            renders: 0,
            launches: 0,
            closes: 0,
            last_headless: None,
        })
    }

    /// Invalidate all sessions after `loads` authenticated page loads.
    pub fn expire_after(mut self, loads: u32) -> Self {
        self.expire_after = Some(loads);
        self
    }

    pub fn page(mut self, path: &str, page: StaticPage) -> Result<Self> {
        let key = self.origin.join(path)?.to_string();
        self.pages.insert(key, page);
        Ok(self)
    }

    pub fn file(mut self, path: &str, bytes: &[u8]) -> Result<Self> {
        let key = self.origin.join(path)?.to_string();
        self.files.insert(key, bytes.to_vec());
        Ok(self)
    }

    /// A cookie the site currently accepts, for seeding stored sessions.
    pub fn session_cookie(&self) -> StoredCookie {
        StoredCookie {
            name: self.cookie_name.clone(),
            value: format!("token-{}", self.generation),
            domain: self.origin.host_str().unwrap_or_default().to_string(),
            path: "/".to_string(),
            secure: false,
            http_only: true,
        }
    }

    fn is_authenticated(&self, cookies: &[StoredCookie]) -> bool {
        let token = format!("token-{}", self.generation);
        cookies
            .iter()
            .any(|c| c.name == self.cookie_name && c.value == token)
    }
}

/// Renderer backed by a [`StaticSite`].
#[derive(Debug, Clone)]
pub struct StaticRenderer {
    site: Arc<Mutex<StaticSite>>,
}

impl StaticRenderer {
    pub fn new(site: StaticSite) -> Self {
        Self {
            site: Arc::new(Mutex::new(site)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StaticSite> {
        lock(&self.site)
    }

    pub fn navigations(&self) -> u32 {
        self.lock().navigations
    }

    pub fn renders(&self) -> u32 {
        self.lock().renders
    }

    pub fn launches(&self) -> u32 {
        self.lock().launches
    }

    /// Contexts launched but not yet closed.
    pub fn open_contexts(&self) -> u32 {
        let site = self.lock();
        site.launches - site.closes
    }

    pub fn last_headless(&self) -> Option<bool> {
        self.lock().last_headless
    }

    pub fn session_cookie(&self) -> StoredCookie {
        self.lock().session_cookie()
    }

    /// Invalidate every issued session now.
    pub fn expire_sessions(&self) {
        self.lock().generation += 1;
    }

    /// Make the page at `path` fail to load, or load again.
    pub fn set_broken(&self, path: &str, broken: bool) -> Result<()> {
        let mut site = self.lock();
        let key = site.origin.join(path)?.to_string();
        let page = site
            .pages
            .get_mut(&key)
            .ok_or_else(|| anyhow!("no page at {key}"))?;
        page.broken = broken;
        Ok(())
    }
}

fn lock(site: &Mutex<StaticSite>) -> MutexGuard<'_, StaticSite> {
    site.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Renderer for StaticRenderer {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn RenderContext>> {
        let mut site = self.lock();
        site.launches += 1;
        site.last_headless = Some(options.headless);
        Ok(Box::new(StaticContext {
            site: Arc::clone(&self.site),
            cookies: Vec::new(),
            current: "about:blank".to_string(),
            fields: HashMap::new(),
        }))
    }
}

struct StaticContext {
    site: Arc<Mutex<StaticSite>>,
    cookies: Vec<StoredCookie>,
    current: String,
    fields: HashMap<String, String>,
}

fn resolve(base: &str, href: &str) -> String {
    Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

#[async_trait]
impl RenderContext for StaticContext {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<NavigationResult> {
        let key = Url::parse(url)?.to_string();
        let mut site = lock(&self.site);
        site.navigations += 1;

        let page = site
            .pages
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("net::ERR_HTTP_RESPONSE_CODE_FAILURE (404) at {key}"))?;
        if page.broken {
            bail!("net::ERR_CONNECTION_RESET at {key}");
        }

        if !page.public {
            if let Some(limit) = site.expire_after {
                if site.authenticated_loads >= limit {
                    site.generation += 1;
                    site.expire_after = None;
                }
            }
            if !site.is_authenticated(&self.cookies) {
                self.current = site.login_url.clone();
                return Ok(NavigationResult {
                    final_url: self.current.clone(),
                    load_time_ms: 1,
                });
            }
            site.authenticated_loads += 1;
        }

        self.current = match &page.redirect {
            Some(target) => resolve(&key, target),
            None => key,
        };
        Ok(NavigationResult {
            final_url: self.current.clone(),
            load_time_ms: 1,
        })
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.current.clone())
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let site = lock(&self.site);
        let Some(page) = site.pages.get(&self.current) else {
            // A file displayed directly by the browser.
            return Ok(PageSnapshot {
                url: self.current.clone(),
                ..Default::default()
            });
        };
        Ok(PageSnapshot {
            url: self.current.clone(),
            title: page.title.clone(),
            links: page
                .links
                .iter()
                .map(|l| PageLink {
                    href: resolve(&self.current, &l.href),
                    text: l.text.clone(),
                    section: l.section.clone(),
                })
                .collect(),
            embeds: page
                .embeds
                .iter()
                .map(|e| resolve(&self.current, e))
                .collect(),
            meta_refresh: page
                .meta_refresh
                .as_ref()
                .map(|m| resolve(&self.current, m)),
        })
    }

    async fn has_element(&self, selector: &str) -> Result<bool> {
        let site = lock(&self.site);
        Ok(site
            .pages
            .get(&self.current)
            .is_some_and(|p| p.elements.iter().any(|e| e == selector)))
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        if !self.has_element(selector).await? {
            bail!("no element matches {selector}");
        }
        self.fields.insert(selector.to_string(), value.to_string());
        Ok(())
    }

    async fn click_and_wait(&mut self, selector: &str, _timeout_ms: u64) -> Result<()> {
        if !self.has_element(selector).await? {
            bail!("no element matches {selector}");
        }
        let site = lock(&self.site);
        if self.current != site.login_url {
            return Ok(());
        }
        let values: Vec<&String> = self.fields.values().collect();
        if values.contains(&&site.username) && values.contains(&&site.password) {
            let cookie = site.session_cookie();
            self.cookies.retain(|c| c.name != cookie.name);
            self.cookies.push(cookie);
            self.current = site.origin.to_string();
        }
        drop(site);
        self.fields.clear();
        Ok(())
    }

    async fn print_pdf(&self, _options: &PdfOptions) -> Result<Vec<u8>> {
        let mut site = lock(&self.site);
        let page = site
            .pages
            .get(&self.current)
            .cloned()
            .ok_or_else(|| anyhow!("nothing to print at {}", self.current))?;
        if page.unprintable {
            bail!("Printing failed");
        }
        site.renders += 1;
        Ok(format!("%PDF-1.4\n% {}\n%%EOF\n", page.title).into_bytes())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let key = Url::parse(url)?.to_string();
        let site = lock(&self.site);
        if !site.is_authenticated(&self.cookies) {
            bail!("HTTP 403");
        }
        site.files
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP 404"))
    }

    async fn cookies(&self) -> Result<Vec<StoredCookie>> {
        Ok(self.cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> Result<()> {
        for cookie in cookies {
            self.cookies
                .retain(|c| !(c.name == cookie.name && c.domain == cookie.domain));
            self.cookies.push(cookie.clone());
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        lock(&self.site).closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn options() -> LaunchOptions {
        LaunchOptions {
            user_data_dir: PathBuf::from("/nonexistent"),
            headless: true,
        }
    }

    fn site() -> StaticSite {
        StaticSite::new("https://lms.example", "/login")
            .unwrap()
            .page("/course", StaticPage::new("Course").link("/a", "A"))
            .unwrap()
            .page("/public", StaticPage::new("Public").public())
            .unwrap()
    }

    #[tokio::test]
    async fn test_private_pages_redirect_to_login() {
        let renderer = StaticRenderer::new(site());
        let mut ctx = renderer.launch(&options()).await.unwrap();
        let nav = ctx.navigate("https://lms.example/course", 1000).await.unwrap();
        assert_eq!(nav.final_url, "https://lms.example/login");
        let nav = ctx.navigate("https://lms.example/public", 1000).await.unwrap();
        assert_eq!(nav.final_url, "https://lms.example/public");
        assert!(ctx.navigate("https://lms.example/missing", 1000).await.is_err());
    }

    #[tokio::test]
    async fn test_login_form_sets_cookie() {
        let renderer = StaticRenderer::new(site());
        let mut ctx = renderer.launch(&options()).await.unwrap();
        ctx.navigate("https://lms.example/login", 1000).await.unwrap();
        ctx.fill(r#"input[type="text"]"#, "student").await.unwrap();
        ctx.fill(r#"input[type="password"]"#, "secret").await.unwrap();
        ctx.click_and_wait(r#"input[type="submit"]"#, 1000)
            .await
            .unwrap();
        assert_eq!(ctx.cookies().await.unwrap().len(), 1);

        ctx.navigate("https://lms.example/course", 1000).await.unwrap();
        let snap = ctx.snapshot().await.unwrap();
        assert_eq!(snap.title, "Course");
        assert_eq!(snap.links[0].href, "https://lms.example/a");

        renderer.expire_sessions();
        let nav = ctx.navigate("https://lms.example/course", 1000).await.unwrap();
        assert_eq!(nav.final_url, "https://lms.example/login");
        ctx.close().await.unwrap();
        assert_eq!(renderer.open_contexts(), 0);
    }

    #[tokio::test]
    async fn test_wrong_password_stays_logged_out() {
        let renderer = StaticRenderer::new(site());
        let mut ctx = renderer.launch(&options()).await.unwrap();
        ctx.navigate("https://lms.example/login", 1000).await.unwrap();
        ctx.fill(r#"input[type="text"]"#, "student").await.unwrap();
        ctx.fill(r#"input[type="password"]"#, "wrong").await.unwrap();
        ctx.click_and_wait(r#"input[type="submit"]"#, 1000)
            .await
            .unwrap();
        assert!(ctx.cookies().await.unwrap().is_empty());
        assert!(ctx.fill("#missing", "x").await.is_err());
    }
}
