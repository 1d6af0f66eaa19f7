//! Chromium-based renderer using chromiumoxide.

use super::{LaunchOptions, NavigationResult, PageSnapshot, RenderContext, Renderer, StoredCookie};
use crate::config::PdfOptions;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Collects links (with their course section), embeds and meta refresh in one pass.
const SNAPSHOT_JS: &str = r#"
(() => {
  const text = (el) => {
    if (!el) return '';
    const copy = el.cloneNode(true);
    copy.querySelectorAll('.accesshide, .sr-only').forEach((n) => n.remove());
    return (copy.innerText || copy.textContent || '').trim();
  };
  const sectionOf = (link) => {
    const container = link.closest('li[id^="section-"]') || link.closest('section') ||
      link.closest('[data-sectionid]') || link.closest('.section');
    if (!container) return null;
    const heading = container.querySelector('.sectionname') ||
      container.querySelector('[data-for="section_title"]') ||
      container.querySelector('h3') || container.querySelector('.section-title');
    const name = text(heading);
    return name || null;
  };
  const links = Array.from(document.querySelectorAll('a[href]')).map((a) => ({
    href: a.href || a.getAttribute('href'),
    text: text(a.querySelector('.instancename')) || text(a),
    section: sectionOf(a),
  }));
  const embeds = Array.from(document.querySelectorAll('iframe[src], embed[src], object[data]'))
    .map((el) => el.src || el.data)
    .filter((src) => !!src);
  const refresh = document.querySelector('meta[http-equiv="refresh" i]');
  let metaRefresh = null;
  if (refresh) {
    const m = /url\s*=\s*['"]?([^'";]+)/i.exec(refresh.getAttribute('content') || '');
    if (m) metaRefresh = new URL(m[1], location.href).href;
  }
  return { url: location.href, title: document.title || '', links, embeds, meta_refresh: metaRefresh };
})()
"#;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. COURSEVAULT_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("COURSEVAULT_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. System PATH
    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 3. Common macOS locations
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Chromium-based renderer. Each context is its own browser process bound to
/// a profile directory.
#[derive(Debug, Default)]
pub struct ChromiumRenderer {
    executable: Option<PathBuf>,
}

impl ChromiumRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific browser binary instead of searching for one.
    pub fn with_executable(path: PathBuf) -> Self {
        Self {
            executable: Some(path),
        }
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn RenderContext>> {
        let chrome_path = match &self.executable {
            Some(p) => p.clone(),
            None => find_chromium()
                .context("Chromium not found. Install Chrome or set COURSEVAULT_CHROMIUM_PATH.")?,
        };

        std::fs::create_dir_all(&options.user_data_dir).with_context(|| {
            format!("failed to create {}", options.user_data_dir.display())
        })?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&options.user_data_dir)
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        builder = if options.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        Ok(Box::new(ChromiumContext {
            browser,
            page,
            handler,
        }))
    }
}

/// A single Chromium page plus the browser that owns it.
pub struct ChromiumContext {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl ChromiumContext {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid evaluate params: {e}"))?;
        let result = self
            .page
            .evaluate(params)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult> {
        let start = Instant::now();

        let result =
            tokio::time::timeout(Duration::from_millis(timeout_ms), self.page.goto(url)).await;

        let load_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(_)) => {
                let final_url = self.current_url().await.unwrap_or_else(|_| url.to_string());
                Ok(NavigationResult {
                    final_url,
                    load_time_ms,
                })
            }
            Ok(Err(e)) => bail!("navigation failed: {e}"),
            Err(_) => bail!("navigation timed out after {timeout_ms}ms"),
        }
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .context("failed to read page URL")?
            .unwrap_or_default())
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        self.eval(SNAPSHOT_JS).await
    }

    async fn has_element(&self, selector: &str) -> Result<bool> {
        let script = format!(
            "document.querySelector({}) !== null",
            serde_json::to_string(selector)?
        );
        self.eval(&script).await
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("no element matches {selector}"))?
            .click()
            .await?
            .type_str(value)
            .await
            .with_context(|| format!("failed to type into {selector}"))?;
        Ok(())
    }

    async fn click_and_wait(&mut self, selector: &str, timeout_ms: u64) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("no element matches {selector}"))?
            .click()
            .await
            .with_context(|| format!("failed to click {selector}"))?;
        // A form that re-renders in place never fires a navigation.
        let _ = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.page.wait_for_navigation(),
        )
        .await;
        Ok(())
    }

    async fn print_pdf(&self, options: &PdfOptions) -> Result<Vec<u8>> {
        let (width, height) = options.paper_size();
        let params = PrintToPdfParams {
            print_background: Some(options.print_background),
            paper_width: Some(width),
            paper_height: Some(height),
            ..Default::default()
        };
        self.page.pdf(params).await.context("PDF rendering failed")
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let script = format!(
            r#"(async () => {{
  const res = await fetch({}, {{ credentials: 'include' }});
  if (!res.ok) throw new Error('HTTP ' + res.status);
  const buf = new Uint8Array(await res.arrayBuffer());
  let bin = '';
  for (let i = 0; i < buf.length; i += 0x8000) {{
    bin += String.fromCharCode.apply(null, buf.subarray(i, i + 0x8000));
  }}
  return btoa(bin);
}})()"#,
            serde_json::to_string(url)?
        );
        let encoded: String = self.eval(&script).await?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("in-page fetch returned invalid base64")
    }

    async fn cookies(&self) -> Result<Vec<StoredCookie>> {
        let cookies = self.page.get_cookies().await.context("failed to read cookies")?;
        Ok(cookies
            .into_iter()
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> Result<()> {
        let params = cookies
            .iter()
            .map(|c| {
                CookieParam::builder()
                    .name(c.name.clone())
                    .value(c.value.clone())
                    .domain(c.domain.clone())
                    .path(c.path.clone())
                    .secure(c.secure)
                    .http_only(c.http_only)
                    .build()
                    .map_err(|e| anyhow::anyhow!("invalid cookie {}: {e}", c.name))
            })
            .collect::<Result<Vec<_>>>()?;
        self.page
            .set_cookies(params)
            .await
            .context("failed to restore cookies")?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let ChromiumContext {
            mut browser,
            page,
            handler,
        } = *self;
        let _ = page.close().await;
        let closed = browser.close().await;
        let _ = browser.wait().await;
        handler.abort();
        closed.context("failed to close Chromium")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_chromium_honors_env() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("chrome");
        std::fs::write(&fake, b"").unwrap();
        std::env::set_var("COURSEVAULT_CHROMIUM_PATH", &fake);
        assert_eq!(find_chromium(), Some(fake));
        std::env::remove_var("COURSEVAULT_CHROMIUM_PATH");
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ChromiumRenderer::new();
        let mut ctx = renderer
            .launch(&LaunchOptions {
                user_data_dir: dir.path().join("browser"),
                headless: true,
            })
            .await
            .unwrap();
        ctx.navigate("https://example.com", 30_000).await.unwrap();
        let snap = ctx.snapshot().await.unwrap();
        assert!(snap.title.contains("Example"));
        assert!(!snap.links.is_empty());
        let pdf = ctx.print_pdf(&PdfOptions::default()).await.unwrap();
        assert!(pdf.starts_with(b"%PDF"));
        ctx.close().await.unwrap();
    }
}
