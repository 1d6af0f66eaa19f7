//! Download orchestrator: decide, retrieve, commit.
//!
//! Bytes are written to a temporary file inside the target folder and renamed
//! into place once complete, so a target path only ever holds a finished file.
//! Failures, deadlines and cancellation drop the temporary file.

pub mod http_client;

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::{ArchiveConfig, DownloadStrategy, HostAllowlist, OverwritePolicy, PdfOptions};
use crate::error::RetrievalError;
use crate::renderer::{RenderContext, StoredCookie};
use crate::session::LoginDetector;
use crate::types::{FetchOutcome, ResourceDescriptor, ResourceKind};

pub use http_client::{Download, HttpClient};

/// The browsing handle, shared by the fetches of one node one at a time.
pub type BrowserGate<'a> = Mutex<&'a mut dyn RenderContext>;

/// Retrieves resource descriptors into node folders.
pub struct Orchestrator {
    http: HttpClient,
    strategy: DownloadStrategy,
    overwrite: OverwritePolicy,
    pdf: PdfOptions,
    hosts: HostAllowlist,
    detector: LoginDetector,
    timeout_ms: u64,
    deadline: Option<Duration>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: &ArchiveConfig, cancel: CancelToken) -> Self {
        Self {
            http: HttpClient::new(config.navigation_timeout_ms),
            strategy: config.download_strategy,
            overwrite: config.overwrite_policy(),
            pdf: config.pdf.clone(),
            hosts: HostAllowlist::new(&config.allowed_resource_hosts),
            detector: LoginDetector::new(config.platform, &config.login_path),
            timeout_ms: config.navigation_timeout_ms,
            deadline: config.resource_deadline,
            cancel,
        }
    }

    /// One best-effort attempt at `descriptor`.
    pub async fn fetch(
        &self,
        gate: &BrowserGate<'_>,
        cookies: &[StoredCookie],
        descriptor: &ResourceDescriptor,
        folder: &Path,
    ) -> FetchOutcome {
        let target = folder.join(&descriptor.filename);
        if self.overwrite == OverwritePolicy::KeepExisting && target.exists() {
            debug!(path = %target.display(), "exists, skipping");
            return FetchOutcome::Skipped { path: target };
        }

        match self.retrieve(gate, cookies, descriptor, folder, &target).await {
            Ok(bytes) => {
                info!(path = %target.display(), bytes, "saved");
                FetchOutcome::Fetched {
                    path: target,
                    bytes,
                }
            }
            Err(error) => {
                warn!(source = %descriptor.source, "retrieval failed: {error}");
                FetchOutcome::Failed { error }
            }
        }
    }

    async fn retrieve(
        &self,
        gate: &BrowserGate<'_>,
        cookies: &[StoredCookie],
        descriptor: &ResourceDescriptor,
        folder: &Path,
        target: &Path,
    ) -> Result<u64, RetrievalError> {
        if descriptor.kind != ResourceKind::RenderAsPdf {
            let url = Url::parse(&descriptor.source)
                .map_err(|e| RetrievalError::Transport(e.to_string()))?;
            if !self.hosts.allows(&url) {
                return Err(RetrievalError::HostNotAllowed(
                    url.host_str().unwrap_or_default().to_string(),
                ));
            }
        }

        tokio::fs::create_dir_all(folder).await?;
        let tmp = tempfile::Builder::new()
            .prefix(".coursevault-")
            .suffix(".part")
            .tempfile_in(folder)?;
        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let work = self.write_resource(gate, cookies, descriptor, &mut file);
        let bounded = async {
            match self.deadline {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .unwrap_or(Err(RetrievalError::DeadlineExceeded(limit))),
                None => work.await,
            }
        };
        let written = self
            .cancel
            .run(bounded)
            .await
            .unwrap_or(Err(RetrievalError::Cancelled));

        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(file);
                // Dropping the path removes the partial file.
                drop(tmp_path);
                return Err(e);
            }
        };
        file.sync_all().await?;
        drop(file);
        tmp_path
            .persist(target)
            .map_err(|e| RetrievalError::Io(e.error))?;
        Ok(bytes)
    }

    async fn write_resource(
        &self,
        gate: &BrowserGate<'_>,
        cookies: &[StoredCookie],
        descriptor: &ResourceDescriptor,
        file: &mut tokio::fs::File,
    ) -> Result<u64, RetrievalError> {
        let source = descriptor.source.as_str();
        match descriptor.kind {
            ResourceKind::RenderAsPdf => {
                let bytes = self.render(gate, source).await?;
                write_all(file, &bytes).await
            }
            ResourceKind::RawFile | ResourceKind::Archive => match self.strategy {
                DownloadStrategy::Request => self.download(cookies, source, file).await,
                DownloadStrategy::Browser => {
                    let bytes = self.browser_fetch(gate, source).await?;
                    write_all(file, &bytes).await
                }
                DownloadStrategy::Auto => match self.download(cookies, source, file).await {
                    Err(e) if !matches!(e, RetrievalError::SessionExpired) => {
                        debug!(source, "direct download failed ({e}), using browser");
                        file.set_len(0).await?;
                        file.seek(SeekFrom::Start(0)).await?;
                        let bytes = self.browser_fetch(gate, source).await?;
                        write_all(file, &bytes).await
                    }
                    result => result,
                },
            },
        }
    }

    async fn download(
        &self,
        cookies: &[StoredCookie],
        url: &str,
        file: &mut tokio::fs::File,
    ) -> Result<u64, RetrievalError> {
        let download = self.http.download(url, cookies, file).await?;
        if self.bounced_to_login(url, &download.final_url) {
            return Err(RetrievalError::SessionExpired);
        }
        Ok(download.bytes)
    }

    /// A request for `requested` that ended on the login page. The file URL
    /// itself is never tested, so names like `SSO-Intro.pdf` are plain files.
    fn bounced_to_login(&self, requested: &str, landed: &str) -> bool {
        !same_location(requested, landed) && self.detector.is_login_url(landed)
    }

    async fn render(&self, gate: &BrowserGate<'_>, source: &str) -> Result<Vec<u8>, RetrievalError> {
        let mut ctx = gate.lock().await;
        let current = ctx
            .current_url()
            .await
            .map_err(|e| RetrievalError::Render(format!("{e:#}")))?;
        if !same_location(&current, source) {
            let nav = ctx
                .navigate(source, self.timeout_ms)
                .await
                .map_err(|e| RetrievalError::Render(format!("{e:#}")))?;
            if self.bounced_to_login(source, &nav.final_url) {
                return Err(RetrievalError::SessionExpired);
            }
        }
        ctx.print_pdf(&self.pdf)
            .await
            .map_err(|e| RetrievalError::Render(format!("{e:#}")))
    }

    async fn browser_fetch(
        &self,
        gate: &BrowserGate<'_>,
        url: &str,
    ) -> Result<Vec<u8>, RetrievalError> {
        let ctx = gate.lock().await;
        ctx.fetch_bytes(url)
            .await
            .map_err(|e| RetrievalError::Transport(format!("in-browser fetch: {e:#}")))
    }
}

async fn write_all(file: &mut tokio::fs::File, bytes: &[u8]) -> Result<u64, RetrievalError> {
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(bytes.len() as u64)
}

fn same_location(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(mut a), Ok(mut b)) => {
            a.set_fragment(None);
            b.set_fragment(None);
            a == b
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::renderer::{LaunchOptions, Renderer, StaticPage, StaticRenderer, StaticSite};
    use crate::types::{Platform, ResourceFormat};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        server: MockServer,
        renderer: StaticRenderer,
        config: ArchiveConfig,
        out: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let site = StaticSite::new(&server.uri(), "/users/login")
            .unwrap()
            .page("/assignment/view/1", StaticPage::new("Blatt 1").public())
            .unwrap()
            .page("/assignment/view/2", StaticPage::new("Blatt 2"))
            .unwrap()
            .file("/files/only-in-browser.zip", b"browser bytes")
            .unwrap();
        let mut config = ArchiveConfig::new(
            Platform::Roeselite,
            Url::parse(&server.uri()).unwrap(),
            "/assignments",
            "se",
        );
        config.navigation_timeout_ms = 5_000;
        Fixture {
            server,
            renderer: StaticRenderer::new(site),
            config,
            out: tempfile::tempdir().unwrap(),
        }
    }

    fn file(source: String, filename: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            kind: ResourceKind::Archive,
            format: ResourceFormat::Zip,
            source,
            name: filename.into(),
            filename: filename.into(),
        }
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

    fn gate(ctx: &mut Box<dyn RenderContext>) -> BrowserGate<'_> {
        let ctx: &mut dyn RenderContext = ctx.as_mut();
        Mutex::new(ctx)
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|n| n.ends_with(".part"))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_fetch_then_skip() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .and(path("/files/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip".to_vec()))
            .expect(1)
            .mount(&fx.server)
            .await;

        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&fx.config, CancelToken::never());
        let folder = fx.out.path().join("Blatt_1");
        let descriptor = file(format!("{}/files/a.zip", fx.server.uri()), "a.zip");

        let first = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        assert!(matches!(first, FetchOutcome::Fetched { bytes: 3, .. }));
        assert_eq!(std::fs::read(folder.join("a.zip")).unwrap(), b"zip");

        let second = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        assert!(matches!(second, FetchOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_replace_policy_overwrites() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .and(path("/files/a.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .mount(&fx.server)
            .await;
        let folder = fx.out.path().join("Blatt_1");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("a.zip"), b"old").unwrap();

        let mut config = fx.config.clone();
        config.replace_existing_files = true;
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&config, CancelToken::never());
        let descriptor = file(format!("{}/files/a.zip", fx.server.uri()), "a.zip");
        let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        assert!(matches!(outcome, FetchOutcome::Fetched { .. }));
        assert_eq!(std::fs::read(folder.join("a.zip")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_browser() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&fx.server)
            .await;

        let mut ctx = context(&fx.renderer).await;
        ctx.set_cookies(&[fx.renderer.session_cookie()]).await.unwrap();
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&fx.config, CancelToken::never());
        let folder = fx.out.path().join("Blatt_1");
        let descriptor = file(
            format!("{}/files/only-in-browser.zip", fx.server.uri()),
            "only-in-browser.zip",
        );
        let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        assert!(matches!(outcome, FetchOutcome::Fetched { bytes: 13, .. }));
        assert_eq!(
            std::fs::read(folder.join("only-in-browser.zip")).unwrap(),
            b"browser bytes"
        );
    }

    #[tokio::test]
    async fn test_http_failure_leaves_nothing_behind() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&fx.server)
            .await;

        let mut config = fx.config.clone();
        config.download_strategy = DownloadStrategy::Request;
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&config, CancelToken::never());
        let folder = fx.out.path().join("Blatt_1");
        let descriptor = file(format!("{}/files/gone.zip", fx.server.uri()), "gone.zip");
        let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        match outcome {
            FetchOutcome::Failed { error } => {
                assert!(matches!(error, RetrievalError::Http { status: 404, .. }))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!folder.join("gone.zip").exists());
        assert!(leftovers(&folder).is_empty());
    }

    #[tokio::test]
    async fn test_deadline_and_cancellation_discard_partial_file() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 1024])
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&fx.server)
            .await;
        let folder = fx.out.path().join("Blatt_1");
        let descriptor = file(format!("{}/files/slow.zip", fx.server.uri()), "slow.zip");

        let mut config = fx.config.clone();
        config.download_strategy = DownloadStrategy::Request;
        config.resource_deadline = Some(Duration::from_millis(200));
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&config, CancelToken::never());
        let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                error: RetrievalError::DeadlineExceeded(_)
            }
        ));

        config.resource_deadline = None;
        let (handle, token) = cancel_pair();
        let orchestrator = Orchestrator::new(&config, token);
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel();
        });
        let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        canceller.await.unwrap();
        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                error: RetrievalError::Cancelled
            }
        ));
        assert!(!folder.join("slow.zip").exists());
        assert!(leftovers(&folder).is_empty());
    }

    #[tokio::test]
    async fn test_render_page_to_pdf() {
        let fx = fixture().await;
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&fx.config, CancelToken::never());
        let folder = fx.out.path().join("Blatt_1");
        let descriptor = ResourceDescriptor {
            kind: ResourceKind::RenderAsPdf,
            format: ResourceFormat::Pdf,
            source: format!("{}/assignment/view/1", fx.server.uri()),
            name: "Blatt 1".into(),
            filename: "Blatt_1.pdf".into(),
        };
        let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
        assert!(matches!(outcome, FetchOutcome::Fetched { .. }));
        let pdf = std::fs::read(folder.join("Blatt_1.pdf")).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
        assert_eq!(fx.renderer.renders(), 1);
    }

    #[tokio::test]
    async fn test_sso_words_in_file_names_are_not_login_pages() {
        let fx = fixture().await;
        for name in ["SSO-Intro.pdf", "OAuth-Grundlagen.pdf"] {
            Mock::given(method("GET"))
                .and(path(format!("/pluginfile.php/1/mod_resource/content/1/{name}")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
                .mount(&fx.server)
                .await;
        }

        let mut config = ArchiveConfig::new(
            Platform::Moodle,
            Url::parse(&fx.server.uri()).unwrap(),
            "/course/view.php?id=1",
            "ti",
        );
        config.download_strategy = DownloadStrategy::Request;
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&config, CancelToken::never());
        let folder = fx.out.path().join("Intro");
        for name in ["SSO-Intro.pdf", "OAuth-Grundlagen.pdf"] {
            let mut descriptor = file(
                format!("{}/pluginfile.php/1/mod_resource/content/1/{name}", fx.server.uri()),
                name,
            );
            descriptor.kind = ResourceKind::RawFile;
            descriptor.format = ResourceFormat::Document;
            let outcome = orchestrator.fetch(&gate, &[], &descriptor, &folder).await;
            assert!(
                matches!(outcome, FetchOutcome::Fetched { bytes: 4, .. }),
                "{name}: {outcome:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_redirect_to_login_is_session_expiry() {
        let fx = fixture().await;
        Mock::given(method("GET"))
            .and(path("/files/a.zip"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/users/login"))
            .mount(&fx.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<form></form>"))
            .mount(&fx.server)
            .await;

        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&fx.config, CancelToken::never());
        let folder = fx.out.path().join("Blatt_1");
        let descriptor = file(format!("{}/files/a.zip", fx.server.uri()), "a.zip");
        match orchestrator.fetch(&gate, &[], &descriptor, &folder).await {
            FetchOutcome::Failed { error } => {
                assert!(matches!(error, RetrievalError::SessionExpired));
                assert!(!error.is_retryable());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!folder.join("a.zip").exists());
    }

    #[tokio::test]
    async fn test_render_bounced_to_login_is_session_expiry() {
        let fx = fixture().await;
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&fx.config, CancelToken::never());
        let descriptor = ResourceDescriptor {
            kind: ResourceKind::RenderAsPdf,
            format: ResourceFormat::Pdf,
            source: format!("{}/assignment/view/2", fx.server.uri()),
            name: "Blatt 2".into(),
            filename: "Blatt_2.pdf".into(),
        };
        let outcome = orchestrator
            .fetch(&gate, &[], &descriptor, &fx.out.path().join("Blatt_2"))
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                error: RetrievalError::SessionExpired
            }
        ));
        assert_eq!(fx.renderer.renders(), 0);
    }

    #[tokio::test]
    async fn test_disallowed_host() {
        let fx = fixture().await;
        let mut ctx = context(&fx.renderer).await;
        let gate = gate(&mut ctx);
        let orchestrator = Orchestrator::new(&fx.config, CancelToken::never());
        let descriptor = file("https://cdn.elsewhere.test/x.zip".into(), "x.zip");
        let outcome = orchestrator
            .fetch(&gate, &[], &descriptor, fx.out.path())
            .await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed {
                error: RetrievalError::HostNotAllowed(_)
            }
        ));
    }
}
