//! Crawl driver: the top-level control loop of one archive run.
//!
//! ```text
//! Init → SessionAcquired → Enumerating → (Resolving → Fetching)* → Finalizing → Done
//!                                                                             ↘ Aborted
//! ```
//!
//! Per-node and per-resource errors are folded into the [`RunOutcome`]; only
//! authentication failures, cancellation and session store failures abort.
//! The session is released on every path out of [`CrawlDriver::run`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{ArchiveConfig, NavigationPolicy};
use crate::error::{ArchiveError, ArchiveResult, AuthError, RetrievalError};
use crate::fetch::{BrowserGate, Orchestrator};
use crate::naming::FolderAllocator;
use crate::navigator::{self, Navigator, NodeLink};
use crate::progress::{emit, ProgressEventKind, ProgressSender, RunPhase};
use crate::renderer::{RenderContext, Renderer, StoredCookie};
use crate::resolver::{self, Resolver, URL_TXT};
use crate::session::{AuthPlan, LoginDetector, LoginFlow, LoginRequest, Session, SessionStore};
use crate::types::{
    ContentNode, FailureRecord, FailureStage, FetchOutcome, ResourceDescriptor, RunOutcome,
};

/// First retry delay; doubled on every further attempt.
const RETRY_BASE: Duration = Duration::from_millis(500);

/// Runs one course archive end to end.
pub struct CrawlDriver {
    config: ArchiveConfig,
    policy: NavigationPolicy,
    store: SessionStore,
    login: Arc<dyn LoginFlow>,
    navigator: Box<dyn Navigator>,
    resolver: Box<dyn Resolver>,
    cancel: CancelToken,
    progress: Option<ProgressSender>,
}

/// Per-run bookkeeping threaded through the loop.
struct RunLog {
    outcome: RunOutcome,
    seq: u64,
}

impl CrawlDriver {
    /// Validate `config` and prepare a driver. Fails with
    /// [`ArchiveError::Config`] before any browser is launched.
    pub fn new(
        config: ArchiveConfig,
        renderer: Arc<dyn Renderer>,
        login: Arc<dyn LoginFlow>,
    ) -> ArchiveResult<Self> {
        let policy = config.validate()?;
        Ok(Self {
            store: SessionStore::new(config.profile_dir.clone(), renderer),
            navigator: navigator::for_config(&config),
            resolver: resolver::for_config(&config),
            config,
            policy,
            login,
            cancel: CancelToken::never(),
            progress: None,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    fn auth_plan(&self) -> ArchiveResult<AuthPlan> {
        Ok(AuthPlan {
            probe_url: self.config.start_url()?.to_string(),
            detector: self.detector(),
            login: LoginRequest {
                login_url: self.config.login_url()?.to_string(),
                form: self.config.login.clone(),
                timeout_ms: self.config.navigation_timeout_ms,
            },
        })
    }

    fn detector(&self) -> LoginDetector {
        LoginDetector::new(self.config.platform, &self.config.login_path)
    }

    /// Acquire a session, forgetting an expired stored one once when
    /// `reauthenticate` is set.
    async fn acquire(&self) -> ArchiveResult<Session> {
        let plan = self.auth_plan()?;
        let profile = self.config.profile.as_str();
        let headless = self.config.headless;
        let first = self
            .store
            .acquire(profile, headless, &plan, self.login.as_ref())
            .await;
        match first {
            Err(ArchiveError::Auth(AuthError::Expired)) if self.config.reauthenticate => {
                info!(profile, "stored session expired, logging in again");
                self.store.forget(profile)?;
                self.store
                    .acquire(profile, headless, &plan, self.login.as_ref())
                    .await
            }
            other => other,
        }
    }

    /// Establish (or verify) the stored session for this course and release it.
    pub async fn login(&self) -> ArchiveResult<()> {
        let session = self
            .cancel
            .run(self.acquire())
            .await
            .ok_or(ArchiveError::Cancelled)??;
        self.store.release(session).await
    }

    /// Delete the stored session for this course.
    pub fn logout(&self) -> ArchiveResult<()> {
        self.store.forget(&self.config.profile)
    }

    /// Archive the course. Never fails: the outcome carries every error.
    pub async fn run(&self) -> RunOutcome {
        let mut log = RunLog {
            outcome: RunOutcome::new(&self.config.label),
            seq: 0,
        };
        self.phase(&mut log, RunPhase::Init);

        let mut session = match self.cancel.run(self.acquire()).await {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                warn!(label = %self.config.label, "could not acquire session: {e}");
                log.outcome.abort(e.to_string());
                self.phase(&mut log, RunPhase::Aborted);
                return log.outcome;
            }
            None => {
                log.outcome.abort(ArchiveError::Cancelled.to_string());
                self.phase(&mut log, RunPhase::Aborted);
                return log.outcome;
            }
        };
        self.phase(&mut log, RunPhase::SessionAcquired);

        if let Err(e) = self.crawl(&mut session, &mut log).await {
            if matches!(e, ArchiveError::Auth(AuthError::Expired)) {
                session.mark_expired();
            }
            warn!(label = %self.config.label, "run aborted: {e}");
            log.outcome.abort(e.to_string());
        }

        self.phase(&mut log, RunPhase::Finalizing);
        if let Err(e) = self.store.release(session).await {
            warn!(label = %self.config.label, "session release failed: {e}");
            log.outcome.abort(e.to_string());
        }

        let end = if log.outcome.is_aborted() {
            RunPhase::Aborted
        } else {
            RunPhase::Done
        };
        self.phase(&mut log, end);
        info!(
            label = %self.config.label,
            nodes = log.outcome.nodes_visited,
            fetched = log.outcome.fetched,
            skipped = log.outcome.skipped,
            failed = log.outcome.failed,
            state = %end,
            "run finished"
        );
        log.outcome
    }

    /// Enumerate and process every admitted node. Errors returned here are fatal.
    async fn crawl(&self, session: &mut Session, log: &mut RunLog) -> ArchiveResult<()> {
        self.phase(log, RunPhase::Enumerating);
        let start = self.config.start_url()?.to_string();
        let cursor = self
            .cancel
            .run(
                self.navigator
                    .discover(session.context_mut(), &start, &self.policy),
            )
            .await
            .ok_or(ArchiveError::Cancelled)??;
        self.emit(
            log,
            ProgressEventKind::NodesDiscovered {
                total: cursor.len() as u32,
            },
        );

        let orchestrator = Orchestrator::new(&self.config, self.cancel.clone());
        let ledger = self.config.folder_ledger_path();
        let mut folders = FolderAllocator::load(&ledger).unwrap_or_else(|e| {
            warn!(path = %ledger.display(), "ignoring unreadable folder ledger: {e}");
            FolderAllocator::new()
        });
        let course_dir = self.config.course_dir();

        for link in cursor {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let node = match self.visit(session, &link).await {
                Ok(node) => node,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let title = link.title.clone().unwrap_or_else(|| link.id.clone());
                    self.fail(log, &link.id, &title, None, FailureStage::Navigation, &e);
                    continue;
                }
            };
            log.outcome.record_node(&node.id);
            self.emit(
                log,
                ProgressEventKind::NodeStarted {
                    id: node.id.clone(),
                    title: node.title.clone(),
                },
            );

            let folder = course_dir.join(folders.allocate(&node));
            if let Err(e) = folders.save() {
                warn!(path = %ledger.display(), "could not save folder ledger: {e}");
            }
            self.process_node(session, &orchestrator, &node, &folder, log)
                .await?;
            self.emit(log, ProgressEventKind::NodeFinished { id: node.id.clone() });
        }
        Ok(())
    }

    async fn visit(&self, session: &mut Session, link: &NodeLink) -> ArchiveResult<ContentNode> {
        self.cancel
            .run(self.navigator.visit(session.context_mut(), link))
            .await
            .ok_or(ArchiveError::Cancelled)?
    }

    async fn process_node(
        &self,
        session: &mut Session,
        orchestrator: &Orchestrator,
        node: &ContentNode,
        folder: &Path,
        log: &mut RunLog,
    ) -> ArchiveResult<()> {
        debug!(id = %node.id, folder = %folder.display(), "processing node");
        if self.config.write_url_txt {
            if let Err(e) = write_url_txt(folder, &node.location).await {
                warn!(id = %node.id, "could not write {URL_TXT}: {e}");
            }
        }

        self.phase(log, RunPhase::Resolving);
        let resolved = self
            .cancel
            .run(
                self.resolver
                    .resolve(session.context(), node, &self.config.formats),
            )
            .await
            .ok_or(ArchiveError::Cancelled)?;
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.fail(log, &node.id, &node.title, None, FailureStage::Resolution, &e);
                return Ok(());
            }
        };
        for failure in &resolution.failures {
            let resource = match failure {
                ArchiveError::Resolution { resource, .. } => Some(resource.clone()),
                _ => None,
            };
            self.fail(log, &node.id, &node.title, resource, FailureStage::Resolution, failure);
        }
        if resolution.descriptors.is_empty() {
            info!(id = %node.id, "no resources");
            return Ok(());
        }

        self.phase(log, RunPhase::Fetching);
        let cookies = match session.context().cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!(id = %node.id, "could not read session cookies: {e:#}");
                Vec::new()
            }
        };
        let ctx: &mut dyn RenderContext = session.context_mut();
        let gate: BrowserGate<'_> = Mutex::new(ctx);
        let outcomes: Vec<FetchOutcome> = stream::iter(&resolution.descriptors)
            .map(|descriptor| self.fetch_with_retry(orchestrator, &gate, &cookies, descriptor, folder))
            .buffered(self.config.concurrency)
            .collect()
            .await;

        let mut expired = false;
        for (descriptor, outcome) in resolution.descriptors.iter().zip(outcomes) {
            expired |= matches!(
                outcome,
                FetchOutcome::Failed {
                    error: RetrievalError::SessionExpired
                }
            );
            self.record(log, node, descriptor, outcome);
        }
        if self.cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        if expired {
            return Err(AuthError::Expired.into());
        }
        Ok(())
    }

    async fn fetch_with_retry(
        &self,
        orchestrator: &Orchestrator,
        gate: &BrowserGate<'_>,
        cookies: &[StoredCookie],
        descriptor: &ResourceDescriptor,
        folder: &Path,
    ) -> FetchOutcome {
        let mut attempt = 0u32;
        loop {
            let outcome = orchestrator.fetch(gate, cookies, descriptor, folder).await;
            let FetchOutcome::Failed { error } = &outcome else {
                return outcome;
            };
            if !error.is_retryable() || attempt >= self.config.max_retries {
                return outcome;
            }
            let backoff = RETRY_BASE * 2u32.saturating_pow(attempt);
            attempt += 1;
            info!(
                source = %descriptor.source,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "retrying after: {error}"
            );
            if self.cancel.run(tokio::time::sleep(backoff)).await.is_none() {
                return outcome;
            }
        }
    }

    fn record(
        &self,
        log: &mut RunLog,
        node: &ContentNode,
        descriptor: &ResourceDescriptor,
        outcome: FetchOutcome,
    ) {
        match outcome {
            FetchOutcome::Fetched { bytes, .. } => {
                log.outcome.fetched += 1;
                self.emit(
                    log,
                    ProgressEventKind::ResourceFetched {
                        node_id: node.id.clone(),
                        filename: descriptor.filename.clone(),
                        bytes,
                    },
                );
            }
            FetchOutcome::Skipped { .. } => {
                log.outcome.skipped += 1;
                self.emit(
                    log,
                    ProgressEventKind::ResourceSkipped {
                        node_id: node.id.clone(),
                        filename: descriptor.filename.clone(),
                    },
                );
            }
            FetchOutcome::Failed { error } => {
                let mut cause = error.to_string();
                if !cause.contains(&descriptor.source) {
                    cause = format!("{cause} ({})", descriptor.source);
                }
                self.fail(
                    log,
                    &node.id,
                    &node.title,
                    Some(descriptor.filename.clone()),
                    FailureStage::Retrieval,
                    &cause,
                );
            }
        }
    }

    fn fail(
        &self,
        log: &mut RunLog,
        node_id: &str,
        node_title: &str,
        resource: Option<String>,
        stage: FailureStage,
        cause: &dyn std::fmt::Display,
    ) {
        let cause = cause.to_string();
        warn!(node = node_id, ?stage, resource = resource.as_deref().unwrap_or("-"), "{cause}");
        self.emit(
            log,
            ProgressEventKind::Failure {
                node_id: node_id.to_string(),
                stage,
                cause: cause.clone(),
            },
        );
        log.outcome.record_failure(FailureRecord {
            node_id: node_id.to_string(),
            node_title: node_title.to_string(),
            resource,
            stage,
            cause,
        });
    }

    fn phase(&self, log: &mut RunLog, phase: RunPhase) {
        debug!(label = %self.config.label, %phase, "phase");
        self.emit(log, ProgressEventKind::PhaseChanged { phase });
    }

    fn emit(&self, log: &mut RunLog, event: ProgressEventKind) {
        emit(&self.progress, &self.config.label, &mut log.seq, event);
    }
}

async fn write_url_txt(folder: &Path, location: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(folder).await?;
    tokio::fs::write(folder.join(URL_TXT), format!("{location}\n")).await
}
