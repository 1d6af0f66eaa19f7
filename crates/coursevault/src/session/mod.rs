//! Session store: persisted, exclusively-held authenticated browsing state.
//!
//! A profile directory holds:
//!
//! ```text
//! <root>/<profile>/session.json   cookies, validity, last update
//! <root>/<profile>/browser/       Chromium user data
//! <root>/<profile>/.lock          PID of the process holding the profile
//! ```
//!
//! `acquire` restores a profile and probes whether it is still logged in;
//! `release` flushes state back and closes the browser. A profile is never
//! handed out twice at the same time.

pub mod login;
pub mod probe;

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, ArchiveResult, AuthError};
use crate::renderer::{LaunchOptions, RenderContext, Renderer, StoredCookie};

pub use login::{
    BrowserLogin, Credentials, FixedCredentials, FormLogin, LoginFlow, LoginRequest, NoLogin,
    OperatorConfirm,
};
pub use probe::LoginDetector;

const STATE_FILE: &str = "session.json";
const BROWSER_DIR: &str = "browser";
const LOCK_FILE: &str = ".lock";

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Unauthenticated,
    Authenticated,
    Expired,
}

/// What `session.json` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub profile: String,
    pub validity: Validity,
    pub cookies: Vec<StoredCookie>,
    pub updated_at: DateTime<Utc>,
}

/// How to check and establish authentication for one platform.
#[derive(Debug, Clone)]
pub struct AuthPlan {
    /// Page whose load tells whether we are logged in.
    pub probe_url: String,
    pub detector: LoginDetector,
    pub login: LoginRequest,
}

/// One live, exclusively held browsing session.
pub struct Session {
    profile: String,
    validity: Validity,
    context: Box<dyn RenderContext>,
    _lock: ProfileLock,
}

impl Session {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    /// Record a logout observed mid-run.
    pub fn mark_expired(&mut self) {
        self.validity = Validity::Expired;
    }

    pub fn context(&self) -> &dyn RenderContext {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> &mut dyn RenderContext {
        self.context.as_mut()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("profile", &self.profile)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

/// Persists sessions below a profile root and hands them out.
#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
    renderer: Arc<dyn Renderer>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            root: root.into(),
            renderer,
        }
    }

    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.root.join(profile)
    }

    /// Persisted state for `profile`, if any.
    pub fn load_state(&self, profile: &str) -> ArchiveResult<Option<SessionState>> {
        let path = self.profile_dir(profile).join(STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Restore or establish an authenticated session for `profile`.
    ///
    /// Stored state that no longer passes the probe fails with
    /// [`AuthError::Expired`]; the caller decides whether to [`forget`] and
    /// retry. Without stored state, `login` is run once.
    ///
    /// [`forget`]: SessionStore::forget
    pub async fn acquire(
        &self,
        profile: &str,
        headless: bool,
        plan: &AuthPlan,
        login: &dyn LoginFlow,
    ) -> ArchiveResult<Session> {
        let dir = self.profile_dir(profile);
        let lock = ProfileLock::acquire(&dir)?;
        let stored = self.load_state(profile)?;

        let mut context = self
            .renderer
            .launch(&LaunchOptions {
                user_data_dir: dir.join(BROWSER_DIR),
                headless,
            })
            .await
            .map_err(|e| ArchiveError::SessionStore(format!("failed to launch browser: {e:#}")))?;

        match self
            .establish(context.as_mut(), stored.as_ref(), plan, login)
            .await
        {
            Ok(()) => {
                let session = Session {
                    profile: profile.to_string(),
                    validity: Validity::Authenticated,
                    context,
                    _lock: lock,
                };
                self.flush(&session).await?;
                info!(profile, "session acquired");
                Ok(session)
            }
            Err(e) => {
                if let (Some(state), ArchiveError::Auth(AuthError::Expired)) = (&stored, &e) {
                    let expired = SessionState {
                        validity: Validity::Expired,
                        updated_at: Utc::now(),
                        ..state.clone()
                    };
                    if let Err(write_err) = write_state(&dir, &expired) {
                        warn!(profile, "failed to record expired session: {write_err}");
                    }
                }
                if let Err(close_err) = context.close().await {
                    warn!(profile, "failed to close browser: {close_err:#}");
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        ctx: &mut dyn RenderContext,
        stored: Option<&SessionState>,
        plan: &AuthPlan,
        login: &dyn LoginFlow,
    ) -> ArchiveResult<()> {
        if let Some(state) = stored {
            if !state.cookies.is_empty() {
                ctx.set_cookies(&state.cookies).await.map_err(|e| {
                    ArchiveError::SessionStore(format!("failed to restore cookies: {e:#}"))
                })?;
            }
        }

        if self.probe(ctx, plan).await? {
            return Ok(());
        }
        if stored.is_some() {
            info!("stored session is no longer valid");
            return Err(AuthError::Expired.into());
        }

        info!("no stored session, starting interactive login");
        login.login(ctx, &plan.login).await?;
        if self.probe(ctx, plan).await? {
            Ok(())
        } else {
            Err(AuthError::Unauthenticated.into())
        }
    }

    /// Load the probe page; `true` when it shows us logged in.
    async fn probe(&self, ctx: &mut dyn RenderContext, plan: &AuthPlan) -> ArchiveResult<bool> {
        ctx.navigate(&plan.probe_url, plan.login.timeout_ms)
            .await
            .map_err(|e| ArchiveError::navigation(&plan.probe_url, format!("{e:#}")))?;
        let on_login = plan
            .detector
            .is_login_page(&*ctx)
            .await
            .map_err(|e| ArchiveError::navigation(&plan.probe_url, format!("{e:#}")))?;
        debug!(url = %plan.probe_url, logged_in = !on_login, "session probe");
        Ok(!on_login)
    }

    /// Flush state and close the browser. Runs on every exit path of a run.
    pub async fn release(&self, session: Session) -> ArchiveResult<()> {
        let flushed = self.flush(&session).await;
        let Session {
            profile,
            context,
            _lock,
            ..
        } = session;
        let closed = context.close().await;
        drop(_lock);
        info!(profile = %profile, "session released");

        flushed?;
        closed.map_err(|e| ArchiveError::SessionStore(format!("failed to close browser: {e:#}")))
    }

    async fn flush(&self, session: &Session) -> ArchiveResult<()> {
        let dir = self.profile_dir(&session.profile);
        let cookies = match session.context.cookies().await {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!(profile = %session.profile, "could not read cookies: {e:#}");
                self.load_state(&session.profile)?
                    .map(|s| s.cookies)
                    .unwrap_or_default()
            }
        };
        let state = SessionState {
            profile: session.profile.clone(),
            validity: session.validity,
            cookies,
            updated_at: Utc::now(),
        };
        write_state(&dir, &state)
    }

    /// Delete all persisted state of `profile`.
    pub fn forget(&self, profile: &str) -> ArchiveResult<()> {
        let dir = self.profile_dir(profile);
        if !dir.exists() {
            return Ok(());
        }
        let _lock = ProfileLock::acquire(&dir)?;
        for (path, is_dir) in [(dir.join(STATE_FILE), false), (dir.join(BROWSER_DIR), true)] {
            let removed = if is_dir {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removed {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(profile, "stored session forgotten");
        Ok(())
    }
}

fn write_state(dir: &Path, state: &SessionState) -> ArchiveResult<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, state)?;
    tmp.flush()?;
    tmp.persist(dir.join(STATE_FILE))
        .map_err(|e| ArchiveError::SessionStore(format!("failed to write session state: {e}")))?;
    Ok(())
}

fn held_profiles() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive hold on a profile directory, in-process and across processes.
struct ProfileLock {
    dir: PathBuf,
    file: PathBuf,
}

impl ProfileLock {
    fn acquire(dir: &Path) -> ArchiveResult<Self> {
        std::fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;
        {
            let mut held = held_profiles()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !held.insert(dir.clone()) {
                return Err(ArchiveError::SessionStore(format!(
                    "profile {} is already in use",
                    dir.display()
                )));
            }
        }

        let file = dir.join(LOCK_FILE);
        match claim_lock_file(&file) {
            Ok(()) => Ok(Self { dir, file }),
            Err(e) => {
                release_registry(&dir);
                Err(e)
            }
        }
    }
}

impl Drop for ProfileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.file);
        release_registry(&self.dir);
    }
}

fn release_registry(dir: &Path) {
    held_profiles()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(dir);
}

fn claim_lock_file(file: &Path) -> ArchiveResult<()> {
    for _ in 0..2 {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(file)
        {
            Ok(mut f) => {
                write!(f, "{}", std::process::id())?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(file)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                match owner {
                    Some(pid) if pid != std::process::id() && process_alive(pid) => {
                        return Err(ArchiveError::SessionStore(format!(
                            "profile is locked by running process {pid}"
                        )));
                    }
                    _ => {
                        // Our own leftover or a dead process.
                        warn!(lock = %file.display(), "reclaiming stale profile lock");
                        let _ = std::fs::remove_file(file);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ArchiveError::SessionStore(format!(
        "could not claim {}",
        file.display()
    )))
}

fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let output = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output();
        matches!(output, Ok(o) if o.status.success())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
