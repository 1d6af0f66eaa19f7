//! Interactive login capabilities invoked by the session store.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{LoginForm, LoginMode};
use crate::error::AuthError;
use crate::renderer::RenderContext;

/// Consent dialog some identity providers show after SSO login.
const CONSENT_PROCEED: &str = r#"button[name="_eventId_proceed"]"#;

/// What a login flow needs to know about the platform.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub login_url: String,
    pub form: LoginForm,
    pub timeout_ms: u64,
}

/// Performs interactive login on a live page.
///
/// Success is not judged here; the session store re-probes afterwards.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn login(
        &self,
        ctx: &mut dyn RenderContext,
        request: &LoginRequest,
    ) -> Result<(), AuthError>;
}

/// Source of a username and password.
#[async_trait]
pub trait Credentials: Send + Sync {
    async fn credentials(&self, login_url: &str) -> anyhow::Result<(String, String)>;
}

/// Fixed credentials, e.g. read from the environment.
#[derive(Clone)]
pub struct FixedCredentials {
    username: String,
    password: String,
}

impl FixedCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for FixedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[async_trait]
impl Credentials for FixedCredentials {
    async fn credentials(&self, _login_url: &str) -> anyhow::Result<(String, String)> {
        Ok((self.username.clone(), self.password.clone()))
    }
}

/// Fills and submits the platform's login form.
pub struct FormLogin<C> {
    credentials: C,
}

impl<C: Credentials> FormLogin<C> {
    pub fn new(credentials: C) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl<C: Credentials> LoginFlow for FormLogin<C> {
    async fn login(
        &self,
        ctx: &mut dyn RenderContext,
        request: &LoginRequest,
    ) -> Result<(), AuthError> {
        let (username, password) = self
            .credentials
            .credentials(&request.login_url)
            .await
            .map_err(|e| {
                warn!("no credentials available: {e:#}");
                AuthError::Unauthenticated
            })?;

        info!(url = %request.login_url, "submitting login form");
        let form = &request.form;
        let submitted = async {
            ctx.navigate(&request.login_url, request.timeout_ms).await?;
            ctx.fill(&form.user_selector, &username).await?;
            ctx.fill(&form.password_selector, &password).await?;
            ctx.click_and_wait(&form.submit_selector, request.timeout_ms)
                .await?;
            if ctx.has_element(CONSENT_PROCEED).await? {
                debug!("accepting attribute release");
                ctx.click_and_wait(CONSENT_PROCEED, request.timeout_ms)
                    .await?;
            }
            anyhow::Ok(())
        }
        .await;

        submitted.map_err(|e| {
            warn!("login form failed: {e:#}");
            AuthError::Unauthenticated
        })
    }
}

/// Blocks until the operator confirms the login is done.
#[async_trait]
pub trait OperatorConfirm: Send + Sync {
    async fn wait_for_login(&self, login_url: &str) -> anyhow::Result<()>;
}

/// Opens the login page in a visible browser and lets the operator log in.
pub struct BrowserLogin<O> {
    operator: O,
}

impl<O: OperatorConfirm> BrowserLogin<O> {
    pub fn new(operator: O) -> Self {
        Self { operator }
    }
}

#[async_trait]
impl<O: OperatorConfirm> LoginFlow for BrowserLogin<O> {
    async fn login(
        &self,
        ctx: &mut dyn RenderContext,
        request: &LoginRequest,
    ) -> Result<(), AuthError> {
        if request.form.mode != LoginMode::Browser {
            debug!("browser login used with form mode configured");
        }
        ctx.navigate(&request.login_url, request.timeout_ms)
            .await
            .map_err(|e| {
                warn!("could not open login page: {e:#}");
                AuthError::Unauthenticated
            })?;
        self.operator
            .wait_for_login(&request.login_url)
            .await
            .map_err(|e| {
                warn!("login not confirmed: {e:#}");
                AuthError::Unauthenticated
            })
    }
}

/// A flow that never logs in. Runs that must reuse a stored session use it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLogin;

#[async_trait]
impl LoginFlow for NoLogin {
    async fn login(
        &self,
        _ctx: &mut dyn RenderContext,
        _request: &LoginRequest,
    ) -> Result<(), AuthError> {
        Err(AuthError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::{LaunchOptions, Renderer, StaticRenderer, StaticSite};
    use crate::types::Platform;

    fn request() -> LoginRequest {
        LoginRequest {
            login_url: "https://se.example/users/login".into(),
            form: LoginForm::for_platform(Platform::Roeselite),
            timeout_ms: 1000,
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

    #[tokio::test]
    async fn test_form_login_sets_session() {
        let renderer =
            StaticRenderer::new(StaticSite::new("https://se.example", "/users/login").unwrap());
        let mut ctx = context(&renderer).await;
        let flow = FormLogin::new(FixedCredentials::new("student", "secret"));
        flow.login(ctx.as_mut(), &request()).await.unwrap();
        assert_eq!(ctx.cookies().await.unwrap(), vec![renderer.session_cookie()]);
    }

    #[tokio::test]
    async fn test_form_login_bad_selector() {
        let renderer =
            StaticRenderer::new(StaticSite::new("https://se.example", "/users/login").unwrap());
        let mut ctx = context(&renderer).await;
        let mut req = request();
        req.form.user_selector = "#no-such-field".into();
        let flow = FormLogin::new(FixedCredentials::new("student", "secret"));
        assert_eq!(
            flow.login(ctx.as_mut(), &req).await,
            Err(AuthError::Unauthenticated)
        );
    }

    struct Confirmed;

    #[async_trait]
    impl OperatorConfirm for Confirmed {
        async fn wait_for_login(&self, _login_url: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_browser_login_opens_login_page() {
        let renderer =
            StaticRenderer::new(StaticSite::new("https://se.example", "/users/login").unwrap());
        let mut ctx = context(&renderer).await;
        BrowserLogin::new(Confirmed)
            .login(ctx.as_mut(), &request())
            .await
            .unwrap();
        assert_eq!(
            ctx.current_url().await.unwrap(),
            "https://se.example/users/login"
        );
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = FixedCredentials::new("student", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
