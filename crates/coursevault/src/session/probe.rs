//! "Am I logged in" detection per platform.

use anyhow::Result;

use crate::renderer::RenderContext;
use crate::types::Platform;

/// URL tokens that mark a single-sign-on identity provider page.
const SSO_MARKERS: &[&str] = &["saml", "saml2", "sso", "idp", "shibboleth", "oauth", "oauth2"];

/// Guest "log in" link in Moodle's login-info block.
const GUEST_LOGIN_LINK: &str = r#".logininfo a[href*="login/index.php"]"#;

/// Decides whether the loaded page means "not authenticated".
#[derive(Debug, Clone)]
pub struct LoginDetector {
    platform: Platform,
    login_path: String,
}

impl LoginDetector {
    pub fn new(platform: Platform, login_path: &str) -> Self {
        Self {
            platform,
            login_path: login_path.to_string(),
        }
    }

    /// URL-only check.
    pub fn is_login_url(&self, url: &str) -> bool {
        if !self.login_path.is_empty() && url.contains(&self.login_path) {
            return true;
        }
        match self.platform {
            Platform::Roeselite => false,
            Platform::Moodle => is_sso_url(url),
        }
    }

    /// Full check against the live page.
    pub async fn is_login_page(&self, ctx: &dyn RenderContext) -> Result<bool> {
        let url = ctx.current_url().await?;
        if self.is_login_url(&url) {
            return Ok(true);
        }
        match self.platform {
            Platform::Roeselite => Ok(false),
            Platform::Moodle => ctx.has_element(GUEST_LOGIN_LINK).await,
        }
    }
}

/// Token match so that e.g. `/mod/lesson/` is not mistaken for `sso`.
fn is_sso_url(url: &str) -> bool {
    url.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| SSO_MARKERS.contains(&token))
}
