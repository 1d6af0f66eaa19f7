//! Terminal-side login capabilities: credential prompts and operator confirmation.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use inquire::{Confirm, Password, Text};

use coursevault::session::{BrowserLogin, Credentials, FormLogin, OperatorConfirm};
use coursevault::{ArchiveConfig, LoginFlow, LoginMode};

pub const USERNAME_ENV: &str = "COURSEVAULT_USERNAME";
pub const PASSWORD_ENV: &str = "COURSEVAULT_PASSWORD";

/// Credentials from the environment, else asked for on the terminal.
#[derive(Debug, Default, Clone)]
pub struct PromptCredentials {
    username: Option<String>,
    password: Option<String>,
}

impl PromptCredentials {
    pub fn from_env() -> Self {
        Self {
            username: std::env::var(USERNAME_ENV).ok().filter(|v| !v.is_empty()),
            password: std::env::var(PASSWORD_ENV).ok().filter(|v| !v.is_empty()),
        }
    }
}

#[async_trait]
impl Credentials for PromptCredentials {
    async fn credentials(&self, login_url: &str) -> Result<(String, String)> {
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            return Ok((user.clone(), pass.clone()));
        }
        let known_user = self.username.clone();
        let login_url = login_url.to_string();
        tokio::task::spawn_blocking(move || {
            eprintln!("  Login required at {login_url}");
            let username = match known_user {
                Some(user) => user,
                None => Text::new("Username:")
                    .prompt()
                    .context("failed to read username")?,
            };
            let password = Password::new("Password:")
                .without_confirmation()
                .prompt()
                .context("failed to read password")?;
            Ok::<_, anyhow::Error>((username, password))
        })
        .await
        .context("credential prompt panicked")?
    }
}

/// Asks the operator to confirm once they finished logging in by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptConfirm;

#[async_trait]
impl OperatorConfirm for PromptConfirm {
    async fn wait_for_login(&self, login_url: &str) -> Result<()> {
        let login_url = login_url.to_string();
        let confirmed = tokio::task::spawn_blocking(move || {
            eprintln!("  Log in at {login_url} in the browser window.");
            Confirm::new("Logged in?")
                .with_default(true)
                .with_help_message("Press Enter once the course page is visible")
                .prompt()
        })
        .await
        .context("confirmation prompt panicked")?
        .context("failed to read confirmation")?;
        if !confirmed {
            bail!("login cancelled by operator");
        }
        Ok(())
    }
}

/// The login flow matching the configured login mode.
pub fn login_flow(config: &ArchiveConfig) -> Arc<dyn LoginFlow> {
    match config.login.mode {
        LoginMode::Form => Arc::new(FormLogin::new(PromptCredentials::from_env())),
        LoginMode::Browser => Arc::new(BrowserLogin::new(PromptConfirm)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stored_credentials_skip_prompt() {
        let creds = PromptCredentials {
            username: Some("student".into()),
            password: Some("secret".into()),
        };
        let (user, pass) = creds
            .credentials("https://lms.example/login/index.php")
            .await
            .unwrap();
        assert_eq!((user.as_str(), pass.as_str()), ("student", "secret"));
    }
}
