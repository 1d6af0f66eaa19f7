//! The validated configuration value the engine runs against.
//!
//! Shape checks (types, required fields) belong to whoever builds the value;
//! [`ArchiveConfig::validate`] only rejects combinations the engine alone can
//! judge, such as a format the selected platform cannot resolve.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ArchiveError, ArchiveResult};
use crate::types::{Platform, ResourceFormat};

/// Default Moodle module kinds walked on the course page.
pub const DEFAULT_MODULE_PATTERNS: &[&str] = &["/mod/resource/view.php", "/mod/folder/view.php"];

/// What to do when a target file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    KeepExisting,
    Replace,
}

impl From<bool> for OverwritePolicy {
    fn from(replace_existing_files: bool) -> Self {
        if replace_existing_files {
            OverwritePolicy::Replace
        } else {
            OverwritePolicy::KeepExisting
        }
    }
}

/// Which network path raw files are fetched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    /// Direct HTTP with the session's cookies.
    Request,
    /// `fetch()` inside the browser page.
    Browser,
    /// HTTP first, browser on failure.
    Auto,
}

/// How interactive login is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMode {
    /// Fill the login form with credentials from a credential source.
    Form,
    /// Let the operator log in by hand in a visible browser window.
    Browser,
}

/// Login page selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginForm {
    pub mode: LoginMode,
    pub user_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
}

impl LoginForm {
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            mode: LoginMode::Form,
            user_selector: r#"input[type="text"]"#.to_string(),
            password_selector: r#"input[type="password"]"#.to_string(),
            submit_selector: platform.default_submit_selector().to_string(),
        }
    }
}

/// Paper settings for page renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfOptions {
    /// `A4` or `Letter`.
    pub paper: String,
    pub print_background: bool,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            paper: "A4".to_string(),
            print_background: true,
        }
    }
}

impl PdfOptions {
    /// Paper width and height in inches.
    pub fn paper_size(&self) -> (f64, f64) {
        match self.paper.to_ascii_lowercase().as_str() {
            "letter" => (8.5, 11.0),
            "legal" => (8.5, 14.0),
            "a3" => (11.69, 16.54),
            _ => (8.27, 11.69),
        }
    }
}

/// Full engine configuration for one course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub platform: Platform,
    pub base_url: Url,
    pub start_path: String,
    pub login_path: String,
    /// Course or run label; first folder level below `output_dir`.
    pub label: String,
    pub output_dir: PathBuf,
    pub profile_dir: PathBuf,
    pub profile: String,
    pub headless: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub module_patterns: Vec<String>,
    pub include_submissions: bool,
    pub formats: BTreeSet<ResourceFormat>,
    pub replace_existing_files: bool,
    pub allowed_resource_hosts: Vec<String>,
    pub login: LoginForm,
    pub pdf: PdfOptions,
    pub download_strategy: DownloadStrategy,
    pub navigation_timeout_ms: u64,
    pub resource_deadline: Option<Duration>,
    pub max_retries: u32,
    pub concurrency: usize,
    pub write_url_txt: bool,
    pub reauthenticate: bool,
}

impl ArchiveConfig {
    /// Configuration with platform defaults for everything but the essentials.
    pub fn new(platform: Platform, base_url: Url, start_path: &str, label: &str) -> Self {
        let host = base_url.host_str().unwrap_or_default().to_string();
        Self {
            platform,
            start_path: start_path.to_string(),
            login_path: platform.default_login_path().to_string(),
            label: label.to_string(),
            output_dir: PathBuf::from("data"),
            profile_dir: default_profile_root(),
            profile: label.to_string(),
            headless: true,
            include: Vec::new(),
            exclude: Vec::new(),
            module_patterns: DEFAULT_MODULE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            include_submissions: false,
            formats: platform.default_formats(),
            replace_existing_files: false,
            allowed_resource_hosts: vec![host],
            login: LoginForm::for_platform(platform),
            pdf: PdfOptions::default(),
            download_strategy: DownloadStrategy::Auto,
            navigation_timeout_ms: 30_000,
            resource_deadline: None,
            max_retries: 1,
            concurrency: 1,
            write_url_txt: false,
            reauthenticate: true,
            base_url,
        }
    }

    pub fn overwrite_policy(&self) -> OverwritePolicy {
        self.replace_existing_files.into()
    }

    pub fn start_url(&self) -> ArchiveResult<Url> {
        join_url(&self.base_url, &self.start_path)
    }

    pub fn login_url(&self) -> ArchiveResult<Url> {
        join_url(&self.base_url, &self.login_path)
    }

    /// Root of this run's output tree: `<output_dir>/<label>`.
    pub fn course_dir(&self) -> PathBuf {
        self.output_dir
            .join(crate::naming::safe_filename(&self.label, crate::naming::MAX_NAME_LEN))
    }

    pub fn session_profile_dir(&self) -> PathBuf {
        self.profile_dir.join(&self.profile)
    }

    /// Which node owns which folder of the course tree, kept across runs.
    pub fn folder_ledger_path(&self) -> PathBuf {
        self.output_dir.join(".coursevault").join(format!(
            "{}.folders.json",
            crate::naming::safe_filename(&self.label, crate::naming::MAX_NAME_LEN)
        ))
    }

    /// Check semantic consistency and compile the navigation policy.
    pub fn validate(&self) -> ArchiveResult<NavigationPolicy> {
        if self.label.trim().is_empty() {
            return Err(ArchiveError::config("label must not be empty"));
        }
        if self.profile.trim().is_empty()
            || self.profile.contains(['/', '\\'])
            || matches!(self.profile.trim(), "." | "..")
        {
            return Err(ArchiveError::config(format!(
                "profile '{}' is not a valid identifier",
                self.profile
            )));
        }
        if self.formats.is_empty() {
            return Err(ArchiveError::config("at least one resource format must be enabled"));
        }
        for format in &self.formats {
            if !self.platform.supports(*format) {
                return Err(ArchiveError::config(format!(
                    "format '{format}' is not supported on {} (supported: {})",
                    self.platform,
                    self.platform
                        .supported_formats()
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
        if self.login.mode == LoginMode::Browser && self.headless {
            return Err(ArchiveError::config(
                "browser login needs a visible browser; set headless to false",
            ));
        }
        if self.concurrency == 0 {
            return Err(ArchiveError::config("concurrency must be at least 1"));
        }
        if self.platform == Platform::Moodle && self.module_patterns.is_empty() {
            return Err(ArchiveError::config("moodle needs at least one module pattern"));
        }
        self.start_url()?;
        self.login_url()?;

        NavigationPolicy::compile(&self.include, &self.exclude)
    }
}

/// Home-relative default for session profiles (`~/.coursevault/profiles`).
pub fn default_profile_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coursevault")
        .join("profiles")
}

fn join_url(base: &Url, path_or_url: &str) -> ArchiveResult<Url> {
    base.join(path_or_url)
        .map_err(|e| ArchiveError::config(format!("invalid location '{path_or_url}': {e}")))
}

/// Compiled inclusion/exclusion filter over content-node paths.
#[derive(Debug, Clone, Default)]
pub struct NavigationPolicy {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NavigationPolicy {
    pub fn compile(include: &[String], exclude: &[String]) -> ArchiveResult<Self> {
        let compile_all = |patterns: &[String]| -> ArchiveResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        ArchiveError::config(format!("invalid pattern '{p}': {e}"))
                    })
                })
                .collect()
        };
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
        })
    }

    /// A path is admitted when it matches some include pattern (or none are
    /// configured) and no exclude pattern.
    pub fn admits(&self, path: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(path));
        included && !self.exclude.iter().any(|r| r.is_match(path))
    }
}

/// Hosts resources may be fetched from. `*.example.org` matches subdomains.
#[derive(Debug, Clone)]
pub struct HostAllowlist {
    hosts: Vec<String>,
}

impl HostAllowlist {
    pub fn new(hosts: &[String]) -> Self {
        Self {
            hosts: hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }

    pub fn allows(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(domain) => host == domain || host.ends_with(&format!(".{domain}")),
            None => host == *pattern,
        })
    }
}
