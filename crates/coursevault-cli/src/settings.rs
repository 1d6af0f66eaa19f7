//! Course files: YAML on disk, merged with defaults, environment and flags.
//!
//! Precedence, lowest first: platform defaults, the course file,
//! `COURSEVAULT_PROFILE_DIR`, command-line overrides.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use coursevault::{
    ArchiveConfig, ArchiveError, DownloadStrategy, LoginMode, Platform, ResourceFormat,
};

/// Environment override for the session profile root.
pub const PROFILE_DIR_ENV: &str = "COURSEVAULT_PROFILE_DIR";

/// One course as written in its YAML file. Everything but the platform,
/// the origin and the label is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourseFile {
    pub platform: Platform,
    pub base_url: String,
    pub label: String,
    pub start_path: Option<String>,
    pub login_path: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub profile_dir: Option<PathBuf>,
    pub profile: Option<String>,
    pub headless: Option<bool>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub module_patterns: Option<Vec<String>>,
    pub include_submissions: Option<bool>,
    pub formats: Option<Vec<ResourceFormat>>,
    pub replace_existing_files: Option<bool>,
    pub allowed_resource_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub login: LoginSection,
    #[serde(default)]
    pub pdf: PdfSection,
    pub download_strategy: Option<DownloadStrategy>,
    pub navigation_timeout_ms: Option<u64>,
    pub resource_deadline_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub concurrency: Option<usize>,
    pub write_url_txt: Option<bool>,
    pub reauthenticate: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginSection {
    pub mode: Option<LoginMode>,
    pub user_selector: Option<String>,
    pub password_selector: Option<String>,
    pub submit_selector: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdfSection {
    pub paper: Option<String>,
    pub print_background: Option<bool>,
}

/// Flags given to `coursevault run`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub headless: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub replace_existing_files: bool,
    pub formats: Vec<ResourceFormat>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Read and parse a course file.
pub fn load_course_file(path: &Path) -> Result<CourseFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ArchiveError::config(format!("cannot read course file {}: {e}", path.display()))
    })?;
    parse_course_file(&raw).with_context(|| format!("in {}", path.display()))
}

pub fn parse_course_file(raw: &str) -> Result<CourseFile> {
    serde_yaml::from_str(raw).map_err(|e| ArchiveError::config(e.to_string()).into())
}

impl CourseFile {
    /// Merge into an engine configuration. `profile_env` is the value of
    /// [`PROFILE_DIR_ENV`], if set.
    pub fn into_config(
        self,
        overrides: &Overrides,
        profile_env: Option<PathBuf>,
    ) -> Result<ArchiveConfig> {
        let base_url = Url::parse(&self.base_url).map_err(|e| {
            ArchiveError::config(format!("base_url '{}' is not a URL: {e}", self.base_url))
        })?;
        let start_path = match self.start_path {
            Some(path) => path,
            None => self
                .platform
                .default_start_path()
                .map(str::to_string)
                .ok_or_else(|| {
                    ArchiveError::config(format!("start_path is required for {}", self.platform))
                })?,
        };

        let mut config = ArchiveConfig::new(self.platform, base_url, &start_path, &self.label);
        if let Some(v) = self.login_path {
            config.login_path = v;
        }
        if let Some(v) = self.output_dir {
            config.output_dir = expand_home(v);
        }
        if let Some(v) = self.profile_dir {
            config.profile_dir = expand_home(v);
        }
        if let Some(v) = self.profile {
            config.profile = v;
        }
        if let Some(v) = self.headless {
            config.headless = v;
        }
        config.include = self.include;
        config.exclude = self.exclude;
        if let Some(v) = self.module_patterns {
            config.module_patterns = v;
        }
        if let Some(v) = self.include_submissions {
            config.include_submissions = v;
        }
        if let Some(v) = self.formats {
            config.formats = v.into_iter().collect();
        }
        if let Some(v) = self.replace_existing_files {
            config.replace_existing_files = v;
        }
        if let Some(v) = self.allowed_resource_hosts {
            config.allowed_resource_hosts = v;
        }
        if let Some(v) = self.login.mode {
            config.login.mode = v;
        }
        if let Some(v) = self.login.user_selector {
            config.login.user_selector = v;
        }
        if let Some(v) = self.login.password_selector {
            config.login.password_selector = v;
        }
        if let Some(v) = self.login.submit_selector {
            config.login.submit_selector = v;
        }
        if let Some(v) = self.pdf.paper {
            config.pdf.paper = v;
        }
        if let Some(v) = self.pdf.print_background {
            config.pdf.print_background = v;
        }
        if let Some(v) = self.download_strategy {
            config.download_strategy = v;
        }
        if let Some(v) = self.navigation_timeout_ms {
            config.navigation_timeout_ms = v;
        }
        config.resource_deadline = self.resource_deadline_secs.map(Duration::from_secs);
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = self.write_url_txt {
            config.write_url_txt = v;
        }
        if let Some(v) = self.reauthenticate {
            config.reauthenticate = v;
        }

        if let Some(dir) = profile_env {
            config.profile_dir = expand_home(dir);
        }
        apply_overrides(&mut config, overrides);
        Ok(config)
    }
}

fn apply_overrides(config: &mut ArchiveConfig, overrides: &Overrides) {
    if let Some(headless) = overrides.headless {
        config.headless = headless;
    }
    if let Some(dir) = &overrides.output_dir {
        config.output_dir = dir.clone();
    }
    if overrides.replace_existing_files {
        config.replace_existing_files = true;
    }
    if !overrides.formats.is_empty() {
        config.formats = overrides.formats.iter().copied().collect::<BTreeSet<_>>();
    }
    if !overrides.include.is_empty() {
        config.include = overrides.include.clone();
    }
    if !overrides.exclude.is_empty() {
        config.exclude = overrides.exclude.clone();
    }
}

/// `~/x` → `<home>/x`.
fn expand_home(path: PathBuf) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path,
    }
}

/// Build the engine configuration for the course file at `path`.
pub fn resolve_config(path: &Path, overrides: &Overrides) -> Result<ArchiveConfig> {
    let profile_env = std::env::var_os(PROFILE_DIR_ENV).map(PathBuf::from);
    load_course_file(path)?.into_config(overrides, profile_env)
}

/// Whether `err` is a configuration problem (exit status 2).
pub fn is_config_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::Config(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOODLE: &str = r#"
platform: moodle
base_url: https://elearning.example.edu
label: theoinf
start_path: /course/view.php?id=19620
include: ["^Woche"]
formats: [document, zip, tgz]
resource_deadline_secs: 120
login:
  mode: browser
pdf:
  paper: Letter
"#;

    #[test]
    fn test_moodle_course_file() {
        let course = parse_course_file(MOODLE).unwrap();
        let config = course.into_config(&Overrides::default(), None).unwrap();
        assert_eq!(config.platform, Platform::Moodle);
        assert_eq!(config.start_url().unwrap().as_str(), "https://elearning.example.edu/course/view.php?id=19620");
        assert_eq!(config.login_path, "/login/index.php");
        assert_eq!(config.profile, "theoinf");
        assert_eq!(config.include, vec!["^Woche"]);
        assert_eq!(config.formats.len(), 3);
        assert_eq!(config.resource_deadline, Some(Duration::from_secs(120)));
        assert_eq!(config.login.mode, LoginMode::Browser);
        assert_eq!(config.login.submit_selector, r#"button[type="submit"]"#);
        assert_eq!(config.pdf.paper, "Letter");
        assert!(config.pdf.print_background);
        assert_eq!(config.allowed_resource_hosts, vec!["elearning.example.edu"]);
    }

    #[test]
    fn test_roeselite_defaults_start_path() {
        let course = parse_course_file(
            "platform: roeselite\nbase_url: https://se.example\nlabel: se\n",
        )
        .unwrap();
        let config = course.into_config(&Overrides::default(), None).unwrap();
        assert_eq!(config.start_path, "/assignments");
        assert_eq!(
            config.formats,
            [ResourceFormat::Pdf, ResourceFormat::Dl, ResourceFormat::Zip].into()
        );
    }

    #[test]
    fn test_moodle_without_start_path_is_config_error() {
        let course = parse_course_file(
            "platform: moodle\nbase_url: https://lms.example\nlabel: x\n",
        )
        .unwrap();
        let err = course.into_config(&Overrides::default(), None).unwrap_err();
        assert!(is_config_error(&err));
    }

    #[test]
    fn test_unknown_key_is_config_error() {
        let err = parse_course_file(
            "platform: moodle\nbase_url: https://lms.example\nlabel: x\nheadles: false\n",
        )
        .unwrap_err();
        assert!(is_config_error(&err));
        assert!(err.to_string().contains("headles"));
    }

    #[test]
    fn test_overrides_and_environment_win() {
        let course = parse_course_file(MOODLE).unwrap();
        let overrides = Overrides {
            headless: Some(false),
            output_dir: Some(PathBuf::from("/srv/archive")),
            replace_existing_files: true,
            formats: vec![ResourceFormat::Pdf],
            include: vec!["Klausur".into()],
            exclude: vec![],
        };
        let config = course
            .into_config(&overrides, Some(PathBuf::from("/tmp/profiles")))
            .unwrap();
        assert!(!config.headless);
        assert_eq!(config.output_dir, PathBuf::from("/srv/archive"));
        assert!(config.replace_existing_files);
        assert_eq!(config.formats, [ResourceFormat::Pdf].into());
        assert_eq!(config.include, vec!["Klausur"]);
        assert_eq!(config.profile_dir, PathBuf::from("/tmp/profiles"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_course_file(&tmp.path().join("absent.yaml")).unwrap_err();
        assert!(is_config_error(&err));
    }
}
