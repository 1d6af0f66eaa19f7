//! Course files on disk through to a validated engine configuration.

use std::sync::Arc;

use coursevault::renderer::StaticRenderer;
use coursevault::renderer::StaticSite;
use coursevault::session::NoLogin;
use coursevault::{ArchiveError, CrawlDriver, Platform};
use coursevault_cli::settings::load_course_file;
use coursevault_cli::{is_config_error, Overrides};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_course_file_builds_a_driver() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "se.yaml",
        "platform: roeselite\n\
         base_url: https://se.example\n\
         label: Software Engineering\n\
         profile: se-ws25\n\
         output_dir: archive\n\
         formats: [pdf, raw]\n\
         concurrency: 4\n",
    );
    let config = load_course_file(&path)
        .unwrap()
        .into_config(&Overrides::default(), Some(dir.path().join("profiles")))
        .unwrap();
    assert_eq!(config.platform, Platform::Roeselite);
    assert_eq!(config.course_dir(), std::path::PathBuf::from("archive/Software_Engineering"));
    assert_eq!(config.session_profile_dir(), dir.path().join("profiles/se-ws25"));

    let renderer = StaticRenderer::new(StaticSite::new("https://se.example", "/users/login").unwrap());
    assert!(CrawlDriver::new(config, Arc::new(renderer), Arc::new(NoLogin)).is_ok());
}

#[test]
fn test_engine_rejections_are_config_errors() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "moodle.yaml",
        "platform: moodle\n\
         base_url: https://lms.example\n\
         label: ti\n\
         start_path: /course/view.php?id=1\n\
         formats: [dl]\n",
    );
    let config = load_course_file(&path)
        .unwrap()
        .into_config(&Overrides::default(), None)
        .unwrap();
    let renderer = StaticRenderer::new(StaticSite::new("https://lms.example", "/login/index.php").unwrap());
    let err = CrawlDriver::new(config, Arc::new(renderer), Arc::new(NoLogin))
        .err()
        .unwrap();
    assert!(matches!(err, ArchiveError::Config(_)));
    assert!(is_config_error(&anyhow::Error::from(err)));
}

#[test]
fn test_malformed_yaml_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "broken.yaml", "platform: [moodle\n");
    let err = load_course_file(&path).unwrap_err();
    assert!(is_config_error(&err));
    assert!(format!("{err:#}").contains("broken.yaml"));
}
