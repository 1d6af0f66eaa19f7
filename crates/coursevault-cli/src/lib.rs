//! CourseVault command-line front end: course files, login prompts, progress and reports.

pub mod login;
pub mod progress;
pub mod report;
pub mod settings;

pub use settings::{is_config_error, resolve_config, CourseFile, Overrides};
