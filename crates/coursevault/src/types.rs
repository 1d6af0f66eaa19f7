//! Core data types: platforms, content nodes, resource descriptors and run outcomes.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported learning platform variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Moodle,
    Roeselite,
}

impl Platform {
    pub fn default_start_path(&self) -> Option<&'static str> {
        match self {
            Platform::Moodle => None,
            Platform::Roeselite => Some("/assignments"),
        }
    }

    pub fn default_login_path(&self) -> &'static str {
        match self {
            Platform::Moodle => "/login/index.php",
            Platform::Roeselite => "/users/login",
        }
    }

    pub fn default_submit_selector(&self) -> &'static str {
        match self {
            Platform::Moodle => r#"button[type="submit"]"#,
            Platform::Roeselite => r#"input[type="submit"]"#,
        }
    }

    pub fn default_formats(&self) -> BTreeSet<ResourceFormat> {
        match self {
            Platform::Moodle => [ResourceFormat::Document, ResourceFormat::Zip].into(),
            Platform::Roeselite => {
                [ResourceFormat::Pdf, ResourceFormat::Dl, ResourceFormat::Zip].into()
            }
        }
    }

    /// Formats the platform's resolver knows how to discover.
    pub fn supported_formats(&self) -> &'static [ResourceFormat] {
        use ResourceFormat::*;
        match self {
            Platform::Moodle => &[Pdf, Document, Zip, Tgz, Image],
            Platform::Roeselite => &[Pdf, Dl, Raw, Zip, Tgz, Document, Image],
        }
    }

    pub fn supports(&self, format: ResourceFormat) -> bool {
        self.supported_formats().contains(&format)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Moodle => write!(f, "moodle"),
            Self::Roeselite => write!(f, "roeselite"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "moodle" => Ok(Platform::Moodle),
            "roeselite" | "roesslite" => Ok(Platform::Roeselite),
            other => Err(format!("unknown platform '{other}' (expected moodle or roeselite)")),
        }
    }
}

/// An archivable format a resolver may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFormat {
    /// The node page itself, rendered to PDF.
    Pdf,
    /// Download links (`mode=dl`).
    Dl,
    /// Raw text views (`mode=raw`).
    Raw,
    Zip,
    /// `.tgz`, `.tar.gz` and `.gz` archives.
    Tgz,
    /// Linked documents: PDF and office files.
    Document,
    Image,
}

impl ResourceFormat {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceFormat::Pdf => ResourceKind::RenderAsPdf,
            ResourceFormat::Zip | ResourceFormat::Tgz => ResourceKind::Archive,
            ResourceFormat::Dl
            | ResourceFormat::Raw
            | ResourceFormat::Document
            | ResourceFormat::Image => ResourceKind::RawFile,
        }
    }
}

impl std::fmt::Display for ResourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pdf => "pdf",
            Self::Dl => "dl",
            Self::Raw => "raw",
            Self::Zip => "zip",
            Self::Tgz => "tgz",
            Self::Document => "document",
            Self::Image => "image",
        };
        f.write_str(name)
    }
}

impl FromStr for ResourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "dl" => Ok(Self::Dl),
            "raw" => Ok(Self::Raw),
            "zip" => Ok(Self::Zip),
            "tgz" | "tar.gz" | "gz" => Ok(Self::Tgz),
            "document" | "doc" => Ok(Self::Document),
            "image" | "img" => Ok(Self::Image),
            other => Err(format!("unknown resource format '{other}'")),
        }
    }
}

/// How a resource is materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    RenderAsPdf,
    RawFile,
    Archive,
}

/// One addressable unit of the platform hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentNode {
    /// Stable identifier derived from the platform path.
    pub id: String,
    /// Human-readable title, used for the output folder.
    pub title: String,
    /// Absolute URL of the node page.
    pub location: String,
    /// Hierarchy path the navigation policy was evaluated against.
    pub path: String,
    /// Enclosing section, when the platform groups nodes.
    pub section: Option<String>,
}

/// One retrievable unit belonging to a content node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub format: ResourceFormat,
    /// Page URL to render or file URL to fetch.
    pub source: String,
    /// Resource name before collision handling.
    pub name: String,
    /// Final filename inside the node folder.
    pub filename: String,
}

/// Result of handing one descriptor to the orchestrator.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched { path: PathBuf, bytes: u64 },
    Skipped { path: PathBuf },
    Failed { error: crate::error::RetrievalError },
}

/// Which stage of the pipeline a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Navigation,
    Resolution,
    Retrieval,
}

/// Actionable detail for one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub node_id: String,
    pub node_title: String,
    pub resource: Option<String>,
    pub stage: FailureStage,
    pub cause: String,
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Done,
    Aborted { reason: String },
}

/// Aggregate result of one engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub label: String,
    pub nodes_visited: u32,
    pub fetched: u32,
    pub skipped: u32,
    pub failed: u32,
    /// Identifiers of visited nodes in enumeration order.
    pub node_ids: Vec<String>,
    pub failures: Vec<FailureRecord>,
    pub state: RunState,
}

impl RunOutcome {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            nodes_visited: 0,
            fetched: 0,
            skipped: 0,
            failed: 0,
            node_ids: Vec::new(),
            failures: Vec::new(),
            state: RunState::Done,
        }
    }

    pub fn record_node(&mut self, node_id: &str) {
        self.nodes_visited += 1;
        self.node_ids.push(node_id.to_string());
    }

    pub fn record_failure(&mut self, failure: FailureRecord) {
        self.failed += 1;
        self.failures.push(failure);
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        // The first fatal cause wins.
        if self.state == RunState::Done {
            self.state = RunState::Aborted {
                reason: reason.into(),
            };
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.state, RunState::Aborted { .. })
    }

    /// Process exit code: 0 only for a completed run without failures.
    pub fn exit_code(&self) -> i32 {
        if self.is_aborted() || self.failed > 0 {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_support() {
        assert!(Platform::Roeselite.supports(ResourceFormat::Raw));
        assert!(!Platform::Moodle.supports(ResourceFormat::Raw));
        assert!(!Platform::Moodle.supports(ResourceFormat::Dl));
        for format in Platform::Moodle.default_formats() {
            assert!(Platform::Moodle.supports(format));
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("PDF".parse::<ResourceFormat>().unwrap(), ResourceFormat::Pdf);
        assert_eq!("tar.gz".parse::<ResourceFormat>().unwrap(), ResourceFormat::Tgz);
        assert!("docx".parse::<ResourceFormat>().is_err());
        assert_eq!(ResourceFormat::Document.to_string(), "document");
    }

    #[test]
    fn test_format_kinds() {
        assert_eq!(ResourceFormat::Pdf.kind(), ResourceKind::RenderAsPdf);
        assert_eq!(ResourceFormat::Tgz.kind(), ResourceKind::Archive);
        assert_eq!(ResourceFormat::Raw.kind(), ResourceKind::RawFile);
    }

    #[test]
    fn test_exit_code() {
        let mut outcome = RunOutcome::new("se");
        assert_eq!(outcome.exit_code(), 0);

        outcome.record_failure(FailureRecord {
            node_id: "assignment-view-1".into(),
            node_title: "Sheet 1".into(),
            resource: Some("sheet1.zip".into()),
            stage: FailureStage::Retrieval,
            cause: "HTTP 404".into(),
        });
        assert_eq!(outcome.exit_code(), 1);

        let mut aborted = RunOutcome::new("se");
        aborted.abort("session expired");
        aborted.abort("second cause");
        assert_eq!(aborted.exit_code(), 1);
        assert_eq!(
            aborted.state,
            RunState::Aborted {
                reason: "session expired".into()
            }
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let mut outcome = RunOutcome::new("theoinf");
        outcome.record_node("resource-42");
        outcome.fetched = 2;
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"state\":\"done\""));
        assert!(json.contains("resource-42"));
    }
}
