//! Resource resolvers: turn a loaded content-node page into resource
//! descriptors with collision-free target filenames.

pub mod moodle;
pub mod roeselite;

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::config::{ArchiveConfig, HostAllowlist};
use crate::error::{ArchiveError, ArchiveResult};
use crate::naming::{file_name_from_url, split_extension, target_filename, FilenameAllocator};
use crate::renderer::{PageSnapshot, RenderContext};
use crate::types::{ContentNode, Platform, ResourceDescriptor, ResourceFormat, ResourceKind};

pub use moodle::MoodleResolver;
pub use roeselite::RoeseliteResolver;

/// Filename kept free in every node folder when `url.txt` is written.
pub const URL_TXT: &str = "url.txt";

const OFFICE_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "odt", "rtf", "ppt", "pptx", "odp", "xls", "xlsx", "ods",
];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Descriptors for one node plus the resources that could not be resolved.
#[derive(Debug, Default)]
pub struct Resolution {
    pub descriptors: Vec<ResourceDescriptor>,
    pub failures: Vec<ArchiveError>,
}

/// Resolves the resources of a loaded node page.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        ctx: &dyn RenderContext,
        node: &ContentNode,
        formats: &BTreeSet<ResourceFormat>,
    ) -> ArchiveResult<Resolution>;
}

/// Resolver for the configured platform.
pub fn for_config(config: &ArchiveConfig) -> Box<dyn Resolver> {
    let hosts = HostAllowlist::new(&config.allowed_resource_hosts);
    match config.platform {
        Platform::Moodle => Box::new(MoodleResolver::new(hosts, config.write_url_txt)),
        Platform::Roeselite => Box::new(RoeseliteResolver::new(hosts, config.write_url_txt)),
    }
}

pub(crate) async fn snapshot(
    ctx: &dyn RenderContext,
    node: &ContentNode,
) -> ArchiveResult<PageSnapshot> {
    ctx.snapshot().await.map_err(|e| ArchiveError::Resolution {
        resource: node.location.clone(),
        cause: format!("{e:#}"),
    })
}

/// File extension of the URL path, lowercased, `tar.gz` kept whole.
pub(crate) fn url_extension(url: &Url) -> String {
    let name = file_name_from_url(url);
    let (_, ext) = split_extension(&name);
    ext.trim_start_matches('.').to_ascii_lowercase()
}

pub(crate) fn is_document(ext: &str) -> bool {
    OFFICE_EXTENSIONS.contains(&ext)
}

pub(crate) fn is_image(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext)
}

pub(crate) fn is_tgz(ext: &str) -> bool {
    matches!(ext, "tgz" | "tar.gz" | "gz")
}

/// Accumulates candidate files in encounter order.
pub(crate) struct Candidates<'a> {
    hosts: &'a HostAllowlist,
    seen: HashSet<String>,
    files: Vec<(Url, ResourceFormat, String)>,
    failures: Vec<ArchiveError>,
}

impl<'a> Candidates<'a> {
    pub(crate) fn new(hosts: &'a HostAllowlist) -> Self {
        Self {
            hosts,
            seen: HashSet::new(),
            files: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Parse `href` against the page URL; unparseable links become failures.
    pub(crate) fn parse(&mut self, page: &Url, href: &str) -> Option<Url> {
        match page.join(href.trim()) {
            Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
                url.set_fragment(None);
                Some(url)
            }
            Ok(_) => None,
            Err(e) => {
                self.failures.push(ArchiveError::Resolution {
                    resource: href.to_string(),
                    cause: format!("unparseable link: {e}"),
                });
                None
            }
        }
    }

    /// Record a file unless its host is not allowed or the URL was seen.
    pub(crate) fn push(&mut self, url: Url, format: ResourceFormat, link_text: &str) {
        if !self.hosts.allows(&url) {
            debug!(%url, "host not allowed, skipping");
            return;
        }
        if !self.seen.insert(url.to_string()) {
            return;
        }
        let name = resource_name(&url, link_text);
        self.files.push((url, format, name));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Turn the candidates into descriptors, adding the page render first.
    pub(crate) fn finish(
        self,
        node: &ContentNode,
        render_page: bool,
        write_url_txt: bool,
    ) -> Resolution {
        let mut names = FilenameAllocator::new();
        if write_url_txt {
            names.reserve(URL_TXT);
        }
        let mut descriptors = Vec::with_capacity(self.files.len() + 1);

        if render_page {
            let filename = names.allocate(&target_filename(
                &node.title,
                ResourceKind::RenderAsPdf,
                ResourceFormat::Pdf,
                &node.title,
            ));
            descriptors.push(ResourceDescriptor {
                kind: ResourceKind::RenderAsPdf,
                format: ResourceFormat::Pdf,
                source: node.location.clone(),
                name: node.title.clone(),
                filename,
            });
        }

        for (url, format, name) in self.files {
            let kind = format.kind();
            let filename = names.allocate(&target_filename(&node.title, kind, format, &name));
            descriptors.push(ResourceDescriptor {
                kind,
                format,
                source: url.to_string(),
                name,
                filename,
            });
        }

        Resolution {
            descriptors,
            failures: self.failures,
        }
    }
}

/// The URL's last path segment, or the link text when only it carries an extension.
fn resource_name(url: &Url, link_text: &str) -> String {
    let from_url = file_name_from_url(url);
    if !split_extension(&from_url).1.is_empty() {
        return from_url;
    }
    let text = link_text.trim();
    let (stem, ext) = split_extension(text);
    if !stem.is_empty() && !ext.is_empty() && !ext.contains(' ') && ext.len() <= 8 {
        text.to_string()
    } else {
        from_url
    }
}
