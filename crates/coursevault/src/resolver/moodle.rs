use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{is_document, is_image, is_tgz, snapshot, url_extension, Candidates, Resolution, Resolver};
use crate::config::HostAllowlist;
use crate::error::{ArchiveError, ArchiveResult};
use crate::renderer::RenderContext;
use crate::types::{ContentNode, ResourceFormat};

/// Resolves the files behind a Moodle resource or folder module.
///
/// Files are found, in this order, as the page itself (a module that
/// redirected straight to its file), `pluginfile.php` / `forcedownload=1`
/// links, embedded frames and objects, and a meta-refresh target.
pub struct MoodleResolver {
    hosts: HostAllowlist,
    write_url_txt: bool,
}

impl MoodleResolver {
    pub fn new(hosts: HostAllowlist, write_url_txt: bool) -> Self {
        Self {
            hosts,
            write_url_txt,
        }
    }
}

fn is_file_url(url: &Url) -> bool {
    url.path().contains("/pluginfile.php")
        || url
            .query_pairs()
            .any(|(k, v)| k == "forcedownload" && v == "1")
}

fn classify(url: &Url, formats: &BTreeSet<ResourceFormat>) -> Option<ResourceFormat> {
    let ext = url_extension(url);
    let format = if ext == "zip" {
        ResourceFormat::Zip
    } else if is_tgz(&ext) {
        ResourceFormat::Tgz
    } else if is_image(&ext) {
        ResourceFormat::Image
    } else if is_document(&ext) || is_file_url(url) {
        ResourceFormat::Document
    } else {
        return None;
    };
    formats.contains(&format).then_some(format)
}

#[async_trait]
impl Resolver for MoodleResolver {
    async fn resolve(
        &self,
        ctx: &dyn RenderContext,
        node: &ContentNode,
        formats: &BTreeSet<ResourceFormat>,
    ) -> ArchiveResult<Resolution> {
        let page = snapshot(ctx, node).await?;
        let page_url = Url::parse(&page.url).map_err(|e| ArchiveError::Resolution {
            resource: page.url.clone(),
            cause: e.to_string(),
        })?;

        let mut candidates = Candidates::new(&self.hosts);

        if is_file_url(&page_url) {
            if let Some(format) = classify(&page_url, formats) {
                candidates.push(page_url.clone(), format, "");
            }
        }

        for link in &page.links {
            let Some(url) = candidates.parse(&page_url, &link.href) else {
                continue;
            };
            if !is_file_url(&url) {
                continue;
            }
            if let Some(format) = classify(&url, formats) {
                candidates.push(url, format, &link.text);
            }
        }

        let embedded = page.embeds.iter().chain(page.meta_refresh.iter());
        for src in embedded {
            let Some(url) = candidates.parse(&page_url, src) else {
                continue;
            };
            if let Some(format) = classify(&url, formats) {
                candidates.push(url, format, "");
            }
        }

        if candidates.is_empty() {
            debug!(node = %node.id, "no files found on module page");
        }
        let resolution = candidates.finish(
            node,
            formats.contains(&ResourceFormat::Pdf),
            self.write_url_txt,
        );
        debug!(
            node = %node.id,
            resources = resolution.descriptors.len(),
            unresolved = resolution.failures.len(),
            "resources resolved"
        );
        Ok(resolution)
    }
}
