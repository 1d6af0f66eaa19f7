use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{is_document, is_image, is_tgz, snapshot, url_extension, Candidates, Resolution, Resolver};
use crate::config::HostAllowlist;
use crate::error::{ArchiveError, ArchiveResult};
use crate::renderer::RenderContext;
use crate::types::{ContentNode, ResourceFormat};

/// Resolves attachments on a Roeselite assignment page.
pub struct RoeseliteResolver {
    hosts: HostAllowlist,
    write_url_txt: bool,
}

impl RoeseliteResolver {
    pub fn new(hosts: HostAllowlist, write_url_txt: bool) -> Self {
        Self {
            hosts,
            write_url_txt,
        }
    }
}

/// First enabled format a link qualifies for.
fn classify(url: &Url, formats: &BTreeSet<ResourceFormat>) -> Option<ResourceFormat> {
    let mode = url
        .query_pairs()
        .find(|(k, _)| k == "mode")
        .map(|(_, v)| v.to_ascii_lowercase());
    let ext = url_extension(url);
    let checks = [
        (ResourceFormat::Dl, mode.as_deref() == Some("dl")),
        (ResourceFormat::Raw, mode.as_deref() == Some("raw")),
        (ResourceFormat::Zip, ext == "zip"),
        (ResourceFormat::Tgz, is_tgz(&ext)),
        (ResourceFormat::Document, is_document(&ext)),
        (ResourceFormat::Image, is_image(&ext)),
    ];
    checks
        .into_iter()
        .find(|(format, hit)| *hit && formats.contains(format))
        .map(|(format, _)| format)
}

#[async_trait]
impl Resolver for RoeseliteResolver {
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
        for link in &page.links {
            let Some(url) = candidates.parse(&page_url, &link.href) else {
                continue;
            };
            if let Some(format) = classify(&url, formats) {
                candidates.push(url, format, &link.text);
            }
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
