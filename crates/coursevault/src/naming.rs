//! Filesystem-safe naming: node identifiers, folder names, target filenames
//! and encounter-order collision suffixes.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{ArchiveError, ArchiveResult};
use crate::types::{ContentNode, ResourceFormat, ResourceKind};

/// Maximum length of a single path component we produce.
pub const MAX_NAME_LEN: usize = 90;

/// Fallback for names that sanitize to nothing.
const FALLBACK_NAME: &str = "page";

/// Make `text` safe for use as a single path component.
///
/// Runs of characters outside `[A-Za-z0-9._-]` collapse to `_`, leading and
/// trailing underscores are trimmed and the result is capped at `max_len`.
pub fn safe_filename(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }

    let trimmed = out.trim_matches('_');
    // Only ASCII survives, so byte truncation is char-safe.
    let capped = &trimmed[..trimmed.len().min(max_len)];
    let capped = capped.trim_end_matches('_');

    if capped.is_empty() || capped == "." || capped == ".." {
        FALLBACK_NAME.to_string()
    } else {
        capped.to_string()
    }
}

/// Split a filename into stem and extension, keeping `.tar.gz` together.
pub fn split_extension(name: &str) -> (&str, &str) {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") && name.len() > ".tar.gz".len() {
        let at = name.len() - ".tar.gz".len();
        return name.split_at(at);
    }
    match name.rfind('.') {
        Some(at) if at > 0 => name.split_at(at),
        _ => (name, ""),
    }
}

/// Decoded last path segment of a URL, or `file` when there is none.
pub fn file_name_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or("");
    if segment.is_empty() {
        return "file".to_string();
    }
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Identifier built from a URL path and query, e.g. `assignment-view-17`.
pub fn id_from_path(path_and_query: &str) -> String {
    let parts: Vec<String> = path_and_query
        .split(['/', '?', '&', '=', '#'])
        .filter(|s| !s.is_empty())
        .map(|s| safe_filename(s, MAX_NAME_LEN))
        .collect();
    if parts.is_empty() {
        "root".to_string()
    } else {
        parts.join("-")
    }
}

/// Target filename for a resource. Pure in (node title, kind, format, name).
pub fn target_filename(
    node_title: &str,
    kind: ResourceKind,
    format: ResourceFormat,
    name: &str,
) -> String {
    if kind == ResourceKind::RenderAsPdf {
        let stem = safe_filename(node_title, MAX_NAME_LEN - ".pdf".len());
        return format!("{stem}.pdf");
    }

    let (stem, ext) = split_extension(name);
    let ext = if ext.is_empty() {
        String::new()
    } else {
        let cleaned = safe_filename(ext.trim_start_matches('.'), 16);
        format!(".{cleaned}")
    };
    let suffix = if format == ResourceFormat::Raw { "__raw" } else { "" };
    let budget = MAX_NAME_LEN.saturating_sub(ext.len() + suffix.len()).max(1);
    let stem = safe_filename(stem, budget);
    format!("{stem}{suffix}{ext}")
}

/// Hands out filenames inside one folder, appending `_2`, `_3`, ... to names
/// that were already taken. Comparison ignores case.
#[derive(Debug, Default)]
pub struct FilenameAllocator {
    taken: HashSet<String>,
}

impl FilenameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a name as used without handing it out.
    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_lowercase());
    }

    pub fn allocate(&mut self, name: &str) -> String {
        if self.taken.insert(name.to_lowercase()) {
            return name.to_string();
        }
        let (stem, ext) = split_extension(name);
        let mut k = 2u32;
        loop {
            let candidate = format!("{stem}_{k}{ext}");
            if self.taken.insert(candidate.to_lowercase()) {
                return candidate;
            }
            k += 1;
        }
    }
}

/// Assigns each content node a folder below the course root.
///
/// Folders are `[<section>/]<title>`. A folder that already belongs to a
/// different node is not shared: the newcomer gets its identifier appended.
/// Ownership is kept in a ledger file across runs, so a folder stays with the
/// node that claimed it first even when that node fails in a later run.
#[derive(Debug, Default)]
pub struct FolderAllocator {
    /// Lowercased relative folder → owning node id.
    owners: BTreeMap<String, String>,
    ledger: Option<PathBuf>,
    dirty: bool,
}

impl FolderAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator backed by the ledger at `path`. A missing ledger starts empty.
    pub fn load(path: &Path) -> ArchiveResult<Self> {
        let owners = match std::fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            owners,
            ledger: Some(path.to_path_buf()),
            dirty: false,
        })
    }

    pub fn allocate(&mut self, node: &ContentNode) -> PathBuf {
        let title = safe_filename(&node.title, MAX_NAME_LEN);
        let suffixed = format!("{}_{}", title, safe_filename(&node.id, MAX_NAME_LEN));
        let mut rel = PathBuf::new();
        if let Some(section) = &node.section {
            rel.push(safe_filename(section, MAX_NAME_LEN));
        }

        let key = |leaf: &str| ledger_key(&rel.join(leaf));
        let (plain_key, suffixed_key) = (key(&title), key(&suffixed));
        let owns = |k: &str| self.owners.get(k).map(String::as_str) == Some(node.id.as_str());

        let leaf = if owns(&plain_key) {
            title
        } else if owns(&suffixed_key) {
            suffixed
        } else if !self.owners.contains_key(&plain_key) {
            self.claim(plain_key, &node.id);
            title
        } else {
            self.claim(suffixed_key, &node.id);
            suffixed
        };
        rel.push(leaf);
        rel
    }

    fn claim(&mut self, key: String, id: &str) {
        self.owners.insert(key, id.to_string());
        self.dirty = true;
    }

    /// Write the ledger if an allocation changed it.
    pub fn save(&mut self) -> ArchiveResult<()> {
        let Some(path) = &self.ledger else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.owners)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| ArchiveError::Io(e.error))?;
        self.dirty = false;
        Ok(())
    }
}

fn ledger_key(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/").to_lowercase()
}
