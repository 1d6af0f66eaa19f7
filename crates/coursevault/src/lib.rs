//! CourseVault — archival engine for course platforms: authenticated sessions,
//! platform navigation, resource resolution, and idempotent downloads.

pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod naming;
pub mod navigator;
pub mod progress;
pub mod renderer;
pub mod resolver;
pub mod session;
pub mod types;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::{
    default_profile_root, ArchiveConfig, DownloadStrategy, LoginForm, LoginMode,
    NavigationPolicy, OverwritePolicy, PdfOptions,
};
pub use driver::CrawlDriver;
pub use error::{ArchiveError, ArchiveResult, AuthError, RetrievalError};
pub use progress::{ProgressEvent, ProgressEventKind, ProgressReceiver, ProgressSender, RunPhase};
pub use renderer::{ChromiumRenderer, RenderContext, Renderer};
pub use session::{LoginFlow, SessionStore};
pub use types::*;
