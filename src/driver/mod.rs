//! The browser substrate seam.
//!
//! Everything the engine needs from a live browser is behind [`Driver`]:
//! navigation, frame-scoped script evaluation, frame and tab enumeration,
//! screenshots, a best-effort load wait, cookies, and init scripts. The
//! production backend is [`cdp::CdpDriver`]; tests drive the engine with a
//! scripted stand-in.

pub mod cdp;

use async_trait::async_trait;
use serde::Deserialize;

use crate::Result;

/// Path of child-frame indices from the root document. Empty means the
/// root itself. Frame paths are only meaningful until the next navigation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FramePath(pub Vec<u32>);

impl FramePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

/// A live frame discovered during traversal, root first.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameInfo {
    pub path: Vec<u32>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// One open browser tab.
#[derive(Debug, Clone)]
pub struct TabInfo {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// A cookie to install before navigation.
#[derive(Debug, Clone, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// What the engine requires from a browser substrate.
///
/// Scripts passed to [`Driver::eval_in_frame`] are function literals of the
/// form `(win, doc) => ...` returning a `JSON.stringify`'d value; the
/// driver applies them to the addressed frame's window and document.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Navigate the active tab.
    async fn goto(&self, url: &str) -> Result<()>;

    /// Reload the current page.
    async fn reload(&self) -> Result<()>;

    /// URL of the active tab.
    async fn current_url(&self) -> Result<String>;

    /// Enumerate reachable frames, root first.
    async fn frames(&self) -> Result<Vec<FrameInfo>>;

    /// Evaluate a `(win, doc) => ...` function literal in the given frame,
    /// returning its JSON string result.
    async fn eval_in_frame(&self, frame: &FramePath, js: &str) -> Result<String>;

    /// Viewport screenshot of the active tab, PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Best-effort "page is ready" wait, bounded by `timeout_ms`.
    async fn wait_for_load(&self, timeout_ms: u64) -> Result<()>;

    /// All open tabs in the session.
    async fn tabs(&self) -> Result<Vec<TabInfo>>;

    /// Id of the tab the driver is currently attached to.
    async fn active_tab(&self) -> Result<String>;

    /// Attach to another tab.
    async fn activate_tab(&self, id: &str) -> Result<()>;

    /// Close a tab by id.
    async fn close_tab(&self, id: &str) -> Result<()>;

    /// Install a cookie.
    async fn set_cookie(&self, cookie: &Cookie) -> Result<()>;

    /// Register a script to run in every new document before page scripts.
    async fn add_init_script(&self, js: &str) -> Result<()>;

    /// Release the browser session.
    async fn close(self: Box<Self>) -> Result<()>;
}
