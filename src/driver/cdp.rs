//! Production driver over the eoka CDP substrate.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Cookie, Driver, FrameInfo, FramePath, TabInfo};
use crate::{Error, Result};

/// Launch options for [`CdpDriver`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Rewrite `window.open` / `target="_blank"` to same-tab navigation so
    /// the single page handle stays authoritative. Popup-heavy sites may
    /// need this off, at the cost of losing sight of foreign tabs.
    pub rewrite_window_open: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1600,
            viewport_height: 900,
            rewrite_window_open: true,
        }
    }
}

/// Keeps `window.open` from detaching work into tabs we cannot address.
const WINDOW_OPEN_REWRITE_JS: &str = r#"(() => {
    window.open = (url) => { if (url) { window.location.href = url; } return null; };
    document.addEventListener('click', (ev) => {
        const a = ev.target && ev.target.closest ? ev.target.closest('a[target]') : null;
        if (a) { a.removeAttribute('target'); }
    }, true);
})()"#;

/// Walks same-origin child frames from the root window. Frames whose
/// documents are inaccessible (cross-origin) are skipped.
const FRAMES_JS: &str = r#"(win, doc) => {
    const out = [];
    const walk = (w, path) => {
        let name = '', url = '';
        try { name = w.name || ''; url = w.location.href; } catch (e) { return; }
        out.push({ path: path, name: name, url: url });
        for (let i = 0; i < w.frames.length; i++) {
            try { void w.frames[i].document; } catch (e) { continue; }
            walk(w.frames[i], path.concat([i]));
        }
    };
    walk(win, []);
    return JSON.stringify(out);
}"#;

/// One eoka browser session and the page handle it stays attached to.
pub struct CdpDriver {
    browser: eoka::Browser,
    page: eoka::Page,
    rewrite_window_open: bool,
    init_scripts: Mutex<Vec<String>>,
}

impl CdpDriver {
    /// Launch a browser and attach to a blank page.
    pub async fn launch(config: DriverConfig) -> Result<Self> {
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            ..Default::default()
        };
        debug!("Launching browser (headless: {})", config.headless);
        let browser = eoka::Browser::launch_with_config(stealth).await?;
        let page = browser.new_page("about:blank").await?;
        Ok(Self {
            browser,
            page,
            rewrite_window_open: config.rewrite_window_open,
            init_scripts: Mutex::new(Vec::new()),
        })
    }

    /// Apply the registered init scripts to the current document.
    ///
    /// The substrate has no reliable before-page-scripts hook for documents
    /// it did not create, so scripts are re-applied right after each
    /// navigation; a script that must win a race against page code may
    /// still lose it.
    async fn apply_init_scripts(&self) -> Result<()> {
        if self.rewrite_window_open {
            self.page.execute(WINDOW_OPEN_REWRITE_JS).await?;
        }
        let scripts = {
            let guard = self
                .init_scripts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        };
        for script in &scripts {
            if let Err(e) = self.page.execute(script).await {
                warn!("Init script failed: {}", e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for CdpDriver {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.apply_init_scripts().await
    }

    async fn reload(&self) -> Result<()> {
        self.page.reload().await?;
        self.apply_init_scripts().await
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?)
    }

    async fn frames(&self) -> Result<Vec<FrameInfo>> {
        let raw = self.eval_in_frame(&FramePath::root(), FRAMES_JS).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn eval_in_frame(&self, frame: &FramePath, js: &str) -> Result<String> {
        let path = serde_json::to_string(&frame.0)?;
        let wrapped = format!(
            "(() => {{ let win = window; for (const i of {path}) {{ win = win.frames[i]; }} \
             const doc = win.document; return ({js})(win, doc); }})()"
        );
        let out: String = self.page.evaluate(&wrapped).await?;
        Ok(out)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(self.page.screenshot().await?)
    }

    async fn wait_for_load(&self, timeout_ms: u64) -> Result<()> {
        self.page
            .wait_for_network_idle(500, timeout_ms)
            .await
            .map_err(|e| Error::LoadTimeout(e.to_string()))
    }

    async fn tabs(&self) -> Result<Vec<TabInfo>> {
        let tabs = self.browser.tabs().await?;
        Ok(tabs
            .into_iter()
            .map(|t| TabInfo {
                id: t.id,
                title: t.title,
                url: t.url,
            })
            .collect())
    }

    async fn active_tab(&self) -> Result<String> {
        Ok(self.page.target_id().to_string())
    }

    async fn activate_tab(&self, id: &str) -> Result<()> {
        self.browser.activate_tab(id).await?;
        Ok(())
    }

    async fn close_tab(&self, id: &str) -> Result<()> {
        self.browser.close_tab(id).await?;
        Ok(())
    }

    async fn set_cookie(&self, cookie: &Cookie) -> Result<()> {
        self.page
            .set_cookie(
                &cookie.name,
                &cookie.value,
                cookie.domain.as_deref(),
                cookie.path.as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn add_init_script(&self, js: &str) -> Result<()> {
        let mut guard = self
            .init_scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(js.to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}
