//! The browser environment: reset, step, observe, close.
//!
//! One `BrowserEnv` owns one driver session and one task's state. Each
//! `step` runs a whole program, settles the page, re-marks, and returns a
//! fresh observation; element ids from earlier observations are dead the
//! moment `step` returns.

use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::actions::{Actions, ClickOverrideFn};
use crate::driver::{Cookie, Driver, FramePath};
use crate::marker::Marker;
use crate::observe::{is_screenshot_blank, ObservationSource, WebpageObservation};
use crate::program::ActionProgram;
use crate::runner;
use crate::state::EnvState;
use crate::{Error, Result};

/// How long the engine pauses after a program before observing, letting
/// late mutations (debounced handlers, animation-gated reveals) land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Delay(u64),
    None,
}

impl Settle {
    async fn wait(self) {
        if let Settle::Delay(ms) = self {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Environment construction options.
pub struct EnvConfig {
    pub settle: Settle,
    pub load_timeout_ms: u64,
    /// Window a click watches for an unexpected file-picker dialog.
    pub chooser_wait_ms: u64,
    /// Site-specific readiness script; `(win, doc) => ...` returning a
    /// JSON boolean. When set it replaces the substrate's load wait.
    pub detect_load_override: Option<String>,
    /// Site-specific markability predicate spliced into the marker.
    pub markable_override: Option<String>,
    pub extra_observation_sources: Vec<Box<dyn ObservationSource>>,
    pub click_override: Option<Box<ClickOverrideFn>>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            settle: Settle::Delay(1500),
            load_timeout_ms: 10_000,
            chooser_wait_ms: 1200,
            detect_load_override: None,
            markable_override: None,
            extra_observation_sources: Vec::new(),
            click_override: None,
        }
    }
}

/// A driver session bound to one task's lifecycle.
pub struct BrowserEnv {
    driver: Box<dyn Driver>,
    config: EnvConfig,
    marker: Marker,
    env_state: EnvState,
    marked: crate::marker::MarkedElements,
    current_url: String,
    tab_id: String,
}

impl BrowserEnv {
    pub fn new(driver: Box<dyn Driver>, config: EnvConfig) -> Self {
        let marker = Marker::new(config.markable_override.as_deref());
        Self {
            driver,
            config,
            marker,
            env_state: EnvState::default(),
            marked: crate::marker::MarkedElements::new(),
            current_url: String::new(),
            tab_id: String::new(),
        }
    }

    /// Begin a task: install scripts and cookies, navigate, wait, observe.
    /// Discards any previous task's state.
    pub async fn reset(
        &mut self,
        url: &str,
        cookies: &[Cookie],
        init_scripts: &[String],
    ) -> Result<WebpageObservation> {
        for script in init_scripts {
            self.driver.add_init_script(script).await?;
        }
        for cookie in cookies {
            self.driver.set_cookie(cookie).await?;
        }
        self.driver.goto(url).await?;
        info!("Waiting for page to load...");
        self.wait_for_load().await;

        self.env_state = EnvState::default();
        self.current_url = self.driver.current_url().await?;
        self.tab_id = self.driver.active_tab().await?;
        self.observation(None).await
    }

    /// Execute one program and return the resulting observation. A failed
    /// line stops the program; its attributed message rides back on the
    /// observation rather than failing the step.
    pub async fn step(&mut self, program: &ActionProgram) -> Result<WebpageObservation> {
        let error_message = {
            let mut actions = Actions::new(self.driver.as_ref(), &self.marked, &mut self.env_state)
                .with_chooser_wait(self.config.chooser_wait_ms)
                .with_click_override(self.config.click_override.as_deref());
            runner::run(&mut actions, program).await
        };

        // Overlays are per-pass; they must not survive into the settle
        // window or the next screenshot.
        self.marker.remove_marks(self.driver.as_ref()).await;
        self.config.settle.wait().await;

        let url = self.driver.current_url().await?;
        if normalized(&url) != normalized(&self.current_url) {
            debug!("Navigation detected: {} -> {}", self.current_url, url);
            self.wait_for_load().await;
        }
        // A query-only change skips the load wait, never the refresh; the
        // observation always carries the live URL.
        self.current_url = self.driver.current_url().await?;

        self.env_state.timeframe += 1;
        let mut observation = self.observation(error_message).await?;

        if let Some(obs) = self.adopt_new_tab(&observation.error_message).await? {
            observation = obs;
        }
        Ok(observation)
    }

    /// When the page spawned a tab, the work has moved there: close the
    /// old tab, attach to the newest one, and observe it instead.
    async fn adopt_new_tab(
        &mut self,
        error_message: &Option<String>,
    ) -> Result<Option<WebpageObservation>> {
        let tabs = self.driver.tabs().await?;
        if tabs.len() <= 1 {
            return Ok(None);
        }
        let newest = match tabs.iter().rev().find(|t| t.id != self.tab_id) {
            Some(tab) => tab.clone(),
            None => return Ok(None),
        };
        info!("Adopting new tab: {}", newest.url);
        if let Err(e) = self.driver.close_tab(&self.tab_id).await {
            warn!("Failed to close the abandoned tab: {}", e);
        }
        self.driver.activate_tab(&newest.id).await?;
        self.tab_id = newest.id;
        self.wait_for_load().await;
        self.current_url = self.driver.current_url().await?;
        Ok(Some(self.observation(error_message.clone()).await?))
    }

    /// Load waits are best effort: a timeout is logged and the step
    /// proceeds with whatever the page has managed to render.
    async fn wait_for_load(&self) {
        let result = match &self.config.detect_load_override {
            Some(js) => self.wait_for_load_override(js).await,
            None => self.driver.wait_for_load(self.config.load_timeout_ms).await,
        };
        if let Err(e) = result {
            warn!("Exception while waiting for load state: {}", e);
        }
    }

    async fn wait_for_load_override(&self, js: &str) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.load_timeout_ms);
        loop {
            let raw = self.driver.eval_in_frame(&FramePath::root(), js).await?;
            if serde_json::from_str::<bool>(&raw).unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::LoadTimeout(format!(
                    "readiness script stayed false for {}ms",
                    self.config.load_timeout_ms
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Mark, screenshot, extract, assemble. Fails on a blank page so the
    /// caller never hands the oracle an observation with nothing in it.
    async fn observation(
        &mut self,
        error_message: Option<String>,
    ) -> Result<WebpageObservation> {
        self.marked = self.marker.mark(self.driver.as_ref()).await?;
        let screenshot = self.driver.screenshot().await?;
        if is_screenshot_blank(&screenshot)? {
            return Err(Error::BlankPage);
        }

        let mut additional_observations = std::collections::BTreeMap::new();
        for source in &self.config.extra_observation_sources {
            match source.extract(self.driver.as_ref()).await {
                Ok((name, content)) => {
                    additional_observations.insert(name, content);
                }
                Err(e) => warn!("Observation source failed: {}", e),
            }
        }

        Ok(WebpageObservation {
            url: self.current_url.clone(),
            error_message,
            screenshot,
            marked_elements: self.marked.clone(),
            additional_observations,
            env_state: self.env_state.clone(),
        })
    }

    pub fn env_state(&self) -> &EnvState {
        &self.env_state
    }

    /// Release the browser session.
    pub async fn close(self) -> Result<()> {
        self.driver.close().await
    }
}

/// Comparison form for navigation detection: the query string is dropped,
/// everything else kept. Sites rewrite query strings constantly without
/// the page going anywhere, but hash-route apps navigate through the
/// fragment, so it stays significant.
pub fn normalized(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}
