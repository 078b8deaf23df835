//! Observation synthesis: everything the oracle sees about the page.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::driver::Driver;
use crate::marker::MarkedElements;
use crate::state::EnvState;
use crate::Result;

/// A pluggable extractor contributing one named text observation per step
/// (page text dumps, accessibility summaries, scraping hooks).
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Returns `(name, content)`. Failures downgrade to a warning; the
    /// observation is built without this source's entry.
    async fn extract(&self, driver: &dyn Driver) -> Result<(String, String)>;
}

/// One step's complete view of the page, handed to the oracle.
#[derive(Debug, Clone)]
pub struct WebpageObservation {
    pub url: String,
    /// Attributed failure from the previous program, if any.
    pub error_message: Option<String>,
    /// PNG of the viewport with overlays visible.
    pub screenshot: Vec<u8>,
    /// The marking pass this observation's element ids refer to.
    pub marked_elements: MarkedElements,
    pub additional_observations: BTreeMap<String, String>,
    /// Snapshot of the task state at observation time. A clone, so a
    /// later step cannot retroactively change what the oracle saw.
    pub env_state: EnvState,
}

impl WebpageObservation {
    /// Compact per-element listing for prompt assembly.
    pub fn marked_summary(&self) -> String {
        let mut out = String::new();
        for el in self.marked_elements.values() {
            let text: String = el.text.chars().take(20).collect();
            out.push_str(&format!(
                "({}) - <{}> (Text Content: {})\n",
                el.id, el.tag, text
            ));
        }
        out
    }
}

/// A screenshot is blank when every pixel is pure white (or the capture
/// produced no bytes at all). Blank pages mean the renderer gave us
/// nothing worth showing an oracle.
pub fn is_screenshot_blank(png: &[u8]) -> Result<bool> {
    if png.is_empty() {
        return Ok(true);
    }
    let img = image::load_from_memory(png)?.to_rgb8();
    Ok(img.pixels().all(|p| p.0 == [255, 255, 255]))
}
