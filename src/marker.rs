//! DOM Marker: transient visual and data annotation of interactive
//! elements, one marking pass per step.
//!
//! Every reachable frame is scanned with a single id counter spanning all
//! of them, so ids are unique within the pass. Each qualifying element
//! gets a border box and a numbered label near its top-left corner; the
//! overlay node ids embed the element id so the executor can recolor them
//! during an interaction. Ids are meaningless the moment the next pass
//! begins.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use crate::driver::{Driver, FramePath};
use crate::Result;

/// One marked element. Valid only for the marking pass that produced it.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    /// Unique within one marking pass; shown in the overlay label.
    pub id: u32,
    pub tag: String,
    pub class_attr: String,
    /// Visible text, whitespace-collapsed and truncated.
    pub text: String,
    /// Structural locator within the owning frame's document.
    pub xpath: String,
    /// Owning frame; a cheap address, not an owner.
    pub frame: FramePath,
}

/// Ordered id → element map produced by one marking pass.
pub type MarkedElements = BTreeMap<u32, ElementInfo>;

#[derive(Deserialize)]
struct RawMarked {
    id: u32,
    tag: String,
    class: String,
    text: String,
    xpath: String,
}

/// Stub replaced verbatim when a deployment overrides markability.
/// The override returns `true`/`false` to decide, or `null` to defer to
/// the default predicate.
pub const MARKABLE_OVERRIDE_STUB: &str =
    "function isMarkableOverride(element) { return null; }";

const COUNTER_STUB: &str = "let counter = 0;";

const MARK_JS: &str = r#"(win, doc) => {
    let counter = 0;
    function isMarkableOverride(element) { return null; }

    const INTERACTIVE = 'a, button, input, select, textarea, summary, ' +
        '[role="button"], [role="link"], [role="tab"], [role="menuitem"], ' +
        '[role="combobox"], [role="textbox"], [onclick], [contenteditable="true"]';

    function isMarkable(el) {
        const override = isMarkableOverride(el);
        if (override !== null) return override;
        if (!el.matches(INTERACTIVE)) return false;
        const rect = el.getBoundingClientRect();
        if (rect.width < 2 || rect.height < 2) return false;
        const style = win.getComputedStyle(el);
        if (style.display === 'none' || style.visibility === 'hidden') return false;
        if (parseFloat(style.opacity) < 0.1) return false;
        if (rect.bottom < 0 || rect.top > win.innerHeight) return false;
        if (rect.right < 0 || rect.left > win.innerWidth) return false;
        return true;
    }

    function xpathOf(el) {
        const parts = [];
        let node = el;
        while (node && node.nodeType === 1) {
            let idx = 1;
            let sib = node.previousElementSibling;
            while (sib) {
                if (sib.tagName === node.tagName) idx++;
                sib = sib.previousElementSibling;
            }
            parts.unshift(node.tagName.toLowerCase() + '[' + idx + ']');
            node = node.parentElement;
        }
        return '/' + parts.join('/');
    }

    const results = [];
    for (const el of doc.querySelectorAll('*')) {
        if (!isMarkable(el)) continue;
        const id = counter++;
        const rect = el.getBoundingClientRect();

        const border = doc.createElement('div');
        border.id = '__wh_border_' + id;
        border.className = '__wh_mark';
        border.style.cssText =
            'position:fixed;z-index:2147483646;pointer-events:none;' +
            'border:2px solid green;border-radius:2px;' +
            'left:' + rect.x + 'px;top:' + rect.y + 'px;' +
            'width:' + rect.width + 'px;height:' + rect.height + 'px';
        doc.body.appendChild(border);

        const label = doc.createElement('div');
        label.id = '__wh_label_' + id;
        label.className = '__wh_mark';
        label.textContent = String(id);
        label.style.cssText =
            'position:fixed;z-index:2147483647;pointer-events:none;' +
            'background:green;color:white;font:bold 11px/13px monospace;' +
            'padding:1px 3px;border-radius:2px;' +
            'left:' + Math.max(0, rect.x - 2) + 'px;' +
            'top:' + Math.max(0, rect.y - 14) + 'px';
        doc.body.appendChild(label);

        let text = (el.textContent || '').trim().replace(/\s+/g, ' ');
        if (text.length > 120) text = text.substring(0, 117) + '...';
        results.push({
            id: id,
            tag: el.tagName.toLowerCase(),
            class: el.getAttribute('class') || '',
            text: text,
            xpath: xpathOf(el)
        });
    }
    return JSON.stringify(results);
}"#;

const REMOVE_MARKS_JS: &str = r#"(win, doc) => {
    for (const el of Array.from(doc.querySelectorAll('.__wh_mark'))) el.remove();
    return JSON.stringify(true);
}"#;

/// Runs marking passes and removes their overlays again.
pub struct Marker {
    script: String,
}

impl Marker {
    pub fn new(markable_override: Option<&str>) -> Self {
        let mut script = MARK_JS.to_string();
        if let Some(js) = markable_override {
            script = script.replace(MARKABLE_OVERRIDE_STUB, js);
        }
        Self { script }
    }

    /// Mark every reachable frame. A frame where the script fails is
    /// skipped; its elements are simply absent from this observation.
    pub async fn mark(&self, driver: &dyn Driver) -> Result<MarkedElements> {
        let mut counter: u32 = 0;
        let mut marked = MarkedElements::new();

        for frame in driver.frames().await? {
            let path = FramePath(frame.path);
            let script = self
                .script
                .replacen(COUNTER_STUB, &format!("let counter = {counter};"), 1);
            let raw = match driver.eval_in_frame(&path, &script).await {
                Ok(json) => json,
                Err(e) => {
                    warn!("Marking script failed in frame {}: {}", frame.url, e);
                    continue;
                }
            };
            let elements: Vec<RawMarked> = serde_json::from_str(&raw)?;
            counter += elements.len() as u32;
            for el in elements {
                marked.insert(
                    el.id,
                    ElementInfo {
                        id: el.id,
                        tag: el.tag,
                        class_attr: el.class,
                        text: el.text,
                        xpath: el.xpath,
                        frame: path.clone(),
                    },
                );
            }
        }
        Ok(marked)
    }

    /// Remove every overlay in every frame. Overlays must never survive
    /// into a navigation or a screenshot outside their own pass, so this
    /// tolerates any per-frame failure rather than propagating it.
    pub async fn remove_marks(&self, driver: &dyn Driver) {
        let frames = match driver.frames().await {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Frame enumeration failed during mark removal: {}", e);
                return;
            }
        };
        for frame in frames {
            let path = FramePath(frame.path);
            if let Err(e) = driver.eval_in_frame(&path, REMOVE_MARKS_JS).await {
                warn!("Mark removal failed in frame {}: {}", frame.url, e);
            }
        }
    }
}
