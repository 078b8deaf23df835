//! Action Executor: the primitive surface oracle programs run against.
//!
//! Every element-directed primitive follows the same protocol: resolve the
//! id against the current marking pass, recolor the element's overlay to
//! the in-progress color, perform the low-level interaction, recolor to
//! the done color on success. Log messages are appended before the attempt
//! so partial failures are still explainable from the history.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::driver::{Driver, FramePath};
use crate::marker::{ElementInfo, MarkedElements};
use crate::program::{Call, ScrollDirection};
use crate::state::EnvState;
use crate::{Error, Result};

/// How a click reaches the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickBehavior {
    /// Dispatch a pointer-event sequence at the element's center.
    Simulated,
    /// Invoke the element's native activation (`el.click()`). Some widget
    /// libraries ignore simulated pointer events; deployments can route
    /// known element shapes here.
    Native,
}

/// Per-deployment substitution of the low-level click for specific element
/// shapes. Return `None` to keep the default behavior.
pub type ClickOverrideFn = dyn Fn(&ElementInfo) -> Option<ClickBehavior> + Send + Sync;

/// Structured outcome reported by the interaction script.
#[derive(Debug, Deserialize)]
struct InteractOutcome {
    ok: bool,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    chooser: bool,
}

/// The closed set of low-level interactions rendered into page script.
#[derive(Debug, Clone)]
enum Interaction {
    Click { force: bool, behavior: ClickBehavior },
    Fill { text: String },
    Type { text: String, clear: bool },
    SelectOption { option: String },
}

/// Executes primitives for one step, against one marking pass.
pub struct Actions<'a> {
    driver: &'a dyn Driver,
    marked: &'a MarkedElements,
    state: &'a mut EnvState,
    chooser_wait_ms: u64,
    click_override: Option<&'a ClickOverrideFn>,
}

impl<'a> Actions<'a> {
    pub fn new(
        driver: &'a dyn Driver,
        marked: &'a MarkedElements,
        state: &'a mut EnvState,
    ) -> Self {
        Self {
            driver,
            marked,
            state,
            chooser_wait_ms: 1200,
            click_override: None,
        }
    }

    /// How long a click watches for an unexpected file-picker dialog.
    pub fn with_chooser_wait(mut self, ms: u64) -> Self {
        self.chooser_wait_ms = ms;
        self
    }

    pub fn with_click_override(mut self, hook: Option<&'a ClickOverrideFn>) -> Self {
        self.click_override = hook;
        self
    }

    /// Dispatch one parsed program call.
    pub async fn apply(&mut self, call: &Call) -> Result<()> {
        match call {
            Call::Click {
                id,
                log_message,
                force,
            } => self.click(*id, log_message, *force).await,
            Call::InputText {
                id,
                text,
                clear_before_input,
                log_message,
            } => {
                self.input_text(*id, text, *clear_before_input, log_message)
                    .await
            }
            Call::UploadFiles {
                id,
                files,
                log_message,
            } => self.upload_files(*id, files, log_message).await,
            Call::Scroll {
                direction,
                log_message,
            } => self.scroll(*direction, log_message).await,
            Call::ComboboxSelect {
                id,
                option,
                log_message,
            } => self.combobox_select(*id, option, log_message).await,
            Call::Finish {
                did_succeed,
                output,
                reason,
            } => {
                self.finish(*did_succeed, output.clone(), reason);
                Ok(())
            }
        }
    }

    /// Click an element, watching for an unexpected file-picker dialog.
    ///
    /// An unstable element is retried once with `force` (and an empty log
    /// message, so the history does not record the action twice). A click
    /// that races a navigation is benign: the page is reloaded and the
    /// call returns as a no-op. A file picker opening is always an error
    /// for this call; `upload_files` is the right primitive for that.
    pub async fn click(&mut self, id: u32, log_message: &str, force: bool) -> Result<()> {
        self.log(log_message);
        let el = self.resolve(id)?.clone();
        debug!("click [{}] <{}> force={}", id, el.tag, force);

        let behavior = if force {
            ClickBehavior::Native
        } else {
            self.click_override
                .and_then(|hook| hook(&el))
                .unwrap_or(ClickBehavior::Simulated)
        };

        let interaction = Interaction::Click { force, behavior };
        match self.visualized_interact(&el, &interaction).await {
            Ok(outcome) if outcome.ok => {
                if outcome.chooser || self.watch_chooser(&el.frame, self.chooser_wait_ms).await {
                    return Err(Error::UnexpectedFileChooser);
                }
                Ok(())
            }
            Ok(outcome) => {
                let err = outcome_error(&el, &outcome);
                if matches!(err, Error::UnstableElement { .. }) && !force {
                    debug!("click [{}] unstable, retrying with force", id);
                    let retry = Interaction::Click {
                        force: true,
                        behavior: ClickBehavior::Native,
                    };
                    return match self.visualized_interact(&el, &retry).await {
                        Ok(second) if second.ok => {
                            if second.chooser
                                || self.watch_chooser(&el.frame, self.chooser_wait_ms).await
                            {
                                Err(Error::UnexpectedFileChooser)
                            } else {
                                Ok(())
                            }
                        }
                        Ok(second) => Err(outcome_error(&el, &second)),
                        Err(e) if e.is_context_destroyed() => {
                            warn!("click [{}] raced a navigation; reloading", id);
                            self.driver.reload().await?;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                }
                Err(err)
            }
            Err(e) if e.is_context_destroyed() => {
                // The page likely navigated mid-click. Reload and move on.
                warn!("click [{}] raced a navigation; reloading", id);
                self.driver.reload().await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fill or type text. A replacement fill only works on native text
    /// inputs; editable containers swallow bulk value writes silently, so
    /// everything else is driven through incremental typing.
    pub async fn input_text(
        &mut self,
        id: u32,
        text: &str,
        clear_before_input: bool,
        log_message: &str,
    ) -> Result<()> {
        self.log(log_message);
        let el = self.resolve(id)?.clone();
        debug!("input_text [{}] <{}> clear={}", id, el.tag, clear_before_input);

        let native_text_input = matches!(el.tag.as_str(), "input" | "textarea");
        let interaction = if clear_before_input && native_text_input {
            Interaction::Fill { text: text.into() }
        } else {
            Interaction::Type {
                text: text.into(),
                clear: clear_before_input,
            }
        };
        let outcome = self.visualized_interact(&el, &interaction).await?;
        if outcome.ok {
            Ok(())
        } else {
            Err(outcome_error(&el, &outcome))
        }
    }

    /// Click the element, wait for the resulting file-picker dialog, and
    /// supply it the given file paths. If the dialog never opens within
    /// the wait window, the triggering click failure is surfaced if there
    /// was one, otherwise a timeout.
    pub async fn upload_files(
        &mut self,
        id: u32,
        files: &[String],
        log_message: &str,
    ) -> Result<()> {
        self.log(log_message);
        let el = self.resolve(id)?.clone();
        debug!("upload_files [{}] {} file(s)", id, files.len());

        let mut click_error: Option<Error> = None;
        let first = Interaction::Click {
            force: false,
            behavior: ClickBehavior::Simulated,
        };
        match self.visualized_interact(&el, &first).await {
            Ok(outcome) if outcome.ok => {}
            Ok(outcome) => {
                let err = outcome_error(&el, &outcome);
                if matches!(err, Error::UnstableElement { .. }) {
                    let forced = Interaction::Click {
                        force: true,
                        behavior: ClickBehavior::Native,
                    };
                    match self.visualized_interact(&el, &forced).await {
                        Ok(second) if second.ok => {}
                        Ok(second) => click_error = Some(outcome_error(&el, &second)),
                        Err(e) => return Err(e),
                    }
                } else {
                    click_error = Some(err);
                }
            }
            Err(e) => return Err(e),
        }

        // The original gives uploads a longer dialog window than clicks.
        let window = self.chooser_wait_ms.saturating_mul(2);
        if !self.watch_chooser(&el.frame, window).await {
            return Err(click_error.unwrap_or_else(|| {
                Error::ScriptExecution(format!(
                    "file chooser did not open within {window}ms"
                ))
            }));
        }
        self.set_chooser_files(&el.frame, files).await
    }

    /// Scroll the viewport by exactly one viewport height.
    pub async fn scroll(&mut self, direction: ScrollDirection, log_message: &str) -> Result<()> {
        self.log(log_message);
        debug!("scroll {}", direction);
        let js = match direction {
            ScrollDirection::Down => {
                "(win, doc) => { win.scrollBy(0, win.innerHeight); return JSON.stringify(true); }"
            }
            ScrollDirection::Up => {
                "(win, doc) => { win.scrollBy(0, -win.innerHeight); return JSON.stringify(true); }"
            }
        };
        self.driver.eval_in_frame(&FramePath::root(), js).await?;
        Ok(())
    }

    /// Select an option from a native selector. Styled lookalikes fool
    /// oracles into calling this on plain divs; when structured selection
    /// fails, fall back to a forced click, which may simply open a custom
    /// dropdown for a subsequent step.
    pub async fn combobox_select(
        &mut self,
        id: u32,
        option: &str,
        log_message: &str,
    ) -> Result<()> {
        self.log(log_message);
        let el = self.resolve(id)?.clone();
        debug!("combobox_select [{}] '{}'", id, option);

        let select = Interaction::SelectOption {
            option: option.into(),
        };
        match self.visualized_interact(&el, &select).await {
            Ok(outcome) if outcome.ok => return Ok(()),
            Ok(_) | Err(_) => {}
        }

        let fallback = Interaction::Click {
            force: true,
            behavior: ClickBehavior::Native,
        };
        let outcome = self.visualized_interact(&el, &fallback).await?;
        if outcome.ok {
            Ok(())
        } else {
            Err(outcome_error(&el, &outcome))
        }
    }

    /// Record the terminal outcome. Never touches the DOM.
    pub fn finish(&mut self, did_succeed: bool, output: Map<String, Value>, reason: &str) {
        debug!("finish did_succeed={} reason={}", did_succeed, reason);
        self.state.finish(did_succeed, output);
    }

    fn log(&mut self, message: &str) {
        if !message.is_empty() {
            self.state.log_history.push(message.to_string());
        }
    }

    fn resolve(&self, id: u32) -> Result<&ElementInfo> {
        self.marked.get(&id).ok_or(Error::ElementNotMarked(id))
    }

    async fn visualized_interact(
        &self,
        el: &ElementInfo,
        interaction: &Interaction,
    ) -> Result<InteractOutcome> {
        self.recolor(el, "red").await;
        let js = interaction.render(el);
        let raw = self.driver.eval_in_frame(&el.frame, &js).await?;
        let outcome: InteractOutcome = serde_json::from_str(&raw)?;
        if outcome.ok {
            self.recolor(el, "green").await;
        }
        Ok(outcome)
    }

    async fn recolor(&self, el: &ElementInfo, color: &str) {
        let js = format!(
            "(win, doc) => {{ \
             const b = doc.getElementById('__wh_border_{id}'); \
             if (b) b.style.borderColor = '{color}'; \
             const l = doc.getElementById('__wh_label_{id}'); \
             if (l) l.style.background = '{color}'; \
             return JSON.stringify(true); }}",
            id = el.id,
            color = color
        );
        // Feedback only; a missing overlay must not fail the interaction.
        if let Err(e) = self.driver.eval_in_frame(&el.frame, &js).await {
            debug!("Overlay recolor failed for [{}]: {}", el.id, e);
        }
    }

    /// Poll the chooser guard for up to `window_ms`. Evaluation failures
    /// count as "no dialog": if the click navigated away there is nothing
    /// left to open one.
    async fn watch_chooser(&self, frame: &FramePath, window_ms: u64) -> bool {
        const POLL_JS: &str =
            "(win, doc) => JSON.stringify(!!(win.__wh_chooser && win.__wh_chooser.pending))";
        let deadline = tokio::time::Instant::now() + Duration::from_millis(window_ms);
        loop {
            match self.driver.eval_in_frame(frame, POLL_JS).await {
                Ok(raw) => {
                    if serde_json::from_str::<bool>(&raw).unwrap_or(false) {
                        return true;
                    }
                }
                Err(e) => {
                    debug!("Chooser poll failed: {}", e);
                    return false;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    }

    /// Reconstruct the chosen files inside the page and hand them to the
    /// input recorded by the chooser guard.
    async fn set_chooser_files(&self, frame: &FramePath, files: &[String]) -> Result<()> {
        let mut payload = Vec::new();
        for file in files {
            let bytes = std::fs::read(file)?;
            let name = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            payload.push(serde_json::json!({
                "name": name,
                "data": BASE64.encode(&bytes),
            }));
        }
        let js = format!(
            r#"(win, doc) => {{
    const files = {payload};
    const target = win.__wh_chooser && win.__wh_chooser.target;
    if (!target) return JSON.stringify({{ ok: false, kind: 'missing', detail: 'no chooser target' }});
    const dt = new win.DataTransfer();
    for (const f of files) {{
        const bin = win.atob(f.data);
        const bytes = new win.Uint8Array(bin.length);
        for (let i = 0; i < bin.length; i++) bytes[i] = bin.charCodeAt(i);
        dt.items.add(new win.File([bytes], f.name));
    }}
    target.files = dt.files;
    win.__wh_chooser.pending = false;
    target.dispatchEvent(new win.Event('change', {{ bubbles: true }}));
    return JSON.stringify({{ ok: true }});
}}"#,
            payload = serde_json::to_string(&payload)?
        );
        let raw = self.driver.eval_in_frame(frame, &js).await?;
        let outcome: InteractOutcome = serde_json::from_str(&raw)?;
        if outcome.ok {
            Ok(())
        } else {
            Err(Error::ScriptExecution(format!(
                "failed to supply files to the chooser: {}",
                outcome.detail
            )))
        }
    }
}

fn outcome_error(el: &ElementInfo, outcome: &InteractOutcome) -> Error {
    match outcome.kind.as_str() {
        "missing" => Error::UnstableElement {
            id: el.id,
            detail: "element is no longer present at its locator".into(),
        },
        "unstable" => Error::UnstableElement {
            id: el.id,
            detail: outcome.detail.clone(),
        },
        other => Error::ScriptExecution(format!(
            "interaction with element {} failed ({}): {}",
            el.id,
            if other.is_empty() { "unknown" } else { other },
            outcome.detail
        )),
    }
}

impl Interaction {
    /// Render this interaction as a `(win, doc)` function literal. The
    /// script resolves the locator, runs an actionability check unless
    /// forced, installs the file-chooser guard, performs the operation,
    /// and reports a structured `{ok, kind, detail, chooser}` outcome.
    fn render(&self, el: &ElementInfo) -> String {
        let xpath = serde_json::to_string(&el.xpath).unwrap_or_else(|_| "\"\"".into());
        let (force, op) = match self {
            Interaction::Click { force, behavior } => (*force, click_op(*behavior)),
            Interaction::Fill { text } => (false, fill_op(text)),
            Interaction::Type { text, clear } => (false, type_op(text, *clear)),
            Interaction::SelectOption { option } => (false, select_op(option)),
        };
        format!(
            r#"(win, doc) => {{
    const el = doc.evaluate({xpath}, doc, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
    if (!el) return JSON.stringify({{ ok: false, kind: 'missing' }});
    const force = {force};
    if (!force) {{
        const rect = el.getBoundingClientRect();
        const style = win.getComputedStyle(el);
        if (rect.width === 0 || rect.height === 0)
            return JSON.stringify({{ ok: false, kind: 'unstable', detail: 'element has zero size' }});
        if (style.display === 'none' || style.visibility === 'hidden')
            return JSON.stringify({{ ok: false, kind: 'unstable', detail: 'element is hidden' }});
        if (el.disabled)
            return JSON.stringify({{ ok: false, kind: 'unstable', detail: 'element is disabled' }});
        const hit = doc.elementFromPoint(
            rect.x + rect.width / 2, rect.y + rect.height / 2);
        if (hit && hit !== el && !el.contains(hit) && !hit.contains(el))
            return JSON.stringify({{ ok: false, kind: 'unstable',
                detail: 'element is covered by <' + hit.tagName.toLowerCase() + '>' }});
    }}
    if (!win.__wh_chooser) {{
        win.__wh_chooser = {{ pending: false, target: null }};
        const origClick = win.HTMLInputElement.prototype.click;
        win.HTMLInputElement.prototype.click = function () {{
            if (this.type === 'file') {{
                win.__wh_chooser.pending = true;
                win.__wh_chooser.target = this;
                return;
            }}
            return origClick.call(this);
        }};
        if (win.HTMLInputElement.prototype.showPicker) {{
            win.HTMLInputElement.prototype.showPicker = function () {{
                win.__wh_chooser.pending = true;
                win.__wh_chooser.target = this;
            }};
        }}
    }}
    win.__wh_chooser.pending = false;
    {op}
    return JSON.stringify({{ ok: true, chooser: !!win.__wh_chooser.pending }});
}}"#
        )
    }
}

fn click_op(behavior: ClickBehavior) -> String {
    let body = match behavior {
        // Direct clicks on a file input must never reach the native
        // dialog; record the request the way the guard would.
        ClickBehavior::Simulated => {
            r#"if (el.tagName === 'INPUT' && el.type === 'file') {
        win.__wh_chooser.pending = true;
        win.__wh_chooser.target = el;
    } else {
        const r = el.getBoundingClientRect();
        const x = r.x + r.width / 2, y = r.y + r.height / 2;
        for (const type of ['pointerdown', 'mousedown', 'pointerup', 'mouseup', 'click']) {
            const Ctor = type.startsWith('pointer') ? win.PointerEvent : win.MouseEvent;
            el.dispatchEvent(new Ctor(type, {
                bubbles: true, cancelable: true, view: win,
                clientX: x, clientY: y, button: 0
            }));
        }
    }"#
        }
        ClickBehavior::Native => {
            r#"if (el.tagName === 'INPUT' && el.type === 'file') {
        win.__wh_chooser.pending = true;
        win.__wh_chooser.target = el;
    } else {
        el.click();
    }"#
        }
    };
    body.to_string()
}

fn fill_op(text: &str) -> String {
    let text = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".into());
    format!(
        r#"const tag = el.tagName;
    if (tag !== 'INPUT' && tag !== 'TEXTAREA')
        return JSON.stringify({{ ok: false, kind: 'unstable', detail: 'not a native text input' }});
    const proto = tag === 'TEXTAREA'
        ? win.HTMLTextAreaElement.prototype : win.HTMLInputElement.prototype;
    const desc = win.Object.getOwnPropertyDescriptor(proto, 'value');
    el.focus();
    if (desc && desc.set) {{ desc.set.call(el, {text}); }} else {{ el.value = {text}; }}
    el.dispatchEvent(new win.Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new win.Event('change', {{ bubbles: true }}));"#
    )
}

fn type_op(text: &str, clear: bool) -> String {
    let text = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".into());
    let clear_editable = if clear {
        "doc.execCommand('selectAll', false, null); doc.execCommand('delete', false, null);"
    } else {
        ""
    };
    let base = if clear { "''" } else { "(el.value || '')" };
    format!(
        r#"el.focus();
    if (el.isContentEditable) {{
        {clear_editable}
        doc.execCommand('insertText', false, {text});
    }} else {{
        const tag = el.tagName;
        if (tag !== 'INPUT' && tag !== 'TEXTAREA')
            return JSON.stringify({{ ok: false, kind: 'unstable', detail: 'element is not editable' }});
        const proto = tag === 'TEXTAREA'
            ? win.HTMLTextAreaElement.prototype : win.HTMLInputElement.prototype;
        const desc = win.Object.getOwnPropertyDescriptor(proto, 'value');
        const next = {base} + {text};
        if (desc && desc.set) {{ desc.set.call(el, next); }} else {{ el.value = next; }}
        el.dispatchEvent(new win.Event('input', {{ bubbles: true }}));
        el.dispatchEvent(new win.Event('change', {{ bubbles: true }}));
    }}"#
    )
}

fn select_op(option: &str) -> String {
    let option = serde_json::to_string(option).unwrap_or_else(|_| "\"\"".into());
    format!(
        r#"if (el.tagName !== 'SELECT' || !el.options)
        return JSON.stringify({{ ok: false, kind: 'not_a_select', detail: 'element is not a native selector' }});
    const opt = Array.from(el.options).find(o => o.value === {option} || o.text === {option});
    if (!opt)
        return JSON.stringify({{ ok: false, kind: 'missing_option', detail: 'no option matching ' + {option} }});
    el.value = opt.value;
    el.dispatchEvent(new win.Event('change', {{ bubbles: true }}));"#
    )
}
