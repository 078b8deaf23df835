//! End-to-end engine scenarios against a scripted in-memory driver.
//!
//! The fake driver dispatches evaluated scripts by recognizable fragments
//! of the engine's own script text, so these tests exercise the real
//! marking, execution, and observation paths without a browser.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use webhelm::{
    ActionProgram, BrowserEnv, Cookie, Driver, EnvConfig, Error, FrameInfo, FramePath, Oracle,
    Settle, StatefulAgent, TabInfo, Task, TaskStatus, WebpageObservation,
};

fn png(r: u8, g: u8, b: u8) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([r, g, b])));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Marker output for a page with a text input (0), a button (1), and a
/// link (2).
const FORM_MARKS: &str = r#"[
    {"id": 0, "tag": "input", "class": "field", "text": "", "xpath": "/html[1]/body[1]/input[1]"},
    {"id": 1, "tag": "button", "class": "", "text": "Submit", "xpath": "/html[1]/body[1]/button[1]"},
    {"id": 2, "tag": "a", "class": "nav", "text": "Help", "xpath": "/html[1]/body[1]/a[1]"}
]"#;

/// Sentinel interaction result that makes the fake surface a
/// context-destroyed substrate error instead of an outcome.
const CONTEXT_DESTROYED: &str = "CONTEXT_DESTROYED";

#[derive(Default)]
struct FakeState {
    url: String,
    screenshot: Vec<u8>,
    mark_json: String,
    /// Outcomes popped front-first by element interactions; empty means
    /// every interaction succeeds.
    interact_results: VecDeque<String>,
    interact_count: usize,
    chooser_pending: bool,
    tabs: Vec<TabInfo>,
    active_tab: String,
    closed_tabs: Vec<String>,
    reloads: usize,
    cookies: Vec<String>,
    init_scripts: Vec<String>,
}

#[derive(Clone)]
struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    fn new() -> Self {
        let state = FakeState {
            url: "https://site.test/form".into(),
            screenshot: png(240, 240, 255),
            mark_json: FORM_MARKS.into(),
            tabs: vec![TabInfo {
                id: "tab-1".into(),
                title: "Form".into(),
                url: "https://site.test/form".into(),
            }],
            active_tab: "tab-1".into(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn queue_results<I: IntoIterator<Item = &'static str>>(&self, results: I) {
        self.lock()
            .interact_results
            .extend(results.into_iter().map(String::from));
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn goto(&self, url: &str) -> webhelm::Result<()> {
        self.lock().url = url.to_string();
        Ok(())
    }

    async fn reload(&self) -> webhelm::Result<()> {
        self.lock().reloads += 1;
        Ok(())
    }

    async fn current_url(&self) -> webhelm::Result<String> {
        Ok(self.lock().url.clone())
    }

    async fn frames(&self) -> webhelm::Result<Vec<FrameInfo>> {
        let url = self.lock().url.clone();
        Ok(vec![FrameInfo {
            path: Vec::new(),
            name: String::new(),
            url,
        }])
    }

    async fn eval_in_frame(&self, _frame: &FramePath, js: &str) -> webhelm::Result<String> {
        let mut state = self.lock();
        if js.contains("isMarkableOverride") {
            return Ok(state.mark_json.clone());
        }
        if js.contains("XPathResult") {
            state.interact_count += 1;
            let raw = state
                .interact_results
                .pop_front()
                .unwrap_or_else(|| r#"{"ok": true}"#.into());
            if raw == CONTEXT_DESTROYED {
                return Err(Error::Browser(eoka::Error::CdpSimple(
                    "Execution context was destroyed, most likely because of a navigation".into(),
                )));
            }
            if raw.contains("\"chooser\": true") {
                state.chooser_pending = true;
            }
            return Ok(raw);
        }
        if js.contains("DataTransfer") {
            state.chooser_pending = false;
            return Ok(r#"{"ok": true}"#.into());
        }
        if js.contains("borderColor") || js.contains("scrollBy") {
            return Ok("true".into());
        }
        if js.contains(".__wh_mark") {
            return Ok("true".into());
        }
        if js.contains("__wh_chooser && win.__wh_chooser.pending") {
            return Ok(if state.chooser_pending { "true" } else { "false" }.into());
        }
        panic!("fake driver got an unrecognized script: {js}");
    }

    async fn screenshot(&self) -> webhelm::Result<Vec<u8>> {
        Ok(self.lock().screenshot.clone())
    }

    async fn wait_for_load(&self, _timeout_ms: u64) -> webhelm::Result<()> {
        Ok(())
    }

    async fn tabs(&self) -> webhelm::Result<Vec<TabInfo>> {
        Ok(self.lock().tabs.clone())
    }

    async fn active_tab(&self) -> webhelm::Result<String> {
        Ok(self.lock().active_tab.clone())
    }

    async fn activate_tab(&self, id: &str) -> webhelm::Result<()> {
        self.lock().active_tab = id.to_string();
        Ok(())
    }

    async fn close_tab(&self, id: &str) -> webhelm::Result<()> {
        let mut state = self.lock();
        state.closed_tabs.push(id.to_string());
        state.tabs.retain(|t| t.id != id);
        Ok(())
    }

    async fn set_cookie(&self, cookie: &Cookie) -> webhelm::Result<()> {
        self.lock().cookies.push(cookie.name.clone());
        Ok(())
    }

    async fn add_init_script(&self, js: &str) -> webhelm::Result<()> {
        self.lock().init_scripts.push(js.to_string());
        Ok(())
    }

    async fn close(self: Box<Self>) -> webhelm::Result<()> {
        Ok(())
    }
}

fn test_config() -> EnvConfig {
    EnvConfig {
        settle: Settle::None,
        chooser_wait_ms: 10,
        load_timeout_ms: 100,
        ..Default::default()
    }
}

async fn env_on_form(driver: &FakeDriver) -> (BrowserEnv, WebpageObservation) {
    let mut env = BrowserEnv::new(Box::new(driver.clone()), test_config());
    let obs = env
        .reset("https://site.test/form", &[], &[])
        .await
        .unwrap();
    (env, obs)
}

/// Oracle replaying a fixed list of program texts; the last one repeats.
struct Replay {
    programs: Vec<String>,
    next: usize,
}

impl Replay {
    fn new<I: IntoIterator<Item = &'static str>>(programs: I) -> Self {
        Self {
            programs: programs.into_iter().map(String::from).collect(),
            next: 0,
        }
    }
}

#[async_trait]
impl Oracle for Replay {
    async fn decide(
        &mut self,
        _task: &Task,
        _observation: &WebpageObservation,
    ) -> webhelm::Result<ActionProgram> {
        let idx = self.next.min(self.programs.len() - 1);
        self.next += 1;
        ActionProgram::parse(&self.programs[idx])
    }
}

#[tokio::test]
async fn reset_marks_elements_and_applies_setup() {
    let driver = FakeDriver::new();
    let mut env = BrowserEnv::new(Box::new(driver.clone()), test_config());
    let obs = env
        .reset(
            "https://site.test/form",
            &[Cookie::new("session", "abc123")],
            &["window.__ready = true".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(obs.url, "https://site.test/form");
    assert_eq!(obs.marked_elements.len(), 3);
    assert_eq!(obs.marked_elements[&1].tag, "button");
    assert!(obs.error_message.is_none());

    let state = driver.lock();
    assert_eq!(state.cookies, vec!["session"]);
    assert_eq!(state.init_scripts.len(), 1);
}

#[tokio::test]
async fn finish_ends_the_task_with_output() {
    let driver = FakeDriver::new();
    let env = BrowserEnv::new(Box::new(driver.clone()), test_config());
    let oracle = Replay::new([
        r#"["finish", true, {"confirmation": "A-17"}, "order placed"]"#,
    ]);
    let mut agent = StatefulAgent::start(env, oracle, "https://site.test/form", &[], &[])
        .await
        .unwrap();

    let outcome = agent.act(&Task::new("place the order")).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Success);
    assert_eq!(outcome.output["confirmation"], "A-17");
    assert_eq!(outcome.steps, 1);
    agent.close().await.unwrap();
}

#[tokio::test]
async fn step_budget_exhaustion_fails_the_task() {
    let driver = FakeDriver::new();
    let env = BrowserEnv::new(Box::new(driver.clone()), test_config());
    let oracle = Replay::new([r#"["click", 2, "Open the help page"]"#]);
    let mut agent = StatefulAgent::start(env, oracle, "https://site.test/form", &[], &[])
        .await
        .unwrap()
        .with_max_steps(3);

    let outcome = agent.act(&Task::new("an impossible task")).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.steps, 3);
}

#[tokio::test]
async fn program_runs_in_order_and_logs() {
    let driver = FakeDriver::new();
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(
        r#"
["input_text", 0, "Jane Doe", true, "Type the customer name"]
["click", 1, "Press the submit button"]
"#,
    )
    .unwrap();
    let obs = env.step(&program).await.unwrap();

    assert!(obs.error_message.is_none());
    assert_eq!(obs.env_state.timeframe, 1);
    assert_eq!(
        obs.env_state.log_history,
        vec!["Type the customer name", "Press the submit button"]
    );
    assert_eq!(driver.lock().interact_count, 2);
}

#[tokio::test]
async fn failed_line_attributes_its_literal_source() {
    let driver = FakeDriver::new();
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(
        "[\"click\", 99, \"Press the missing button\"]\n[\"click\", 1, \"never runs\"]",
    )
    .unwrap();
    let obs = env.step(&program).await.unwrap();

    let message = obs.error_message.unwrap();
    assert!(message.contains(r#"At line: "["click", 99, "Press the missing button"]""#));
    assert!(message.contains("is not marked in the webpage"));
    // The failing line stopped the program before the second click.
    assert_eq!(driver.lock().interact_count, 0);
    // The log message of the failed line is still recorded.
    assert_eq!(obs.env_state.log_history, vec!["Press the missing button"]);
}

#[tokio::test]
async fn unstable_click_retries_once_with_force() {
    let driver = FakeDriver::new();
    driver.queue_results([
        r#"{"ok": false, "kind": "unstable", "detail": "element is covered by <div>"}"#,
        r#"{"ok": true}"#,
    ]);
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(r#"["click", 1, "Press the submit button"]"#).unwrap();
    let obs = env.step(&program).await.unwrap();

    assert!(obs.error_message.is_none());
    assert_eq!(driver.lock().interact_count, 2);
    // The forced retry must not duplicate the log entry.
    assert_eq!(obs.env_state.log_history, vec!["Press the submit button"]);
}

#[tokio::test]
async fn persistently_unstable_click_reports_the_failure() {
    let driver = FakeDriver::new();
    driver.queue_results([
        r#"{"ok": false, "kind": "unstable", "detail": "element is hidden"}"#,
        r#"{"ok": false, "kind": "unstable", "detail": "element is hidden"}"#,
    ]);
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(r#"["click", 1, "Press the submit button"]"#).unwrap();
    let obs = env.step(&program).await.unwrap();

    let message = obs.error_message.unwrap();
    assert!(message.contains("not stable enough"));
    assert_eq!(driver.lock().interact_count, 2);
}

#[tokio::test]
async fn click_that_opens_a_chooser_is_an_error() {
    let driver = FakeDriver::new();
    driver.queue_results([r#"{"ok": true, "chooser": true}"#]);
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(r#"["click", 0, "Press the attach button"]"#).unwrap();
    let obs = env.step(&program).await.unwrap();

    let message = obs.error_message.unwrap();
    assert!(message.contains("upload_files() instead of click()"));
}

#[tokio::test]
async fn query_only_url_change_shows_in_the_observation() {
    let driver = FakeDriver::new();
    let (mut env, _) = env_on_form(&driver).await;

    // Same page, new query string: not a navigation, but the oracle must
    // still see where the browser actually is.
    driver.lock().url = "https://site.test/form?step=2".into();

    let program = ActionProgram::parse(r#"["click", 1, "Press the next button"]"#).unwrap();
    let obs = env.step(&program).await.unwrap();

    assert!(obs.error_message.is_none());
    assert_eq!(obs.url, "https://site.test/form?step=2");
}

#[tokio::test]
async fn upload_files_supplies_the_chooser() {
    let driver = FakeDriver::new();
    driver.queue_results([r#"{"ok": true, "chooser": true}"#]);
    let (mut env, _) = env_on_form(&driver).await;

    let path = std::env::temp_dir().join("webhelm_test_resume.txt");
    std::fs::write(&path, b"resume body").unwrap();

    let program = ActionProgram::parse(&format!(
        r#"["upload_files", 0, [{}], "Attach the resume"]"#,
        serde_json::to_string(path.to_str().unwrap()).unwrap()
    ))
    .unwrap();
    let obs = env.step(&program).await.unwrap();

    assert!(obs.error_message.is_none(), "{:?}", obs.error_message);
    // The chooser was answered, not left dangling.
    assert!(!driver.lock().chooser_pending);
    assert_eq!(obs.env_state.log_history, vec!["Attach the resume"]);
}

#[tokio::test]
async fn upload_without_a_chooser_times_out() {
    let driver = FakeDriver::new();
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(
        r#"["upload_files", 1, ["/tmp/never-read.txt"], "Attach the file"]"#,
    )
    .unwrap();
    let obs = env.step(&program).await.unwrap();

    let message = obs.error_message.unwrap();
    assert!(message.contains("file chooser did not open"), "{message}");
}

#[tokio::test]
async fn upload_surfaces_the_underlying_click_failure() {
    let driver = FakeDriver::new();
    driver.queue_results([
        r#"{"ok": false, "kind": "unstable", "detail": "element is hidden"}"#,
        r#"{"ok": false, "kind": "unstable", "detail": "element is hidden"}"#,
    ]);
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(
        r#"["upload_files", 1, ["/tmp/never-read.txt"], "Attach the file"]"#,
    )
    .unwrap();
    let obs = env.step(&program).await.unwrap();

    // No chooser ever opened, so the click failure is what comes back.
    let message = obs.error_message.unwrap();
    assert!(message.contains("not stable enough"), "{message}");
    assert_eq!(driver.lock().interact_count, 2);
}

#[tokio::test]
async fn context_destroyed_click_reloads_and_continues() {
    let driver = FakeDriver::new();
    driver.queue_results([CONTEXT_DESTROYED]);
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(r#"["click", 1, "Press the submit button"]"#).unwrap();
    let obs = env.step(&program).await.unwrap();

    assert!(obs.error_message.is_none());
    assert_eq!(driver.lock().reloads, 1);
}

#[tokio::test]
async fn blank_screenshot_fails_the_observation() {
    let driver = FakeDriver::new();
    driver.lock().screenshot = png(255, 255, 255);

    let mut env = BrowserEnv::new(Box::new(driver.clone()), test_config());
    let err = env
        .reset("https://site.test/form", &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BlankPage));
}

#[tokio::test]
async fn spawned_tab_is_adopted_and_the_old_one_closed() {
    let driver = FakeDriver::new();
    let (mut env, _) = env_on_form(&driver).await;

    driver.lock().tabs.push(TabInfo {
        id: "tab-2".into(),
        title: "Checkout".into(),
        url: "https://site.test/checkout".into(),
    });

    let program = ActionProgram::parse(r#"["click", 1, "Press the checkout button"]"#).unwrap();
    let obs = env.step(&program).await.unwrap();
    assert!(obs.error_message.is_none());

    let state = driver.lock();
    assert_eq!(state.closed_tabs, vec!["tab-1"]);
    assert_eq!(state.active_tab, "tab-2");
    assert_eq!(state.tabs.len(), 1);
}

#[tokio::test]
async fn element_ids_are_reassigned_each_step() {
    let driver = FakeDriver::new();
    let (mut env, first) = env_on_form(&driver).await;
    assert_eq!(first.marked_elements[&0].tag, "input");

    // The page re-rendered; the next pass marks different elements.
    driver.lock().mark_json = r#"[
        {"id": 0, "tag": "button", "class": "", "text": "Confirm", "xpath": "/html[1]/body[1]/button[1]"}
    ]"#
    .into();

    let program = ActionProgram::parse(r#"["click", 1, "Press the submit button"]"#).unwrap();
    let second = env.step(&program).await.unwrap();

    assert_eq!(second.marked_elements.len(), 1);
    assert_eq!(second.marked_elements[&0].tag, "button");
}

#[tokio::test]
async fn scroll_and_finish_in_one_program() {
    let driver = FakeDriver::new();
    let (mut env, _) = env_on_form(&driver).await;

    let program = ActionProgram::parse(
        r#"
["scroll", "down", "Scroll to the totals"]
["finish", false, {}, "the totals show the item is out of stock"]
"#,
    )
    .unwrap();
    let obs = env.step(&program).await.unwrap();

    assert!(obs.error_message.is_none());
    assert_eq!(obs.env_state.status(), TaskStatus::Failed);
    assert_eq!(obs.env_state.log_history, vec!["Scroll to the totals"]);
}
