//! # webhelm
//!
//! Browser interaction & observation engine for oracle-driven web agents.
//!
//! The engine marks every interactive element across all frames of the
//! current page, executes primitive actions (click, type, select, scroll,
//! upload, finish) against them with workaround/retry logic for flaky UI
//! behavior, detects navigation and tab changes, and hands a
//! screenshot-plus-metadata observation to an external decision-maker,
//! repeating until the task finishes or the step budget runs out.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use webhelm::{
//!     BrowserEnv, CdpDriver, DriverConfig, EnvConfig, StatefulAgent, Task,
//! };
//! # use webhelm::{ActionProgram, Oracle, WebpageObservation};
//! # struct MyOracle;
//! # #[async_trait::async_trait]
//! # impl Oracle for MyOracle {
//! #     async fn decide(
//! #         &mut self,
//! #         _task: &Task,
//! #         _obs: &WebpageObservation,
//! #     ) -> webhelm::Result<ActionProgram> {
//! #         ActionProgram::parse(r#"["finish", true, {}, "done"]"#)
//! #     }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() -> webhelm::Result<()> {
//! let driver = CdpDriver::launch(DriverConfig::default()).await?;
//! let env = BrowserEnv::new(Box::new(driver), EnvConfig::default());
//! let mut agent =
//!     StatefulAgent::start(env, MyOracle, "https://example.com", &[], &[]).await?;
//! let outcome = agent.act(&Task::new("Find the pricing page")).await?;
//! println!("{:?}: {:?}", outcome.status, outcome.output);
//! agent.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod agent;
pub mod driver;
pub mod engine;
pub mod marker;
pub mod observe;
pub mod program;
pub mod runner;
pub mod state;

pub use actions::{Actions, ClickBehavior, ClickOverrideFn};
pub use agent::{Oracle, StatefulAgent, TaskOutcome, DEFAULT_MAX_STEPS};
pub use driver::cdp::{CdpDriver, DriverConfig};
pub use driver::{Cookie, Driver, FrameInfo, FramePath, TabInfo};
pub use engine::{normalized, BrowserEnv, EnvConfig, Settle};
pub use marker::{ElementInfo, MarkedElements};
pub use observe::{ObservationSource, WebpageObservation};
pub use program::{ActionProgram, Call, ScrollDirection};
pub use state::{EnvState, Task, TaskStatus};

/// Result type for webhelm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the browser.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("element with id {0} is not marked in the webpage")]
    ElementNotMarked(u32),

    #[error("element {id} is not stable enough to interact with: {detail}")]
    UnstableElement { id: u32, detail: String },

    #[error("execution context was destroyed (the page navigated mid-action)")]
    ContextDestroyed,

    #[error(
        "filechooser event was triggered unexpectedly. Consider using \
         upload_files() instead of click() for this element."
    )]
    UnexpectedFileChooser,

    #[error("screenshot is blank! Likely the webpage did not fully load.")]
    BlankPage,

    #[error("script execution failed: {0}")]
    ScriptExecution(String),

    #[error("load detection exceeded its window: {0}")]
    LoadTimeout(String),

    #[error("invalid action program: {0}")]
    Program(String),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Closed classification of substrate failures that mean the execution
    /// context died under us, i.e. the page navigated mid-action.
    ///
    /// The matched phrases come from the CDP `Runtime.evaluate` error
    /// surface and must be re-validated when the substrate changes.
    pub fn is_context_destroyed(&self) -> bool {
        match self {
            Error::ContextDestroyed => true,
            Error::Browser(e) => {
                let text = e.to_string();
                text.contains("Execution context was destroyed")
                    || text.contains("Cannot find context")
                    || text.contains("Inspected target navigated or closed")
            }
            _ => false,
        }
    }
}
