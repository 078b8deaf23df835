//! Bounded oracle-driven task loop.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::driver::Cookie;
use crate::engine::BrowserEnv;
use crate::observe::WebpageObservation;
use crate::program::ActionProgram;
use crate::state::{Task, TaskStatus};
use crate::Result;

/// Default cap on the number of programs a single task may run.
pub const DEFAULT_MAX_STEPS: usize = 40;

/// The decision maker: looks at an observation, produces the next program.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(
        &mut self,
        task: &Task,
        observation: &WebpageObservation,
    ) -> Result<ActionProgram>;
}

/// How a task ended.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub output: Map<String, Value>,
    /// Number of programs executed before the task ended.
    pub steps: u64,
}

/// Runs one task to completion against one environment.
///
/// Holds the latest observation between steps so callers can inspect what
/// the oracle last saw. An oracle failure consumes a step like any other:
/// its message is attached to the observation and the loop continues, so a
/// wedged oracle cannot spin forever.
pub struct StatefulAgent<O: Oracle> {
    env: BrowserEnv,
    oracle: O,
    observation: WebpageObservation,
    max_steps: usize,
}

impl<O: Oracle> StatefulAgent<O> {
    /// Open the starting page and take the first observation.
    pub async fn start(
        mut env: BrowserEnv,
        oracle: O,
        url: &str,
        cookies: &[Cookie],
        init_scripts: &[String],
    ) -> Result<Self> {
        let observation = env.reset(url, cookies, init_scripts).await?;
        Ok(Self {
            env,
            oracle,
            observation,
            max_steps: DEFAULT_MAX_STEPS,
        })
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Drive the task until it finishes or the step budget runs out.
    pub async fn act(&mut self, task: &Task) -> Result<TaskOutcome> {
        info!("Task: {}", task.description);
        for _ in 0..self.max_steps {
            let program = match self.oracle.decide(task, &self.observation).await {
                Ok(program) => program,
                Err(e) => {
                    warn!("Oracle failed to produce a program: {}", e);
                    self.observation.error_message =
                        Some(format!("Failed to produce an action script: {e}"));
                    continue;
                }
            };

            self.observation = self.env.step(&program).await?;

            let state = self.env.env_state();
            if state.status() != TaskStatus::InProgress {
                return Ok(TaskOutcome {
                    status: state.status(),
                    output: state.output.clone(),
                    steps: state.timeframe,
                });
            }
        }

        warn!("Reached {} actions without completing the task.", self.max_steps);
        let state = self.env.env_state();
        Ok(TaskOutcome {
            status: TaskStatus::Failed,
            output: state.output.clone(),
            steps: state.timeframe,
        })
    }

    pub fn observation(&self) -> &WebpageObservation {
        &self.observation
    }

    pub fn env_mut(&mut self) -> &mut BrowserEnv {
        &mut self.env
    }

    /// Release the underlying browser session.
    pub async fn close(self) -> Result<()> {
        self.env.close().await
    }
}
