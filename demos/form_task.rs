//! Fill and submit the httpbin demo form with a scripted oracle.
//!
//! ```sh
//! cargo run --example form_task
//! ```
//!
//! Requires a local Chrome/Chromium installation.

use async_trait::async_trait;
use tracing::info;

use webhelm::{
    ActionProgram, BrowserEnv, Call, CdpDriver, DriverConfig, EnvConfig, Oracle, StatefulAgent,
    Task, WebpageObservation,
};

/// A rule-based stand-in for an LLM oracle: fills the first text input,
/// submits, then declares the task done when the URL changes.
struct FormFiller {
    start_url: String,
}

#[async_trait]
impl Oracle for FormFiller {
    async fn decide(
        &mut self,
        task: &Task,
        observation: &WebpageObservation,
    ) -> webhelm::Result<ActionProgram> {
        info!("Observing:\n{}", observation.marked_summary());
        if let Some(message) = &observation.error_message {
            info!("Previous step failed: {}", message);
        }

        if observation.url != self.start_url {
            return ActionProgram::from_calls(vec![Call::Finish {
                did_succeed: true,
                output: serde_json::Map::new(),
                reason: "the form was accepted".into(),
            }]);
        }

        let name = task.args["customer_name"]
            .as_str()
            .unwrap_or("Jane Doe")
            .to_string();
        let input = observation
            .marked_elements
            .values()
            .find(|el| el.tag == "input");
        let submit = observation
            .marked_elements
            .values()
            .find(|el| el.tag == "button");

        match (input, submit) {
            (Some(input), Some(submit)) => ActionProgram::from_calls(vec![
                Call::InputText {
                    id: input.id,
                    text: name,
                    clear_before_input: true,
                    log_message: "Type the customer name".into(),
                },
                Call::Click {
                    id: submit.id,
                    log_message: "Submit the order form".into(),
                    force: false,
                },
            ]),
            _ => ActionProgram::from_calls(vec![Call::Finish {
                did_succeed: false,
                output: serde_json::Map::new(),
                reason: "the form fields never appeared".into(),
            }]),
        }
    }
}

#[tokio::main]
async fn main() -> webhelm::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,webhelm=debug".into()),
        )
        .init();

    let url = "https://httpbin.org/forms/post";
    let driver = CdpDriver::launch(DriverConfig::default()).await?;
    let env = BrowserEnv::new(Box::new(driver), EnvConfig::default());
    let oracle = FormFiller {
        start_url: url.to_string(),
    };

    let mut agent = StatefulAgent::start(env, oracle, url, &[], &[])
        .await?
        .with_max_steps(5);
    let task = Task::new("order a pizza for the customer").with_arg("customer_name", "Jane Doe");
    let outcome = agent.act(&task).await?;

    info!("Task finished: {:?} after {} step(s)", outcome.status, outcome.steps);
    agent.close().await
}
