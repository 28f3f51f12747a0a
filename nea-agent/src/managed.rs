//! Sub-agents exposed to a parent agent as tools.
//!
//! A [`ManagedAgent`] wraps a complete [`Agent`] behind the ordinary
//! [`Tool`] interface. The parent's code calls it like any other tool with a
//! single `request` argument; the sub-agent runs the request as its own task
//! and its final answer, optionally followed by a summary of its steps,
//! becomes the tool's return value.

use crate::agent::{Agent, RunStatus};
use anyhow::Context;
use nea_vm::transcript::truncate_content;
use nea_vm::value::to_display;
use nea_vm::{
    LlmProvider, ParamSpec, ParamType, RenderOptions, Tool, ToolArgs, ToolRegistry, ToolSpec,
    Transcript,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

const TASK_TEMPLATE: &str = "\
You're a helpful agent named '{{name}}'.
You have been submitted this task by your manager.
---
Task:
{{task}}
---
You're helping your manager solve a wider task: so make sure to not provide a one-line answer, but give as much information as possible to give them a clear understanding of the answer.

Your final_answer WILL HAVE to contain these parts:
### 1. Task outcome (short version):
### 2. Task outcome (extremely detailed version):
### 3. Additional context (if relevant):

Put all these in your final_answer, everything that you do not pass as an argument to final_answer will be lost.
And even if your task resolution is not successful, please return as much context as possible, so that your manager can act upon this feedback.";

/// Characters kept from each message of the run summary
const SUMMARY_MESSAGE_CHARS: usize = 2_000;

/// An agent the parent can delegate to by calling it from code
pub struct ManagedAgent<P> {
    agent: Arc<Agent<P>>,
    name: String,
    description: String,
    additional_prompting: Option<String>,
    provide_run_summary: bool,
}

impl<P: LlmProvider> ManagedAgent<P> {
    pub fn new(agent: Agent<P>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent: Arc::new(agent),
            name: name.into(),
            description: description.into(),
            additional_prompting: None,
            provide_run_summary: true,
        }
    }

    /// Extra instructions appended to every delegated task
    pub fn with_additional_prompting(mut self, text: impl Into<String>) -> Self {
        self.additional_prompting = Some(text.into());
        self
    }

    /// Return only the final answer, without the step summary
    pub fn with_run_summary(mut self, provide: bool) -> Self {
        self.provide_run_summary = provide;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            self.name.clone(),
            format!(
                "A team member: {} Give it a long, detailed request, as you would to a colleague.",
                self.description.trim()
            ),
        )
        .param(ParamSpec::required(
            "request",
            ParamType::String,
            "What the team member should do, with all the context it needs",
        ))
        .with_output(ParamType::String)
    }

    /// The task text the sub-agent actually runs
    pub fn compose_task(&self, request: &str) -> String {
        let mut task = TASK_TEMPLATE
            .replace("{{name}}", &self.name)
            .replace("{{task}}", request);
        if let Some(extra) = &self.additional_prompting {
            task.push('\n');
            task.push_str(extra.trim());
        }
        task
    }

    fn summarize(&self, answer: &Value, transcript: &Transcript) -> String {
        let mut lines = vec![
            format!("Here is the final answer from your managed agent '{}':", self.name),
            to_display(answer),
            "\nFor more detail, find below a summary of this agent's work:".to_string(),
            format!("SUMMARY OF WORK FROM AGENT '{}':", self.name),
        ];
        for message in transcript.render("", &RenderOptions::default()).iter().skip(1) {
            lines.push(format!(
                "{}\n---",
                truncate_content(message.text(), SUMMARY_MESSAGE_CHARS)
            ));
        }
        lines.push(format!("END OF SUMMARY OF WORK FROM AGENT '{}'.", self.name));
        lines.join("\n")
    }
}

impl<P: LlmProvider + 'static> ManagedAgent<P> {
    /// Add this agent to a parent's registry under its own name
    pub fn register(self, registry: &mut ToolRegistry) -> nea_vm::Result<()> {
        let spec = self.spec();
        registry.register(spec, self)
    }
}

impl<P: LlmProvider> Tool for ManagedAgent<P> {
    fn call(&self, args: &ToolArgs) -> anyhow::Result<Value> {
        let request = args.get("request").and_then(Value::as_str).unwrap_or("");
        let handle = Handle::try_current()
            .with_context(|| format!("managed agent '{}' needs a tokio runtime", self.name))?;

        info!(agent = %self.name, "delegating request");
        let result = handle.block_on(self.agent.run_task(self.compose_task(request)));
        match &result.status {
            RunStatus::Success { value } if self.provide_run_summary => {
                Ok(Value::String(self.summarize(value, &result.transcript)))
            }
            RunStatus::Success { value } => Ok(value.clone()),
            RunStatus::Failed { reason } => {
                anyhow::bail!("managed agent '{}' failed: {}", self.name, reason.brief())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nea_vm::{ErrorKind, ScriptedProvider};
    use serde_json::json;
    use std::time::Duration;

    fn code(body: &str) -> String {
        format!("Thought: go\nCode:\n```py\n{}\n```<end_code>", body)
    }

    fn worker(replies: Vec<String>) -> ManagedAgent<ScriptedProvider> {
        let agent = Agent::new(ScriptedProvider::new(replies), Arc::new(ToolRegistry::new()));
        ManagedAgent::new(agent, "researcher", "Looks things up.")
    }

    #[test]
    fn test_compose_task_names_agent() {
        let managed = worker(Vec::new()).with_additional_prompting("  Cite sources.  ");
        let task = managed.compose_task("find the boiling point of water");
        assert!(task.starts_with("You're a helpful agent named 'researcher'."));
        assert!(task.contains("Task:\nfind the boiling point of water\n---"));
        assert!(task.ends_with("\nCite sources."));
        assert_eq!(managed.spec().name, "researcher");
    }

    #[test]
    fn test_call_outside_runtime_fails() {
        let managed = worker(vec![code("final_answer(1)")]);
        let args = json!({"request": "anything"}).as_object().cloned().unwrap();
        let err = managed.call(&args).unwrap_err();
        assert!(err.to_string().contains("needs a tokio runtime"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parent_delegates_to_managed_agent() {
        let mut tools = ToolRegistry::new();
        worker(vec![code("final_answer('100 degrees')")])
            .register(&mut tools)
            .unwrap();
        let parent = Agent::new(
            ScriptedProvider::new([
                code("report = researcher(request='boiling point of water?')\nprint(report)"),
                code("final_answer('done')"),
            ]),
            Arc::new(tools),
        );
        let result = parent.run("ask the team", 4, Duration::from_secs(5)).await;

        assert_eq!(result.value(), Some(&json!("done")));
        let stdout = match &result.transcript.steps()[0].outcome {
            nea_vm::StepOutcome::Executed(outcome) => outcome.stdout.clone(),
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(stdout.contains("final answer from your managed agent 'researcher'"));
        assert!(stdout.contains("100 degrees"));
        assert!(stdout.contains("END OF SUMMARY OF WORK FROM AGENT 'researcher'."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_sub_run_is_a_tool_error() {
        let mut tools = ToolRegistry::new();
        worker(vec![code("print('no answer')")])
            .with_run_summary(false)
            .register(&mut tools)
            .unwrap();
        let parent = Agent::new(
            ScriptedProvider::new([
                code("researcher(request='try')"),
                code("final_answer('fallback')"),
            ]),
            Arc::new(tools),
        );
        let result = parent.run("delegate", 3, Duration::from_secs(5)).await;

        assert_eq!(result.value(), Some(&json!("fallback")));
        let err = result.transcript.steps()[0].error().unwrap();
        assert_eq!(err.kind, ErrorKind::ToolExecution);
        assert!(err.message.contains("managed agent 'researcher' failed"));
    }
}
